/*
 * kernos - an RTOS core for small microcontrollers.
 *
 * SPDX-License-Identifier: MIT
 */

//! Trace hooks.
//!
//! The kernel calls one of these functions at every interesting event.
//! Without the `trace` feature they compile to nothing. With it, they
//! forward to `defmt`, filtered by the per-subsystem constants in
//! [`crate::config`].
//!
//! Object identities are reported as raw addresses; the hooks never
//! dereference them, so they are safe to call from any context, including
//! the tick interrupt.

#![allow(unused_variables)]

use crate::types::{Priority, Timestamp};

macro_rules! hook {
    ($flag:ident, $($arg:tt)*) => {
        #[cfg(feature = "trace")]
        if crate::config::$flag {
            defmt::trace!($($arg)*);
        }
    };
}

// =============================================================================
// Threads
// =============================================================================

#[inline(always)]
pub fn thread_create(thread: usize, prio: Priority) {
    hook!(OS_TRACE_THREAD, "thread {=usize:x} create prio={=u8}", thread, prio);
}

#[inline(always)]
pub fn thread_terminate(thread: usize) {
    hook!(OS_TRACE_THREAD, "thread {=usize:x} terminate", thread);
}

#[inline(always)]
pub fn thread_priority(thread: usize, prio: Priority) {
    hook!(OS_TRACE_THREAD, "thread {=usize:x} prio={=u8}", thread, prio);
}

#[inline(always)]
pub fn thread_signal(thread: usize, mask: u32) {
    hook!(OS_TRACE_THREAD, "thread {=usize:x} signal {=u32:b}", thread, mask);
}

// =============================================================================
// Scheduler
// =============================================================================

#[inline(always)]
pub fn sched_start() {
    hook!(OS_TRACE_SCHEDULER, "scheduler start");
}

#[inline(always)]
pub fn context_switch(from: usize, to: usize) {
    hook!(OS_TRACE_SCHEDULER, "switch {=usize:x} -> {=usize:x}", from, to);
}

#[inline(always)]
pub fn thread_ready(thread: usize) {
    hook!(OS_TRACE_SCHEDULER, "ready {=usize:x}", thread);
}

#[inline(always)]
pub fn thread_block(thread: usize) {
    hook!(OS_TRACE_SCHEDULER, "block {=usize:x}", thread);
}

// =============================================================================
// Clock and timers
// =============================================================================

#[inline(always)]
pub fn clock_tick(now: Timestamp) {
    hook!(OS_TRACE_CLOCK, "tick {=u64}", now);
}

#[inline(always)]
pub fn clock_wake(thread: usize, now: Timestamp) {
    hook!(OS_TRACE_CLOCK, "timed wake {=usize:x} @{=u64}", thread, now);
}

#[inline(always)]
pub fn timer_fire(timer: usize, deadline: Timestamp) {
    hook!(OS_TRACE_TIMER, "timer {=usize:x} fire @{=u64}", timer, deadline);
}

#[inline(always)]
pub fn timer_arm(timer: usize, deadline: Timestamp) {
    hook!(OS_TRACE_TIMER, "timer {=usize:x} arm @{=u64}", timer, deadline);
}

// =============================================================================
// Synchronization primitives
// =============================================================================

#[inline(always)]
pub fn sync_block(object: usize, thread: usize) {
    hook!(OS_TRACE_SYNC, "sync {=usize:x} block {=usize:x}", object, thread);
}

#[inline(always)]
pub fn sync_wake(object: usize, thread: usize) {
    hook!(OS_TRACE_SYNC, "sync {=usize:x} wake {=usize:x}", object, thread);
}

#[inline(always)]
pub fn mutex_boost(owner: usize, prio: Priority) {
    hook!(OS_TRACE_SYNC, "boost {=usize:x} -> {=u8}", owner, prio);
}
