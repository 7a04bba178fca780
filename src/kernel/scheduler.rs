/*
 * kernos - an RTOS core for small microcontrollers.
 *
 * SPDX-License-Identifier: MIT
 */

//! The scheduler.
//!
//! Single CPU, preemptive, priority-based. The running thread is always
//! the highest-priority ready thread; equal priorities round-robin
//! through the per-level FIFOs. Preemption decisions are taken inside
//! interrupt critical sections and take effect when the section ends
//! (thread mode) or when the interrupt chain unwinds (handler mode, via
//! the port's pended switch).
//!
//! The scheduler owns the process-wide kernel state: the running thread,
//! the ready queue, the idle thread, and the scheduler-lock nesting
//! counter. Everything is initialized exactly once, in [`start`], and
//! never torn down; the kernel lives for the device's lifetime.

use core::convert::Infallible;
use core::ffi::c_void;
use core::ptr;

use crate::config::{OS_IDLE_STACK_SIZE_BYTES, OS_SYSTICK_FREQUENCY_HZ};
use crate::kernel::readyq::ReadyQueue;
use crate::kernel::thread::{self, Attributes, Thread};
use crate::kernel::timer;
use crate::port::{self, StackElement};
use crate::trace;
use crate::types::*;

/// Scheduler-lock state returned by [`lock`] and consumed by [`unlock`].
pub type SchedStatus = u32;

// =============================================================================
// Kernel state
// =============================================================================

/// The running thread. Null until [`start`].
static mut CURRENT: *mut Thread = ptr::null_mut();

/// Threads eligible to run.
static mut READY: ReadyQueue = ReadyQueue::new();

/// Set once by [`start`].
static mut STARTED: bool = false;

/// Scheduler-lock nesting; preemption is deferred while non-zero.
static mut LOCK_NESTING: u32 = 0;

/// A wakeup readied a thread that outranks the running one.
static mut PREEMPT_PENDING: bool = false;

/// The idle thread and its stack.
static mut IDLE_THREAD: Thread = Thread::new();
static mut IDLE_STACK: [StackElement; OS_IDLE_STACK_SIZE_BYTES / core::mem::size_of::<StackElement>()] =
    [0; OS_IDLE_STACK_SIZE_BYTES / core::mem::size_of::<StackElement>()];

// =============================================================================
// Queries
// =============================================================================

/// The running thread's control block. Null before [`start`].
#[inline(always)]
pub fn current() -> *mut Thread {
    unsafe { CURRENT }
}

/// Whether [`start`] has been called.
#[inline(always)]
pub fn is_started() -> bool {
    unsafe { STARTED }
}

/// Whether an interrupt service routine is executing. Blocking calls are
/// refused in that context.
#[inline(always)]
pub fn in_handler_mode() -> bool {
    port::in_handler_mode()
}

/// Whether preemption is currently suppressed by [`lock`].
#[inline(always)]
pub fn is_locked() -> bool {
    unsafe { LOCK_NESTING > 0 }
}

/// Priority of the most urgent ready thread. Test and diagnostic aid.
pub(crate) fn top_ready_priority() -> Option<Priority> {
    unsafe {
        let s = port::irq_save();
        let top = READY.top_priority();
        port::irq_restore(s);
        top
    }
}

// =============================================================================
// Scheduler lock
// =============================================================================

/// Enter a non-preemptive region, returning the previous lock state.
///
/// Interrupts stay enabled; only thread preemption is deferred. Nesting
/// is supported by handing the returned state back to [`unlock`].
pub fn lock() -> SchedStatus {
    unsafe {
        let s = port::irq_save();
        let prev = LOCK_NESTING;
        LOCK_NESTING += 1;
        port::irq_restore(s);
        prev
    }
}

/// Restore the lock state saved by a matching [`lock`]. Leaving the
/// outermost region performs any preemption deferred inside it.
pub fn unlock(prev: SchedStatus) {
    unsafe {
        let s = port::irq_save();
        LOCK_NESTING = prev;
        if prev == 0 {
            preempt();
        }
        port::irq_restore(s);
    }
}

// =============================================================================
// Readying and blocking
// =============================================================================

/// Make `t` ready and note whether it outranks the running thread.
/// Runs inside a critical section.
pub(crate) unsafe fn ready_thread(t: *mut Thread) {
    (*t).state = ThreadState::Ready;
    READY.push(&mut (*t).wait_node, (*t).prio);
    trace::thread_ready(t as usize);
    if STARTED && !CURRENT.is_null() && (*t).prio > (*CURRENT).prio {
        PREEMPT_PENDING = true;
    }
}

/// Re-queue an already-ready thread after a priority change.
/// Runs inside a critical section.
pub(crate) unsafe fn ready_requeue(t: *mut Thread) {
    READY.push(&mut (*t).wait_node, (*t).prio);
    if STARTED && !CURRENT.is_null() && (*t).prio > (*CURRENT).prio {
        PREEMPT_PENDING = true;
    }
}

/// Detach a ready thread from the ready queue (kill, priority change).
/// Runs inside a critical section.
pub(crate) unsafe fn remove_from_ready(t: *mut Thread) {
    READY.remove(&mut (*t).wait_node);
}

/// Switch away from the running thread, which the caller has already
/// moved to its destination (wait list, `Waiting` state, or
/// `Terminated`). Runs inside a critical section; execution resumes
/// here once the thread is readied again.
pub(crate) unsafe fn block_current() {
    let cur = CURRENT;
    debug_assert!(!cur.is_null() && (*cur).state != ThreadState::Running);
    trace::thread_block(cur as usize);
    if !STARTED {
        // Nothing to switch to; only reachable on the host port.
        return;
    }
    switch_to_next(cur);
}

/// Preemption point: if a ready thread outranks the running one, switch.
///
/// Called at critical-section exit, after wakeups, and from the tick
/// path. No-op while the scheduler lock is held or in handler mode (the
/// port finishes the job via [`preempt_from_isr`]).
///
/// # Safety
///
/// Must run inside an interrupt critical section.
pub unsafe fn preempt() {
    if !STARTED || LOCK_NESTING > 0 || port::in_handler_mode() {
        return;
    }
    PREEMPT_PENDING = false;
    if let Some(top) = READY.top_priority() {
        if top > (*CURRENT).prio {
            switch_from_running();
        }
    }
}

/// Tick-boundary round-robin: when a ready thread ties the running one,
/// request a switch so equal priorities share the CPU. Runs inside the
/// tick's critical section.
pub(crate) unsafe fn round_robin_tick() {
    if STARTED && !CURRENT.is_null() {
        if let Some(top) = READY.top_priority() {
            if top >= (*CURRENT).prio {
                PREEMPT_PENDING = true;
            }
        }
    }
}

/// Handler-mode preemption point, called by the port at the tail of the
/// tick (or any wakeup-producing) interrupt. The switch itself is pended
/// and runs once the interrupt chain unwinds.
///
/// `>=` here realizes the tick round-robin: the pending flag is only set
/// for ties by [`round_robin_tick`], never by an ordinary wakeup.
pub fn preempt_from_isr() {
    unsafe {
        let s = port::irq_save();
        if STARTED && LOCK_NESTING == 0 && PREEMPT_PENDING {
            PREEMPT_PENDING = false;
            if let Some(top) = READY.top_priority() {
                if top >= (*CURRENT).prio {
                    switch_from_running();
                }
            }
        }
        port::irq_restore(s);
    }
}

/// Voluntarily hand the CPU to the next ready thread of priority greater
/// than *or equal to* ours, so equal-priority threads make progress.
pub fn yield_now() {
    if port::in_handler_mode() {
        return;
    }
    unsafe {
        let s = port::irq_save();
        if STARTED && LOCK_NESTING == 0 {
            // Going to the back of our FIFO realizes the >= tie-break:
            // any equal-priority thread queued ahead of us gets picked.
            switch_from_running();
        }
        port::irq_restore(s);
    }
}

/// Re-queue the running thread and switch to the highest-priority ready
/// thread (possibly itself). Runs inside a critical section.
unsafe fn switch_from_running() {
    let cur = CURRENT;
    if (*cur).state == ThreadState::Running {
        (*cur).state = ThreadState::Ready;
        READY.push(&mut (*cur).wait_node, (*cur).prio);
    }
    switch_to_next(cur);
}

/// Pop the next runnable thread and context-switch to it. The idle
/// thread guarantees the ready queue is never empty after start.
/// Runs inside a critical section.
unsafe fn switch_to_next(prev: *mut Thread) {
    let node = READY.pop_highest();
    debug_assert!(!node.is_null());
    let next = (*node).owner as *mut Thread;
    (*next).state = ThreadState::Running;
    if next != prev {
        CURRENT = next;
        trace::context_switch(prev as usize, next as usize);
        // Effective at critical-section exit (thread mode) or interrupt
        // unwind (handler mode); resumes on `next`'s stack.
        port::context_switch(&mut (*prev).sp, (*next).sp);
    }
}

// =============================================================================
// Start
// =============================================================================

extern "C" fn idle_entry(_arg: *mut c_void) -> *mut c_void {
    loop {
        port::idle_sleep();
    }
}

/// Install the idle and deferred-callback threads, enable the tick
/// source, and enter the highest-priority ready thread. Never returns.
///
/// # Errors
///
/// `NotPermitted` when called twice or from handler mode.
///
/// # Safety
///
/// Must be called from the startup context, after at least one thread
/// exists. The startup stack is abandoned.
pub unsafe fn start() -> Result<Infallible> {
    check(!port::in_handler_mode(), Error::NotPermitted)?;

    let s = port::irq_save();
    if STARTED {
        port::irq_restore(s);
        return Err(Error::NotPermitted);
    }

    let mut idle_attr = Attributes::new();
    idle_attr.name = "idle";
    idle_attr.priority = priority::IDLE;
    idle_attr.stack_base = IDLE_STACK.as_mut_ptr();
    idle_attr.stack_size_bytes = core::mem::size_of_val(&IDLE_STACK);
    if let Err(e) = thread::init_raw(&mut IDLE_THREAD, &idle_attr, idle_entry, ptr::null_mut()) {
        port::irq_restore(s);
        return Err(e);
    }

    if let Err(e) = timer::start_service() {
        port::irq_restore(s);
        return Err(e);
    }

    STARTED = true;
    let node = READY.pop_highest();
    debug_assert!(!node.is_null());
    let first = (*node).owner as *mut Thread;
    (*first).state = ThreadState::Running;
    CURRENT = first;

    trace::sched_start();
    port::tick_start(OS_SYSTICK_FREQUENCY_HZ);
    port::start_first_thread((*first).sp)
}

// =============================================================================
// Test support
// =============================================================================

#[cfg(test)]
pub(crate) unsafe fn reset() {
    CURRENT = ptr::null_mut();
    READY = ReadyQueue::new();
    STARTED = false;
    LOCK_NESTING = 0;
    PREEMPT_PENDING = false;
}

#[cfg(test)]
pub(crate) unsafe fn set_current_for_test(t: *mut Thread) {
    if (*t).wait_node.is_linked() {
        READY.remove(&mut (*t).wait_node);
    }
    let old = CURRENT;
    if !old.is_null() && (*old).state == ThreadState::Running {
        (*old).state = ThreadState::Ready;
        READY.push(&mut (*old).wait_node, (*old).prio);
    }
    (*t).state = ThreadState::Running;
    CURRENT = t;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::test_support::{fixture, spawn};

    #[test]
    fn lock_is_nestable_and_restores_state() {
        let _k = fixture();
        let outer = lock();
        assert_eq!(outer, 0);
        assert!(is_locked());
        let inner = lock();
        assert_eq!(inner, 1);
        unlock(inner);
        assert!(is_locked());
        unlock(outer);
        assert!(!is_locked());
    }

    #[test]
    fn ready_threads_are_visible_by_priority() {
        let _k = fixture();
        unsafe {
            spawn(priority::LOW);
            assert_eq!(top_ready_priority(), Some(priority::LOW));
            spawn(priority::HIGH);
            assert_eq!(top_ready_priority(), Some(priority::HIGH));
        }
    }

    #[test]
    fn yield_before_start_is_harmless() {
        let _k = fixture();
        yield_now();
    }
}
