/*
 * kernos - an RTOS core for small microcontrollers.
 *
 * SPDX-License-Identifier: MIT
 */

//! Compile-time configuration.
//!
//! Numeric knobs live here as constants; structural toggles (port
//! selection, trace backend, std for host tests) are Cargo features.
//! Applications that need different values build the kernel as a path
//! dependency and patch this module.

// =============================================================================
// Clock
// =============================================================================

/// System timer frequency, in Hz. One tick is `1000 / HZ` milliseconds.
pub const OS_SYSTICK_FREQUENCY_HZ: u32 = 1000;

/// Core clock feeding the system timer, in Hz. Match the target hardware.
pub const OS_CPU_CLOCK_HZ: u32 = 48_000_000;

// =============================================================================
// Threads
// =============================================================================

/// Priority range prescaler, 0..=4.
///
/// The value widens the priority space: 0 gives 16 levels, 4 gives the
/// full 256. Keeping it low shrinks the ready table, which holds one list
/// head per level.
pub const OS_THREAD_PRIORITY_RANGE: u32 = 4;

const _: () = assert!(OS_THREAD_PRIORITY_RANGE <= 4);

/// Stack size of the `os_main` thread, in bytes.
pub const OS_MAIN_STACK_SIZE_BYTES: usize = 400;

/// Stack size of the idle thread, in bytes.
pub const OS_IDLE_STACK_SIZE_BYTES: usize = 256;

/// Stack size of the deferred-callback (timer service) thread, in bytes.
pub const OS_TIMER_STACK_SIZE_BYTES: usize = 384;

/// Depth of the per-thread cleanup handler stack.
pub const OS_THREAD_CLEANUP_DEPTH: usize = 4;

/// Byte used to paint fresh thread stacks, for the high-water mark scan.
pub const OS_STACK_FILL_BYTE: u8 = 0xA5;

// =============================================================================
// Message queues
// =============================================================================

/// Number of message priority buckets per queue, 1..=256.
///
/// Send priorities at or above the count are clamped into the top bucket.
/// Every queue pays for this many bucket heads, so the default stays
/// modest; raise it when fine-grained message ordering matters.
pub const OS_MQUEUE_PRIO_LEVELS: usize = 16;

/// Largest accepted message slot size, in bytes.
pub const OS_MQUEUE_MAX_MSG_SIZE: usize = 0xFFFF;

// =============================================================================
// Memory pools
// =============================================================================

/// Largest accepted pool block count.
pub const OS_MEMPOOL_MAX_BLOCKS: usize = 0xFFFF;

/// Stamp written into freed pool blocks so a double `free` is detectable.
pub const OS_MEMPOOL_FREE_STAMP: u32 = 0xBEEF_DEAD;

// =============================================================================
// Trace flags (effective only with the `trace` feature)
// =============================================================================

/// Trace thread lifecycle and state transitions.
pub const OS_TRACE_THREAD: bool = true;

/// Trace context switches and preemption decisions.
pub const OS_TRACE_SCHEDULER: bool = true;

/// Trace the tick and the timed-wait drains.
pub const OS_TRACE_CLOCK: bool = false;

/// Trace user timers.
pub const OS_TRACE_TIMER: bool = false;

/// Trace the blocking synchronization primitives.
pub const OS_TRACE_SYNC: bool = false;
