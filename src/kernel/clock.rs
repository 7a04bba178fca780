/*
 * kernos - an RTOS core for small microcontrollers.
 *
 * SPDX-License-Identifier: MIT
 */

//! The system clock.
//!
//! A monotonic 64-bit tick counter driven by the port's tick interrupt,
//! plus the timed-wait list: threads whose block carries a deadline sit
//! on a deadline-ordered intrusive list, and every tick drains the
//! expired prefix. The 64-bit width makes wrap-around a non-issue, so
//! there is no overflow twin list - one sorted list suffices.
//!
//! The realtime clock is the same counter plus a settable offset.

use crate::kernel::list::List;
use crate::kernel::thread::{self, Thread};
use crate::kernel::{scheduler, timer};
use crate::port;
use crate::trace;
use crate::types::*;

/// Ticks since scheduler start.
static mut TICKS: Timestamp = 0;

/// Realtime = monotonic + offset, in ticks.
static mut RT_OFFSET: ClockOffset = 0;

/// Threads blocked with a deadline, ordered by absolute expiry tick.
static mut TIMED_LIST: List = List::new();

// =============================================================================
// Reading the clocks
// =============================================================================

/// The monotonic tick count.
///
/// Read under an interrupt critical section so the 64-bit value is
/// consistent on 32-bit targets.
pub fn now() -> Timestamp {
    unsafe {
        let s = port::irq_save();
        let t = TICKS;
        port::irq_restore(s);
        t
    }
}

/// The realtime clock, in ticks.
pub fn realtime_now() -> Timestamp {
    unsafe {
        let s = port::irq_save();
        let t = TICKS.saturating_add_signed(RT_OFFSET);
        port::irq_restore(s);
        t
    }
}

/// Adjust the realtime clock to read `value` ticks as of now.
pub fn realtime_set(value: Timestamp) {
    unsafe {
        let s = port::irq_save();
        RT_OFFSET = value.wrapping_sub(TICKS) as ClockOffset;
        port::irq_restore(s);
    }
}

// =============================================================================
// Timed waits
// =============================================================================

/// Put `t` on the timed-wait list with an absolute deadline.
/// Runs inside a critical section.
pub(crate) unsafe fn arm(t: *mut Thread, deadline: Timestamp) {
    debug_assert!(!(*t).clock_node.is_linked());
    (*t).clock_node.key = deadline;
    TIMED_LIST.insert_ordered(&mut (*t).clock_node);
}

/// Remove `t` from the timed-wait list, if present.
/// Runs inside a critical section.
pub(crate) unsafe fn disarm(t: *mut Thread) {
    crate::kernel::list::unlink(&mut (*t).clock_node);
}

/// The tick interrupt entry point.
///
/// Advances the counter, readies every thread whose deadline has passed
/// (they wake with `TimedOut`; `sleep_*` translates that to a normal
/// return), and nudges the timer service when a user timer is due. The
/// port's handler calls [`scheduler::preempt_from_isr`] afterwards to
/// act on anything this readied.
pub fn tick_from_isr() {
    unsafe {
        let s = port::irq_save();
        TICKS += 1;
        let now = TICKS;
        trace::clock_tick(now);

        loop {
            let head = TIMED_LIST.head();
            if head.is_null() || (*head).key > now {
                break;
            }
            let t = (*head).owner as *mut Thread;
            trace::clock_wake(t as usize, now);
            thread::wake(t, Some(Error::TimedOut));
        }

        timer::tick_notify(now);
        scheduler::round_robin_tick();
        port::irq_restore(s);
    }
}

// =============================================================================
// Sleeping
// =============================================================================

/// Block the calling thread for `ticks` tick periods.
///
/// Zero yields instead of sleeping. Returns `Interrupted` when woken by
/// cancellation before the deadline.
pub fn sleep_for(ticks: Duration) -> Result<()> {
    if ticks == 0 {
        scheduler::yield_now();
        return Ok(());
    }
    sleep_until(now().saturating_add(ticks as Timestamp))
}

/// Block the calling thread until the monotonic clock reaches
/// `deadline`.
pub fn sleep_until(deadline: Timestamp) -> Result<()> {
    check(!port::in_handler_mode(), Error::NotPermitted)?;
    let t = scheduler::current();
    check(!t.is_null(), Error::NotPermitted)?;

    unsafe {
        thread::consume_cancel(t)?;

        let s = port::irq_save();
        if deadline <= TICKS {
            port::irq_restore(s);
            return Ok(());
        }
        (*t).wake_err = None;
        arm(t, deadline);
        (*t).state = ThreadState::Waiting;
        scheduler::block_current();
        port::irq_restore(s);

        let s = port::irq_save();
        disarm(t);
        let err = (*t).wake_err.take();
        port::irq_restore(s);
        match err {
            // The deadline expiring is the expected way out.
            None | Some(Error::TimedOut) => Ok(()),
            Some(e) => Err(e),
        }
    }
}

// =============================================================================
// Test support
// =============================================================================

#[cfg(test)]
pub(crate) unsafe fn reset() {
    TICKS = 0;
    RT_OFFSET = 0;
    TIMED_LIST = List::new();
}
