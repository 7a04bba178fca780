/*
 * kernos - an RTOS core for small microcontrollers.
 *
 * SPDX-License-Identifier: MIT
 */

//! Event flags.
//!
//! A 32-bit mask plus a FIFO list of waiters, each carrying a wanted
//! mask and a mode (`ALL`/`ANY`, optionally `CLEAR`). `raise` scans the
//! waiters in queue order and satisfies every one whose predicate now
//! holds; a `CLEAR`-mode waiter consumes its matched bits *before the
//! next waiter is examined*, which makes event consumption
//! deterministic: two clearing waiters for the same bit never both see
//! it.

use crate::kernel::list::{self, List};
use crate::kernel::thread::{self, flags_satisfied, Thread};
use crate::kernel::{clock, scheduler};
use crate::port;
use crate::trace;
use crate::types::*;

/// Creation attributes.
pub struct Attributes {
    pub name: &'static str,
}

impl Attributes {
    pub const fn new() -> Self {
        Attributes { name: "-" }
    }
}

impl Default for Attributes {
    fn default() -> Self {
        Self::new()
    }
}

/// Event flags control block.
pub struct EventFlags {
    pub(crate) mask: FlagsMask,
    pub(crate) waiters: List,
    pub(crate) created: bool,
    pub(crate) name: &'static str,
}

impl EventFlags {
    pub const fn new() -> Self {
        EventFlags {
            mask: 0,
            waiters: List::new(),
            created: false,
            name: "-",
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl Default for EventFlags {
    fn default() -> Self {
        Self::new()
    }
}

/// Initialize an event flags control block.
///
/// # Safety
///
/// `ev` must point to a valid control block not in use.
pub unsafe fn create(ev: *mut EventFlags, attr: &Attributes) -> Result<()> {
    check(!ev.is_null(), Error::Invalid)?;
    (*ev).mask = 0;
    (*ev).waiters = List::new();
    (*ev).name = attr.name;
    (*ev).created = true;
    Ok(())
}

/// OR `mask` into the flags and satisfy every waiter whose predicate now
/// holds. Returns the mask after the scan. Callable from handler mode.
///
/// # Safety
///
/// `ev` must be a valid, created control block.
pub unsafe fn raise(ev: *mut EventFlags, mask: FlagsMask) -> Result<FlagsMask> {
    check(!ev.is_null(), Error::Invalid)?;
    check(mask != 0, Error::Invalid)?;

    let s = port::irq_save();
    if !(*ev).created {
        port::irq_restore(s);
        return Err(Error::Invalid);
    }
    (*ev).mask |= mask;

    let mut woke = false;
    let mut node = (*ev).waiters.head();
    while !node.is_null() {
        let next = (*node).next();
        let t = (*node).owner as *mut Thread;
        if let Some(taken) = flags_satisfied((*ev).mask, (*t).flags_wanted, (*t).flags_mode) {
            (*t).flags_taken = taken;
            if (*t).flags_mode & flags_mode::CLEAR != 0 {
                // Consumed before the next waiter looks.
                (*ev).mask &= !taken;
            }
            trace::sync_wake(ev as usize, t as usize);
            thread::wake(t, None);
            woke = true;
        }
        node = next;
    }
    let after = (*ev).mask;
    if woke {
        scheduler::preempt();
    }
    port::irq_restore(s);
    Ok(after)
}

/// Wait until the flags satisfy `mask`/`mode`.
///
/// `mode` must include `ALL` or `ANY`; adding `CLEAR` consumes the
/// matched bits. A zero `timeout` is the try form. Returns the bits
/// taken.
///
/// # Safety
///
/// `ev` must be a valid, created control block.
pub unsafe fn wait(
    ev: *mut EventFlags,
    mask: FlagsMask,
    mode: FlagsMode,
    timeout: Duration,
) -> Result<FlagsMask> {
    check(!ev.is_null(), Error::Invalid)?;
    check(mask != 0, Error::Invalid)?;
    check(mode & (flags_mode::ALL | flags_mode::ANY) != 0, Error::Invalid)?;
    let t = scheduler::current();
    if timeout != 0 {
        check(!port::in_handler_mode(), Error::NotPermitted)?;
        check(!t.is_null(), Error::NotPermitted)?;
        thread::consume_cancel(t)?;
    }

    let s = port::irq_save();
    if !(*ev).created {
        port::irq_restore(s);
        return Err(Error::Invalid);
    }
    if let Some(taken) = flags_satisfied((*ev).mask, mask, mode) {
        if mode & flags_mode::CLEAR != 0 {
            (*ev).mask &= !taken;
        }
        port::irq_restore(s);
        return Ok(taken);
    }
    if timeout == 0 {
        port::irq_restore(s);
        return Err(Error::Again);
    }

    // The raiser computes our taken bits and clears them under CLEAR.
    trace::sync_block(ev as usize, t as usize);
    (*t).flags_wanted = mask;
    (*t).flags_mode = mode;
    (*t).wake_err = None;
    (*ev).waiters.push_back(&mut (*t).wait_node);
    if timeout != WAIT_FOREVER {
        clock::arm(t, clock::now().saturating_add(timeout as Timestamp));
    }
    (*t).state = ThreadState::Waiting;
    scheduler::block_current();
    port::irq_restore(s);

    let s = port::irq_save();
    list::unlink(&mut (*t).wait_node);
    clock::disarm(t);
    let err = (*t).wake_err.take();
    let taken = (*t).flags_taken;
    port::irq_restore(s);
    match err {
        None => Ok(taken),
        Some(e) => Err(e),
    }
}

/// Non-blocking wait.
///
/// # Safety
///
/// `ev` must be a valid, created control block.
pub unsafe fn try_wait(ev: *mut EventFlags, mask: FlagsMask, mode: FlagsMode) -> Result<FlagsMask> {
    wait(ev, mask, mode, 0)
}

/// The current mask.
///
/// # Safety
///
/// `ev` must be a valid, created control block.
pub unsafe fn get(ev: *mut EventFlags) -> FlagsMask {
    let s = port::irq_save();
    let m = (*ev).mask;
    port::irq_restore(s);
    m
}

/// Clear flags, returning the mask as it was before.
///
/// # Safety
///
/// `ev` must be a valid, created control block.
pub unsafe fn clear(ev: *mut EventFlags, mask: FlagsMask) -> Result<FlagsMask> {
    check(!ev.is_null(), Error::Invalid)?;
    check(mask != 0, Error::Invalid)?;
    let s = port::irq_save();
    if !(*ev).created {
        port::irq_restore(s);
        return Err(Error::Invalid);
    }
    let prev = (*ev).mask;
    (*ev).mask &= !mask;
    port::irq_restore(s);
    Ok(prev)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::test_support::{fixture, spawn};

    unsafe fn make() -> EventFlags {
        let mut ev = EventFlags::new();
        create(&mut ev, &Attributes::new()).unwrap();
        ev
    }

    /// Park a spawned thread as a flags waiter, the way `wait` would.
    unsafe fn park_waiter(ev: *mut EventFlags, t: *mut Thread, mask: FlagsMask, mode: FlagsMode) {
        scheduler::remove_from_ready(t);
        let s = port::irq_save();
        (*t).flags_wanted = mask;
        (*t).flags_mode = mode;
        (*t).wake_err = None;
        (*t).state = ThreadState::Waiting;
        (*ev).waiters.push_back(&mut (*t).wait_node);
        port::irq_restore(s);
    }

    #[test]
    fn raise_and_try_wait_round_trip() {
        let _k = fixture();
        unsafe {
            let mut ev = make();
            assert_eq!(raise(&mut ev, 0b1010), Ok(0b1010));
            assert_eq!(
                try_wait(&mut ev, 0b1010, flags_mode::ALL | flags_mode::CLEAR),
                Ok(0b1010)
            );
            assert_eq!(get(&mut ev), 0);
        }
    }

    #[test]
    fn any_mode_takes_the_matched_subset() {
        let _k = fixture();
        unsafe {
            let mut ev = make();
            raise(&mut ev, 0b0110).unwrap();
            assert_eq!(
                try_wait(&mut ev, 0b0010, flags_mode::ANY | flags_mode::CLEAR),
                Ok(0b0010)
            );
            assert_eq!(get(&mut ev), 0b0100);
        }
    }

    #[test]
    fn all_mode_waiter_wakes_only_when_complete() {
        let _k = fixture();
        unsafe {
            let mut ev = make();
            let w = spawn(priority::NORMAL);
            park_waiter(&mut ev, w, 0b0110, flags_mode::ALL | flags_mode::CLEAR);

            // First bit alone does not satisfy ALL.
            raise(&mut ev, 0b0010).unwrap();
            assert_eq!((*w).state(), ThreadState::Waiting);

            // Second bit completes the set; CLEAR leaves the mask empty.
            raise(&mut ev, 0b0100).unwrap();
            assert_eq!((*w).state(), ThreadState::Ready);
            assert_eq!((*w).flags_taken, 0b0110);
            assert_eq!(get(&mut ev), 0);
        }
    }

    #[test]
    fn clearing_waiter_consumes_before_the_next_is_examined() {
        let _k = fixture();
        unsafe {
            let mut ev = make();
            let first = spawn(priority::NORMAL);
            let second = spawn(priority::NORMAL);
            park_waiter(&mut ev, first, 0b0001, flags_mode::ANY | flags_mode::CLEAR);
            park_waiter(&mut ev, second, 0b0001, flags_mode::ANY | flags_mode::CLEAR);

            raise(&mut ev, 0b0001).unwrap();
            // Only the first (FIFO) waiter saw the bit.
            assert_eq!((*first).state(), ThreadState::Ready);
            assert_eq!((*second).state(), ThreadState::Waiting);
            assert_eq!(get(&mut ev), 0);
        }
    }

    #[test]
    fn non_clearing_raise_wakes_every_satisfied_waiter() {
        let _k = fixture();
        unsafe {
            let mut ev = make();
            let a = spawn(priority::NORMAL);
            let b = spawn(priority::NORMAL);
            park_waiter(&mut ev, a, 0b1000, flags_mode::ANY);
            park_waiter(&mut ev, b, 0b1000, flags_mode::ANY);

            raise(&mut ev, 0b1000).unwrap();
            assert_eq!((*a).state(), ThreadState::Ready);
            assert_eq!((*b).state(), ThreadState::Ready);
            assert_eq!(get(&mut ev), 0b1000);
        }
    }

    #[test]
    fn zero_mask_arguments_are_invalid() {
        let _k = fixture();
        unsafe {
            let mut ev = make();
            assert_eq!(raise(&mut ev, 0), Err(Error::Invalid));
            assert_eq!(try_wait(&mut ev, 0, flags_mode::ANY), Err(Error::Invalid));
            assert_eq!(clear(&mut ev, 0), Err(Error::Invalid));
        }
    }
}
