/*
 * kernos - an RTOS core for small microcontrollers.
 *
 * SPDX-License-Identifier: MIT
 */

//! Counting semaphores.
//!
//! A signed counter with a configurable cap and a FIFO wait list.
//! `post` is non-blocking and therefore callable from handler mode;
//! `wait` with a zero timeout is the `try` form and never suspends.

use crate::kernel::list::List;
use crate::kernel::thread::{self, Thread};
use crate::kernel::{clock, scheduler};
use crate::port;
use crate::trace;
use crate::types::*;

/// Creation attributes.
pub struct Attributes {
    pub name: &'static str,
    /// Count at creation.
    pub initial: SemCount,
    /// Cap enforced on `post`.
    pub max: SemCount,
}

impl Attributes {
    /// A counting semaphore with the full count range.
    pub const fn counting(initial: SemCount) -> Self {
        Attributes {
            name: "-",
            initial,
            max: SEM_MAX_COUNT,
        }
    }

    /// A binary semaphore.
    pub const fn binary(initial: SemCount) -> Self {
        Attributes {
            name: "-",
            initial,
            max: 1,
        }
    }
}

/// Semaphore control block.
pub struct Semaphore {
    pub(crate) count: SemCount,
    pub(crate) max: SemCount,
    pub(crate) waiters: List,
    pub(crate) created: bool,
    pub(crate) name: &'static str,
}

impl Semaphore {
    pub const fn new() -> Self {
        Semaphore {
            count: 0,
            max: 0,
            waiters: List::new(),
            created: false,
            name: "-",
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new()
    }
}

/// Initialize a semaphore control block.
///
/// # Safety
///
/// `sem` must point to a valid control block not in use.
pub unsafe fn create(sem: *mut Semaphore, attr: &Attributes) -> Result<()> {
    check(!sem.is_null(), Error::Invalid)?;
    check(attr.max > 0 && attr.max <= SEM_MAX_COUNT, Error::Invalid)?;
    check(attr.initial >= 0 && attr.initial <= attr.max, Error::Invalid)?;

    (*sem).count = attr.initial;
    (*sem).max = attr.max;
    (*sem).waiters = List::new();
    (*sem).name = attr.name;
    (*sem).created = true;
    Ok(())
}

/// The current count.
///
/// # Safety
///
/// `sem` must be a valid, created semaphore.
pub unsafe fn value(sem: *mut Semaphore) -> SemCount {
    let s = port::irq_save();
    let v = (*sem).count;
    port::irq_restore(s);
    v
}

/// Increment the count and release the longest-waiting thread, if any.
///
/// Callable from handler mode.
///
/// # Errors
///
/// `Overflow` when the count is already at the cap.
///
/// # Safety
///
/// `sem` must be a valid, created semaphore.
pub unsafe fn post(sem: *mut Semaphore) -> Result<()> {
    check(!sem.is_null(), Error::Invalid)?;

    let s = port::irq_save();
    if !(*sem).created {
        port::irq_restore(s);
        return Err(Error::Invalid);
    }
    if (*sem).count >= (*sem).max {
        port::irq_restore(s);
        return Err(Error::Overflow);
    }
    (*sem).count += 1;

    let head = (*sem).waiters.head();
    if !head.is_null() {
        let t = (*head).owner as *mut Thread;
        trace::sync_wake(sem as usize, t as usize);
        thread::wake(t, None);
        scheduler::preempt();
    }
    port::irq_restore(s);
    Ok(())
}

/// Decrement the count, blocking while it would go negative.
///
/// A zero `timeout` is the try form: it returns `Again` instead of
/// suspending (and is therefore allowed in handler mode).
///
/// # Safety
///
/// `sem` must be a valid, created semaphore.
pub unsafe fn wait(sem: *mut Semaphore, timeout: Duration) -> Result<()> {
    check(!sem.is_null(), Error::Invalid)?;
    let t = scheduler::current();
    if timeout != 0 {
        check(!port::in_handler_mode(), Error::NotPermitted)?;
        check(!t.is_null(), Error::NotPermitted)?;
        thread::consume_cancel(t)?;
    }

    let deadline = if timeout == 0 || timeout == WAIT_FOREVER {
        None
    } else {
        Some(clock::now().saturating_add(timeout as Timestamp))
    };

    loop {
        let s = port::irq_save();
        if !(*sem).created {
            port::irq_restore(s);
            return Err(Error::Invalid);
        }
        if (*sem).count > 0 {
            (*sem).count -= 1;
            port::irq_restore(s);
            return Ok(());
        }
        if timeout == 0 {
            port::irq_restore(s);
            return Err(Error::Again);
        }

        // Queue FIFO and go to sleep; `post` hands the wakeup over and
        // the loop re-checks the count, so a racing `try_wait` cannot
        // strand us.
        trace::sync_block(sem as usize, t as usize);
        (*t).wake_err = None;
        (*sem).waiters.push_back(&mut (*t).wait_node);
        if let Some(d) = deadline {
            clock::arm(t, d);
        }
        (*t).state = ThreadState::Waiting;
        scheduler::block_current();
        port::irq_restore(s);

        let s = port::irq_save();
        crate::kernel::list::unlink(&mut (*t).wait_node);
        clock::disarm(t);
        let err = (*t).wake_err.take();
        port::irq_restore(s);
        if let Some(e) = err {
            return Err(e);
        }
    }
}

/// Non-blocking acquire: `Again` when the count is zero.
///
/// # Safety
///
/// `sem` must be a valid, created semaphore.
pub unsafe fn try_wait(sem: *mut Semaphore) -> Result<()> {
    wait(sem, 0)
}

/// Number of threads blocked on the semaphore. Diagnostic aid.
///
/// # Safety
///
/// `sem` must be a valid, created semaphore.
pub unsafe fn waiting(sem: *mut Semaphore) -> usize {
    let s = port::irq_save();
    let n = (*sem).waiters.len();
    port::irq_restore(s);
    n
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::test_support::{fixture, spawn};

    #[test]
    fn create_validates_counts() {
        let _k = fixture();
        unsafe {
            let mut s = Semaphore::new();
            let mut attr = Attributes::counting(5);
            attr.max = 0;
            assert_eq!(create(&mut s, &attr), Err(Error::Invalid));
            attr.max = 3;
            assert_eq!(create(&mut s, &attr), Err(Error::Invalid));
            attr.initial = -1;
            assert_eq!(create(&mut s, &attr), Err(Error::Invalid));
            attr.initial = 3;
            assert_eq!(create(&mut s, &attr), Ok(()));
            assert_eq!(value(&mut s), 3);
        }
    }

    #[test]
    fn post_and_try_wait_count() {
        let _k = fixture();
        unsafe {
            let mut s = Semaphore::new();
            create(&mut s, &Attributes::counting(0)).unwrap();

            assert_eq!(try_wait(&mut s), Err(Error::Again));
            post(&mut s).unwrap();
            post(&mut s).unwrap();
            assert_eq!(value(&mut s), 2);
            assert_eq!(try_wait(&mut s), Ok(()));
            assert_eq!(try_wait(&mut s), Ok(()));
            assert_eq!(try_wait(&mut s), Err(Error::Again));
        }
    }

    #[test]
    fn post_beyond_cap_overflows() {
        let _k = fixture();
        unsafe {
            let mut s = Semaphore::new();
            create(&mut s, &Attributes::binary(1)).unwrap();
            assert_eq!(post(&mut s), Err(Error::Overflow));
            assert_eq!(try_wait(&mut s), Ok(()));
            assert_eq!(post(&mut s), Ok(()));
        }
    }

    #[test]
    fn timed_waiter_expires_with_timed_out() {
        let _k = fixture();
        unsafe {
            let mut s = Semaphore::new();
            create(&mut s, &Attributes::counting(0)).unwrap();

            // Park a thread on the semaphore with a 100-tick deadline,
            // exactly as `wait` would queue it.
            let w = spawn(priority::NORMAL);
            scheduler::remove_from_ready(w);
            let st = port::irq_save();
            (*w).wake_err = None;
            (*w).state = ThreadState::Waiting;
            s.waiters.push_back(&mut (*w).wait_node);
            clock::arm(w, clock::now() + 100);
            port::irq_restore(st);

            for _ in 0..99 {
                clock::tick_from_isr();
            }
            assert_eq!((*w).state(), ThreadState::Waiting);

            // No post ever arrives; the deadline fires.
            clock::tick_from_isr();
            assert_eq!((*w).state(), ThreadState::Ready);
            assert_eq!((*w).wake_err, Some(Error::TimedOut));
            assert_eq!(waiting(&mut s), 0);
            assert_eq!(value(&mut s), 0);
        }
    }

    #[test]
    fn post_releases_the_longest_waiter() {
        let _k = fixture();
        unsafe {
            let mut s = Semaphore::new();
            create(&mut s, &Attributes::counting(0)).unwrap();

            let first = spawn(priority::NORMAL);
            let second = spawn(priority::NORMAL);
            for &w in &[first, second] {
                scheduler::remove_from_ready(w);
                let st = port::irq_save();
                (*w).wake_err = None;
                (*w).state = ThreadState::Waiting;
                s.waiters.push_back(&mut (*w).wait_node);
                port::irq_restore(st);
            }

            post(&mut s).unwrap();
            assert_eq!((*first).state(), ThreadState::Ready);
            assert_eq!((*second).state(), ThreadState::Waiting);
        }
    }

    #[test]
    fn try_wait_is_allowed_in_handler_mode() {
        let _k = fixture();
        unsafe {
            let mut s = Semaphore::new();
            create(&mut s, &Attributes::counting(1)).unwrap();
            crate::port::set_handler_mode(true);
            assert_eq!(try_wait(&mut s), Ok(()));
            assert_eq!(wait(&mut s, 10), Err(Error::NotPermitted));
            crate::port::set_handler_mode(false);
        }
    }
}
