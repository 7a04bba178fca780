/*
 * kernos - an RTOS core for small microcontrollers.
 *
 * SPDX-License-Identifier: MIT
 */

//! Condition variables.
//!
//! A condition variable is nothing but a FIFO wait list; each waiter
//! records the mutex it released so wakeup can restore the invariant
//! "wait returns holding the mutex".
//!
//! `signal` releases the highest-priority waiter. `broadcast` releases
//! every waiter, but *wait-morphs* any whose mutex is still held: there
//! is no point readying them just to pile up on the mutex again, so they
//! are moved directly onto its wait list and receive ownership one
//! unlock at a time, in the mutex's own queueing order.

use core::ptr;

use crate::kernel::list::{self, List};
use crate::kernel::mutex::{self, Mutex};
use crate::kernel::thread::{self, Thread};
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

/// Condition variable control block.
pub struct CondVar {
    pub(crate) waiters: List,
    pub(crate) created: bool,
    pub(crate) name: &'static str,
}

impl CondVar {
    pub const fn new() -> Self {
        CondVar {
            waiters: List::new(),
            created: false,
            name: "-",
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl Default for CondVar {
    fn default() -> Self {
        Self::new()
    }
}

/// Initialize a condition variable control block.
///
/// # Safety
///
/// `cv` must point to a valid control block not in use.
pub unsafe fn create(cv: *mut CondVar, attr: &Attributes) -> Result<()> {
    check(!cv.is_null(), Error::Invalid)?;
    (*cv).waiters = List::new();
    (*cv).name = attr.name;
    (*cv).created = true;
    Ok(())
}

/// Atomically release `mx` and block until signalled (or the timeout
/// expires). The mutex is re-acquired before returning, including on
/// timeout and cancellation.
///
/// # Errors
///
/// - `NotPermitted` - caller does not hold `mx`, or handler mode.
/// - `Invalid` - zero timeout (there is no try form), or a recursive
///   mutex held more than once.
/// - `TimedOut` / `Interrupted` - the wait ended abnormally; the mutex
///   is held nevertheless.
///
/// # Safety
///
/// `cv` and `mx` must be valid, created control blocks.
pub unsafe fn wait(cv: *mut CondVar, mx: *mut Mutex, timeout: Duration) -> Result<()> {
    check(!cv.is_null() && !mx.is_null(), Error::Invalid)?;
    check(!port::in_handler_mode(), Error::NotPermitted)?;
    check(timeout != 0, Error::Invalid)?;
    let t = scheduler::current();
    check(!t.is_null(), Error::NotPermitted)?;
    thread::consume_cancel(t)?;

    let s = port::irq_save();
    if !(*cv).created || !(*mx).created {
        port::irq_restore(s);
        return Err(Error::Invalid);
    }
    if (*mx).owner() != t {
        port::irq_restore(s);
        return Err(Error::NotPermitted);
    }
    if (*mx).count > 1 {
        // Releasing a multiply-locked recursive mutex here would leave
        // it still held; refuse rather than deadlock the signaller.
        port::irq_restore(s);
        return Err(Error::Invalid);
    }

    // Queue on the condvar *before* releasing, all inside one critical
    // section: a signal can then never fall between release and block.
    trace::sync_block(cv as usize, t as usize);
    (*t).wake_err = None;
    (*t).condvar_mutex = mx;
    (*cv).waiters.push_back(&mut (*t).wait_node);
    mutex::release_locked(mx, t);
    if timeout != WAIT_FOREVER {
        clock::arm(t, clock::now().saturating_add(timeout as Timestamp));
    }
    (*t).state = ThreadState::Waiting;
    scheduler::block_current();
    port::irq_restore(s);

    // Resumed: by signal/broadcast, by a morph-grant of the mutex, by
    // timeout, or by cancellation.
    let s = port::irq_save();
    list::unlink(&mut (*t).wait_node);
    clock::disarm(t);
    (*t).condvar_mutex = ptr::null_mut();
    let err = (*t).wake_err.take();
    let morph_granted = (*mx).owner() == t;
    if morph_granted {
        (*t).blocked_mutex = ptr::null_mut();
        (*t).wait_prio_ordered = false;
    }
    port::irq_restore(s);

    if !morph_granted {
        match mutex::lock(mx) {
            // Owner death is the lock's business, not the wait's; we do
            // hold the mutex either way.
            Ok(()) | Err(Error::OwnerDead) => {}
            Err(e) => return Err(e),
        }
    }

    match err {
        None => Ok(()),
        Some(e) => Err(e),
    }
}

/// Release the highest-priority waiter. Callable from handler mode.
///
/// # Safety
///
/// `cv` must be a valid, created control block.
pub unsafe fn signal(cv: *mut CondVar) -> Result<()> {
    check(!cv.is_null(), Error::Invalid)?;

    let s = port::irq_save();
    if !(*cv).created {
        port::irq_restore(s);
        return Err(Error::Invalid);
    }
    let best = pick_highest(cv);
    if !best.is_null() {
        trace::sync_wake(cv as usize, best as usize);
        thread::wake(best, None);
        scheduler::preempt();
    }
    port::irq_restore(s);
    Ok(())
}

/// Release every waiter. A waiter whose released mutex is still held is
/// wait-morphed onto that mutex's queue instead of the ready list, so
/// handover follows the mutex's own policy; only waiters whose mutex is
/// already free are readied directly.
///
/// # Safety
///
/// `cv` must be a valid, created control block.
pub unsafe fn broadcast(cv: *mut CondVar) -> Result<()> {
    check(!cv.is_null(), Error::Invalid)?;

    let s = port::irq_save();
    if !(*cv).created {
        port::irq_restore(s);
        return Err(Error::Invalid);
    }
    let mut woke = false;
    let mut node = (*cv).waiters.head();
    while !node.is_null() {
        let next = (*node).next();
        let t = (*node).owner as *mut Thread;
        let released_mx = (*t).condvar_mutex;
        if !released_mx.is_null() && (*released_mx).is_locked() {
            // Wait-morph: straight onto the mutex queue, still
            // blocked, timeout still armed.
            list::unlink(node);
            mutex::enqueue_waiter(released_mx, t);
        } else {
            trace::sync_wake(cv as usize, t as usize);
            thread::wake(t, None);
            woke = true;
        }
        node = next;
    }
    if woke {
        scheduler::preempt();
    }
    port::irq_restore(s);
    Ok(())
}

/// Highest-priority waiter, FIFO among equals. Runs inside a critical
/// section.
unsafe fn pick_highest(cv: *mut CondVar) -> *mut Thread {
    let mut best: *mut Thread = ptr::null_mut();
    let mut node = (*cv).waiters.head();
    while !node.is_null() {
        let t = (*node).owner as *mut Thread;
        if best.is_null() || (*t).prio > (*best).prio {
            best = t;
        }
        node = (*node).next();
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::test_support::{fixture, spawn};

    unsafe fn make_cv() -> CondVar {
        let mut cv = CondVar::new();
        create(&mut cv, &Attributes::new()).unwrap();
        cv
    }

    /// Park a spawned thread on the condvar the way `wait` would,
    /// without actually blocking the test thread.
    unsafe fn park_waiter(cv: *mut CondVar, t: *mut Thread, mx: *mut Mutex) {
        scheduler::remove_from_ready(t);
        let s = port::irq_save();
        (*t).wake_err = None;
        (*t).condvar_mutex = mx;
        (*t).state = ThreadState::Waiting;
        (*cv).waiters.push_back(&mut (*t).wait_node);
        port::irq_restore(s);
    }

    #[test]
    fn wait_requires_the_mutex() {
        let _k = fixture();
        unsafe {
            let mut cv = make_cv();
            let mut mx = Mutex::new();
            mutex::create(&mut mx, &mutex::Attributes::new()).unwrap();
            assert_eq!(
                wait(&mut cv, &mut mx, WAIT_FOREVER),
                Err(Error::NotPermitted)
            );
        }
    }

    #[test]
    fn signal_on_empty_condvar_is_ok() {
        let _k = fixture();
        unsafe {
            let mut cv = make_cv();
            assert_eq!(signal(&mut cv), Ok(()));
        }
    }

    #[test]
    fn signal_picks_the_highest_priority_waiter() {
        let _k = fixture();
        unsafe {
            let mut cv = make_cv();
            let low = spawn(priority::LOW);
            let high = spawn(priority::HIGH);
            park_waiter(&mut cv, low, ptr::null_mut());
            park_waiter(&mut cv, high, ptr::null_mut());

            signal(&mut cv).unwrap();
            assert_eq!((*high).state(), ThreadState::Ready);
            assert_eq!((*low).state(), ThreadState::Waiting);
            assert_eq!(cv.waiters.len(), 1);
        }
    }

    #[test]
    fn broadcast_morphs_every_waiter_onto_the_held_mutex() {
        let _k = fixture();
        unsafe {
            let mut cv = make_cv();
            let mut mx = Mutex::new();
            mutex::create(&mut mx, &mutex::Attributes::new()).unwrap();
            mutex::lock(&mut mx).unwrap(); // fixture thread holds it

            let a = spawn(priority::LOW);
            let b = spawn(priority::HIGH);
            park_waiter(&mut cv, a, &mut mx);
            park_waiter(&mut cv, b, &mut mx);

            broadcast(&mut cv).unwrap();
            // Nobody is readied past the held mutex: both morphed.
            assert_eq!((*a).state(), ThreadState::Waiting);
            assert_eq!((*b).state(), ThreadState::Waiting);
            assert!(cv.waiters.is_empty());
            assert_eq!(mx.waiters.len(), 2);

            // Handover follows the mutex's queueing order (FIFO here).
            mutex::unlock(&mut mx).unwrap();
            assert_eq!(mx.owner(), a);
            assert_eq!((*a).state(), ThreadState::Ready);
            assert_eq!((*b).state(), ThreadState::Waiting);
        }
    }

    #[test]
    fn morphed_waiters_contend_by_mutex_policy() {
        let _k = fixture();
        unsafe {
            let mut cv = make_cv();
            let mut attr = mutex::Attributes::new();
            attr.protocol = mutex::Protocol::Inherit;
            let mut mx = Mutex::new();
            mutex::create(&mut mx, &attr).unwrap();
            mutex::lock(&mut mx).unwrap(); // fixture thread holds it
            let me = crate::kernel::scheduler::current();

            let a = spawn(priority::LOW);
            let b = spawn(priority::HIGH);
            park_waiter(&mut cv, a, &mut mx);
            park_waiter(&mut cv, b, &mut mx);

            broadcast(&mut cv).unwrap();
            assert_eq!(mx.waiters.len(), 2);
            // Morphing onto an inherit mutex boosts the owner like any
            // other contention would.
            assert_eq!((*me).priority(), priority::HIGH);

            // The high-priority waiter is granted first; no inversion.
            mutex::unlock(&mut mx).unwrap();
            assert_eq!(mx.owner(), b);
            assert_eq!((*b).state(), ThreadState::Ready);
            assert_eq!((*a).state(), ThreadState::Waiting);
            assert_eq!((*me).priority(), priority::NORMAL);
        }
    }

    #[test]
    fn broadcast_readies_everyone_when_the_mutex_is_free() {
        let _k = fixture();
        unsafe {
            let mut cv = make_cv();
            let mut mx = Mutex::new();
            mutex::create(&mut mx, &mutex::Attributes::new()).unwrap();

            let a = spawn(priority::LOW);
            let b = spawn(priority::HIGH);
            park_waiter(&mut cv, a, &mut mx);
            park_waiter(&mut cv, b, &mut mx);

            broadcast(&mut cv).unwrap();
            assert_eq!((*a).state(), ThreadState::Ready);
            assert_eq!((*b).state(), ThreadState::Ready);
            assert!(cv.waiters.is_empty());
            assert!(!mx.is_locked());
        }
    }
}
