/*
 * kernos - an RTOS core for small microcontrollers.
 *
 * SPDX-License-Identifier: MIT
 */

//! Mutexes.
//!
//! Three orthogonal attributes combine freely:
//! - **Type**: `Normal` (self-relock deadlocks), `ErrorCheck`
//!   (self-relock reports `Deadlock`), `Recursive` (counted up to
//!   [`MUTEX_MAX_COUNT`]).
//! - **Protocol**: `None` (FIFO waiters), `Inherit` (the owner borrows
//!   its highest waiter's priority), `Protect` (the owner is raised to
//!   the mutex's ceiling while holding it).
//! - **Robustness**: `Stalled` (a dead owner leaves the mutex stuck) or
//!   `Robust` (the next acquirer is told `OwnerDead` and may repair the
//!   protected state with [`consistent`]).
//!
//! Ownership is handed over directly on unlock: the released waiter
//! wakes already owning the mutex. That keeps the robust owner-dead
//! handshake race-free and makes priority accounting exact.
//!
//! Every mutex a thread holds is chained through the control blocks
//! (`Thread::held_mutexes` / `Mutex::next_held`), so unlock and
//! termination can recompute the owner's effective priority as the
//! maximum of its base priority, the ceilings it still holds, and the
//! top waiter of every inherit mutex it still holds.

use core::ptr;

use crate::kernel::list::{self, prio_key, List, PRIO_KEY_BASE};
use crate::kernel::thread::{self, Thread};
use crate::kernel::{clock, scheduler};
use crate::port;
use crate::trace;
use crate::types::*;

/// Locking protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// Ownership does not affect priorities; waiters queue FIFO.
    None,
    /// Priority inheritance; waiters queue by priority.
    Inherit,
    /// Priority ceiling; waiters queue by priority.
    Protect,
}

/// Robustness against owner termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Robustness {
    /// A dead owner leaves the mutex locked forever.
    Stalled,
    /// A dead owner is detectable and recoverable.
    Robust,
}

/// Relock behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexType {
    /// Self-relock blocks forever.
    Normal,
    /// Self-relock reports `Deadlock`.
    ErrorCheck,
    /// Self-relock counts, up to [`MUTEX_MAX_COUNT`].
    Recursive,
}

/// Robust-mutex lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RobustState {
    Consistent,
    OwnerDead,
    NotRecoverable,
}

/// Creation attributes.
pub struct Attributes {
    pub name: &'static str,
    pub protocol: Protocol,
    pub robustness: Robustness,
    pub mutex_type: MutexType,
    /// Ceiling priority; meaningful only with `Protocol::Protect`.
    pub ceiling: Priority,
}

impl Attributes {
    pub const fn new() -> Self {
        Attributes {
            name: "-",
            protocol: Protocol::None,
            robustness: Robustness::Stalled,
            mutex_type: MutexType::Normal,
            ceiling: priority::HIGHEST,
        }
    }

    /// A recursive mutex with priority inheritance, the common
    /// application default.
    pub const fn recursive() -> Self {
        Attributes {
            name: "-",
            protocol: Protocol::Inherit,
            robustness: Robustness::Stalled,
            mutex_type: MutexType::Recursive,
            ceiling: priority::HIGHEST,
        }
    }
}

impl Default for Attributes {
    fn default() -> Self {
        Self::new()
    }
}

/// Mutex control block.
pub struct Mutex {
    pub(crate) owner: *mut Thread,
    pub(crate) count: MutexCount,
    pub(crate) protocol: Protocol,
    pub(crate) robustness: Robustness,
    pub(crate) mutex_type: MutexType,
    pub(crate) ceiling: Priority,
    pub(crate) robust_state: RobustState,
    pub(crate) waiters: List,
    /// Next mutex in the owner's held chain.
    pub(crate) next_held: *mut Mutex,
    pub(crate) created: bool,
    pub(crate) name: &'static str,
}

impl Mutex {
    pub const fn new() -> Self {
        Mutex {
            owner: ptr::null_mut(),
            count: 0,
            protocol: Protocol::None,
            robustness: Robustness::Stalled,
            mutex_type: MutexType::Normal,
            ceiling: priority::HIGHEST,
            robust_state: RobustState::Consistent,
            waiters: List::new(),
            next_held: ptr::null_mut(),
            created: false,
            name: "-",
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The owning thread, if any.
    pub fn owner(&self) -> *mut Thread {
        self.owner
    }

    pub fn is_locked(&self) -> bool {
        !self.owner.is_null()
    }

    /// Whether `create` has initialized this control block.
    pub fn is_created(&self) -> bool {
        self.created
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Creation
// =============================================================================

/// Initialize a mutex control block.
///
/// # Safety
///
/// `mx` must point to a valid control block not in use.
pub unsafe fn create(mx: *mut Mutex, attr: &Attributes) -> Result<()> {
    check(!mx.is_null(), Error::Invalid)?;
    if attr.protocol == Protocol::Protect {
        check(
            attr.ceiling > priority::NONE && attr.ceiling <= priority::HIGHEST,
            Error::Invalid,
        )?;
    }

    *mx = Mutex::new();
    (*mx).protocol = attr.protocol;
    (*mx).robustness = attr.robustness;
    (*mx).mutex_type = attr.mutex_type;
    (*mx).ceiling = attr.ceiling;
    (*mx).name = attr.name;
    (*mx).created = true;
    Ok(())
}

// =============================================================================
// Internals
// =============================================================================

enum Acquire {
    Taken,
    TakenOwnerDead,
    Busy,
}

/// Hand ownership to `t` and apply any ceiling boost.
/// Runs inside a critical section; `t` is `Running` or `Waiting`.
unsafe fn grant(mx: *mut Mutex, t: *mut Thread) {
    (*mx).owner = t;
    (*mx).count = 1;
    (*mx).next_held = (*t).held_mutexes;
    (*t).held_mutexes = mx;
    if (*mx).protocol == Protocol::Protect {
        let effective = (*t).prio.max((*mx).ceiling);
        thread::apply_priority(t, effective);
    }
}

/// Unchain `mx` from `t`'s held list; tolerates out-of-order unlock.
unsafe fn remove_held(t: *mut Thread, mx: *mut Mutex) {
    let mut cur: *mut *mut Mutex = &mut (*t).held_mutexes;
    while !(*cur).is_null() {
        if *cur == mx {
            *cur = (*mx).next_held;
            (*mx).next_held = ptr::null_mut();
            return;
        }
        cur = &mut (**cur).next_held;
    }
}

/// One acquisition attempt. Runs inside a critical section.
unsafe fn try_acquire(mx: *mut Mutex, t: *mut Thread) -> Result<Acquire> {
    if !(*mx).created {
        return Err(Error::Invalid);
    }
    if (*mx).robust_state == RobustState::NotRecoverable {
        return Err(Error::NotRecoverable);
    }
    if (*mx).owner == t {
        return match (*mx).mutex_type {
            MutexType::Recursive => {
                if (*mx).count == MUTEX_MAX_COUNT {
                    Err(Error::ResourceBusy)
                } else {
                    (*mx).count += 1;
                    Ok(Acquire::Taken)
                }
            }
            MutexType::ErrorCheck => Err(Error::Deadlock),
            // A normal mutex self-relock is the caller's deadlock to
            // keep: it queues behind itself.
            MutexType::Normal => Ok(Acquire::Busy),
        };
    }
    if (*mx).protocol == Protocol::Protect && (*mx).ceiling < (*t).base_prio {
        return Err(Error::Invalid);
    }
    if (*mx).owner.is_null() {
        grant(mx, t);
        if (*mx).robust_state == RobustState::OwnerDead {
            return Ok(Acquire::TakenOwnerDead);
        }
        return Ok(Acquire::Taken);
    }
    Ok(Acquire::Busy)
}

/// Queue `t` as a waiter, boosting an inherit-protocol owner.
/// Runs inside a critical section. Also used by the condition variable
/// to wait-morph broadcast waiters onto the mutex.
pub(crate) unsafe fn enqueue_waiter(mx: *mut Mutex, t: *mut Thread) {
    match (*mx).protocol {
        Protocol::None => (*mx).waiters.push_back(&mut (*t).wait_node),
        Protocol::Inherit | Protocol::Protect => {
            (*t).wait_node.key = prio_key((*t).prio);
            (*t).wait_prio_ordered = true;
            (*mx).waiters.insert_ordered(&mut (*t).wait_node);
        }
    }
    if (*mx).protocol == Protocol::Inherit {
        (*t).blocked_mutex = mx;
        let owner = (*mx).owner;
        if !owner.is_null() && (*t).prio > (*owner).prio {
            trace::mutex_boost(owner as usize, (*t).prio);
            thread::apply_priority(owner, (*t).prio);
        }
    }
}

/// Recompute the owner's effective priority after the waiter set
/// changed. Runs inside a critical section.
pub(crate) unsafe fn reboost_owner(mx: *mut Mutex) {
    let owner = (*mx).owner;
    if owner.is_null() {
        return;
    }
    let effective = (*owner).base_prio.max(boosted_priority(owner));
    thread::apply_priority(owner, effective);
}

/// The boost `t`'s held mutexes impose: the maximum of every ceiling and
/// of the top waiter priority of every inherit mutex.
/// Runs inside a critical section.
pub(crate) unsafe fn boosted_priority(t: *mut Thread) -> Priority {
    let mut boost = priority::NONE;
    let mut mx = (*t).held_mutexes;
    while !mx.is_null() {
        match (*mx).protocol {
            Protocol::Protect => boost = boost.max((*mx).ceiling),
            Protocol::Inherit => {
                let head = (*mx).waiters.head();
                if !head.is_null() {
                    boost = boost.max((PRIO_KEY_BASE - (*head).key) as Priority);
                }
            }
            Protocol::None => {}
        }
        mx = (*mx).next_held;
    }
    boost
}

// =============================================================================
// Lock / unlock
// =============================================================================

/// Acquire, blocking as long as necessary.
///
/// # Safety
///
/// `mx` must be a valid, created mutex.
pub unsafe fn lock(mx: *mut Mutex) -> Result<()> {
    lock_with(mx, WAIT_FOREVER)
}

/// Acquire without blocking: `Again` when held by another thread.
///
/// # Safety
///
/// `mx` must be a valid, created mutex.
pub unsafe fn try_lock(mx: *mut Mutex) -> Result<()> {
    lock_with(mx, 0)
}

/// Acquire, blocking at most `timeout` ticks.
///
/// # Safety
///
/// `mx` must be a valid, created mutex.
pub unsafe fn timed_lock(mx: *mut Mutex, timeout: Duration) -> Result<()> {
    lock_with(mx, timeout)
}

unsafe fn lock_with(mx: *mut Mutex, timeout: Duration) -> Result<()> {
    check(!mx.is_null(), Error::Invalid)?;
    check(!port::in_handler_mode(), Error::NotPermitted)?;
    let t = scheduler::current();
    check(!t.is_null(), Error::NotPermitted)?;
    if timeout != 0 {
        thread::consume_cancel(t)?;
    }

    let deadline = if timeout == 0 || timeout == WAIT_FOREVER {
        None
    } else {
        Some(clock::now().saturating_add(timeout as Timestamp))
    };

    loop {
        let s = port::irq_save();
        match try_acquire(mx, t) {
            Err(e) => {
                port::irq_restore(s);
                return Err(e);
            }
            Ok(Acquire::Taken) => {
                port::irq_restore(s);
                return Ok(());
            }
            Ok(Acquire::TakenOwnerDead) => {
                port::irq_restore(s);
                return Err(Error::OwnerDead);
            }
            Ok(Acquire::Busy) => {
                if timeout == 0 {
                    port::irq_restore(s);
                    return Err(Error::Again);
                }
                trace::sync_block(mx as usize, t as usize);
                (*t).wake_err = None;
                enqueue_waiter(mx, t);
                if let Some(d) = deadline {
                    clock::arm(t, d);
                }
                (*t).state = ThreadState::Waiting;
                scheduler::block_current();
                port::irq_restore(s);

                let s = port::irq_save();
                if (*mx).owner == t {
                    // Unlock handed us the lock before waking us.
                    let dead = (*mx).robust_state == RobustState::OwnerDead;
                    let _ = (*t).wake_err.take();
                    port::irq_restore(s);
                    return if dead { Err(Error::OwnerDead) } else { Ok(()) };
                }
                list::unlink(&mut (*t).wait_node);
                clock::disarm(t);
                (*t).blocked_mutex = ptr::null_mut();
                (*t).wait_prio_ordered = false;
                // Our departure may deflate the owner's inherited boost.
                reboost_owner(mx);
                let err = (*t).wake_err.take();
                port::irq_restore(s);
                if let Some(e) = err {
                    return Err(e);
                }
            }
        }
    }
}

/// Release the mutex.
///
/// A recursive mutex releases for real only when its count returns to
/// zero. On full release the longest-eligible waiter (highest priority
/// for inherit/protect, FIFO otherwise) receives ownership directly, and
/// the caller's inherited or ceiling boost is re-evaluated.
///
/// # Errors
///
/// `NotPermitted` - the caller does not own the mutex.
///
/// # Safety
///
/// `mx` must be a valid, created mutex.
pub unsafe fn unlock(mx: *mut Mutex) -> Result<()> {
    check(!mx.is_null(), Error::Invalid)?;
    check(!port::in_handler_mode(), Error::NotPermitted)?;
    let t = scheduler::current();
    check(!t.is_null(), Error::NotPermitted)?;

    let s = port::irq_save();
    if !(*mx).created {
        port::irq_restore(s);
        return Err(Error::Invalid);
    }
    if (*mx).owner != t {
        port::irq_restore(s);
        return Err(Error::NotPermitted);
    }
    if (*mx).mutex_type == MutexType::Recursive && (*mx).count > 1 {
        (*mx).count -= 1;
        port::irq_restore(s);
        return Ok(());
    }

    release_locked(mx, t);
    scheduler::preempt();
    port::irq_restore(s);
    Ok(())
}

/// Full release: unchain, hand over to the next waiter, restore the
/// caller's priority. Runs inside a critical section and performs no
/// preemption itself, so it is also usable mid-operation by the
/// condition variable (which must not be switched away from while its
/// own wait node is queued).
pub(crate) unsafe fn release_locked(mx: *mut Mutex, t: *mut Thread) {
    remove_held(t, mx);
    (*mx).owner = ptr::null_mut();
    (*mx).count = 0;

    if (*mx).robust_state == RobustState::OwnerDead {
        // Abandoned without repair: condemn the mutex and fail every
        // waiter out.
        (*mx).robust_state = RobustState::NotRecoverable;
        loop {
            let head = (*mx).waiters.head();
            if head.is_null() {
                break;
            }
            thread::wake(head_thread(head), Some(Error::NotRecoverable));
        }
    } else {
        let head = (*mx).waiters.head();
        if !head.is_null() {
            let next = head_thread(head);
            grant(mx, next);
            trace::sync_wake(mx as usize, next as usize);
            thread::wake(next, None);
        }
    }

    // Any boost this mutex sustained lapses now.
    let effective = (*t).base_prio.max(boosted_priority(t));
    thread::apply_priority(t, effective);
}

#[inline(always)]
unsafe fn head_thread(node: *mut list::ListNode) -> *mut Thread {
    (*node).owner as *mut Thread
}

/// Repair an owner-dead robust mutex.
///
/// Only the thread that acquired the mutex with `OwnerDead` may call
/// this, before unlocking; afterwards the mutex behaves normally again.
///
/// # Safety
///
/// `mx` must be a valid, created mutex.
pub unsafe fn consistent(mx: *mut Mutex) -> Result<()> {
    check(!mx.is_null(), Error::Invalid)?;
    let t = scheduler::current();

    let s = port::irq_save();
    let ok = (*mx).created
        && (*mx).owner == t
        && (*mx).robust_state == RobustState::OwnerDead;
    if ok {
        (*mx).robust_state = RobustState::Consistent;
    }
    port::irq_restore(s);
    check(ok, Error::Invalid)
}

/// Release everything `t` holds because it is terminating.
///
/// Robust mutexes become owner-dead and are handed to their next waiter,
/// who will observe `OwnerDead`. Stalled mutexes keep their dead owner,
/// which is exactly their contract. Runs inside a critical section.
pub(crate) unsafe fn abandon_all(t: *mut Thread) {
    let mut mx = (*t).held_mutexes;
    (*t).held_mutexes = ptr::null_mut();
    while !mx.is_null() {
        let next = (*mx).next_held;
        (*mx).next_held = ptr::null_mut();
        if (*mx).robustness == Robustness::Robust {
            (*mx).robust_state = RobustState::OwnerDead;
            (*mx).owner = ptr::null_mut();
            (*mx).count = 0;
            let head = (*mx).waiters.head();
            if !head.is_null() {
                let w = head_thread(head);
                grant(mx, w);
                thread::wake(w, None);
            }
        }
        mx = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::test_support::{adopt, fixture, spawn};
    use crate::kernel::thread::kill;

    unsafe fn make(attr: &Attributes) -> Mutex {
        let mut mx = Mutex::new();
        create(&mut mx, attr).unwrap();
        mx
    }

    #[test]
    fn uncontended_lock_and_unlock() {
        let _k = fixture();
        unsafe {
            let mut mx = make(&Attributes::new());
            let me = scheduler::current();
            assert_eq!(lock(&mut mx), Ok(()));
            assert_eq!(mx.owner(), me);
            assert_eq!(mx.count, 1);
            assert_eq!(unlock(&mut mx), Ok(()));
            assert!(!mx.is_locked());
            assert_eq!(mx.count, 0);
        }
    }

    #[test]
    fn recursive_lock_counts_and_saturates() {
        let _k = fixture();
        unsafe {
            let mut mx = make(&Attributes::recursive());
            lock(&mut mx).unwrap();
            lock(&mut mx).unwrap();
            assert_eq!(mx.count, 2);
            unlock(&mut mx).unwrap();
            assert!(mx.is_locked());
            unlock(&mut mx).unwrap();
            assert!(!mx.is_locked());

            lock(&mut mx).unwrap();
            mx.count = MUTEX_MAX_COUNT;
            assert_eq!(lock(&mut mx), Err(Error::ResourceBusy));
            mx.count = 1;
            unlock(&mut mx).unwrap();
        }
    }

    #[test]
    fn errorcheck_relock_reports_deadlock() {
        let _k = fixture();
        unsafe {
            let mut attr = Attributes::new();
            attr.mutex_type = MutexType::ErrorCheck;
            let mut mx = make(&attr);
            lock(&mut mx).unwrap();
            assert_eq!(lock(&mut mx), Err(Error::Deadlock));
            unlock(&mut mx).unwrap();
        }
    }

    #[test]
    fn unlock_by_non_owner_is_refused() {
        let _k = fixture();
        unsafe {
            let mut mx = make(&Attributes::new());
            lock(&mut mx).unwrap();
            let other = spawn(priority::NORMAL);
            adopt(other);
            assert_eq!(unlock(&mut mx), Err(Error::NotPermitted));
            assert_eq!(try_lock(&mut mx), Err(Error::Again));
        }
    }

    #[test]
    fn ceiling_below_base_priority_is_invalid() {
        let _k = fixture();
        unsafe {
            let mut attr = Attributes::new();
            attr.protocol = Protocol::Protect;
            attr.ceiling = priority::LOW;
            let mut mx = make(&attr);
            // The fixture thread runs at NORMAL > LOW.
            assert_eq!(lock(&mut mx), Err(Error::Invalid));
        }
    }

    #[test]
    fn ceiling_boost_applies_and_lapses() {
        let _k = fixture();
        unsafe {
            let mut attr = Attributes::new();
            attr.protocol = Protocol::Protect;
            attr.ceiling = priority::HIGH;
            let mut mx = make(&attr);
            let me = scheduler::current();
            lock(&mut mx).unwrap();
            assert_eq!((*me).priority(), priority::HIGH);
            assert_eq!((*me).base_priority(), priority::NORMAL);
            unlock(&mut mx).unwrap();
            assert_eq!((*me).priority(), priority::NORMAL);
        }
    }

    #[test]
    fn priority_inheritance_boosts_owner_and_hands_over() {
        let _k = fixture();
        unsafe {
            let low = spawn(5);
            adopt(low);
            let mut attr = Attributes::new();
            attr.protocol = Protocol::Inherit;
            let mut mx = make(&attr);
            lock(&mut mx).unwrap();

            // A priority-20 thread arrives at the held mutex.
            let high = spawn(20);
            scheduler::remove_from_ready(high);
            let s = port::irq_save();
            (*high).wake_err = None;
            (*high).state = ThreadState::Waiting;
            enqueue_waiter(&mut mx, high);
            port::irq_restore(s);

            assert_eq!((*low).priority(), 20);
            assert_eq!((*low).base_priority(), 5);

            // Unlock drops the boost and hands the lock to the waiter.
            unlock(&mut mx).unwrap();
            assert_eq!((*low).priority(), 5);
            assert_eq!(mx.owner(), high);
            assert_eq!((*high).state(), ThreadState::Ready);
            assert_eq!((*high).wake_err, None);
        }
    }

    #[test]
    fn killing_a_blocked_waiter_deflates_the_boost() {
        let _k = fixture();
        unsafe {
            let low = spawn(5);
            adopt(low);
            let mut attr = Attributes::new();
            attr.protocol = Protocol::Inherit;
            let mut mx = make(&attr);
            lock(&mut mx).unwrap();

            let high = spawn(20);
            scheduler::remove_from_ready(high);
            let s = port::irq_save();
            (*high).wake_err = None;
            (*high).state = ThreadState::Waiting;
            enqueue_waiter(&mut mx, high);
            port::irq_restore(s);
            assert_eq!((*low).priority(), 20);

            // The waiter dies; the boost it imposed must die with it.
            kill(high).unwrap();
            assert_eq!((*low).priority(), 5);
            assert!(mx.waiters.is_empty());
            unlock(&mut mx).unwrap();
        }
    }

    #[test]
    fn robust_mutex_owner_death_handshake() {
        let _k = fixture();
        unsafe {
            let mut attr = Attributes::new();
            attr.robustness = Robustness::Robust;
            let mut mx = make(&attr);

            let victim = spawn(priority::NORMAL);
            adopt(victim);
            lock(&mut mx).unwrap();

            let survivor = spawn(priority::NORMAL);
            adopt(survivor);
            kill(victim).unwrap();
            assert_eq!(mx.robust_state, RobustState::OwnerDead);
            assert!(!mx.is_locked());

            // The next lock succeeds but reports the death.
            assert_eq!(lock(&mut mx), Err(Error::OwnerDead));
            assert_eq!(mx.owner(), survivor);

            // Unlocking without repair condemns the mutex.
            unlock(&mut mx).unwrap();
            assert_eq!(mx.robust_state, RobustState::NotRecoverable);
            assert_eq!(lock(&mut mx), Err(Error::NotRecoverable));
        }
    }

    #[test]
    fn robust_mutex_repaired_by_consistent() {
        let _k = fixture();
        unsafe {
            let mut attr = Attributes::new();
            attr.robustness = Robustness::Robust;
            let mut mx = make(&attr);

            let victim = spawn(priority::NORMAL);
            adopt(victim);
            lock(&mut mx).unwrap();
            let survivor = spawn(priority::NORMAL);
            adopt(survivor);
            kill(victim).unwrap();

            assert_eq!(lock(&mut mx), Err(Error::OwnerDead));
            assert_eq!(consistent(&mut mx), Ok(()));
            unlock(&mut mx).unwrap();
            assert_eq!(lock(&mut mx), Ok(()));
            unlock(&mut mx).unwrap();
        }
    }

    #[test]
    fn consistent_requires_owner_dead_state() {
        let _k = fixture();
        unsafe {
            let mut mx = make(&Attributes::new());
            lock(&mut mx).unwrap();
            assert_eq!(consistent(&mut mx), Err(Error::Invalid));
            unlock(&mut mx).unwrap();
        }
    }
}
