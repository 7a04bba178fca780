/*
 * kernos - an RTOS core for small microcontrollers.
 *
 * SPDX-License-Identifier: MIT
 */

//! Threads.
//!
//! A [`Thread`] is a control block the caller owns, bound at `create`
//! time to a caller-supplied stack. The kernel never allocates: the wait
//! node and the clock node used to queue the thread are embedded in the
//! control block, and a non-terminated thread is always in exactly one
//! place - running, on the ready list, or on one wait list.
//!
//! The state machine is `Undefined -> Inactive -> Ready <-> Running <->
//! Waiting -> Terminated -> Destroyed`; a control block can be reused by
//! `create` once it reaches `Terminated`.

use core::ffi::c_void;
use core::ptr;

use crate::config::{OS_STACK_FILL_BYTE, OS_THREAD_CLEANUP_DEPTH};
use crate::kernel::list::{self, prio_key, ListNode};
use crate::kernel::mutex::{self, Mutex};
use crate::kernel::{clock, scheduler};
use crate::port::{self, StackElement};
use crate::trace;
use crate::types::*;

/// Smallest stack accepted by `create`: one initial frame plus headroom.
pub const MIN_STACK_SIZE_BYTES: usize = 32 * core::mem::size_of::<StackElement>();

// =============================================================================
// Attributes
// =============================================================================

/// Creation attributes. The stack is always caller-supplied.
pub struct Attributes {
    /// Debug name; `"-"` for anonymous threads.
    pub name: &'static str,
    /// Initial (base) priority.
    pub priority: Priority,
    /// Bottom of the stack region.
    pub stack_base: *mut StackElement,
    /// Stack region size in bytes.
    pub stack_size_bytes: usize,
}

impl Attributes {
    pub const fn new() -> Self {
        Attributes {
            name: "-",
            priority: priority::NORMAL,
            stack_base: ptr::null_mut(),
            stack_size_bytes: 0,
        }
    }
}

impl Default for Attributes {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Control block
// =============================================================================

#[derive(Clone, Copy)]
pub(crate) struct CleanupRec {
    pub(crate) func: Option<CleanupFn>,
    pub(crate) arg: *mut c_void,
}

impl CleanupRec {
    const EMPTY: Self = CleanupRec {
        func: None,
        arg: ptr::null_mut(),
    };
}

/// Thread control block.
///
/// Constructed with [`Thread::new`] (state `Undefined`), then initialized
/// by [`create`]. The kernel holds only weak references to it; the caller
/// keeps it alive for the thread's lifetime.
#[repr(C)]
pub struct Thread {
    /// Saved stack pointer. The port's context switch writes through a
    /// pointer to this field, so it must stay first.
    pub(crate) sp: *mut StackElement,

    pub(crate) state: ThreadState,
    /// Effective priority, including any inheritance or ceiling boost.
    pub(crate) prio: Priority,
    /// Priority assigned by `create`/`priority_set`.
    pub(crate) base_prio: Priority,

    pub(crate) entry: Option<ThreadEntry>,
    pub(crate) arg: *mut c_void,
    pub(crate) exit_value: *mut c_void,

    pub(crate) stack_base: *mut StackElement,
    pub(crate) stack_size_bytes: usize,

    /// Membership in the ready list or one primitive's wait list.
    pub(crate) wait_node: ListNode,
    /// Membership in the timed-wait list.
    pub(crate) clock_node: ListNode,
    /// Whether `wait_node` sits on a priority-ordered list (and must be
    /// re-sorted when the priority changes).
    pub(crate) wait_prio_ordered: bool,

    /// Outcome of the last block, written by the waker: `None` for a
    /// normal wake, `TimedOut`, or `Interrupted`.
    pub(crate) wake_err: Option<Error>,

    // Signal flags.
    pub(crate) sig_raised: FlagsMask,
    pub(crate) sig_wanted: FlagsMask,
    pub(crate) sig_mode: FlagsMode,
    pub(crate) sig_waiting: bool,

    // Event-flags wait record, valid while queued on an event object.
    pub(crate) flags_wanted: FlagsMask,
    pub(crate) flags_mode: FlagsMode,
    pub(crate) flags_taken: FlagsMask,

    /// Thread blocked in `join` on us, if any.
    pub(crate) joiner: *mut Thread,
    /// Thread we are blocked joining, if any.
    pub(crate) join_target: *mut Thread,
    pub(crate) detached: bool,

    pub(crate) cancel_pending: bool,

    /// Head of the chain of mutexes this thread holds.
    pub(crate) held_mutexes: *mut Mutex,
    /// Inherit-protocol mutex this thread is blocked on, if any.
    pub(crate) blocked_mutex: *mut Mutex,
    /// Mutex released by an in-progress condition-variable wait.
    pub(crate) condvar_mutex: *mut Mutex,

    pub(crate) cleanups: [CleanupRec; OS_THREAD_CLEANUP_DEPTH],
    pub(crate) cleanup_depth: u8,

    pub(crate) name: &'static str,
}

impl Thread {
    /// A control block in the `Undefined` state.
    pub const fn new() -> Self {
        Thread {
            sp: ptr::null_mut(),
            state: ThreadState::Undefined,
            prio: priority::NONE,
            base_prio: priority::NONE,
            entry: None,
            arg: ptr::null_mut(),
            exit_value: ptr::null_mut(),
            stack_base: ptr::null_mut(),
            stack_size_bytes: 0,
            wait_node: ListNode::new(),
            clock_node: ListNode::new(),
            wait_prio_ordered: false,
            wake_err: None,
            sig_raised: 0,
            sig_wanted: 0,
            sig_mode: 0,
            sig_waiting: false,
            flags_wanted: 0,
            flags_mode: 0,
            flags_taken: 0,
            joiner: ptr::null_mut(),
            join_target: ptr::null_mut(),
            detached: false,
            cancel_pending: false,
            held_mutexes: ptr::null_mut(),
            blocked_mutex: ptr::null_mut(),
            condvar_mutex: ptr::null_mut(),
            cleanups: [CleanupRec::EMPTY; OS_THREAD_CLEANUP_DEPTH],
            cleanup_depth: 0,
            name: "-",
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn state(&self) -> ThreadState {
        self.state
    }

    /// Effective priority (base plus any boost).
    pub fn priority(&self) -> Priority {
        self.prio
    }

    pub fn base_priority(&self) -> Priority {
        self.base_prio
    }
}

impl Default for Thread {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Creation
// =============================================================================

/// Entry trampoline: the port's initial frame "returns" into this with
/// the control block as argument.
pub(crate) extern "C" fn trampoline(arg: *mut c_void) {
    let t = arg as *mut Thread;
    // Safety: the trampoline only ever runs on a thread initialized by
    // `create`, which sets `entry`.
    unsafe {
        let value = match (*t).entry {
            Some(entry) => entry((*t).arg),
            None => ptr::null_mut(),
        };
        exit(value);
    }
}

/// Initialize a control block and make the thread ready.
///
/// Reusable for control blocks in the `Undefined`, `Terminated` or
/// `Destroyed` states. The stack region is painted for the high-water
/// mark scan, then handed to the port for frame setup.
///
/// # Errors
///
/// - `Invalid` - null/undersized stack, out-of-band priority, or a
///   control block that is still alive.
/// - `NotPermitted` - called from handler mode.
///
/// # Safety
///
/// `t` must point to a valid control block; the stack region in `attr`
/// must be writable and unused by anything else.
pub unsafe fn create(
    t: *mut Thread,
    attr: &Attributes,
    entry: ThreadEntry,
    arg: *mut c_void,
) -> Result<()> {
    check(!port::in_handler_mode(), Error::NotPermitted)?;
    check(!t.is_null(), Error::Invalid)?;
    check(
        attr.priority > priority::NONE && attr.priority <= priority::HIGHEST,
        Error::Invalid,
    )?;
    init_raw(t, attr, entry, arg)
}

/// Creation without the user-band priority check, for the kernel's own
/// idle and deferred-callback threads.
pub(crate) unsafe fn init_raw(
    t: *mut Thread,
    attr: &Attributes,
    entry: ThreadEntry,
    arg: *mut c_void,
) -> Result<()> {
    check(!attr.stack_base.is_null(), Error::Invalid)?;
    check(attr.stack_size_bytes >= MIN_STACK_SIZE_BYTES, Error::Invalid)?;
    check(
        matches!(
            (*t).state,
            ThreadState::Undefined | ThreadState::Terminated | ThreadState::Destroyed
        ),
        Error::Invalid,
    )?;

    *t = Thread::new();
    (*t).state = ThreadState::Inactive;
    (*t).prio = attr.priority;
    (*t).base_prio = attr.priority;
    (*t).entry = Some(entry);
    (*t).arg = arg;
    (*t).stack_base = attr.stack_base;
    (*t).stack_size_bytes = attr.stack_size_bytes;
    (*t).name = attr.name;
    (*t).wait_node.owner = t as *mut c_void;
    (*t).clock_node.owner = t as *mut c_void;

    // Paint the stack for `stack_available`.
    ptr::write_bytes(
        attr.stack_base as *mut u8,
        OS_STACK_FILL_BYTE,
        attr.stack_size_bytes,
    );

    (*t).sp = port::stack_init(
        attr.stack_base,
        attr.stack_size_bytes,
        trampoline,
        t as *mut c_void,
    );

    trace::thread_create(t as usize, attr.priority);

    let s = port::irq_save();
    scheduler::ready_thread(t);
    // A creation that outranks the creator runs immediately.
    scheduler::preempt();
    port::irq_restore(s);
    Ok(())
}

// =============================================================================
// Termination
// =============================================================================

/// Terminate the calling thread.
///
/// Runs the cleanup handlers (LIFO), abandons held mutexes (robust ones
/// become owner-dead), hands `value` to a joiner, and never returns.
pub unsafe fn exit(value: *mut c_void) -> ! {
    let t = scheduler::current();
    run_cleanups(t);

    let s = port::irq_save();
    (*t).exit_value = value;
    mutex::abandon_all(t);
    finish(t);
    trace::thread_terminate(t as usize);
    scheduler::block_current();
    port::irq_restore(s);

    // A terminated thread is never rescheduled; this is only reachable
    // on the host port, which cannot switch away.
    loop {
        port::idle_sleep();
    }
}

/// Forcibly terminate `t`.
///
/// The cleanup handlers run in the caller's context. If `t` is the
/// calling thread this is `exit(null)`.
///
/// # Safety
///
/// `t` must be a valid, created control block.
pub unsafe fn kill(t: *mut Thread) -> Result<()> {
    check(!port::in_handler_mode(), Error::NotPermitted)?;
    check(!t.is_null(), Error::Invalid)?;

    if t == scheduler::current() {
        exit(ptr::null_mut());
    }

    let s = port::irq_save();
    match (*t).state {
        ThreadState::Undefined | ThreadState::Terminated | ThreadState::Destroyed => {
            port::irq_restore(s);
            return Err(Error::Invalid);
        }
        ThreadState::Ready => {
            scheduler::remove_from_ready(t);
        }
        ThreadState::Waiting => {
            let blocked_on = (*t).blocked_mutex;
            list::unlink(&mut (*t).wait_node);
            clock::disarm(t);
            (*t).sig_waiting = false;
            (*t).blocked_mutex = ptr::null_mut();
            (*t).wait_prio_ordered = false;
            // Its departure may deflate the owner's inherited boost.
            if !blocked_on.is_null() {
                mutex::reboost_owner(blocked_on);
            }
            if !(*t).join_target.is_null() {
                (*(*t).join_target).joiner = ptr::null_mut();
                (*t).join_target = ptr::null_mut();
            }
        }
        ThreadState::Running | ThreadState::Inactive => {}
    }
    port::irq_restore(s);

    run_cleanups(t);

    let s = port::irq_save();
    mutex::abandon_all(t);
    finish(t);
    trace::thread_terminate(t as usize);
    scheduler::preempt();
    port::irq_restore(s);
    Ok(())
}

/// Common tail of `exit` and `kill`: state transition plus joiner wake.
/// Runs inside a critical section.
unsafe fn finish(t: *mut Thread) {
    (*t).state = if (*t).detached {
        ThreadState::Destroyed
    } else {
        ThreadState::Terminated
    };
    let joiner = (*t).joiner;
    if !joiner.is_null() {
        (*t).joiner = ptr::null_mut();
        (*joiner).join_target = ptr::null_mut();
        wake(joiner, None);
    }
}

unsafe fn run_cleanups(t: *mut Thread) {
    while (*t).cleanup_depth > 0 {
        (*t).cleanup_depth -= 1;
        let rec = (*t).cleanups[(*t).cleanup_depth as usize];
        if let Some(func) = rec.func {
            func(rec.arg);
        }
    }
}

/// Register a cleanup handler on the calling thread (LIFO order).
pub fn cleanup_push(func: CleanupFn, arg: *mut c_void) -> Result<()> {
    let t = scheduler::current();
    unsafe {
        check(!t.is_null(), Error::NotPermitted)?;
        check(
            ((*t).cleanup_depth as usize) < OS_THREAD_CLEANUP_DEPTH,
            Error::OutOfMemory,
        )?;
        (*t).cleanups[(*t).cleanup_depth as usize] = CleanupRec {
            func: Some(func),
            arg,
        };
        (*t).cleanup_depth += 1;
    }
    Ok(())
}

/// Remove the most recent cleanup handler, running it when `execute`.
pub fn cleanup_pop(execute: bool) -> Result<()> {
    let t = scheduler::current();
    unsafe {
        check(!t.is_null(), Error::NotPermitted)?;
        check((*t).cleanup_depth > 0, Error::Invalid)?;
        (*t).cleanup_depth -= 1;
        let rec = (*t).cleanups[(*t).cleanup_depth as usize];
        if execute {
            if let Some(func) = rec.func {
                func(rec.arg);
            }
        }
    }
    Ok(())
}

// =============================================================================
// Join / detach
// =============================================================================

/// Wait for `t` to terminate and reclaim it, returning its exit value.
///
/// # Errors
///
/// - `Deadlock` - joining the calling thread.
/// - `Invalid` - detached target, never-created target, or a second
///   simultaneous joiner.
/// - `Interrupted` - the calling thread was cancelled.
///
/// # Safety
///
/// `t` must be a valid control block.
pub unsafe fn join(t: *mut Thread) -> Result<*mut c_void> {
    check(!port::in_handler_mode(), Error::NotPermitted)?;
    check(!t.is_null(), Error::Invalid)?;
    let cur = scheduler::current();
    check(t != cur, Error::Deadlock)?;

    let s = port::irq_save();
    if (*t).detached || (*t).state == ThreadState::Undefined || (*t).state == ThreadState::Destroyed
    {
        port::irq_restore(s);
        return Err(Error::Invalid);
    }
    if (*t).state != ThreadState::Terminated {
        if !(*t).joiner.is_null() {
            port::irq_restore(s);
            return Err(Error::Invalid);
        }
        (*t).joiner = cur;
        (*cur).join_target = t;
        (*cur).wake_err = None;
        (*cur).state = ThreadState::Waiting;
        scheduler::block_current();
        port::irq_restore(s);

        // Resumed: either the target terminated or we were cancelled.
        let s2 = port::irq_save();
        let err = (*cur).wake_err.take();
        port::irq_restore(s2);
        if let Some(e) = err {
            return Err(e);
        }
    }

    let s = port::irq_save();
    (*t).state = ThreadState::Destroyed;
    let value = (*t).exit_value;
    port::irq_restore(s);
    Ok(value)
}

/// Mark `t` detached: it is reclaimed automatically at termination.
///
/// # Safety
///
/// `t` must be a valid control block.
pub unsafe fn detach(t: *mut Thread) -> Result<()> {
    check(!t.is_null(), Error::Invalid)?;
    let s = port::irq_save();
    let r = match (*t).state {
        ThreadState::Undefined | ThreadState::Destroyed => Err(Error::Invalid),
        ThreadState::Terminated => {
            (*t).state = ThreadState::Destroyed;
            Ok(())
        }
        _ => {
            (*t).detached = true;
            Ok(())
        }
    };
    port::irq_restore(s);
    r
}

// =============================================================================
// Cancellation
// =============================================================================

/// Request cooperative cancellation of `t`.
///
/// Sets the cancel flag; if `t` is blocked, it wakes with `Interrupted`.
/// The flag is observed at the next blocking call or [`test_cancel`].
///
/// # Safety
///
/// `t` must be a valid, created control block.
pub unsafe fn cancel(t: *mut Thread) -> Result<()> {
    check(!t.is_null(), Error::Invalid)?;
    let s = port::irq_save();
    if matches!(
        (*t).state,
        ThreadState::Undefined | ThreadState::Terminated | ThreadState::Destroyed
    ) {
        port::irq_restore(s);
        return Err(Error::Invalid);
    }
    (*t).cancel_pending = true;
    if (*t).state == ThreadState::Waiting {
        if !(*t).join_target.is_null() {
            (*(*t).join_target).joiner = ptr::null_mut();
            (*t).join_target = ptr::null_mut();
        }
        wake(t, Some(Error::Interrupted));
        scheduler::preempt();
    }
    port::irq_restore(s);
    Ok(())
}

/// Whether cancellation is pending on the calling thread. The flag is
/// consumed when it reports true.
pub fn test_cancel() -> bool {
    let t = scheduler::current();
    if t.is_null() {
        return false;
    }
    unsafe {
        let s = port::irq_save();
        let pending = (*t).cancel_pending;
        (*t).cancel_pending = false;
        port::irq_restore(s);
        pending
    }
}

/// Consume a pending cancellation at the start of a blocking call.
pub(crate) unsafe fn consume_cancel(t: *mut Thread) -> Result<()> {
    let s = port::irq_save();
    let pending = (*t).cancel_pending;
    (*t).cancel_pending = false;
    port::irq_restore(s);
    check(!pending, Error::Interrupted)
}

// =============================================================================
// Signal flags
// =============================================================================

/// Decide whether `raised` satisfies a flags wait, returning the bits
/// the waiter takes.
pub(crate) fn flags_satisfied(
    raised: FlagsMask,
    wanted: FlagsMask,
    mode: FlagsMode,
) -> Option<FlagsMask> {
    if wanted == sig::ANY {
        if raised != 0 {
            return Some(raised);
        }
        return None;
    }
    if mode & flags_mode::ALL != 0 {
        if raised & wanted == wanted {
            return Some(wanted);
        }
        return None;
    }
    if raised & wanted != 0 {
        return Some(raised & wanted);
    }
    None
}

/// Raise signal flags on `t`. Callable from handler mode.
///
/// # Safety
///
/// `t` must be a valid, created control block.
pub unsafe fn signal_raise(t: *mut Thread, mask: FlagsMask) -> Result<FlagsMask> {
    check(!t.is_null(), Error::Invalid)?;
    check(mask != 0, Error::Invalid)?;

    let s = port::irq_save();
    (*t).sig_raised |= mask;
    let raised = (*t).sig_raised;
    trace::thread_signal(t as usize, raised);

    if (*t).sig_waiting {
        if let Some(taken) = flags_satisfied(raised, (*t).sig_wanted, (*t).sig_mode) {
            if (*t).sig_mode & flags_mode::CLEAR != 0 {
                (*t).sig_raised &= !taken;
            }
            (*t).flags_taken = taken;
            (*t).sig_waiting = false;
            wake(t, None);
            scheduler::preempt();
        }
    }
    port::irq_restore(s);
    Ok(raised)
}

/// Wait for signal flags on the calling thread.
///
/// `mask == sig::ANY` matches any raised flag. `mode` combines
/// `flags_mode::{ALL, ANY, CLEAR}`. A zero `timeout` never suspends
/// (`Again` when unsatisfied); `WAIT_FOREVER` waits indefinitely.
///
/// Returns the flags taken.
pub fn signal_wait(mask: FlagsMask, mode: FlagsMode, timeout: Duration) -> Result<FlagsMask> {
    check(!port::in_handler_mode(), Error::NotPermitted)?;
    let t = scheduler::current();
    check(!t.is_null(), Error::NotPermitted)?;

    unsafe {
        consume_cancel(t)?;
        let s = port::irq_save();
        if let Some(taken) = flags_satisfied((*t).sig_raised, mask, mode) {
            if mode & flags_mode::CLEAR != 0 {
                (*t).sig_raised &= !taken;
            }
            port::irq_restore(s);
            return Ok(taken);
        }
        if timeout == 0 {
            port::irq_restore(s);
            return Err(Error::Again);
        }

        // The raiser satisfies the wait: it computes the taken bits,
        // clears them under CLEAR mode, and readies us.
        (*t).sig_wanted = mask;
        (*t).sig_mode = mode;
        (*t).sig_waiting = true;
        (*t).wake_err = None;
        (*t).state = ThreadState::Waiting;
        if timeout != WAIT_FOREVER {
            clock::arm(t, clock::now().saturating_add(timeout as Timestamp));
        }
        scheduler::block_current();
        port::irq_restore(s);

        let s = port::irq_save();
        (*t).sig_waiting = false;
        clock::disarm(t);
        let err = (*t).wake_err.take();
        let taken = (*t).flags_taken;
        port::irq_restore(s);
        match err {
            None => Ok(taken),
            Some(e) => Err(e),
        }
    }
}

/// Clear signal flags on the calling thread, returning the previous set.
pub fn signal_clear(mask: FlagsMask) -> Result<FlagsMask> {
    check(mask != 0, Error::Invalid)?;
    let t = scheduler::current();
    check(!t.is_null(), Error::NotPermitted)?;
    unsafe {
        let s = port::irq_save();
        let prev = (*t).sig_raised;
        (*t).sig_raised &= !mask;
        port::irq_restore(s);
        Ok(prev)
    }
}

/// The raised signal flags of the calling thread.
pub fn signal_get() -> FlagsMask {
    let t = scheduler::current();
    if t.is_null() {
        return 0;
    }
    unsafe {
        let s = port::irq_save();
        let raised = (*t).sig_raised;
        port::irq_restore(s);
        raised
    }
}

// =============================================================================
// Priority
// =============================================================================

/// The effective priority of `t`.
///
/// # Safety
///
/// `t` must be a valid control block.
pub unsafe fn priority_get(t: *mut Thread) -> Priority {
    (*t).prio
}

/// Change the base priority of `t`.
///
/// The effective priority is recomputed from any boosts still in force;
/// a ready or priority-queued thread is re-sorted, and the change may
/// cause an immediate preemption.
///
/// # Safety
///
/// `t` must be a valid, created control block.
pub unsafe fn priority_set(t: *mut Thread, prio: Priority) -> Result<()> {
    check(!t.is_null(), Error::Invalid)?;
    check(
        prio > priority::NONE && prio <= priority::HIGHEST,
        Error::Invalid,
    )?;

    let s = port::irq_save();
    if matches!(
        (*t).state,
        ThreadState::Undefined | ThreadState::Terminated | ThreadState::Destroyed
    ) {
        port::irq_restore(s);
        return Err(Error::Invalid);
    }

    (*t).base_prio = prio;
    let effective = mutex::boosted_priority(t).max(prio);
    apply_priority(t, effective);
    scheduler::preempt();
    port::irq_restore(s);
    trace::thread_priority(t as usize, prio);
    Ok(())
}

/// Install a new effective priority and re-sort whatever queue the
/// thread occupies. Runs inside a critical section.
pub(crate) unsafe fn apply_priority(t: *mut Thread, effective: Priority) {
    if (*t).prio == effective {
        return;
    }
    (*t).prio = effective;

    match (*t).state {
        ThreadState::Ready => {
            scheduler::remove_from_ready(t);
            scheduler::ready_requeue(t);
        }
        ThreadState::Waiting => {
            if (*t).wait_prio_ordered && (*t).wait_node.is_linked() {
                let container = (*t).wait_node.container();
                list::unlink(&mut (*t).wait_node);
                (*t).wait_node.key = prio_key(effective);
                (*container).insert_ordered(&mut (*t).wait_node);
            }
            // A boost must follow the thread down a mutex chain.
            let blocked_on = (*t).blocked_mutex;
            if !blocked_on.is_null() {
                mutex::reboost_owner(blocked_on);
            }
        }
        _ => {}
    }
}

// =============================================================================
// Stack accounting
// =============================================================================

/// Bytes of stack never touched since creation, from the fill-byte scan.
///
/// # Safety
///
/// `t` must be a valid, created control block.
pub unsafe fn stack_available(t: *mut Thread) -> usize {
    let base = (*t).stack_base as *const u8;
    if base.is_null() {
        return 0;
    }
    let mut n = 0;
    while n < (*t).stack_size_bytes && *base.add(n) == OS_STACK_FILL_BYTE {
        n += 1;
    }
    n
}

// =============================================================================
// Wakeup
// =============================================================================

/// Make a waiting thread ready, recording why it woke.
///
/// Unlinks the thread from its wait list and the timed-wait list, so the
/// caller only needs to have decided *that* it wakes. Runs inside a
/// critical section; the caller triggers preemption afterwards.
pub(crate) unsafe fn wake(t: *mut Thread, err: Option<Error>) {
    debug_assert!((*t).state == ThreadState::Waiting);
    list::unlink(&mut (*t).wait_node);
    clock::disarm(t);
    (*t).sig_waiting = false;
    (*t).blocked_mutex = ptr::null_mut();
    (*t).wait_prio_ordered = false;
    (*t).wake_err = err;
    scheduler::ready_thread(t);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::test_support::{fixture, spawn};

    #[test]
    fn create_validates_arguments() {
        let _k = fixture();
        unsafe {
            let mut t = Thread::new();
            let mut stack = [0usize; 64];

            // Null stack.
            let mut attr = Attributes::new();
            attr.priority = priority::NORMAL;
            assert_eq!(
                create(&mut t, &attr, test_entry, ptr::null_mut()),
                Err(Error::Invalid)
            );

            // Undersized stack.
            attr.stack_base = stack.as_mut_ptr();
            attr.stack_size_bytes = 8;
            assert_eq!(
                create(&mut t, &attr, test_entry, ptr::null_mut()),
                Err(Error::Invalid)
            );

            // Reserved priority.
            attr.stack_size_bytes = core::mem::size_of_val(&stack);
            attr.priority = priority::NONE;
            assert_eq!(
                create(&mut t, &attr, test_entry, ptr::null_mut()),
                Err(Error::Invalid)
            );
            attr.priority = priority::ISR;
            assert_eq!(
                create(&mut t, &attr, test_entry, ptr::null_mut()),
                Err(Error::Invalid)
            );

            // And a good one.
            attr.priority = priority::NORMAL;
            assert_eq!(create(&mut t, &attr, test_entry, ptr::null_mut()), Ok(()));
            assert_eq!(t.state(), ThreadState::Ready);
            assert_eq!(t.priority(), priority::NORMAL);
        }
    }

    extern "C" fn test_entry(_arg: *mut c_void) -> *mut c_void {
        ptr::null_mut()
    }

    #[test]
    fn created_stack_is_painted() {
        let _k = fixture();
        unsafe {
            let t = spawn(priority::NORMAL);
            // The host port lays no frame, so the whole region stays
            // painted.
            assert_eq!(stack_available(t), (*t).stack_size_bytes);
        }
    }

    #[test]
    fn signal_raise_and_try_wait_round_trip() {
        let _k = fixture();
        unsafe {
            let cur = scheduler::current();
            assert_eq!(signal_raise(cur, 0b0101), Ok(0b0101));

            // ANY | CLEAR takes the matched bits and clears them.
            let taken = signal_wait(0b0100, flags_mode::ANY | flags_mode::CLEAR, 0).unwrap();
            assert_eq!(taken, 0b0100);
            assert_eq!(signal_get(), 0b0001);

            // ALL on missing bits would block; zero timeout says Again.
            assert_eq!(
                signal_wait(0b0011, flags_mode::ALL, 0),
                Err(Error::Again)
            );

            // Zero mask matches any currently raised bit.
            let taken = signal_wait(sig::ANY, flags_mode::CLEAR, 0).unwrap();
            assert_eq!(taken, 0b0001);
            assert_eq!(signal_get(), 0);
        }
    }

    #[test]
    fn signal_clear_is_idempotent() {
        let _k = fixture();
        unsafe {
            let cur = scheduler::current();
            signal_raise(cur, 0b1110).unwrap();
            assert_eq!(signal_clear(0b0110), Ok(0b1110));
            assert_eq!(signal_get(), 0b1000);
            assert_eq!(signal_clear(0b0110), Ok(0b1000));
            assert_eq!(signal_get(), 0b1000);
        }
    }

    #[test]
    fn raising_zero_mask_is_invalid() {
        let _k = fixture();
        unsafe {
            let cur = scheduler::current();
            assert_eq!(signal_raise(cur, 0), Err(Error::Invalid));
        }
    }

    #[test]
    fn join_of_terminated_thread_reaps_it() {
        let _k = fixture();
        unsafe {
            let t = spawn(priority::NORMAL);
            (*t).exit_value = 7 as *mut c_void;
            kill(t).unwrap();
            assert_eq!((*t).state(), ThreadState::Terminated);
            assert_eq!(join(t), Ok(7 as *mut c_void));
            assert_eq!((*t).state(), ThreadState::Destroyed);
        }
    }

    #[test]
    fn join_self_deadlocks() {
        let _k = fixture();
        unsafe {
            let cur = scheduler::current();
            assert_eq!(join(cur).unwrap_err(), Error::Deadlock);
        }
    }

    #[test]
    fn detach_then_kill_destroys() {
        let _k = fixture();
        unsafe {
            let t = spawn(priority::NORMAL);
            detach(t).unwrap();
            kill(t).unwrap();
            assert_eq!((*t).state(), ThreadState::Destroyed);
            assert_eq!(join(t).unwrap_err(), Error::Invalid);
        }
    }

    #[test]
    fn priority_set_requeues_ready_thread() {
        let _k = fixture();
        unsafe {
            let a = spawn(priority::LOW);
            let b = spawn(priority::LOW);
            // FIFO within the level: a before b.
            priority_set(b, priority::HIGH).unwrap();
            assert_eq!((*b).priority(), priority::HIGH);
            // b now outranks a in the ready queue.
            let top = crate::kernel::scheduler::top_ready_priority();
            assert_eq!(top, Some(priority::HIGH));
            let _ = a;
        }
    }

    #[test]
    fn cancel_flag_is_consumed_by_test_cancel() {
        let _k = fixture();
        unsafe {
            let cur = scheduler::current();
            assert!(!test_cancel());
            // A running thread only gets the flag set.
            cancel(cur).unwrap();
            assert!(test_cancel());
            assert!(!test_cancel());
        }
    }

    #[test]
    fn cleanup_handlers_run_lifo_on_kill() {
        static mut ORDER: [u8; 4] = [0; 4];
        static mut N: usize = 0;

        extern "C" fn rec(arg: *mut c_void) {
            unsafe {
                ORDER[N] = arg as usize as u8;
                N += 1;
            }
        }

        let _k = fixture();
        unsafe {
            ORDER = [0; 4];
            N = 0;
            let t = spawn(priority::NORMAL);
            // Push on behalf of t.
            (*t).cleanups[0] = CleanupRec {
                func: Some(rec),
                arg: 1 as *mut c_void,
            };
            (*t).cleanups[1] = CleanupRec {
                func: Some(rec),
                arg: 2 as *mut c_void,
            };
            (*t).cleanup_depth = 2;
            kill(t).unwrap();
            assert_eq!(N, 2);
            assert_eq!(ORDER[0], 2);
            assert_eq!(ORDER[1], 1);
        }
    }
}
