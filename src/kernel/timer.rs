/*
 * kernos - an RTOS core for small microcontrollers.
 *
 * SPDX-License-Identifier: MIT
 */

//! User timers.
//!
//! One-shot and periodic timers sit on their own deadline-ordered list.
//! The tick interrupt only *notices* an expired head and releases the
//! timer service thread; callbacks always run in that thread, at the
//! reserved `isr` priority band, never in interrupt context.
//!
//! Periodic timers re-arm at `previous_deadline + period`, not
//! `now + period`, so a late service pass does not accumulate drift.

use core::ffi::c_void;
use core::ptr;

use crate::config::OS_TIMER_STACK_SIZE_BYTES;
use crate::kernel::list::{unlink, List, ListNode};
use crate::kernel::semaphore::{self, Semaphore};
use crate::kernel::clock;
use crate::kernel::thread::{self, Attributes as ThreadAttributes, Thread};
use crate::port::{self, StackElement};
use crate::trace;
use crate::types::*;

/// Run type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerType {
    /// Fire once, then stop.
    Once,
    /// Re-arm after every expiry.
    Periodic,
}

/// Creation attributes.
pub struct Attributes {
    pub name: &'static str,
    pub timer_type: TimerType,
}

impl Attributes {
    pub const fn new() -> Self {
        Attributes {
            name: "-",
            timer_type: TimerType::Once,
        }
    }

    pub const fn periodic() -> Self {
        Attributes {
            name: "-",
            timer_type: TimerType::Periodic,
        }
    }
}

impl Default for Attributes {
    fn default() -> Self {
        Self::new()
    }
}

/// Timer control block.
pub struct Timer {
    /// Membership in the deadline-ordered timer list.
    pub(crate) node: ListNode,
    pub(crate) func: Option<TimerFn>,
    pub(crate) arg: *mut c_void,
    pub(crate) period: Duration,
    pub(crate) timer_type: TimerType,
    pub(crate) running: bool,
    pub(crate) created: bool,
    pub(crate) name: &'static str,
}

impl Timer {
    pub const fn new() -> Self {
        Timer {
            node: ListNode::new(),
            func: None,
            arg: ptr::null_mut(),
            period: 0,
            timer_type: TimerType::Once,
            running: false,
            created: false,
            name: "-",
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_running(&self) -> bool {
        self.running
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Timer list and service thread state
// =============================================================================

/// Armed timers, ordered by absolute expiry tick.
static mut TIMER_LIST: List = List::new();

/// Released by the tick interrupt when the head timer expires, and by
/// `start` when the head may have changed.
static mut SERVICE_SEM: Semaphore = Semaphore::new();

static mut SERVICE_THREAD: Thread = Thread::new();
static mut SERVICE_STACK: [StackElement; OS_TIMER_STACK_SIZE_BYTES / core::mem::size_of::<StackElement>()] =
    [0; OS_TIMER_STACK_SIZE_BYTES / core::mem::size_of::<StackElement>()];

// =============================================================================
// API
// =============================================================================

/// Initialize a timer control block.
///
/// # Safety
///
/// `tm` must point to a valid control block not in use.
pub unsafe fn create(
    tm: *mut Timer,
    attr: &Attributes,
    func: TimerFn,
    arg: *mut c_void,
) -> Result<()> {
    check(!tm.is_null(), Error::Invalid)?;

    *tm = Timer::new();
    (*tm).func = Some(func);
    (*tm).arg = arg;
    (*tm).timer_type = attr.timer_type;
    (*tm).name = attr.name;
    (*tm).node.owner = tm as *mut c_void;
    (*tm).created = true;
    Ok(())
}

/// Arm the timer to fire `period` ticks from now. An armed timer is
/// re-armed with the new period.
///
/// # Safety
///
/// `tm` must be a valid, created timer.
pub unsafe fn start(tm: *mut Timer, period: Duration) -> Result<()> {
    check(!tm.is_null(), Error::Invalid)?;
    check(period > 0 && period != WAIT_FOREVER, Error::Invalid)?;

    let s = port::irq_save();
    if !(*tm).created {
        port::irq_restore(s);
        return Err(Error::Invalid);
    }
    unlink(&mut (*tm).node);
    (*tm).period = period;
    let deadline = clock::now().saturating_add(period as Timestamp);
    (*tm).node.key = deadline;
    TIMER_LIST.insert_ordered(&mut (*tm).node);
    (*tm).running = true;
    trace::timer_arm(tm as usize, deadline);
    port::irq_restore(s);

    // The head may have moved; let the service recompute its sleep.
    let _ = semaphore::post(&mut SERVICE_SEM);
    Ok(())
}

/// Disarm the timer.
///
/// # Errors
///
/// `Again` when the timer is not running.
///
/// # Safety
///
/// `tm` must be a valid, created timer.
pub unsafe fn stop(tm: *mut Timer) -> Result<()> {
    check(!tm.is_null(), Error::Invalid)?;

    let s = port::irq_save();
    if !(*tm).created {
        port::irq_restore(s);
        return Err(Error::Invalid);
    }
    if !(*tm).running {
        port::irq_restore(s);
        return Err(Error::Again);
    }
    unlink(&mut (*tm).node);
    (*tm).running = false;
    port::irq_restore(s);
    Ok(())
}

// =============================================================================
// Service
// =============================================================================

/// Called by the tick interrupt, inside its critical section: release
/// the service thread when the head timer is due.
pub(crate) unsafe fn tick_notify(now: Timestamp) {
    let head = TIMER_LIST.head();
    if !head.is_null() && (*head).key <= now {
        // Saturates at the binary cap while the service is behind; the
        // pending release already covers every expired timer.
        let _ = semaphore::post(&mut SERVICE_SEM);
    }
}

/// Run every timer whose deadline has passed. Callbacks execute outside
/// the critical section, in the caller's (the service thread's) context.
pub(crate) unsafe fn service_drain(now: Timestamp) {
    loop {
        let s = port::irq_save();
        let head = TIMER_LIST.head();
        if head.is_null() || (*head).key > now {
            port::irq_restore(s);
            return;
        }
        let tm = (*head).owner as *mut Timer;
        let deadline = (*head).key;
        unlink(head);
        if (*tm).timer_type == TimerType::Periodic {
            // Anchor on the old deadline to stay drift-free.
            (*tm).node.key = deadline.saturating_add((*tm).period as Timestamp);
            TIMER_LIST.insert_ordered(&mut (*tm).node);
        } else {
            (*tm).running = false;
        }
        let func = (*tm).func;
        let arg = (*tm).arg;
        port::irq_restore(s);

        trace::timer_fire(tm as usize, deadline);
        if let Some(f) = func {
            f(arg);
        }
    }
}

extern "C" fn service_entry(_arg: *mut c_void) -> *mut c_void {
    loop {
        let timeout = unsafe {
            let s = port::irq_save();
            let head = TIMER_LIST.head();
            let timeout = if head.is_null() {
                WAIT_FOREVER
            } else {
                let now = clock::now();
                (*head).key.saturating_sub(now).max(1).min(WAIT_FOREVER as Timestamp - 1) as Duration
            };
            port::irq_restore(s);
            timeout
        };

        unsafe {
            let _ = semaphore::wait(&mut SERVICE_SEM, timeout);
            service_drain(clock::now());
        }
    }
}

/// Create the service semaphore and thread. Called once, from
/// `scheduler::start`.
pub(crate) unsafe fn start_service() -> Result<()> {
    semaphore::create(&mut SERVICE_SEM, &semaphore::Attributes::binary(0))?;

    let mut attr = ThreadAttributes::new();
    attr.name = "timerd";
    attr.priority = priority::ISR;
    attr.stack_base = SERVICE_STACK.as_mut_ptr();
    attr.stack_size_bytes = core::mem::size_of_val(&SERVICE_STACK);
    thread::init_raw(&mut SERVICE_THREAD, &attr, service_entry, ptr::null_mut())
}

// =============================================================================
// Test support
// =============================================================================

#[cfg(test)]
pub(crate) unsafe fn reset() {
    TIMER_LIST = List::new();
    SERVICE_SEM = Semaphore::new();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::test_support::fixture;
    use core::sync::atomic::{AtomicUsize, Ordering};

    static FIRED: AtomicUsize = AtomicUsize::new(0);

    extern "C" fn count_fire(_arg: *mut c_void) {
        FIRED.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn one_shot_fires_once_and_stops() {
        let _k = fixture();
        FIRED.store(0, Ordering::SeqCst);
        unsafe {
            let mut tm = Timer::new();
            create(&mut tm, &Attributes::new(), count_fire, ptr::null_mut()).unwrap();
            start(&mut tm, 5).unwrap();
            assert!(tm.is_running());

            service_drain(4);
            assert_eq!(FIRED.load(Ordering::SeqCst), 0);

            service_drain(5);
            assert_eq!(FIRED.load(Ordering::SeqCst), 1);
            assert!(!tm.is_running());

            service_drain(100);
            assert_eq!(FIRED.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn periodic_rearms_from_previous_deadline() {
        let _k = fixture();
        FIRED.store(0, Ordering::SeqCst);
        unsafe {
            let mut tm = Timer::new();
            create(&mut tm, &Attributes::periodic(), count_fire, ptr::null_mut()).unwrap();
            start(&mut tm, 5).unwrap();

            // Serviced late: the next deadline anchors on the old one.
            service_drain(7);
            assert_eq!(FIRED.load(Ordering::SeqCst), 1);
            assert_eq!(tm.node.key, 10);

            // A very late pass catches up one period at a time.
            service_drain(20);
            assert_eq!(tm.node.key, 25);
            assert_eq!(FIRED.load(Ordering::SeqCst), 4);
        }
    }

    #[test]
    fn stop_disarms_and_reports_idle() {
        let _k = fixture();
        unsafe {
            let mut tm = Timer::new();
            create(&mut tm, &Attributes::new(), count_fire, ptr::null_mut()).unwrap();
            assert_eq!(stop(&mut tm), Err(Error::Again));
            start(&mut tm, 3).unwrap();
            assert_eq!(stop(&mut tm), Ok(()));
            assert!(!tm.is_running());

            FIRED.store(0, Ordering::SeqCst);
            service_drain(100);
            assert_eq!(FIRED.load(Ordering::SeqCst), 0);
        }
    }

    #[test]
    fn zero_period_is_invalid() {
        let _k = fixture();
        unsafe {
            let mut tm = Timer::new();
            create(&mut tm, &Attributes::new(), count_fire, ptr::null_mut()).unwrap();
            assert_eq!(start(&mut tm, 0), Err(Error::Invalid));
        }
    }
}
