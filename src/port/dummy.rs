/*
 * kernos - an RTOS core for small microcontrollers.
 *
 * SPDX-License-Identifier: MIT
 */

//! Host/test port.
//!
//! Stands in for real hardware so the kernel can be compiled and its
//! state machines exercised on a development host. Interrupt masking is
//! a nesting counter, context switches are recorded but do not transfer
//! control, and the tick source never fires on its own (tests advance
//! the clock by calling the tick entry point directly).
//!
//! Do not use this port on a target; `scheduler::start` cannot run a
//! first thread here and will panic.

use core::ffi::c_void;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use super::{align_stack_down, IrqStatus, StackElement};

/// Interrupt mask nesting depth. Zero means "interrupts enabled".
static IRQ_DEPTH: AtomicU32 = AtomicU32::new(0);

/// Simulated handler-mode flag, settable by tests.
static HANDLER_MODE: AtomicBool = AtomicBool::new(false);

/// Number of context switches requested so far.
static CONTEXT_SWITCHES: AtomicUsize = AtomicUsize::new(0);

/// Whether the tick source is currently "running".
static TICK_RUNNING: AtomicBool = AtomicBool::new(false);

/// Disable interrupts, returning the previous nesting depth.
#[inline(always)]
pub fn irq_save() -> IrqStatus {
    IRQ_DEPTH.fetch_add(1, Ordering::SeqCst)
}

/// Restore the interrupt state saved by a matching `irq_save`.
#[inline(always)]
pub fn irq_restore(status: IrqStatus) {
    IRQ_DEPTH.store(status, Ordering::SeqCst);
}

/// The simulated handler-mode predicate.
#[inline(always)]
pub fn in_handler_mode() -> bool {
    HANDLER_MODE.load(Ordering::SeqCst)
}

/// Pretend to be inside (or outside) an interrupt handler.
///
/// Test hook; lets host tests exercise the handler-mode refusals.
pub fn set_handler_mode(active: bool) {
    HANDLER_MODE.store(active, Ordering::SeqCst);
}

/// Lay down an initial frame.
///
/// No real frame is needed because this port never switches into the
/// thread; only the alignment arithmetic is performed so stack accounting
/// matches a real port.
pub unsafe fn stack_init(
    base: *mut StackElement,
    size_bytes: usize,
    _entry: extern "C" fn(*mut c_void),
    _arg: *mut c_void,
) -> *mut StackElement {
    let top = (base as usize + size_bytes) as *mut StackElement;
    align_stack_down(top)
}

/// Record a context switch request. Control does not transfer.
pub unsafe fn context_switch(_save_slot: *mut *mut StackElement, _load_sp: *mut StackElement) {
    CONTEXT_SWITCHES.fetch_add(1, Ordering::SeqCst);
}

/// Number of context switches requested so far. Test hook.
pub fn context_switch_count() -> usize {
    CONTEXT_SWITCHES.load(Ordering::SeqCst)
}

/// Entering a thread is impossible without a real context switch.
pub unsafe fn start_first_thread(_load_sp: *mut StackElement) -> ! {
    panic!("the host port cannot enter a thread; use a hardware port");
}

/// "Start" the tick source. Ticks are injected manually by tests.
pub fn tick_start(_hz: u32) {
    TICK_RUNNING.store(true, Ordering::SeqCst);
}

/// Stop the tick source.
pub fn tick_stop() {
    TICK_RUNNING.store(false, Ordering::SeqCst);
}

/// Whether `tick_start` has been called. Test hook.
pub fn tick_running() -> bool {
    TICK_RUNNING.load(Ordering::SeqCst)
}

/// Idle hook; nothing to wait for on a host.
#[inline(always)]
pub fn idle_sleep() {
    core::hint::spin_loop();
}

/// Report the exit code to the host.
pub fn terminate(code: i32) -> ! {
    #[cfg(any(test, feature = "std"))]
    {
        extern crate std;
        std::process::exit(code);
    }
    #[cfg(not(any(test, feature = "std")))]
    {
        let _ = code;
        loop {
            core::hint::spin_loop();
        }
    }
}
