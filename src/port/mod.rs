/*
 * kernos - an RTOS core for small microcontrollers.
 *
 * SPDX-License-Identifier: MIT
 */

//! Port layer.
//!
//! Everything the kernel needs from the hardware goes through this narrow
//! contract, implemented once per architecture and selected by a Cargo
//! feature. A port module provides:
//!
//! - `irq_save() -> IrqStatus` / `irq_restore(status)` - interrupt
//!   critical section, nestable by saving the previous state.
//! - `in_handler_mode() -> bool` - true while an interrupt service
//!   routine is executing.
//! - `stack_init(base, size_bytes, entry, arg) -> sp` - lay down the
//!   initial frame so the first switch into the thread calls
//!   `entry(arg)`.
//! - `context_switch(save_slot, load_sp)` - save the running context so
//!   it resumes after this call, then continue on `load_sp`. Callable
//!   only with interrupts disabled. From handler mode, the switch takes
//!   effect when the handler returns.
//! - `tick_start(hz)` / `tick_stop()` - program the system timer.
//! - `idle_sleep()` - wait-for-interrupt hook used by the idle thread.
//! - `terminate(code) -> !` - report the exit status to the host or halt.
//!
//! ## Available ports
//!
//! - `port-dummy` - host/test stand-in; counts instead of masking and
//!   cannot perform a real context switch.
//! - `port-cortex-m` - ARM Cortex-M: PRIMASK critical sections, PendSV
//!   context switch, SysTick tick source.

#[cfg(all(feature = "port-dummy", not(feature = "port-cortex-m")))]
mod dummy;

#[cfg(all(feature = "port-dummy", not(feature = "port-cortex-m")))]
pub use dummy::*;

#[cfg(feature = "port-cortex-m")]
mod cortex_m;

#[cfg(feature = "port-cortex-m")]
pub use self::cortex_m::*;

// =============================================================================
// Port-independent definitions
// =============================================================================

/// One stack slot. Stacks are allocated and initialized in these units.
pub type StackElement = usize;

/// Saved interrupt state, returned by `irq_save`.
pub type IrqStatus = u32;

/// Stack alignment required by every supported architecture, in bytes.
pub const STACK_ALIGNMENT: usize = 8;

/// Round a stack pointer down to the required alignment.
#[inline(always)]
pub(crate) fn align_stack_down(sp: *mut StackElement) -> *mut StackElement {
    ((sp as usize) & !(STACK_ALIGNMENT - 1)) as *mut StackElement
}
