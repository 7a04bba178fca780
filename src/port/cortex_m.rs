/*
 * kernos - an RTOS core for small microcontrollers.
 *
 * SPDX-License-Identifier: MIT
 */

//! ARM Cortex-M port.
//!
//! - Critical sections mask interrupts through PRIMASK.
//! - Context switches run in the PendSV exception, configured to the
//!   lowest priority so a switch pended from an ISR tail-chains after
//!   every other handler has finished.
//! - The first thread is entered through SVC, which discards the
//!   pre-scheduler main stack.
//! - The tick source is SysTick.
//!
//! Compile for a `thumbv*-none-eabi*` target with the `port-cortex-m`
//! feature.

use core::arch::naked_asm;
use core::ffi::c_void;

use super::{align_stack_down, IrqStatus, StackElement};
use crate::config::OS_CPU_CLOCK_HZ;

// =============================================================================
// Registers
// =============================================================================

/// Initial xPSR value: thumb bit set.
const INITIAL_XPSR: usize = 0x0100_0000;

/// Interrupt control and state register; bit 28 pends PendSV.
const NVIC_ICSR: *mut u32 = 0xE000_ED04 as *mut u32;
const NVIC_PENDSVSET_BIT: u32 = 1 << 28;

/// System handler priority register 3 (PendSV, SysTick fields).
const SCB_SHPR3: *mut u32 = 0xE000_ED20 as *mut u32;

/// SysTick control, reload and current-value registers.
const SYST_CSR: *mut u32 = 0xE000_E010 as *mut u32;
const SYST_RVR: *mut u32 = 0xE000_E014 as *mut u32;
const SYST_CVR: *mut u32 = 0xE000_E018 as *mut u32;

const SYST_CSR_ENABLE: u32 = 1 << 0;
const SYST_CSR_TICKINT: u32 = 1 << 1;
const SYST_CSR_CLKSOURCE: u32 = 1 << 2;

// =============================================================================
// Critical sections
// =============================================================================

/// Disable interrupts, returning the previous PRIMASK state.
#[inline(always)]
pub fn irq_save() -> IrqStatus {
    let active = cortex_m::register::primask::read().is_active();
    cortex_m::interrupt::disable();
    active as IrqStatus
}

/// Restore the interrupt state saved by a matching `irq_save`.
#[inline(always)]
pub fn irq_restore(status: IrqStatus) {
    if status != 0 {
        // Safety: only re-enables what irq_save disabled.
        unsafe { cortex_m::interrupt::enable() };
    }
}

/// True while an exception handler is executing (IPSR != 0).
#[inline(always)]
pub fn in_handler_mode() -> bool {
    let ipsr: u32;
    unsafe {
        core::arch::asm!("mrs {}, IPSR", out(reg) ipsr, options(nomem, nostack));
    }
    ipsr != 0
}

// =============================================================================
// Stack initialization
// =============================================================================

/// Trap for a thread entry function that returns.
///
/// The kernel trampoline never returns, so reaching this means the frame
/// was corrupted.
extern "C" fn entry_return_trap() -> ! {
    cortex_m::interrupt::disable();
    loop {
        cortex_m::asm::wfi();
    }
}

/// Lay down the frame the hardware and PendSV expect, so the first switch
/// into the thread "returns" into `entry(arg)`.
///
/// Frame, high to low address: xPSR, PC, LR, R12, R3-R1, R0 (= `arg`),
/// then R11-R4 as saved by PendSV.
///
/// # Safety
///
/// `base..base + size_bytes` must be writable memory owned by the thread.
pub unsafe fn stack_init(
    base: *mut StackElement,
    size_bytes: usize,
    entry: extern "C" fn(*mut c_void),
    arg: *mut c_void,
) -> *mut StackElement {
    let top = align_stack_down((base as usize + size_bytes) as *mut StackElement);
    let mut sp = top;

    // Hardware exception frame.
    sp = sp.sub(1);
    *sp = INITIAL_XPSR;
    sp = sp.sub(1);
    *sp = (entry as usize) & !1; // PC, bit 0 clear for exception return
    sp = sp.sub(1);
    *sp = entry_return_trap as usize; // LR
    sp = sp.sub(4); // R12, R3, R2, R1
    sp = sp.sub(1);
    *sp = arg as usize; // R0

    // Software-saved registers R11-R4, contents irrelevant.
    sp = sp.sub(8);

    sp
}

// =============================================================================
// Context switch
// =============================================================================

/// Where PendSV stores the outgoing stack pointer.
#[no_mangle]
static mut KERNOS_SAVE_SLOT: *mut *mut StackElement = core::ptr::null_mut();

/// Where PendSV loads the incoming stack pointer from.
#[no_mangle]
static mut KERNOS_LOAD_SP: *mut StackElement = core::ptr::null_mut();

/// Request a context switch.
///
/// Pends PendSV; the exception performs the actual save/restore once
/// interrupts are re-enabled (thread mode) or the current handler chain
/// unwinds (handler mode). At most one switch can be outstanding, which
/// the kernel guarantees by only deciding switches inside its interrupt
/// critical sections.
///
/// # Safety
///
/// Interrupts must be disabled. `save_slot` must point at the outgoing
/// thread's stack-pointer slot and `load_sp` must be a frame produced by
/// `stack_init` or a previous save.
pub unsafe fn context_switch(save_slot: *mut *mut StackElement, load_sp: *mut StackElement) {
    KERNOS_SAVE_SLOT = save_slot;
    KERNOS_LOAD_SP = load_sp;
    core::ptr::write_volatile(NVIC_ICSR, NVIC_PENDSVSET_BIT);
    cortex_m::asm::dsb();
    cortex_m::asm::isb();
}

/// PendSV: save R4-R11 and PSP into the outgoing slot, restore the
/// incoming frame.
#[unsafe(naked)]
#[no_mangle]
pub unsafe extern "C" fn PendSV() {
    naked_asm!(
        "mrs r0, psp",
        "isb",
        "stmdb r0!, {{r4-r11}}",
        "ldr r2, =KERNOS_SAVE_SLOT",
        "ldr r2, [r2]",
        "str r0, [r2]",
        "ldr r2, =KERNOS_LOAD_SP",
        "ldr r0, [r2]",
        "ldmia r0!, {{r4-r11}}",
        "msr psp, r0",
        "isb",
        "bx lr",
    );
}

/// SVC: enter the first thread, discarding the startup stack.
#[unsafe(naked)]
#[no_mangle]
pub unsafe extern "C" fn SVCall() {
    naked_asm!(
        "ldr r2, =KERNOS_LOAD_SP",
        "ldr r0, [r2]",
        "ldmia r0!, {{r4-r11}}",
        "msr psp, r0",
        "isb",
        "mov r0, #0",
        "msr basepri, r0",
        "orr lr, #0xd", // thread mode, PSP, no FPU state
        "bx lr",
    );
}

/// Enter the first thread. Never returns.
///
/// # Safety
///
/// Interrupts must be disabled; `load_sp` must be a frame produced by
/// `stack_init`. Call exactly once, from `scheduler::start`.
pub unsafe fn start_first_thread(load_sp: *mut StackElement) -> ! {
    KERNOS_LOAD_SP = load_sp;

    // PendSV and SysTick at the lowest exception priority, so context
    // switches never preempt other handlers.
    core::ptr::write_volatile(SCB_SHPR3, 0xFFFF_0000);

    cortex_m::interrupt::enable();
    cortex_m::asm::dsb();
    cortex_m::asm::isb();
    core::arch::asm!("svc 0", options(noreturn));
}

// =============================================================================
// Tick source
// =============================================================================

/// SysTick: drive the kernel clock, then let the scheduler pend a switch
/// if the drain readied something more urgent.
#[no_mangle]
pub extern "C" fn SysTick() {
    crate::kernel::clock::tick_from_isr();
    crate::kernel::scheduler::preempt_from_isr();
}

/// Program SysTick for `hz` interrupts per second and start it.
pub fn tick_start(hz: u32) {
    let reload = (OS_CPU_CLOCK_HZ / hz) - 1;
    unsafe {
        core::ptr::write_volatile(SYST_RVR, reload);
        core::ptr::write_volatile(SYST_CVR, 0);
        core::ptr::write_volatile(
            SYST_CSR,
            SYST_CSR_CLKSOURCE | SYST_CSR_TICKINT | SYST_CSR_ENABLE,
        );
    }
}

/// Stop SysTick.
pub fn tick_stop() {
    unsafe {
        core::ptr::write_volatile(SYST_CSR, 0);
    }
}

// =============================================================================
// Idle and termination
// =============================================================================

/// Wait for the next interrupt.
#[inline(always)]
pub fn idle_sleep() {
    cortex_m::asm::wfi();
}

/// Report the exit code to a semihosting host, then park.
pub fn terminate(code: i32) -> ! {
    // ADP_Stopped_ApplicationExit, with the exit code in the parameter
    // block (SYS_EXIT_EXTENDED layout).
    let block: [usize; 2] = [0x20026, code as usize];
    unsafe {
        core::arch::asm!(
            "mov r0, #0x20",
            "mov r1, {0}",
            "bkpt #0xAB",
            in(reg) block.as_ptr(),
            options(nostack),
        );
    }
    cortex_m::interrupt::disable();
    loop {
        cortex_m::asm::wfi();
    }
}
