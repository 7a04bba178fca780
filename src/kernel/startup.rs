/*
 * kernos - an RTOS core for small microcontrollers.
 *
 * SPDX-License-Identifier: MIT
 */

//! Application bootstrap.
//!
//! [`run`] wraps the canonical embedded entry sequence: create the main
//! thread on a kernel-provided stack, start the scheduler, call the
//! application's `os_main` inside that thread, and report its return
//! value to the host through the port's `terminate` hook (a semihosting
//! exit on real targets). Zero means success.

use core::convert::Infallible;
use core::ffi::c_void;
use core::ptr;

use crate::config::OS_MAIN_STACK_SIZE_BYTES;
use crate::kernel::scheduler;
use crate::kernel::thread::{self, Attributes, Thread};
use crate::port::{self, StackElement};
use crate::types::*;

/// The application entry point, `os_main(argc, argv)`.
pub type MainFn = extern "C" fn(i32, *mut *mut u8) -> i32;

static mut MAIN_FN: Option<MainFn> = None;
static mut MAIN_THREAD: Thread = Thread::new();
static mut MAIN_STACK: [StackElement; OS_MAIN_STACK_SIZE_BYTES / core::mem::size_of::<StackElement>()] =
    [0; OS_MAIN_STACK_SIZE_BYTES / core::mem::size_of::<StackElement>()];

extern "C" fn main_entry(_arg: *mut c_void) -> *mut c_void {
    // Safety: `run` stores the function before the thread can exist.
    let code = unsafe {
        match MAIN_FN {
            Some(f) => f(0, ptr::null_mut()),
            None => -1,
        }
    };
    port::terminate(code)
}

/// Create the main thread around `main` and start the scheduler.
/// Never returns on success.
///
/// # Errors
///
/// `NotPermitted` when the scheduler is already running.
///
/// # Safety
///
/// Must be called once, from the startup context.
pub unsafe fn run(main: MainFn) -> Result<Infallible> {
    MAIN_FN = Some(main);

    let mut attr = Attributes::new();
    attr.name = "main";
    attr.priority = priority::NORMAL;
    attr.stack_base = MAIN_STACK.as_mut_ptr();
    attr.stack_size_bytes = core::mem::size_of_val(&MAIN_STACK);
    thread::create(&mut MAIN_THREAD, &attr, main_entry, ptr::null_mut())?;

    scheduler::start()
}
