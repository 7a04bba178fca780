/*
 * kernos - an RTOS core for small microcontrollers.
 *
 * SPDX-License-Identifier: MIT
 */

//! Shared fixtures for the host-side kernel tests.
//!
//! The kernel is process-wide state by design, so tests serialize on a
//! global lock and reset that state before running. The fixture installs
//! a leaked "current thread" so operations that act on the caller have
//! an identity to act on; because the host port cannot context-switch,
//! tests only exercise the non-suspending paths and drive wakeups from
//! the other side of each primitive.

use core::ffi::c_void;
use core::ptr;
use std::boxed::Box;
use std::sync::{Mutex as StdMutex, MutexGuard};
use std::vec;

use crate::kernel::thread::{self, Attributes, Thread};
use crate::kernel::{clock, scheduler, timer};
use crate::port;
use crate::types::*;

static LOCK: StdMutex<()> = StdMutex::new(());

pub(crate) struct Fixture {
    _guard: MutexGuard<'static, ()>,
}

/// Serialize the test, reset kernel state, and install a fresh current
/// thread at `NORMAL` priority.
pub(crate) fn fixture() -> Fixture {
    let guard = LOCK.lock().unwrap_or_else(|e| e.into_inner());
    unsafe {
        port::set_handler_mode(false);
        scheduler::reset();
        clock::reset();
        timer::reset();

        let main = alloc_block("tmain");
        (*main).state = ThreadState::Inactive;
        (*main).prio = priority::NORMAL;
        (*main).base_prio = priority::NORMAL;
        scheduler::set_current_for_test(main);
    }
    Fixture { _guard: guard }
}

/// Create a ready thread with a leaked control block and stack.
pub(crate) unsafe fn spawn(prio: Priority) -> *mut Thread {
    let t = Box::leak(Box::new(Thread::new())) as *mut Thread;
    let stack = Box::leak(vec![0usize; 256].into_boxed_slice());
    let mut attr = Attributes::new();
    attr.name = "tthread";
    attr.priority = prio;
    attr.stack_base = stack.as_mut_ptr();
    attr.stack_size_bytes = core::mem::size_of_val(&stack[..]);
    thread::create(t, &attr, noop_entry, ptr::null_mut()).unwrap();
    t
}

/// Make `t` the current thread; the previous one goes back to ready.
pub(crate) unsafe fn adopt(t: *mut Thread) {
    scheduler::set_current_for_test(t);
}

extern "C" fn noop_entry(_arg: *mut c_void) -> *mut c_void {
    ptr::null_mut()
}

unsafe fn alloc_block(name: &'static str) -> *mut Thread {
    let t = Box::leak(Box::new(Thread::new())) as *mut Thread;
    let stack = Box::leak(vec![0usize; 256].into_boxed_slice());
    (*t).name = name;
    (*t).stack_base = stack.as_mut_ptr();
    (*t).stack_size_bytes = core::mem::size_of_val(&stack[..]);
    (*t).wait_node.owner = t as *mut c_void;
    (*t).clock_node.owner = t as *mut c_void;
    t
}
