/*
 * kernos - an RTOS core for small microcontrollers.
 *
 * SPDX-License-Identifier: MIT
 */

//! # kernos
//!
//! A preemptive priority RTOS core for small microcontrollers: threads
//! on caller-supplied stacks, a bitmap-indexed ready queue, a tick-driven
//! clock with timed waits, user timers, and the blocking primitives that
//! cooperate with the scheduler - mutexes with priority inheritance,
//! semaphores, condition variables, event flags, message queues, and
//! memory pools. The core allocates nothing: every queueable object
//! embeds its own list nodes.
//!
//! Hardware is reached only through the port layer; select a port with a
//! Cargo feature.
//!
//! ## Features
//!
//! - `port-dummy` - host/test stand-in port (default)
//! - `port-cortex-m` - ARM Cortex-M (PendSV/SysTick, `cortex-m` crate)
//! - `std` - enable std, for host testing
//! - `trace` - route the kernel trace hooks to `defmt`
//!
//! ## Entry
//!
//! ```ignore
//! extern "C" fn os_main(_argc: i32, _argv: *mut *mut u8) -> i32 {
//!     // create threads, then do work; 0 is reported to the host
//!     0
//! }
//!
//! unsafe { kernos::startup::run(os_main).unwrap() };
//! ```

#![no_std]
#![allow(static_mut_refs)] // kernel globals are guarded by critical sections

#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod config;
pub mod trace;
pub mod types;

// Port layer
pub mod port;

// Kernel modules
pub mod kernel;

// Safe wrappers
pub mod sync;

pub use kernel::{
    clock, condvar, evflags, mempool, mqueue, mutex, scheduler, semaphore, startup, thread, timer,
};
pub use types::*;
