/*
 * kernos - an RTOS core for small microcontrollers.
 *
 * SPDX-License-Identifier: MIT
 */

//! Safe, RAII-style wrappers over the kernel primitives.
//!
//! The kernel layer works on caller-owned control blocks through raw
//! pointers; this layer packages the common cases behind ownership and
//! guards for application code.

mod critical;
mod mutex;
mod semaphore;

pub use critical::{IrqCritical, SchedulerLock};
pub use mutex::{Mutex, MutexGuard};
pub use semaphore::Semaphore;
