/*
 * kernos - an RTOS core for small microcontrollers.
 *
 * SPDX-License-Identifier: MIT
 */

//! Safe counting-semaphore wrapper.
//!
//! Usable as a `static`: the kernel control block is initialized on
//! first use with the count configured at construction. `post` is
//! interrupt-safe, which makes this the standard ISR-to-thread
//! signalling device.

use core::cell::UnsafeCell;

use crate::kernel::semaphore as raw;
use crate::port;
use crate::types::{Duration, Result, SemCount};

/// A counting semaphore.
pub struct Semaphore {
    raw: UnsafeCell<raw::Semaphore>,
    initial: SemCount,
    max: SemCount,
}

// Safety: all operations on the kernel semaphore are internally
// serialized by critical sections.
unsafe impl Sync for Semaphore {}
unsafe impl Send for Semaphore {}

impl Semaphore {
    /// A semaphore that will start at `initial` with cap `max`.
    pub const fn new(initial: SemCount, max: SemCount) -> Self {
        Semaphore {
            raw: UnsafeCell::new(raw::Semaphore::new()),
            initial,
            max,
        }
    }

    /// A binary semaphore, initially empty.
    pub const fn binary() -> Self {
        Self::new(0, 1)
    }

    fn ensure_created(&self) {
        unsafe {
            let s = port::irq_save();
            if !(*self.raw.get()).created {
                let mut attr = raw::Attributes::counting(self.initial);
                attr.max = self.max;
                let _ = raw::create(self.raw.get(), &attr);
            }
            port::irq_restore(s);
        }
    }

    /// Release once. Callable from handler mode.
    pub fn post(&self) -> Result<()> {
        self.ensure_created();
        unsafe { raw::post(self.raw.get()) }
    }

    /// Acquire, blocking up to `timeout` ticks (zero never blocks).
    pub fn wait(&self, timeout: Duration) -> Result<()> {
        self.ensure_created();
        unsafe { raw::wait(self.raw.get(), timeout) }
    }

    /// Acquire without blocking.
    pub fn try_wait(&self) -> Result<()> {
        self.ensure_created();
        unsafe { raw::try_wait(self.raw.get()) }
    }

    /// The current count.
    pub fn value(&self) -> SemCount {
        self.ensure_created();
        unsafe { raw::value(self.raw.get()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::test_support::fixture;
    use crate::types::Error;

    #[test]
    fn wrapper_counts_like_the_kernel_object() {
        let _k = fixture();
        let sem = Semaphore::new(2, 4);
        assert_eq!(sem.value(), 2);
        sem.try_wait().unwrap();
        sem.try_wait().unwrap();
        assert_eq!(sem.try_wait(), Err(Error::Again));
        sem.post().unwrap();
        assert_eq!(sem.value(), 1);
    }
}
