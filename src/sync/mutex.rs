/*
 * kernos - an RTOS core for small microcontrollers.
 *
 * SPDX-License-Identifier: MIT
 */

//! Safe `Mutex<T>` wrapper with an RAII guard.
//!
//! Wraps the kernel mutex (inherit protocol, so priority inversion is
//! handled) around a protected value. The guard pattern guarantees the
//! release and scopes the borrow; the guard is `!Send` because the
//! inheritance bookkeeping must unwind on the locking thread.

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};

use crate::kernel::mutex as raw;
use crate::port;
use crate::types::{Duration, Error, Result};

/// A mutual exclusion primitive protecting a value of type `T`.
pub struct Mutex<T> {
    raw: UnsafeCell<raw::Mutex>,
    data: UnsafeCell<T>,
}

// Safety: the kernel mutex serializes access to `data`.
unsafe impl<T: Send> Sync for Mutex<T> {}
unsafe impl<T: Send> Send for Mutex<T> {}

impl<T> Mutex<T> {
    /// A released mutex around `value`. Usable in statics; the kernel
    /// control block is initialized on first use.
    pub const fn new(value: T) -> Self {
        Mutex {
            raw: UnsafeCell::new(raw::Mutex::new()),
            data: UnsafeCell::new(value),
        }
    }

    fn ensure_created(&self) {
        unsafe {
            let s = port::irq_save();
            if !(*self.raw.get()).is_created() {
                let mut attr = raw::Attributes::new();
                attr.protocol = raw::Protocol::Inherit;
                let _ = raw::create(self.raw.get(), &attr);
            }
            port::irq_restore(s);
        }
    }

    /// Acquire, blocking until available.
    pub fn lock(&self) -> Result<MutexGuard<'_, T>> {
        self.ensure_created();
        unsafe { raw::lock(self.raw.get())? };
        Ok(MutexGuard {
            mutex: self,
            _not_send: PhantomData,
        })
    }

    /// Acquire without blocking; `Err(Again)` when held elsewhere.
    pub fn try_lock(&self) -> Result<MutexGuard<'_, T>> {
        self.ensure_created();
        unsafe { raw::try_lock(self.raw.get())? };
        Ok(MutexGuard {
            mutex: self,
            _not_send: PhantomData,
        })
    }

    /// Acquire, blocking at most `ticks` tick periods.
    pub fn lock_timeout(&self, ticks: Duration) -> Result<MutexGuard<'_, T>> {
        self.ensure_created();
        unsafe { raw::timed_lock(self.raw.get(), ticks)? };
        Ok(MutexGuard {
            mutex: self,
            _not_send: PhantomData,
        })
    }

    /// Mutable access without locking; safe because `&mut self` proves
    /// exclusivity.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

/// RAII guard; the mutex is released when this is dropped.
pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
    _not_send: PhantomData<*const ()>,
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // Safety: the guard proves exclusive ownership of the lock.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // Safety: as above.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        // The only failure modes are ours-by-construction bugs; there
        // is nowhere to report them from a destructor.
        let r = unsafe { raw::unlock(self.mutex.raw.get()) };
        debug_assert!(r.is_ok() || r == Err(Error::NotPermitted));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::test_support::fixture;

    #[test]
    fn guard_gives_exclusive_access() {
        let _k = fixture();
        let m: Mutex<u32> = Mutex::new(41);
        {
            let mut guard = m.lock().unwrap();
            *guard += 1;
        }
        assert_eq!(*m.lock().unwrap(), 42);
    }

    #[test]
    fn relock_while_held_reports_busy() {
        let _k = fixture();
        let m: Mutex<u32> = Mutex::new(0);
        let _guard = m.lock().unwrap();
        // Same thread, normal-type mutex: the try form refuses rather
        // than deadlocks.
        assert_eq!(m.try_lock().err(), Some(Error::Again));
    }
}
