/*
 * kernos - an RTOS core for small microcontrollers.
 *
 * SPDX-License-Identifier: MIT
 */

//! RAII guards for the two critical-section mechanisms.
//!
//! [`IrqCritical`] disables interrupts for its scope; use it around data
//! shared with interrupt handlers. [`SchedulerLock`] only defers thread
//! preemption, leaving interrupts live; use it for multi-step invariants
//! among threads. Both nest, and both are `!Send`: a critical section
//! must end on the thread that opened it.

use core::marker::PhantomData;

use crate::kernel::scheduler::{self, SchedStatus};
use crate::port::{self, IrqStatus};

/// Interrupts-disabled region, released on drop.
pub struct IrqCritical {
    status: IrqStatus,
    _not_send: PhantomData<*const ()>,
}

impl IrqCritical {
    pub fn enter() -> Self {
        IrqCritical {
            status: port::irq_save(),
            _not_send: PhantomData,
        }
    }
}

impl Drop for IrqCritical {
    fn drop(&mut self) {
        port::irq_restore(self.status);
    }
}

/// Preemption-deferred region, released on drop. Interrupts stay
/// enabled; any preemption earned inside happens at release.
pub struct SchedulerLock {
    prev: SchedStatus,
    _not_send: PhantomData<*const ()>,
}

impl SchedulerLock {
    pub fn enter() -> Self {
        SchedulerLock {
            prev: scheduler::lock(),
            _not_send: PhantomData,
        }
    }
}

impl Drop for SchedulerLock {
    fn drop(&mut self) {
        scheduler::unlock(self.prev);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::test_support::fixture;

    #[test]
    fn scheduler_lock_guard_nests() {
        let _k = fixture();
        {
            let _outer = SchedulerLock::enter();
            assert!(scheduler::is_locked());
            {
                let _inner = SchedulerLock::enter();
                assert!(scheduler::is_locked());
            }
            assert!(scheduler::is_locked());
        }
        assert!(!scheduler::is_locked());
    }
}
