/*
 * kernos - an RTOS core for small microcontrollers.
 *
 * SPDX-License-Identifier: MIT
 */

//! Base types shared by every kernel module.
//!
//! This module defines:
//! - [`Error`] / [`Result`] - POSIX-valued status codes
//! - clock types ([`SysTicks`], [`Duration`], [`Timestamp`])
//! - the thread priority type and the named priority bands
//! - flags masks and wait modes (shared by thread signals and event flags)
//! - the thread state machine type
//!
//! Higher priority values represent higher priorities. `0` is reserved for
//! uninitialized threads.

use core::ffi::c_void;

// =============================================================================
// Result codes
// =============================================================================

/// Error codes returned by kernel operations.
///
/// The discriminants are the POSIX `errno` values, so a code can be handed
/// to C callers unchanged via [`Error::errno`]. Success is not represented
/// here; successful calls return `Ok`.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Operation not permitted in the current context, e.g. a blocking
    /// call in handler mode, or starting the scheduler twice. (`EPERM`)
    NotPermitted = 1,

    /// A wait was cut short at user request (cancellation). (`EINTR`)
    Interrupted = 4,

    /// Resource busy; a `try_*` call would have to block. (`EAGAIN`)
    Again = 11,

    /// A resource pool is exhausted. (`ENOMEM`)
    OutOfMemory = 12,

    /// A recursion or usage counter is saturated. (`EBUSY`)
    ResourceBusy = 16,

    /// Invalid argument. (`EINVAL`)
    Invalid = 22,

    /// The operation would deadlock on the calling thread. (`EDEADLK`)
    Deadlock = 35,

    /// The kernel detected a corrupted message. (`EBADMSG`)
    BadMessage = 74,

    /// A counter would exceed its configured cap. (`EOVERFLOW`)
    Overflow = 75,

    /// The message does not fit the queue's slot size. (`EMSGSIZE`)
    MessageTooLarge = 90,

    /// The time limit of the operation expired. (`ETIMEDOUT`)
    TimedOut = 110,

    /// The previous owner of a robust mutex terminated while holding
    /// the lock. (`EOWNERDEAD`)
    OwnerDead = 130,

    /// A robust mutex was abandoned without repair and can no longer be
    /// used. (`ENOTRECOVERABLE`)
    NotRecoverable = 131,
}

impl Error {
    /// The POSIX `errno` value of this code.
    #[inline(always)]
    pub const fn errno(self) -> i32 {
        self as i32
    }
}

/// Result type of all fallible kernel operations.
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// Contract checks
// =============================================================================

/// Validate a caller-visible condition.
///
/// This is the quiet form: the error code is returned to the caller in
/// every build. Use it for conditions the caller is entitled to observe
/// (busy resources, ceiling violations, calls from handler mode).
#[inline(always)]
pub(crate) fn check(cond: bool, err: Error) -> Result<()> {
    if cond {
        Ok(())
    } else {
        Err(err)
    }
}

/// Validate an internal invariant.
///
/// This is the loud form: a violated invariant panics in debug builds and
/// degrades to the error code in release builds, where unwinding through
/// the scheduler is not an option.
#[inline(always)]
pub(crate) fn check_invariant(cond: bool, err: Error) -> Result<()> {
    if cond {
        return Ok(());
    }
    debug_assert!(cond, "kernel invariant violated: {:?}", err);
    Err(err)
}

// =============================================================================
// Clock types
// =============================================================================

/// A number of SysTick periods.
pub type SysTicks = u32;

/// A relative duration, in ticks.
pub type Duration = u32;

/// An absolute point in time, in ticks since scheduler start.
///
/// 64 bits wide so the counter never wraps within a device lifetime
/// (584 million years at 1 kHz).
pub type Timestamp = u64;

/// Offset applied to the monotonic clock to obtain the realtime clock.
pub type ClockOffset = i64;

/// Sentinel duration meaning "wait forever".
pub const WAIT_FOREVER: Duration = Duration::MAX;

// =============================================================================
// Thread priorities
// =============================================================================

/// Thread priority. Higher values run first.
pub type Priority = u8;

/// Named priority bands.
///
/// The bands are scaled by [`crate::config::OS_THREAD_PRIORITY_RANGE`]:
/// a range of 4 spreads them over the full 256 levels, 0 packs them into
/// 16. Intermediate values between the named bands are valid.
pub mod priority {
    use crate::config::OS_THREAD_PRIORITY_RANGE as RANGE;

    /// Total number of priority levels.
    pub const LEVELS: usize = 16 << RANGE;

    /// Uninitialized thread.
    pub const NONE: u8 = 0;
    /// Reserved for the idle thread.
    pub const IDLE: u8 = (1 << RANGE) as u8;
    /// Lowest level available to user code.
    pub const LOWEST: u8 = (2 << RANGE) as u8;
    pub const LOW: u8 = LOWEST;
    pub const BELOW_NORMAL: u8 = (4 << RANGE) as u8;
    /// Default priority.
    pub const NORMAL: u8 = (6 << RANGE) as u8;
    pub const ABOVE_NORMAL: u8 = (8 << RANGE) as u8;
    pub const HIGH: u8 = (10 << RANGE) as u8;
    pub const REALTIME: u8 = (12 << RANGE) as u8;
    /// Highest level available to user code.
    pub const HIGHEST: u8 = ((14 << RANGE) - 1) as u8;
    /// Reserved for the deferred-callback (timer service) thread.
    pub const ISR: u8 = ((15 << RANGE) - 1) as u8;
    /// Error sentinel; also the top of the priority space.
    pub const ERROR: u8 = ((16 << RANGE) - 1) as u8;
}

// =============================================================================
// Flags (thread signals and event flags)
// =============================================================================

/// A set of flags. Wide enough for 32 independent events.
pub type FlagsMask = u32;

/// Mode bits accepted by the flag wait operations.
pub type FlagsMode = u32;

pub mod flags_mode {
    use super::FlagsMode;

    /// Return when all requested flags are raised.
    pub const ALL: FlagsMode = 1;

    /// Return when at least one requested flag is raised.
    pub const ANY: FlagsMode = 2;

    /// Clear the matched flags before returning.
    pub const CLEAR: FlagsMode = 4;
}

/// Signal sets with special meaning, for `signal_wait`.
pub mod sig {
    use super::FlagsMask;

    /// Match any raised signal flag.
    pub const ANY: FlagsMask = 0;

    /// All signal flags.
    pub const ALL: FlagsMask = 0xFFFF_FFFF;
}

// =============================================================================
// Thread state machine
// =============================================================================

/// The states a thread moves through.
///
/// `Undefined -> Inactive -> Ready <-> Running <-> Waiting -> Terminated
/// -> Destroyed`. A thread may be reused once it reaches `Terminated`.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Control block not initialized by `create` yet.
    Undefined = 0,
    /// Initialized but not yet eligible to run.
    Inactive = 1,
    /// Eligible to run, queued on the ready list.
    Ready = 2,
    /// Currently executing.
    Running = 3,
    /// Blocked on a wait list, a timed wait, a signal wait, or a join.
    Waiting = 4,
    /// Finished; resources may be reclaimed by `join`.
    Terminated = 5,
    /// Reclaimed.
    Destroyed = 6,
}

// =============================================================================
// Entry point types
// =============================================================================

/// Thread entry function. The returned pointer is handed to `join`.
pub type ThreadEntry = extern "C" fn(*mut c_void) -> *mut c_void;

/// User timer callback.
pub type TimerFn = extern "C" fn(*mut c_void);

/// Thread cleanup handler, run LIFO at exit or forced termination.
pub type CleanupFn = extern "C" fn(*mut c_void);

// =============================================================================
// Scalar types of the synchronization objects
// =============================================================================

/// Mutex recursion counter.
pub type MutexCount = u16;

/// Maximum mutex recursion depth.
pub const MUTEX_MAX_COUNT: MutexCount = 0xFFFF;

/// Semaphore counter; signed so the arithmetic in `wait` stays obvious.
pub type SemCount = i16;

/// Maximum semaphore count value.
pub const SEM_MAX_COUNT: SemCount = 0x7FFF;

/// Message queue capacity / slot index type.
pub type MqSize = u8;

/// Largest representable queue capacity; also the "no slot" chain sentinel.
pub const MQ_MAX_SIZE: MqSize = 0xFF;

/// Message payload size type.
pub type MsgSize = u16;

/// Message priority; higher values are delivered first.
pub type MsgPriority = u8;

/// Default message priority for `send`.
pub const MSG_DEFAULT_PRIORITY: MsgPriority = 0;

/// Memory pool block count type.
pub type PoolSize = u16;

// =============================================================================
// Conversions
// =============================================================================

/// Convert milliseconds to ticks, rounding down.
#[inline(always)]
pub const fn ms_to_ticks(ms: u32) -> Duration {
    ((ms as u64 * crate::config::OS_SYSTICK_FREQUENCY_HZ as u64) / 1000) as Duration
}

/// Convert ticks to milliseconds, rounding down.
#[inline(always)]
pub const fn ticks_to_ms(ticks: Duration) -> u32 {
    ((ticks as u64 * 1000) / crate::config::OS_SYSTICK_FREQUENCY_HZ as u64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_values_are_posix() {
        assert_eq!(Error::NotPermitted.errno(), 1);
        assert_eq!(Error::Interrupted.errno(), 4);
        assert_eq!(Error::Again.errno(), 11);
        assert_eq!(Error::Invalid.errno(), 22);
        assert_eq!(Error::Deadlock.errno(), 35);
        assert_eq!(Error::TimedOut.errno(), 110);
        assert_eq!(Error::OwnerDead.errno(), 130);
        assert_eq!(Error::NotRecoverable.errno(), 131);
    }

    #[test]
    fn priority_bands_are_ordered() {
        use priority::*;
        assert!(NONE < IDLE);
        assert!(IDLE < LOWEST);
        assert!(LOWEST < NORMAL);
        assert!(NORMAL < HIGH);
        assert!(HIGH < HIGHEST);
        assert!(HIGHEST < ISR);
        assert!(ISR < ERROR);
        assert_eq!(ERROR as usize, LEVELS - 1);
    }

    #[test]
    fn tick_conversions_round_down() {
        // 1 kHz tick: 1 ms == 1 tick.
        assert_eq!(ms_to_ticks(10), 10);
        assert_eq!(ticks_to_ms(10), 10);
    }
}
