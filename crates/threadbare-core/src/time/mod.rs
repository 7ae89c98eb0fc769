//! Clocks and deadlines.
//!
//! The timed-wait deadline is an absolute `Timespec` measured against one of
//! the two supported clocks. The layout matches the kernel's `timespec` so a
//! reference can be handed to the futex syscall directly.

use crate::errno;
use crate::sys;

/// Represents a timespec value (seconds + nanoseconds).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timespec {
    /// Seconds.
    pub tv_sec: i64,
    /// Nanoseconds (0 to 999_999_999).
    pub tv_nsec: i64,
}

/// Clock identifiers for `clock_gettime` and timed waits.
pub const CLOCK_REALTIME: i32 = 0;
pub const CLOCK_MONOTONIC: i32 = 1;

/// Returns `true` if `clock_id` is a clock a condition variable may be
/// measured against.
#[inline]
#[must_use]
pub const fn valid_cond_clock(clock_id: i32) -> bool {
    matches!(clock_id, CLOCK_REALTIME | CLOCK_MONOTONIC)
}

/// Validate a timespec nanosecond field: must be in [0, 999_999_999].
#[must_use]
pub const fn valid_timespec_nsec(tv_nsec: i64) -> bool {
    tv_nsec >= 0 && tv_nsec < 1_000_000_000
}

/// Current time on `clock_id`.
pub fn clock_now(clock_id: i32) -> Result<Timespec, i32> {
    if !valid_cond_clock(clock_id) {
        return Err(errno::EINVAL);
    }
    sys::sys_clock_gettime(clock_id)
}

impl Timespec {
    /// Absolute deadline `millis` milliseconds past `self`.
    #[must_use]
    pub const fn add_millis(self, millis: i64) -> Timespec {
        let mut sec = self.tv_sec + millis / 1000;
        let mut nsec = self.tv_nsec + (millis % 1000) * 1_000_000;
        if nsec >= 1_000_000_000 {
            sec += 1;
            nsec -= 1_000_000_000;
        }
        Timespec {
            tv_sec: sec,
            tv_nsec: nsec,
        }
    }
}
