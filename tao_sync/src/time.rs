//! Nanosecond-resolution timestamps and absolute-timeout derivation.

pub use tao_common::consts::MAX_TIME_SECONDS;

/// A wall-clock timestamp, seconds + nanoseconds since the epoch.
///
/// This is the on-the-wire layout for a shared array's five per-write
/// timestamps and a dataframe header's timestamp.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timestamp {
    /// Whole seconds since the Unix epoch.
    pub sec: i64,
    /// Nanoseconds within the second (`0..1_000_000_000`).
    pub nsec: i64,
}

impl Timestamp {
    /// Capture the current `CLOCK_REALTIME` time.
    pub fn now() -> Self {
        let ts = realtime_now();
        Timestamp {
            sec: ts.tv_sec as i64,
            nsec: ts.tv_nsec as i64,
        }
    }

    /// An absolute deadline `secs` seconds from now.
    pub fn after(secs: f64) -> Self {
        let now = Self::now();
        now.plus_seconds(secs)
    }

    /// This timestamp offset forward by `secs` seconds (may be fractional).
    pub fn plus_seconds(self, secs: f64) -> Self {
        let add_nanos = (secs * 1e9) as i128;
        let total = self.sec as i128 * 1_000_000_000 + self.nsec as i128 + add_nanos;
        Timestamp {
            sec: (total.div_euclid(1_000_000_000)) as i64,
            nsec: (total.rem_euclid(1_000_000_000)) as i64,
        }
    }

    /// Seconds remaining until this timestamp, relative to now (may be negative).
    pub fn seconds_from_now(self) -> f64 {
        let now = Self::now();
        (self.sec - now.sec) as f64 + (self.nsec - now.nsec) as f64 / 1e9
    }

    /// Convert to a `libc::timespec` for CLOCK_REALTIME-relative syscalls.
    pub fn to_timespec(self) -> libc::timespec {
        libc::timespec {
            tv_sec: self.sec as libc::time_t,
            tv_nsec: self.nsec as libc::c_long,
        }
    }
}

fn realtime_now() -> libc::timespec {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts);
    }
    ts
}

/// The deadline discipline shared by every blocking guard operation.
///
/// - `Relative(secs)` where `secs > MAX_TIME_SECONDS` degrades to the
///   untimed blocking call.
/// - `Relative(secs)` below one clock tick degrades to the `try_*` call.
/// - `Absolute(ts)` is used as-is.
#[derive(Debug, Clone, Copy)]
pub enum Deadline {
    /// Block indefinitely.
    Blocking,
    /// Return immediately without waiting.
    NoWait,
    /// An absolute `CLOCK_REALTIME` deadline.
    Absolute(Timestamp),
}

/// Smallest relative timeout treated as "wait at all" rather than `try_*`.
///
/// Matches a typical scheduler clock tick; timeouts shorter than this
/// degrade to the non-blocking call.
pub const MIN_CLOCK_TICK_SECONDS: f64 = 1e-6;

impl Deadline {
    /// Derive a [`Deadline`] from a relative timeout in seconds, applying
    /// the degrade rules.
    pub fn relative(secs: f64) -> Self {
        if secs > MAX_TIME_SECONDS {
            Deadline::Blocking
        } else if secs < MIN_CLOCK_TICK_SECONDS {
            Deadline::NoWait
        } else {
            Deadline::Absolute(Timestamp::after(secs))
        }
    }

    /// An absolute deadline.
    pub fn absolute(ts: Timestamp) -> Self {
        Deadline::Absolute(ts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_degrades_to_blocking() {
        assert!(matches!(
            Deadline::relative(MAX_TIME_SECONDS + 1.0),
            Deadline::Blocking
        ));
    }

    #[test]
    fn relative_degrades_to_nowait() {
        assert!(matches!(Deadline::relative(0.0), Deadline::NoWait));
    }

    #[test]
    fn relative_is_absolute_in_normal_range() {
        assert!(matches!(Deadline::relative(1.0), Deadline::Absolute(_)));
    }

    #[test]
    fn timestamp_arithmetic_carries() {
        let t = Timestamp { sec: 0, nsec: 900_000_000 };
        let t2 = t.plus_seconds(0.2);
        assert_eq!(t2.sec, 1);
        assert_eq!(t2.nsec, 100_000_000);
    }
}
