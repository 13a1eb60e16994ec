/*!
 * Deadline arithmetic for bounded waits
 *
 * A timeout of zero means "wait forever" and maps to [`NO_DEADLINE`].
 * Additions saturate instead of wrapping.
 */

use std::time::{Duration, Instant};

use crate::error::{Result, XenonError};

/// Sentinel timestamp meaning "no deadline"
pub const NO_DEADLINE: i64 = i64::MAX;

/// Convert a relative timeout into an absolute timestamp in milliseconds
///
/// # Errors
///
/// Returns [`XenonError::InvalidArgument`] if `timeout_millis` is negative.
pub fn compute_deadline(timeout_millis: i64, now_millis: i64) -> Result<i64> {
    if timeout_millis < 0 {
        return Err(XenonError::invalid_argument(
            "deadline",
            format!("timeout must be >= 0, got {}", timeout_millis),
        ));
    }

    if timeout_millis == 0 {
        return Ok(NO_DEADLINE);
    }

    Ok(now_millis.checked_add(timeout_millis).unwrap_or(NO_DEADLINE))
}

/// Milliseconds since the Unix epoch
pub fn current_time_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A monotonic deadline for wait loops
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    /// Deadline `timeout_millis` from now, zero meaning never
    pub fn after_millis(timeout_millis: i64) -> Result<Self> {
        let absolute = compute_deadline(timeout_millis, 0)?;
        if absolute == NO_DEADLINE {
            return Ok(Self::never());
        }
        Ok(Self::after(Duration::from_millis(absolute as u64)))
    }

    pub fn after(timeout: Duration) -> Self {
        Self {
            at: Instant::now().checked_add(timeout),
        }
    }

    pub fn never() -> Self {
        Self { at: None }
    }

    pub fn is_never(&self) -> bool {
        self.at.is_none()
    }

    pub fn has_passed(&self) -> bool {
        match self.at {
            Some(at) => Instant::now() >= at,
            None => false,
        }
    }

    /// Time left before the deadline, `None` when there is no deadline
    pub fn remaining(&self) -> Option<Duration> {
        self.at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Clamp a sleep interval so it never overshoots the deadline
    pub fn clamp(&self, interval: Duration) -> Duration {
        match self.remaining() {
            Some(remaining) => interval.min(remaining),
            None => interval,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negative_timeout_rejected() {
        let err = compute_deadline(-1, 1_000).unwrap_err();
        assert!(matches!(err, XenonError::InvalidArgument { .. }));
    }

    #[test]
    fn test_zero_means_forever() {
        assert_eq!(compute_deadline(0, 0).unwrap(), NO_DEADLINE);
        assert_eq!(compute_deadline(0, 123_456).unwrap(), NO_DEADLINE);
    }

    #[test]
    fn test_deadline_not_before_now() {
        let now = current_time_millis();
        for timeout in [1, 10, 999, 86_400_000] {
            assert!(compute_deadline(timeout, now).unwrap() >= now);
        }
    }

    #[test]
    fn test_overflow_saturates() {
        let now = 1_000;
        let timeout = i64::MAX - now + 10;
        assert_eq!(compute_deadline(timeout, now).unwrap(), NO_DEADLINE);
        assert_eq!(compute_deadline(i64::MAX, i64::MAX).unwrap(), NO_DEADLINE);
    }

    #[test]
    fn test_normal_deadline() {
        let now = current_time_millis();
        let deadline = compute_deadline(1_000, now).unwrap();
        let after = current_time_millis();
        assert!(deadline >= after + 990 - (after - now));
        assert!(deadline <= now + 1_000);
    }

    #[test]
    fn test_monotonic_deadline() {
        let never = Deadline::after_millis(0).unwrap();
        assert!(never.is_never());
        assert!(!never.has_passed());
        assert_eq!(never.remaining(), None);
        assert_eq!(never.clamp(Duration::from_secs(1)), Duration::from_secs(1));

        let past = Deadline::after(Duration::ZERO);
        assert!(past.has_passed());
        assert_eq!(past.clamp(Duration::from_secs(1)), Duration::ZERO);

        let soon = Deadline::after_millis(60_000).unwrap();
        assert!(!soon.has_passed());
        assert!(soon.clamp(Duration::from_secs(1)) <= Duration::from_secs(1));

        assert!(Deadline::after_millis(-5).is_err());
    }
}
