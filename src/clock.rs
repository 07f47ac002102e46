//! Wall-clock helpers shared by the window and the gate.

use chrono::Utc;

/// Current wall-clock time in milliseconds since the Unix epoch.
///
/// A clock set before the epoch reads as zero.
pub fn current_time_millis() -> u64 {
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0)
}

/// Convert a millisecond span to fractional seconds.
pub fn millis_to_secs(millis: u64) -> f64 {
    millis as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_millis_to_secs() {
        assert_eq!(millis_to_secs(1000), 1.0);
        assert_eq!(millis_to_secs(250), 0.25);
        assert_eq!(millis_to_secs(0), 0.0);
    }

    #[test]
    fn test_current_time_after_epoch() {
        // 2020-01-01T00:00:00Z
        assert!(current_time_millis() > 1_577_836_800_000);
    }
}
