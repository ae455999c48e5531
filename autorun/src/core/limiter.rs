//! Count-bound auto-continuation limit.
//!
//! A limit of `0` means unlimited. The limiter itself is pure; the session
//! store owns the persisted count.

use serde::Serialize;

/// Fraction of the limit at which a warning starts being reported.
pub const WARNING_RATIO: f64 = 0.8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LimitCheck {
    pub should_continue: bool,
    pub count: u32,
    pub limit: u32,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WarningStatus {
    pub is_warning: bool,
    pub threshold: u32,
    pub count: u32,
    pub limit: u32,
    pub message: String,
}

pub fn check_limit(count: u32, limit: u32) -> LimitCheck {
    let (should_continue, message) = if limit == 0 {
        (true, "No safety limit configured".to_string())
    } else if count >= limit {
        (
            false,
            format!("Safety limit reached ({count}/{limit} auto-continuations)"),
        )
    } else {
        (
            true,
            format!(
                "{count}/{limit} auto-continuations used, {} remaining",
                limit - count
            ),
        )
    };
    LimitCheck {
        should_continue,
        count,
        limit,
        message,
    }
}

pub fn warning_threshold(limit: u32) -> u32 {
    (f64::from(limit) * WARNING_RATIO).floor() as u32
}

pub fn warning_status(count: u32, limit: u32) -> WarningStatus {
    let threshold = warning_threshold(limit);
    let is_warning = limit > 0 && count >= threshold;
    let message = if limit == 0 {
        "No safety limit configured".to_string()
    } else if is_warning {
        format!("Warning: approaching safety limit ({count}/{limit})")
    } else {
        format!("Within safe range ({count}/{limit})")
    };
    WarningStatus {
        is_warning,
        threshold,
        count,
        limit,
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_limit_always_continues() {
        for count in [0, 1, 100, u32::MAX] {
            let check = check_limit(count, 0);
            assert!(check.should_continue);
            assert!(check.message.contains("No safety limit"));
        }
    }

    #[test]
    fn stops_at_and_beyond_limit() {
        assert!(check_limit(9, 10).should_continue);
        let at = check_limit(10, 10);
        assert!(!at.should_continue);
        assert!(at.message.contains("Safety limit reached"));
        assert!(!check_limit(15, 10).should_continue);
    }

    #[test]
    fn warning_threshold_is_eighty_percent_floor() {
        assert_eq!(warning_threshold(10), 8);
        assert_eq!(warning_threshold(7), 5);

        let status = warning_status(8, 10);
        assert!(status.is_warning);
        assert!(status.message.contains("Warning"));

        let status = warning_status(3, 10);
        assert!(!status.is_warning);
        assert!(status.message.contains("Within safe range"));
    }

    #[test]
    fn unlimited_never_warns() {
        assert!(!warning_status(1_000, 0).is_warning);
    }
}
