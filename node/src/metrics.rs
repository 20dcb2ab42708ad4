//! Lightweight metrics helpers.

use std::time::Duration;

pub fn rate_per_sec(count: u64, elapsed: Duration) -> Option<f64> {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        Some(count as f64 / secs)
    } else {
        None
    }
}

/// Share of `total` that `part` represents, in percent.
pub fn percent(part: u64, total: u64) -> Option<f64> {
    if total == 0 {
        None
    } else {
        Some(part as f64 * 100.0 / total as f64)
    }
}
