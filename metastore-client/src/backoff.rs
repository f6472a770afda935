//! Randomized bounded backoff.

use std::time::Duration;

use rand::Rng;

use crate::config::TimeoutOptions;

/// A uniform random duration in `[lower_ms, upper_ms]`.
pub fn uniform_ms(lower_ms: u64, upper_ms: u64) -> Duration {
    let (lower_ms, upper_ms) = if lower_ms <= upper_ms {
        (lower_ms, upper_ms)
    } else {
        (upper_ms, lower_ms)
    };
    Duration::from_millis(rand::rng().random_range(lower_ms..=upper_ms))
}

/// Sleep between unary retries: uniform in `[lower * attempt, upper * attempt]`.
pub fn retry_delay(options: &TimeoutOptions, attempt: u32) -> Duration {
    let attempt = u64::from(attempt.max(1));
    uniform_ms(
        options.operation_retry_interval_lower_bound * attempt,
        options.operation_retry_interval_upper_bound * attempt,
    )
}

/// Re-send schedule for the in-flight request tracker: the unary deadline
/// plus the usual jitter window, so a resend never races a reply that is
/// merely slow.
pub fn tracker_delay(options: &TimeoutOptions, attempt: u32) -> Duration {
    let attempt = u64::from(attempt.max(1));
    let base = options.grpc_timeout * 1000;
    uniform_ms(
        base + options.operation_retry_interval_lower_bound * attempt,
        base + options.operation_retry_interval_upper_bound * attempt,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_stay_in_bounds() {
        let options = TimeoutOptions::default();
        for attempt in 1..=5u32 {
            let delay = retry_delay(&options, attempt).as_millis() as u64;
            assert!(delay >= 1000 * u64::from(attempt));
            assert!(delay <= 5000 * u64::from(attempt));

            let tracked = tracker_delay(&options, attempt).as_millis() as u64;
            assert!(tracked >= 5000 + 1000 * u64::from(attempt));
            assert!(tracked <= 5000 + 5000 * u64::from(attempt));
        }
    }
}
