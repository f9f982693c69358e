use std::cmp;
use std::time::Duration;

use crate::configuration::types::UploadConfig;

/// Delay before retrying after attempt `attempt` (0-based) failed:
/// `min(retry_delay_ms * 2^attempt, max_retry_delay_ms)`.
pub fn retry_delay(config: &UploadConfig, attempt: u32) -> Duration {
    let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    let delay = config.retry_delay_ms.saturating_mul(factor);
    Duration::from_millis(cmp::min(delay, config.max_retry_delay_ms))
}

/// Whether a failure of attempt `attempt` still leaves a retry.
pub fn should_retry(config: &UploadConfig, attempt: u32) -> bool {
    attempt < config.max_retries
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> UploadConfig {
        UploadConfig {
            max_retries: 3,
            retry_delay_ms: 1000,
            max_retry_delay_ms: 8000,
            ..Default::default()
        }
    }

    #[test]
    fn delays_double_until_capped() {
        let config = config();
        let delays: Vec<u64> = (0..6)
            .map(|a| retry_delay(&config, a).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 8000, 8000]);
    }

    #[test]
    fn huge_attempt_numbers_saturate() {
        assert_eq!(retry_delay(&config(), 200), Duration::from_millis(8000));
    }

    #[test]
    fn retries_stop_at_max() {
        let config = config();
        assert!(should_retry(&config, 0));
        assert!(should_retry(&config, 2));
        assert!(!should_retry(&config, 3));
    }
}
