use std::time::Duration;
use tokio::time::{sleep_until, Instant};

pub const MAX_RETRIES: u32 = 5;
pub const RETRY_DELAY_MS: u64 = 1000;
pub const MAX_RETRY_DELAY_MS: u64 = 30_000;
pub const MIN_REQUEST_INTERVAL_MS: u64 = 1000;

/// 速率限制時使用的指數退避，有上限
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            base_delay: Duration::from_millis(RETRY_DELAY_MS),
            max_delay: Duration::from_millis(MAX_RETRY_DELAY_MS),
        }
    }
}

impl RetryPolicy {
    /// 第 `retry` 次重試（從 1 起算）前的等待：base * 2^(retry-1)，不超過上限。
    /// 伺服器給的提示只能延長等待，同樣受上限限制。
    pub fn delay_for(&self, retry: u32, hint: Option<Duration>) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        let backoff = self
            .base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay);
        backoff.max(hint.unwrap_or_default()).min(self.max_delay)
    }
}

/// 讓兩次送出至少間隔 `min_interval`
#[derive(Debug)]
pub struct RateGate {
    min_interval: Duration,
    last_dispatch: Option<Instant>,
}

impl RateGate {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_dispatch: None,
        }
    }

    /// 等到距上次送出已滿間隔，並記錄現在為新的送出時間
    pub async fn wait(&mut self) {
        if let Some(last) = self.last_dispatch {
            sleep_until(last + self.min_interval).await;
        }
        self.last_dispatch = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(3000),
        };
        assert_eq!(policy.delay_for(1, None), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2, None), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(3, None), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(4, None), Duration::from_millis(3000));
        assert_eq!(policy.delay_for(40, None), Duration::from_millis(3000));
    }

    #[test]
    fn retry_hint_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.delay_for(1, Some(Duration::from_secs(5))),
            Duration::from_secs(5)
        );
        assert_eq!(
            policy.delay_for(1, Some(Duration::from_secs(600))),
            policy.max_delay
        );
    }

    #[tokio::test(start_paused = true)]
    async fn gate_spaces_dispatches() {
        let mut gate = RateGate::new(Duration::from_millis(1000));
        let start = Instant::now();
        gate.wait().await;
        gate.wait().await;
        gate.wait().await;
        assert!(start.elapsed() >= Duration::from_millis(2000));
    }
}
