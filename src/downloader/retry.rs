use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use super::error::DownloadError;

/// 有界重试策略：最多 `max_attempts` 次，每次失败后等待时间按 `backoff_factor` 倍增。
/// 只有 [`DownloadError::is_transient`] 的错误会被重试。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub backoff_factor: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 2000,
            backoff_factor: 2,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration, backoff_factor: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay_ms: initial_delay.as_millis() as u64,
            backoff_factor,
        }
    }

    /// 第 `failed_attempts` 次失败之后的等待时间
    pub fn delay_for(&self, failed_attempts: u32) -> Duration {
        let exp = failed_attempts.saturating_sub(1);
        let factor = (self.backoff_factor as u64).saturating_pow(exp);
        Duration::from_millis(self.initial_delay_ms.saturating_mul(factor))
    }

    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, DownloadError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DownloadError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() => {
                    debug!("[{}] 不可重试的错误: {}", label, e);
                    return Err(e);
                }
                Err(e) if attempt >= max_attempts => {
                    warn!("[{}] {} | Final Attempt: {} / {}", label, e, attempt, max_attempts);
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.delay_for(attempt);
                    debug!(
                        "[{}] {} | Attempt: {} / {}，{:?} 后重试",
                        label, e, attempt, max_attempts, delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
