//! 지수 백오프 재시도.
//!
//! 일시적 브로커 에러에 대한 재시도 로직을 제공합니다.
//! 치명적/충돌 에러는 즉시 반환되며 재시도되지 않습니다.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::BrokerError;

/// 재시도 설정.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// 최대 재시도 횟수 (최초 시도 제외)
    pub max_retries: u32,
    /// 기본 대기 시간
    pub base_delay: Duration,
    /// 대기 시간 배수 (지수 백오프)
    pub multiplier: f64,
    /// 최대 대기 시간 상한
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// 새 재시도 설정을 생성합니다.
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            ..Default::default()
        }
    }

    /// 주어진 시도 번호의 대기 시간을 계산합니다 (0부터 시작).
    ///
    /// 기본 설정 기준: 1초, 2초, 4초.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay_ms = self.base_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        let capped = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

/// 재시도 실행 통계.
#[derive(Debug, Clone, Default)]
pub struct RetryStats {
    /// 총 시도 횟수 (최초 시도 포함)
    pub attempts: u32,
    /// 재시도로 인한 총 대기 시간
    pub total_backoff: Duration,
}

/// 일시적 에러를 백오프와 함께 재시도합니다.
///
/// `BrokerError::is_retryable()`가 true인 에러만 재시도 대상입니다.
/// 총 브로커 호출 횟수는 최대 `1 + max_retries`회입니다.
pub async fn with_retry<T, F, Fut>(
    operation: &str,
    config: &RetryConfig,
    f: F,
) -> Result<T, BrokerError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, BrokerError>>,
{
    with_retry_if(operation, config, f, BrokerError::is_retryable).await
}

/// 조건을 만족하는 에러만 재시도합니다.
pub async fn with_retry_if<T, F, Fut, P>(
    operation: &str,
    config: &RetryConfig,
    f: F,
    should_retry: P,
) -> Result<T, BrokerError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, BrokerError>>,
    P: Fn(&BrokerError) -> bool,
{
    let mut stats = RetryStats::default();

    loop {
        stats.attempts += 1;

        match f().await {
            Ok(value) => {
                if stats.attempts > 1 {
                    debug!(
                        operation = operation,
                        attempts = stats.attempts,
                        "재시도 후 성공"
                    );
                }
                return Ok(value);
            }
            Err(err) => {
                let retries_used = stats.attempts - 1;

                if !should_retry(&err) || retries_used >= config.max_retries {
                    if retries_used > 0 {
                        warn!(
                            operation = operation,
                            attempts = stats.attempts,
                            error = %err,
                            "재시도 소진, 실패 확정"
                        );
                    }
                    return Err(err);
                }

                let delay = config.delay_for_attempt(retries_used);
                stats.total_backoff += delay;

                warn!(
                    operation = operation,
                    attempt = stats.attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "일시적 에러, 백오프 후 재시도"
                );

                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_config() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            multiplier: 2.0,
            max_delay: Duration::from_millis(10),
        }
    }

    #[test]
    fn test_exponential_delays() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(4));
    }

    #[test]
    fn test_delay_capped() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_success_first_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let result = with_retry("test", &fast_config(), move || {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, BrokerError>(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_then_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let result = with_retry("test", &fast_config(), move || {
            let calls = calls_clone.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(BrokerError::Network("refused".to_string()))
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_max_attempts_bound() {
        // 총 호출 횟수는 최초 1회 + 재시도 3회 = 4회를 넘지 않음
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let result: Result<(), _> = with_retry("test", &fast_config(), move || {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(BrokerError::Timeout("always".to_string()))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_fatal_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let result: Result<(), _> = with_retry("test", &fast_config(), move || {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(BrokerError::OrderRejected("invalid".to_string()))
            }
        })
        .await;

        assert!(matches!(result, Err(BrokerError::OrderRejected(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_conflict_not_retried_by_default() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let result: Result<(), _> = with_retry("test", &fast_config(), move || {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(BrokerError::SharesLocked("stop leg".to_string()))
            }
        })
        .await;

        assert!(matches!(result, Err(BrokerError::SharesLocked(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
