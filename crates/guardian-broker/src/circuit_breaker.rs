//! Circuit Breaker 패턴 구현.
//!
//! 브로커 연결 장애가 지속될 때 연쇄 실패를 방지합니다.
//! ErrorRecoveryManager가 방어 모드 판단에 사용합니다.
//!
//! # 상태 전이
//!
//! ```text
//! Closed ──[실패 임계치 도달]──> Open
//!    ↑                            │
//!    │                   [타임아웃 경과]
//!    │                            ↓
//!    └──[성공]── HalfOpen ──[실패]──> Open
//! ```

use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::warn;

/// Circuit Breaker 상태.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// 정상 상태 - 모든 요청 허용
    Closed,
    /// 장애 상태 - 모든 요청 즉시 거부
    Open,
    /// 복구 테스트 상태 - 단일 요청만 허용
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Circuit Breaker 설정.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// 연속 실패 임계치 (도달 시 Open 전이)
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Open 상태 유지 시간 (밀리초, 이후 HalfOpen으로 전이)
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
    /// HalfOpen에서 Closed로 전이하기 위한 연속 성공 횟수
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_reset_timeout_ms() -> u64 {
    30_000
}
fn default_success_threshold() -> u32 {
    1
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
            success_threshold: default_success_threshold(),
        }
    }
}

impl CircuitBreakerConfig {
    /// reset_timeout Duration 반환.
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

/// Circuit Breaker 내부 상태.
#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
}

/// 브로커 연결 장애 감지용 Circuit Breaker.
pub struct CircuitBreaker {
    /// 서비스 이름 (로깅용)
    name: String,
    /// 설정
    config: CircuitBreakerConfig,
    /// 내부 상태
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// 새 Circuit Breaker 생성.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                opened_at: None,
            }),
        }
    }

    /// 기본 설정으로 생성.
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitBreakerConfig::default())
    }

    /// 서비스 이름 반환.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 현재 상태 반환. Open 상태의 타임아웃 경과를 반영합니다.
    pub fn state(&self) -> CircuitState {
        let mut state = self.state.lock().unwrap();
        self.maybe_half_open(&mut state);
        state.state
    }

    /// 요청이 허용되는지 확인.
    pub fn is_allowed(&self) -> bool {
        self.state() != CircuitState::Open
    }

    /// 성공을 기록합니다.
    pub fn record_success(&self) {
        let mut state = self.state.lock().unwrap();
        match state.state {
            CircuitState::Closed => {
                state.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                state.success_count += 1;
                if state.success_count >= self.config.success_threshold {
                    state.state = CircuitState::Closed;
                    state.failure_count = 0;
                    state.success_count = 0;
                    state.opened_at = None;
                }
            }
            CircuitState::Open => {}
        }
    }

    /// 실패를 기록합니다.
    pub fn record_failure(&self) {
        let mut state = self.state.lock().unwrap();
        match state.state {
            CircuitState::Closed => {
                state.failure_count += 1;
                if state.failure_count >= self.config.failure_threshold {
                    warn!(
                        breaker = %self.name,
                        failures = state.failure_count,
                        "Circuit breaker open 전이"
                    );
                    state.state = CircuitState::Open;
                    state.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                // 복구 테스트 실패 - 즉시 Open 복귀
                state.state = CircuitState::Open;
                state.opened_at = Some(Instant::now());
                state.success_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    /// Open 상태 타임아웃이 경과했으면 HalfOpen으로 전이합니다.
    fn maybe_half_open(&self, state: &mut BreakerState) {
        if state.state == CircuitState::Open {
            if let Some(opened_at) = state.opened_at {
                if opened_at.elapsed() >= self.config.reset_timeout() {
                    state.state = CircuitState::HalfOpen;
                    state.success_count = 0;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                reset_timeout_ms: 10,
                success_threshold: 1,
            },
        )
    }

    #[test]
    fn test_opens_at_threshold() {
        let breaker = fast_breaker(3);
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.is_allowed());
    }

    #[test]
    fn test_success_resets_failure_count() {
        let breaker = fast_breaker(3);
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();

        // 성공으로 카운트가 리셋되었으므로 아직 Closed
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_recovery() {
        let breaker = fast_breaker(1);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        // 타임아웃 경과 대기
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.is_allowed());

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let breaker = fast_breaker(1);
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }
}
