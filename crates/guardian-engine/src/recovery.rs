//! 에러 복구 관리.
//!
//! OrderSequencer 실패를 분류하고, 짧은 윈도우 안에 치명적 실패가
//! 반복되거나 브로커 연결이 끊기면 프로세스 전역 "방어 모드"를
//! 활성화합니다. 방어 모드에서는 새 포지션이 수락되지 않으며,
//! 모든 기존 포지션의 보호 주문이 온전함을 Reconciliation 패스가
//! 확인해야 해제됩니다.

use guardian_broker::{BrokerError, CircuitBreaker, CircuitBreakerConfig};
use guardian_core::{Alert, AlertSink, EngineConfig, Symbol};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

/// 실패 분류.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// 일시적 - 백오프 재시도 (OrderSequencer 내부에서 처리됨)
    Transient,
    /// 충돌 - 브로커 상태 재조회 후 1회 재시도
    Conflict,
    /// 치명적 - 알림, 마지막 보호 상태 유지, 무한 재시도 금지
    Fatal,
}

impl FailureClass {
    /// 브로커 에러를 분류합니다.
    pub fn of(error: &BrokerError) -> Self {
        if error.is_fatal() {
            FailureClass::Fatal
        } else if error.is_conflict() {
            FailureClass::Conflict
        } else {
            FailureClass::Transient
        }
    }
}

/// 에러 복구 관리자.
pub struct ErrorRecoveryManager {
    /// 방어 모드 플래그 (프로세스 전역)
    defensive: AtomicBool,
    /// 윈도우 내 치명적 실패 발생 시각
    fatal_times: Mutex<VecDeque<Instant>>,
    /// 치명적 실패 임계치
    fatal_threshold: u32,
    /// 치명적 실패 집계 윈도우
    fatal_window: Duration,
    /// 브로커 연결 장애 감지기
    breaker: CircuitBreaker,
    /// 알림 싱크
    alerts: Arc<dyn AlertSink>,
}

impl ErrorRecoveryManager {
    /// 새 복구 관리자를 생성합니다.
    pub fn new(config: &EngineConfig, alerts: Arc<dyn AlertSink>) -> Self {
        Self {
            defensive: AtomicBool::new(false),
            fatal_times: Mutex::new(VecDeque::new()),
            fatal_threshold: config.fatal_failure_threshold,
            fatal_window: Duration::from_secs(config.fatal_failure_window_secs),
            breaker: CircuitBreaker::new("broker", CircuitBreakerConfig::default()),
            alerts,
        }
    }

    /// 방어 모드 여부를 반환합니다.
    pub fn is_defensive(&self) -> bool {
        self.defensive.load(Ordering::SeqCst)
    }

    /// 치명적 실패를 기록합니다.
    ///
    /// 윈도우 내 누적 횟수가 임계치에 도달하면 방어 모드로 전환합니다.
    pub async fn record_fatal(&self, position_id: Uuid, symbol: &Symbol, reason: &str) {
        error!(
            position_id = %position_id,
            symbol = %symbol,
            reason = reason,
            "치명적 보호 실패 기록"
        );

        let breached = {
            let mut times = self.fatal_times.lock().unwrap();
            let now = Instant::now();
            times.push_back(now);
            while let Some(front) = times.front() {
                if now.duration_since(*front) > self.fatal_window {
                    times.pop_front();
                } else {
                    break;
                }
            }
            times.len() as u32 >= self.fatal_threshold
        };

        if breached {
            self.engage_defensive("repeated fatal failures within window")
                .await;
        }
    }

    /// 브로커 호출 성공을 기록합니다 (circuit breaker 회복용).
    pub fn record_broker_success(&self) {
        self.breaker.record_success();
    }

    /// 브로커 호출 실패를 기록합니다.
    ///
    /// 연결 장애성 실패가 누적되어 circuit이 열리면 방어 모드로
    /// 전환합니다.
    pub async fn record_broker_failure(&self, error: &BrokerError) {
        if error.is_connectivity() {
            self.breaker.record_failure();
            if !self.breaker.is_allowed() {
                self.engage_defensive("broker connectivity lost").await;
            }
        }
    }

    /// 방어 모드를 활성화합니다.
    pub async fn engage_defensive(&self, reason: &str) {
        if !self.defensive.swap(true, Ordering::SeqCst) {
            warn!(reason = reason, "방어 모드 활성화: 새 포지션 수락 중단");
            self.alerts
                .alert(Alert::DefensiveMode {
                    engaged: true,
                    reason: reason.to_string(),
                })
                .await;
        }
    }

    /// Reconciliation 패스 결과를 반영합니다.
    ///
    /// 모든 기존 포지션의 보호 주문이 온전함이 확인된 경우에만
    /// 방어 모드를 해제합니다.
    pub async fn confirm_reconciled(&self, all_protected: bool) {
        if !all_protected {
            return;
        }

        if self.defensive.swap(false, Ordering::SeqCst) {
            info!("Reconciliation 확인 완료, 방어 모드 해제");
            self.alerts
                .alert(Alert::DefensiveMode {
                    engaged: false,
                    reason: "reconciliation pass confirmed protections intact".to_string(),
                })
                .await;
        }
    }
}
