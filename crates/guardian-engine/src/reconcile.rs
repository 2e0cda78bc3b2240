//! Reconciliation 루프.
//!
//! 틱 주도 평가와 독립적으로 고정 주기마다 브로커의 포지션/주문
//! 뷰를 조회해 로컬 상태와 비교합니다.
//!
//! - 브로커에 대응 포지션이 없는 로컬 포지션은 "외부 종료"로
//!   흡수됩니다 (브라켓 체결, 수동 개입 등). 에러가 아닙니다.
//! - 브로커 상태와 일치하는 포지션에는 아무 변경도 가하지 않습니다.
//!   변경되지 않은 브로커 상태에 대한 재실행은 멱등입니다.
//! - 성공한 패스에서 모든 포지션의 보호가 온전하면 방어 모드
//!   해제를 복구 관리자에 통보합니다.
//!
//! 이것이 OrderSequencer를 거치지 않고 트래커가 브로커 진실로
//! 보정되는 유일한 경로입니다.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use guardian_broker::{Broker, BrokerError};
use guardian_core::{Alert, AlertSink, EventStore};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::recovery::ErrorRecoveryManager;
use crate::sequencer::OrderSequencer;
use crate::tracker::PositionTracker;

/// 단일 Reconciliation 패스의 결과.
#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    /// 검사한 로컬 포지션 수
    pub checked: usize,
    /// 외부 종료로 흡수된 포지션
    pub externally_closed: Vec<Uuid>,
    /// 이 패스에서 수행된 로컬 변경 수
    pub mutations: usize,
    /// 모든 오픈 포지션의 보호 주문이 온전한지 여부
    pub all_protected: bool,
}

/// 주기적 Reconciliation 루프.
pub struct ReconciliationLoop {
    broker: Arc<dyn Broker>,
    tracker: Arc<RwLock<PositionTracker>>,
    sequencer: Arc<OrderSequencer>,
    recovery: Arc<ErrorRecoveryManager>,
    events: Arc<dyn EventStore>,
    alerts: Arc<dyn AlertSink>,
    interval: Duration,
}

impl ReconciliationLoop {
    /// 새 Reconciliation 루프를 생성합니다.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        broker: Arc<dyn Broker>,
        tracker: Arc<RwLock<PositionTracker>>,
        sequencer: Arc<OrderSequencer>,
        recovery: Arc<ErrorRecoveryManager>,
        events: Arc<dyn EventStore>,
        alerts: Arc<dyn AlertSink>,
        interval: Duration,
    ) -> Self {
        Self {
            broker,
            tracker,
            sequencer,
            recovery,
            events,
            alerts,
            interval,
        }
    }

    /// 취소될 때까지 고정 주기로 패스를 실행합니다.
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Reconciliation 루프 종료");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(error) = self.run_once().await {
                        warn!(error = %error, "Reconciliation 패스 실패, 다음 주기에 재시도");
                    }
                }
            }
        }
    }

    /// 단일 Reconciliation 패스를 실행합니다.
    pub async fn run_once(&self) -> Result<ReconcileReport, BrokerError> {
        let broker_positions = match self.broker.get_positions().await {
            Ok(positions) => positions,
            Err(error) => {
                self.recovery.record_broker_failure(&error).await;
                return Err(error);
            }
        };
        let open_orders = match self.broker.get_open_orders(None).await {
            Ok(orders) => orders,
            Err(error) => {
                self.recovery.record_broker_failure(&error).await;
                return Err(error);
            }
        };
        self.recovery.record_broker_success();

        let broker_symbols: HashSet<String> = broker_positions
            .iter()
            .map(|p| p.symbol.to_string())
            .collect();
        let live_order_ids: HashSet<String> = open_orders
            .iter()
            .map(|o| o.id.as_str().to_string())
            .collect();

        let local_snapshots = {
            let tracker = self.tracker.read().await;
            tracker.open_snapshots()
        };

        let mut report = ReconcileReport {
            checked: local_snapshots.len(),
            all_protected: true,
            ..Default::default()
        };

        for snapshot in local_snapshots {
            let symbol_key = snapshot.symbol.to_string();

            if !broker_symbols.contains(&symbol_key) {
                // 브로커에 없는 포지션: 외부 종료로 흡수 (에러 아님)
                info!(
                    position_id = %snapshot.id,
                    symbol = %symbol_key,
                    "브로커에 포지션 없음, 외부 종료로 흡수"
                );

                let event = {
                    let mut tracker = self.tracker.write().await;
                    tracker.absorb_external_close(snapshot.id)
                };

                if let Ok(event) = event {
                    self.events.append(event).await;
                    self.alerts
                        .alert(Alert::ReconciliationCorrection {
                            position_id: snapshot.id,
                            symbol: snapshot.symbol.clone(),
                            detail: "closed externally".to_string(),
                        })
                        .await;
                    self.sequencer.clear_position(snapshot.id);
                    report.externally_closed.push(snapshot.id);
                    report.mutations += 1;
                }
                continue;
            }

            // 브로커 상태와 일치: 변경 없음. 보호 온전성만 확인
            let protected = !snapshot.protection_lost
                && self
                    .sequencer
                    .protection_set(snapshot.id)
                    .and_then(|set| set.stop)
                    .map(|leg| live_order_ids.contains(leg.order_id.as_str()))
                    .unwrap_or(false);

            if !protected {
                debug!(
                    position_id = %snapshot.id,
                    symbol = %symbol_key,
                    "보호 주문 온전성 확인 실패"
                );
                report.all_protected = false;
            }
        }

        self.recovery.confirm_reconciled(report.all_protected).await;

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use guardian_broker::SimulatedBroker;
    use guardian_core::{
        EngineConfig, MemoryAlertSink, MemoryEventStore, Position, RiskState, Side, Symbol,
    };
    use rust_decimal_macros::dec;

    fn btc() -> Symbol {
        Symbol::crypto("BTC", "USDT")
    }

    struct Fixture {
        reconciler: ReconciliationLoop,
        broker: Arc<SimulatedBroker>,
        tracker: Arc<RwLock<PositionTracker>>,
        recovery: Arc<ErrorRecoveryManager>,
        events: Arc<MemoryEventStore>,
        position_id: Uuid,
    }

    async fn fixture() -> Fixture {
        let (broker, _rx) = SimulatedBroker::new();
        let broker = Arc::new(broker);
        broker.set_position(btc(), Side::Buy, dec!(10), dec!(100));

        let tracker = Arc::new(RwLock::new(PositionTracker::new(1000)));
        let position = Position::new(btc(), Side::Buy, dec!(10), dec!(100), dec!(98));
        let position_id = {
            let mut t = tracker.write().await;
            t.register(position).unwrap()
        };
        let snapshot = tracker.read().await.snapshot_by_id(position_id).unwrap();

        let alerts = Arc::new(MemoryAlertSink::new());
        let events = Arc::new(MemoryEventStore::new());
        let config = EngineConfig {
            retry_base_delay_ms: 1,
            ..Default::default()
        };
        let recovery = Arc::new(ErrorRecoveryManager::new(&config, alerts.clone()));

        let sequencer = Arc::new(OrderSequencer::new(
            broker.clone(),
            tracker.clone(),
            recovery.clone(),
            alerts.clone(),
            config,
        ));
        sequencer.bootstrap_protection(&snapshot).await.unwrap();

        let reconciler = ReconciliationLoop::new(
            broker.clone(),
            tracker.clone(),
            sequencer,
            recovery.clone(),
            events.clone(),
            alerts,
            Duration::from_secs(60),
        );

        Fixture {
            reconciler,
            broker,
            tracker,
            recovery,
            events,
            position_id,
        }
    }

    #[tokio::test]
    async fn test_matching_state_no_mutation() {
        let f = fixture().await;

        let report = f.reconciler.run_once().await.unwrap();
        assert_eq!(report.checked, 1);
        assert_eq!(report.mutations, 0);
        assert!(report.all_protected);
    }

    #[tokio::test]
    async fn test_absorbs_externally_closed_position() {
        // 브로커에서 사라진 포지션은 외부 종료로 흡수
        let f = fixture().await;

        f.broker.remove_position(&btc());

        let report = f.reconciler.run_once().await.unwrap();
        assert_eq!(report.externally_closed, vec![f.position_id]);
        assert_eq!(report.mutations, 1);

        let tracker = f.tracker.read().await;
        assert_eq!(tracker.open_position_count(), 0);

        // 전이 이벤트가 영속화됨
        let events = f.events.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].to, RiskState::Closed);
    }

    #[tokio::test]
    async fn test_idempotent_on_unchanged_state() {
        let f = fixture().await;

        f.broker.remove_position(&btc());
        let first = f.reconciler.run_once().await.unwrap();
        assert_eq!(first.mutations, 1);

        // 변경되지 않은 브로커 상태에 대한 재실행은 추가 변경 없음
        let second = f.reconciler.run_once().await.unwrap();
        assert_eq!(second.mutations, 0);
        assert!(second.externally_closed.is_empty());
    }

    #[tokio::test]
    async fn test_clean_pass_clears_defensive_mode() {
        let f = fixture().await;

        f.recovery.engage_defensive("test").await;
        assert!(f.recovery.is_defensive());

        f.reconciler.run_once().await.unwrap();
        assert!(!f.recovery.is_defensive());
    }

    #[tokio::test]
    async fn test_broker_error_skips_pass() {
        let f = fixture().await;

        f.broker.fail_next(
            guardian_broker::BrokerOp::GetPositions,
            guardian_broker::BrokerError::Network("down".to_string()),
        );

        assert!(f.reconciler.run_once().await.is_err());

        // 로컬 상태는 건드리지 않음
        let tracker = f.tracker.read().await;
        assert_eq!(tracker.open_position_count(), 1);
    }
}
