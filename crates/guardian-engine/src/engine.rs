//! 보호 엔진 조합 루트.
//!
//! 데이터 흐름:
//! 틱 -> PositionTracker.update -> RiskStateMachine.evaluate ->
//! OrderSequencer.enqueue (심볼별 직렬화) -> 브로커 ->
//! 체결/확인 이벤트 -> PositionTracker 피드백.
//!
//! ReconciliationLoop는 독립 주기로 실행되며 트래커에 브로커
//! 진실을 반영할 수 있습니다.
//!
//! 외부 호출자는 보호 주문을 직접 변경할 수 없습니다. 수동 종료
//! 요청도 OrderSequencer를 경유합니다.

use std::sync::Arc;
use std::time::{Duration, Instant};

use guardian_broker::{Broker, BrokerEvent};
use guardian_core::{
    Alert, AlertSink, EngineConfig, EventStore, GuardianError, GuardianResult, Position,
    PositionSnapshot, PositionStore, Price, Quantity, RiskState, Side, StateTransitionEvent,
    Symbol, TransitionTrigger,
};
use guardian_risk::{ProtectionCommand, ProtectionConfig, RiskStateMachine};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::recovery::ErrorRecoveryManager;
use crate::reconcile::{ReconcileReport, ReconciliationLoop};
use crate::sequencer::{FillKind, OrderSequencer};
use crate::tracker::{PositionTracker, PriceTick};

/// 수익 보호 엔진.
///
/// 이미 오픈된 포지션을 등록받아 종료될 때까지 보호 주문을
/// 자율적으로 감독합니다. 포지션 진입 방법은 이 엔진의 범위
/// 밖입니다.
pub struct ProtectionEngine {
    tracker: Arc<RwLock<PositionTracker>>,
    machine: RiskStateMachine,
    sequencer: Arc<OrderSequencer>,
    recovery: Arc<ErrorRecoveryManager>,
    reconciler: Arc<ReconciliationLoop>,
    events: Arc<dyn EventStore>,
    alerts: Arc<dyn AlertSink>,
    config: EngineConfig,
}

impl ProtectionEngine {
    /// 새 보호 엔진을 생성합니다.
    pub fn new(
        broker: Arc<dyn Broker>,
        protection_config: ProtectionConfig,
        engine_config: EngineConfig,
        events: Arc<dyn EventStore>,
        alerts: Arc<dyn AlertSink>,
    ) -> GuardianResult<Self> {
        protection_config
            .validate()
            .map_err(|e| GuardianError::Validation(e.to_string()))?;

        let tracker = Arc::new(RwLock::new(PositionTracker::new(
            engine_config.tick_staleness_ms,
        )));
        let recovery = Arc::new(ErrorRecoveryManager::new(&engine_config, alerts.clone()));
        let sequencer = Arc::new(OrderSequencer::new(
            broker.clone(),
            tracker.clone(),
            recovery.clone(),
            alerts.clone(),
            engine_config.clone(),
        ));
        let reconciler = Arc::new(ReconciliationLoop::new(
            broker,
            tracker.clone(),
            sequencer.clone(),
            recovery.clone(),
            events.clone(),
            alerts.clone(),
            Duration::from_secs(engine_config.reconcile_interval_secs),
        ));

        Ok(Self {
            tracker,
            machine: RiskStateMachine::new(protection_config),
            sequencer,
            recovery,
            reconciler,
            events,
            alerts,
            config: engine_config,
        })
    }

    // ==================== 포지션 등록 ====================

    /// 이미 오픈된 포지션을 보호 대상으로 등록합니다.
    ///
    /// 초기 스톱 주문을 제출한 뒤 트래커에 등록합니다. 방어 모드
    /// 중에는 새 포지션을 수락하지 않습니다.
    pub async fn watch(
        &self,
        symbol: Symbol,
        side: Side,
        quantity: Quantity,
        entry_price: Price,
        initial_stop: Price,
    ) -> GuardianResult<Uuid> {
        if self.recovery.is_defensive() {
            return Err(GuardianError::Position(
                "defensive mode active: not accepting new positions".to_string(),
            ));
        }

        let position = Position::new(symbol, side, quantity, entry_price, initial_stop);
        let snapshot = position.snapshot();

        // 트래커 등록 전에 초기 보호부터 확보
        self.sequencer
            .bootstrap_protection(&snapshot)
            .await
            .map_err(GuardianError::from)?;

        let position_id = {
            let mut tracker = self.tracker.write().await;
            tracker
                .register(position)
                .map_err(|e| GuardianError::Position(e.to_string()))?
        };

        info!(
            position_id = %position_id,
            symbol = %snapshot.symbol,
            quantity = %quantity,
            entry = %entry_price,
            stop = %initial_stop,
            "포지션 보호 시작"
        );
        Ok(position_id)
    }

    /// 저장소에서 복원한 포지션을 다시 감독 대상으로 등록합니다.
    ///
    /// 보호 주문은 이미 브로커에 살아있다고 가정하고 새로 제출하지
    /// 않습니다. 다음 스톱 교체가 충돌 재동기화를 통해 기존 레그를
    /// 수습하고, Reconciliation 패스가 온전성을 확인합니다. 기존
    /// 포지션의 감독 복원이므로 방어 모드 중에도 수락됩니다.
    pub async fn resume(&self, position: Position) -> GuardianResult<Uuid> {
        if position.is_closed() {
            return Err(GuardianError::Validation(format!(
                "position {} is already closed",
                position.id
            )));
        }

        let position_id = {
            let mut tracker = self.tracker.write().await;
            tracker
                .register(position)
                .map_err(|e| GuardianError::Position(e.to_string()))?
        };

        info!(position_id = %position_id, "저장소에서 포지션 감독 복원");
        Ok(position_id)
    }

    /// 오픈 포지션 전체를 저장소에 기록합니다 (크래시 복구용).
    pub async fn persist_positions(&self, store: &dyn PositionStore) {
        let positions = {
            let tracker = self.tracker.read().await;
            tracker.export_positions()
        };
        for position in &positions {
            store.save(position).await;
        }
    }

    // ==================== 틱 처리 ====================

    /// 시장 틱을 처리합니다.
    ///
    /// 트래커 갱신과 상태 머신 평가는 인메모리 연산이며 네트워크
    /// I/O로 블록되지 않습니다. 브로커 호출은 심볼 워커 큐로
    /// 넘어갑니다. 처리 지연이 한도를 넘으면 경고와 알림을
    /// 발행하지만 처리를 막지는 않습니다.
    pub async fn on_tick(&self, symbol: &Symbol, tick: PriceTick) -> GuardianResult<()> {
        let started = Instant::now();

        let snapshot = {
            let mut tracker = self.tracker.write().await;
            match tracker.update(symbol, &tick) {
                Ok(snapshot) => snapshot,
                Err(crate::tracker::PositionTrackerError::StaleTick {
                    symbol, age_ms, ..
                }) => {
                    // 스테일 틱은 조용히 폐기하고 다음 틱을 기다림
                    debug!(symbol = %symbol, age_ms = age_ms, "스테일 틱 폐기");
                    return Err(GuardianError::StaleData(format!(
                        "tick age {}ms",
                        age_ms
                    )));
                }
                Err(error) => return Err(GuardianError::Position(error.to_string())),
            }
        };

        let evaluation = self.machine.evaluate(&snapshot);

        // 전이를 먼저 적용하고 영속화. 커맨드 실패는 전이를
        // 롤백하지 않음 - 재시도되는 것은 커맨드다
        for transition in &evaluation.transitions {
            {
                let mut tracker = self.tracker.write().await;
                let _ = tracker.apply_transition(snapshot.id, transition.to);
            }
            self.events
                .append(StateTransitionEvent::new(
                    snapshot.id,
                    snapshot.symbol.clone(),
                    transition.from,
                    transition.to,
                    transition.trigger.clone(),
                ))
                .await;

            info!(
                position_id = %snapshot.id,
                from = %transition.from,
                to = %transition.to,
                trigger = %transition.trigger,
                "상태 전이"
            );
        }

        for command in evaluation.commands {
            // 제출된 마일스톤을 기록해 체결 전 재평가에서의 중복
            // 스케줄을 차단
            if let ProtectionCommand::MilestoneExit { threshold, .. } = &command {
                let mut tracker = self.tracker.write().await;
                let _ = tracker.mark_milestone_scheduled(snapshot.id, *threshold);
            }
            self.sequencer.enqueue(command);
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        if elapsed_ms >= self.config.tick_budget_ms {
            warn!(
                symbol = %symbol,
                elapsed_ms = elapsed_ms,
                budget_ms = self.config.tick_budget_ms,
                "틱 처리 지연 한도 초과"
            );
            self.alerts
                .alert(Alert::LatencyViolation {
                    position_id: snapshot.id,
                    operation: "tick_evaluation".to_string(),
                    elapsed_ms,
                    budget_ms: self.config.tick_budget_ms,
                })
                .await;
        }

        Ok(())
    }

    // ==================== 브로커 이벤트 처리 ====================

    /// 브로커 이벤트 스트림의 이벤트를 처리합니다.
    pub async fn on_broker_event(&self, event: BrokerEvent) {
        match event {
            BrokerEvent::Fill(fill) => {
                let Some(kind) = self.sequencer.classify_fill(&fill.order_id) else {
                    debug!(order_id = %fill.order_id, "보호 레그가 아닌 체결, 무시");
                    return;
                };

                match kind {
                    FillKind::Stop { position_id } => {
                        self.handle_full_exit_fill(
                            position_id,
                            fill.quantity,
                            TransitionTrigger::StopFilled,
                        )
                        .await;
                    }
                    FillKind::MilestoneExit {
                        position_id,
                        threshold,
                    } => {
                        let snapshot = {
                            let mut tracker = self.tracker.write().await;
                            tracker.record_milestone_fill(
                                position_id,
                                threshold,
                                fill.quantity,
                                fill.price,
                            )
                        };
                        self.sequencer.remove_target(position_id, &fill.order_id);

                        if let Ok(snapshot) = snapshot {
                            if snapshot.state == RiskState::Closed {
                                self.finalize_close(
                                    position_id,
                                    snapshot,
                                    TransitionTrigger::MilestoneExitFilled,
                                )
                                .await;
                            }
                        }
                    }
                    FillKind::ManualExit { position_id } => {
                        self.handle_full_exit_fill(
                            position_id,
                            fill.quantity,
                            TransitionTrigger::ManualClose,
                        )
                        .await;
                    }
                }
            }
            BrokerEvent::Cancelled { order_id } => {
                if let Some(kind) = self.sequencer.classify_fill(&order_id) {
                    match kind {
                        FillKind::MilestoneExit { position_id, .. }
                        | FillKind::ManualExit { position_id } => {
                            self.sequencer.remove_target(position_id, &order_id);
                        }
                        FillKind::Stop { .. } => {
                            // 스톱 취소 확인은 시퀀서 교체 절차의 일부
                        }
                    }
                }
            }
            BrokerEvent::Rejected { order_id, reason } => {
                warn!(order_id = %order_id, reason = %reason, "브로커 주문 거부 통지");
            }
        }
    }

    /// 전량 청산 체결 공통 처리.
    async fn handle_full_exit_fill(
        &self,
        position_id: Uuid,
        quantity: Quantity,
        trigger: TransitionTrigger,
    ) {
        let snapshot = {
            let mut tracker = self.tracker.write().await;
            tracker.record_full_exit(position_id, quantity, trigger.clone())
        };

        if let Ok(snapshot) = snapshot {
            self.finalize_close(position_id, snapshot, trigger).await;
        }
    }

    /// 종료 전이를 영속화하고 보호 집합을 정리합니다.
    async fn finalize_close(
        &self,
        position_id: Uuid,
        snapshot: PositionSnapshot,
        trigger: TransitionTrigger,
    ) {
        // 스냅샷은 이미 Closed이므로 from 상태는 마일스톤 원장에서 역산
        let from = previous_state(&snapshot);

        self.events
            .append(StateTransitionEvent::new(
                position_id,
                snapshot.symbol.clone(),
                from,
                RiskState::Closed,
                trigger.clone(),
            ))
            .await;

        self.sequencer.clear_position(position_id);

        info!(
            position_id = %position_id,
            symbol = %snapshot.symbol,
            trigger = %trigger,
            "포지션 종료"
        );
    }

    // ==================== 수동 종료 ====================

    /// 포지션 전량 청산을 요청합니다.
    ///
    /// 불변식 보존을 위해 반드시 OrderSequencer를 경유합니다.
    pub async fn close_position(&self, symbol: &Symbol, reason: &str) -> GuardianResult<()> {
        let snapshot = self
            .snapshot(&symbol.to_string())
            .await
            .ok_or_else(|| GuardianError::Position(format!("no position for {}", symbol)))?;

        self.sequencer.enqueue(ProtectionCommand::Close {
            position_id: snapshot.id,
            symbol: snapshot.symbol,
            side: snapshot.side,
            quantity: snapshot.remaining_quantity,
            reason: reason.to_string(),
        });
        Ok(())
    }

    // ==================== 조회 ====================

    /// 심볼의 읽기 전용 스냅샷을 반환합니다.
    pub async fn snapshot(&self, symbol: &str) -> Option<PositionSnapshot> {
        let tracker = self.tracker.read().await;
        tracker.snapshot(symbol)
    }

    /// 모든 오픈 포지션의 스냅샷을 반환합니다.
    pub async fn open_snapshots(&self) -> Vec<PositionSnapshot> {
        let tracker = self.tracker.read().await;
        tracker.open_snapshots()
    }

    /// 방어 모드 여부를 반환합니다.
    pub fn is_defensive(&self) -> bool {
        self.recovery.is_defensive()
    }

    // ==================== Reconciliation ====================

    /// Reconciliation 패스를 즉시 1회 실행합니다.
    pub async fn reconcile_once(&self) -> GuardianResult<ReconcileReport> {
        self.reconciler
            .run_once()
            .await
            .map_err(GuardianError::from)
    }

    /// 백그라운드 Reconciliation 루프를 시작합니다.
    ///
    /// 반환된 토큰을 취소하면 루프가 종료됩니다.
    pub fn spawn_reconciler(&self) -> CancellationToken {
        let token = CancellationToken::new();
        let reconciler = self.reconciler.clone();
        tokio::spawn(reconciler.run(token.clone()));
        token
    }
}

/// 종료 직전 상태를 추정합니다.
///
/// 완료된 마일스톤 수에서 역산합니다. 스냅샷은 이미 Closed이므로
/// 전이 이벤트의 from 필드에만 사용됩니다.
fn previous_state(snapshot: &PositionSnapshot) -> RiskState {
    match snapshot.milestones_done.len() {
        0 => {
            if snapshot.current_stop_price == snapshot.initial_stop_price {
                RiskState::InitialRisk
            } else {
                RiskState::BreakevenProtected
            }
        }
        1 => RiskState::PartialProfitTaken,
        _ => RiskState::AdvancedProfitTaken,
    }
}
