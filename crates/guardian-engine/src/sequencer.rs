//! 주문 시퀀서.
//!
//! 브로커측 주문 상태를 변경하는 유일한 컴포넌트입니다.
//! 제공 기능:
//! - 심볼별 단일 워커를 통한 커맨드 직렬화 (같은 포지션에 대한
//!   동시 변경 금지)
//! - cancel-before-create 순서 보장 ("shares locked" 충돌 방지)
//! - 일시적 실패의 지수 백오프 재시도, 충돌 시 재동기화 후 1회 재시도
//! - 복합 변경 (스톱 이동 + 부분 청산)의 best-effort 롤백
//!
//! 브로커가 트랜잭션을 제공하지 않으므로 롤백은 best-effort입니다.
//! 취소 성공 후 생성과 복원이 모두 실패하면 포지션은 보호 상실로
//! 플래그되고 알림이 발행되며, 무한 재시도는 하지 않습니다.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use guardian_broker::{with_retry, Broker, BrokerError, BrokerOrderStatus, RetryConfig};
use guardian_core::{
    Alert, AlertSink, BrokerOrderId, EngineConfig, OrderRequest, PositionSnapshot, Price,
    ProtectionOrderSet, Quantity, RiskState, Side, StopLeg, Symbol, TargetLeg,
};
use guardian_risk::{CommandKind, ProtectionCommand};
use rust_decimal::Decimal;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::recovery::ErrorRecoveryManager;
use crate::tracker::PositionTracker;

/// 체결된 주문의 분류 결과.
#[derive(Debug, Clone, PartialEq)]
pub enum FillKind {
    /// 스톱 레그 체결 (포지션 종료)
    Stop {
        /// 대상 포지션
        position_id: Uuid,
    },
    /// 마일스톤 청산 체결
    MilestoneExit {
        /// 대상 포지션
        position_id: Uuid,
        /// 도달한 R-배수 임계값
        threshold: Decimal,
    },
    /// 수동 종료 청산 체결
    ManualExit {
        /// 대상 포지션
        position_id: Uuid,
    },
}

/// 큐에 들어간 커맨드 (지연 한도 측정용 enqueue 시각 포함).
struct QueuedCommand {
    command: ProtectionCommand,
    enqueued_at: Instant,
}

/// 워커와 실행 로직이 공유하는 상태.
pub(crate) struct SequencerShared {
    broker: Arc<dyn Broker>,
    tracker: Arc<RwLock<PositionTracker>>,
    recovery: Arc<ErrorRecoveryManager>,
    alerts: Arc<dyn AlertSink>,
    config: EngineConfig,
    retry: RetryConfig,
    /// 포지션별 보호 주문 집합 (시퀀서가 배타적으로 변경)
    protection: Mutex<HashMap<Uuid, ProtectionOrderSet>>,
}

/// 심볼별 워커 핸들.
struct SymbolWorker {
    tx: mpsc::UnboundedSender<QueuedCommand>,
    handle: JoinHandle<()>,
}

/// 주문 시퀀서.
pub struct OrderSequencer {
    shared: Arc<SequencerShared>,
    workers: Mutex<HashMap<String, SymbolWorker>>,
}

impl OrderSequencer {
    /// 새 시퀀서를 생성합니다.
    pub fn new(
        broker: Arc<dyn Broker>,
        tracker: Arc<RwLock<PositionTracker>>,
        recovery: Arc<ErrorRecoveryManager>,
        alerts: Arc<dyn AlertSink>,
        config: EngineConfig,
    ) -> Self {
        let retry = RetryConfig {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            ..Default::default()
        };

        Self {
            shared: Arc::new(SequencerShared {
                broker,
                tracker,
                recovery,
                alerts,
                config,
                retry,
                protection: Mutex::new(HashMap::new()),
            }),
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// 등록 직후 포지션의 초기 스톱 주문을 제출합니다.
    pub async fn bootstrap_protection(
        &self,
        snapshot: &PositionSnapshot,
    ) -> Result<(), BrokerError> {
        let request = OrderRequest::stop_loss(
            snapshot.symbol.clone(),
            snapshot.side,
            snapshot.remaining_quantity,
            snapshot.current_stop_price,
        );

        let order_id = self.shared.submit_call("bootstrap_stop", &request).await?;

        let mut protection = self.shared.protection.lock().unwrap();
        protection.insert(
            snapshot.id,
            ProtectionOrderSet::with_stop(
                order_id,
                snapshot.current_stop_price,
                snapshot.remaining_quantity,
            ),
        );

        info!(
            position_id = %snapshot.id,
            symbol = %snapshot.symbol,
            stop = %snapshot.current_stop_price,
            "초기 보호 스톱 제출됨"
        );
        Ok(())
    }

    /// 커맨드를 심볼 워커 큐에 넣습니다.
    ///
    /// 심볼당 워커는 하나이며, 같은 포지션의 커맨드는 절대
    /// 동시에 실행되지 않습니다.
    pub fn enqueue(&self, command: ProtectionCommand) {
        let symbol_key = command.symbol().to_string();
        let mut workers = self.workers.lock().unwrap();

        let worker = workers.entry(symbol_key.clone()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            let shared = self.shared.clone();
            let handle = tokio::spawn(run_worker(symbol_key, rx, shared));
            SymbolWorker { tx, handle }
        });

        let _ = worker.tx.send(QueuedCommand {
            command,
            enqueued_at: Instant::now(),
        });
    }

    /// 체결된 주문이 어떤 보호 레그인지 분류합니다.
    pub fn classify_fill(&self, order_id: &BrokerOrderId) -> Option<FillKind> {
        let protection = self.shared.protection.lock().unwrap();

        for (position_id, set) in protection.iter() {
            if set.is_stop_order(order_id) {
                return Some(FillKind::Stop {
                    position_id: *position_id,
                });
            }
            if let Some(target) = set.targets.iter().find(|t| &t.order_id == order_id) {
                return Some(match target.milestone {
                    Some(threshold) => FillKind::MilestoneExit {
                        position_id: *position_id,
                        threshold,
                    },
                    None => FillKind::ManualExit {
                        position_id: *position_id,
                    },
                });
            }
        }
        None
    }

    /// 체결/취소된 타겟 레그를 집합에서 제거합니다.
    pub fn remove_target(&self, position_id: Uuid, order_id: &BrokerOrderId) {
        let mut protection = self.shared.protection.lock().unwrap();
        if let Some(set) = protection.get_mut(&position_id) {
            set.remove_target(order_id);
        }
    }

    /// 종료된 포지션의 보호 집합을 제거합니다.
    pub fn clear_position(&self, position_id: Uuid) {
        let mut protection = self.shared.protection.lock().unwrap();
        protection.remove(&position_id);
    }

    /// 포지션의 보호 집합 복사본을 반환합니다.
    pub fn protection_set(&self, position_id: Uuid) -> Option<ProtectionOrderSet> {
        let protection = self.shared.protection.lock().unwrap();
        protection.get(&position_id).cloned()
    }

    /// 모든 워커를 중지합니다.
    pub fn shutdown(&self) {
        let mut workers = self.workers.lock().unwrap();
        for (_, worker) in workers.drain() {
            worker.handle.abort();
        }
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<SequencerShared> {
        &self.shared
    }
}

impl Drop for OrderSequencer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// 심볼별 워커 루프.
///
/// 큐에서 커맨드를 하나씩 꺼내 실행합니다. 브로커 호출 중에는 이
/// 심볼의 큐만 블록되며 다른 심볼은 독립적으로 진행됩니다.
async fn run_worker(
    symbol: String,
    mut rx: mpsc::UnboundedReceiver<QueuedCommand>,
    shared: Arc<SequencerShared>,
) {
    while let Some(queued) = rx.recv().await {
        let position_id = queued.command.position_id();

        // 종료된 포지션의 미제출 커맨드는 폐기
        let still_open = {
            let tracker = shared.tracker.read().await;
            tracker
                .snapshot_by_id(position_id)
                .map(|s| s.state != RiskState::Closed)
                .unwrap_or(false)
        };
        if !still_open {
            debug!(
                symbol = %symbol,
                position_id = %position_id,
                "포지션 종료됨, 큐의 커맨드 폐기"
            );
            continue;
        }

        // 지연 한도 검사: 한도 초과는 로그/알림 대상이지만 실행을
        // 막지는 않음
        let budget_ms = match queued.command.kind() {
            CommandKind::StopUpdate => shared.config.stop_command_budget_ms,
            CommandKind::MilestoneExit | CommandKind::Close => {
                shared.config.milestone_command_budget_ms
            }
        };
        let elapsed_ms = queued.enqueued_at.elapsed().as_millis() as u64;
        if elapsed_ms >= budget_ms {
            warn!(
                symbol = %symbol,
                position_id = %position_id,
                elapsed_ms = elapsed_ms,
                budget_ms = budget_ms,
                "커맨드 제출 지연 한도 초과"
            );
            shared
                .alerts
                .alert(Alert::LatencyViolation {
                    position_id,
                    operation: format!("{:?}", queued.command.kind()),
                    elapsed_ms,
                    budget_ms,
                })
                .await;
        }

        if let Err(error) = shared.execute_command(&queued.command).await {
            warn!(
                symbol = %symbol,
                position_id = %position_id,
                error = %error,
                "커맨드 실행 실패"
            );
        }
    }
}

impl SequencerShared {
    /// 커맨드 하나를 실행합니다.
    pub(crate) async fn execute_command(
        &self,
        command: &ProtectionCommand,
    ) -> Result<(), BrokerError> {
        match command {
            ProtectionCommand::MoveStop {
                position_id,
                symbol,
                side,
                new_stop,
                quantity,
            } => {
                self.replace_stop(*position_id, symbol, *side, *new_stop, *quantity)
                    .await
            }
            ProtectionCommand::MilestoneExit {
                position_id,
                symbol,
                side,
                threshold,
                quantity,
                stop_price_after,
                stop_quantity_after,
                ..
            } => {
                self.milestone_exit(
                    *position_id,
                    symbol,
                    *side,
                    *threshold,
                    *quantity,
                    *stop_price_after,
                    *stop_quantity_after,
                )
                .await
            }
            ProtectionCommand::Close {
                position_id,
                symbol,
                side,
                quantity,
                reason,
            } => {
                self.close_position(*position_id, symbol, *side, *quantity, reason)
                    .await
            }
        }
    }

    // ==================== 커맨드 구현 ====================

    /// 스톱 레그를 새 가격으로 교체합니다.
    ///
    /// 순서는 항상 cancel-before-create입니다. 반대 순서는 같은
    /// 수량에 두 개의 감소 전용 주문이 걸려 "shares locked"
    /// 충돌을 일으킵니다.
    async fn replace_stop(
        &self,
        position_id: Uuid,
        symbol: &Symbol,
        side: Side,
        new_stop: Price,
        quantity: Quantity,
    ) -> Result<(), BrokerError> {
        let prior = self.stop_leg(position_id);

        // 커맨드 생성 후 체결/청산이 진행됐을 수 있으므로 스톱 수량은
        // 실행 시점의 잔여 수량에서 체결 대기 중인 청산 레그 몫을
        // 제외해 다시 계산한다
        let quantity = {
            let remaining = {
                let tracker = self.tracker.read().await;
                tracker
                    .snapshot_by_id(position_id)
                    .map(|s| s.remaining_quantity)
                    .unwrap_or(quantity)
            };
            let pending_exits: Quantity = {
                let protection = self.protection.lock().unwrap();
                protection
                    .get(&position_id)
                    .map(|set| set.targets.iter().map(|t| t.quantity).sum())
                    .unwrap_or_default()
            };
            remaining - pending_exits.min(remaining)
        };
        if quantity.is_zero() {
            debug!(position_id = %position_id, "잔여 수량 전체가 청산 대기 중, 스톱 교체 생략");
            return Ok(());
        }

        // 1단계: 기존 스톱 취소 및 확인
        if let Some(prior_leg) = &prior {
            match self.cancel_stop_leg(prior_leg).await {
                CancelOutcome::Cancelled => {}
                CancelOutcome::AlreadyFilled => {
                    // 스톱이 이미 체결됨 - 체결 이벤트 핸들러가 종료 처리
                    debug!(position_id = %position_id, "스톱 이미 체결됨, 교체 포기");
                    return Ok(());
                }
                CancelOutcome::Failed(error) => {
                    // 취소 실패: 기존 스톱이 그대로 살아있으므로 포지션은
                    // 여전히 이전 가격으로 보호됨
                    self.record_failure(position_id, symbol, &error).await;
                    return Err(error);
                }
            }
        }

        // 2단계: 새 스톱 제출
        let request = OrderRequest::stop_loss(symbol.clone(), side, quantity, new_stop);
        match self.submit_with_conflict_resync(symbol, &request).await {
            Ok(order_id) => {
                self.commit_stop(position_id, order_id, new_stop, quantity)
                    .await;
                Ok(())
            }
            Err(error) => {
                // 롤백: 이전 가격으로 스톱 복원 (best effort)
                self.record_failure(position_id, symbol, &error).await;
                if let Some(prior_leg) = prior {
                    self.restore_stop(position_id, symbol, side, prior_leg.stop_price, quantity)
                        .await;
                } else {
                    self.mark_unprotected(position_id, symbol, &error).await;
                }
                Err(error)
            }
        }
    }

    /// 마일스톤 부분 청산 배치: 스톱 취소 -> 청산 제출 -> 축소된
    /// 스톱 재제출.
    #[allow(clippy::too_many_arguments)]
    async fn milestone_exit(
        &self,
        position_id: Uuid,
        symbol: &Symbol,
        side: Side,
        threshold: Decimal,
        quantity: Quantity,
        stop_price_after: Option<Price>,
        stop_quantity_after: Quantity,
    ) -> Result<(), BrokerError> {
        let prior = self.stop_leg(position_id);

        // 1단계: 스톱 취소 (청산 수량 잠금 해제)
        if let Some(prior_leg) = &prior {
            match self.cancel_stop_leg(prior_leg).await {
                CancelOutcome::Cancelled => {}
                CancelOutcome::AlreadyFilled => {
                    debug!(position_id = %position_id, "스톱 이미 체결됨, 청산 포기");
                    return Ok(());
                }
                CancelOutcome::Failed(error) => {
                    self.record_failure(position_id, symbol, &error).await;
                    return Err(error);
                }
            }
        }

        // 2단계: 시장가 청산 제출
        let exit_request = OrderRequest::market_exit(symbol.clone(), side, quantity);
        let exit_order_id = match self.submit_call("milestone_exit", &exit_request).await {
            Ok(id) => id,
            Err(error) => {
                // 청산 실패: 이전 스톱 전체를 복원해 보호 유지
                self.record_failure(position_id, symbol, &error).await;
                if let Some(prior_leg) = prior {
                    self.restore_stop(
                        position_id,
                        symbol,
                        side,
                        prior_leg.stop_price,
                        prior_leg.quantity,
                    )
                    .await;
                } else {
                    self.mark_unprotected(position_id, symbol, &error).await;
                }
                return Err(error);
            }
        };

        // 청산 주문을 타겟 레그로 등록 (체결 분류용)
        {
            let mut protection = self.protection.lock().unwrap();
            let set = protection.entry(position_id).or_default();
            set.clear_stop();
            set.add_target(TargetLeg {
                order_id: exit_order_id.clone(),
                limit_price: None,
                quantity,
                milestone: Some(threshold),
            });
        }

        info!(
            position_id = %position_id,
            symbol = %symbol,
            threshold = %threshold,
            quantity = %quantity,
            "마일스톤 청산 제출됨"
        );

        // 3단계: 축소된 수량으로 스톱 재제출 (최종 청산이면 생략)
        if let Some(new_stop) = stop_price_after {
            let stop_request =
                OrderRequest::stop_loss(symbol.clone(), side, stop_quantity_after, new_stop);
            match self.submit_with_conflict_resync(symbol, &stop_request).await {
                Ok(order_id) => {
                    self.commit_stop(position_id, order_id, new_stop, stop_quantity_after)
                        .await;
                }
                Err(error) => {
                    // 롤백: 이전 가격으로 복원 시도. 수량은 청산 주문이
                    // 잠근 몫을 제외한 잔여 수량을 사용
                    self.record_failure(position_id, symbol, &error).await;
                    if let Some(prior_leg) = &prior {
                        self.restore_stop(
                            position_id,
                            symbol,
                            side,
                            prior_leg.stop_price,
                            stop_quantity_after,
                        )
                        .await;
                    } else {
                        self.mark_unprotected(position_id, symbol, &error).await;
                    }
                    return Err(error);
                }
            }
        }

        Ok(())
    }

    /// 전량 청산: 모든 보호 레그 취소 후 시장가 청산.
    async fn close_position(
        &self,
        position_id: Uuid,
        symbol: &Symbol,
        side: Side,
        quantity: Quantity,
        reason: &str,
    ) -> Result<(), BrokerError> {
        info!(
            position_id = %position_id,
            symbol = %symbol,
            reason = reason,
            "포지션 전량 청산 시작"
        );

        let order_ids = {
            let protection = self.protection.lock().unwrap();
            protection
                .get(&position_id)
                .map(|set| set.order_ids())
                .unwrap_or_default()
        };

        for order_id in order_ids {
            match self.cancel_call(&order_id).await {
                Ok(()) => {}
                Err(error) if error.is_conflict() => {
                    // 이미 체결/취소됨 - 체결 이벤트 핸들러가 처리
                    debug!(order_id = %order_id, "취소 불필요: {}", error);
                }
                Err(error) => {
                    self.record_failure(position_id, symbol, &error).await;
                    return Err(error);
                }
            }
        }

        let request = OrderRequest::market_exit(symbol.clone(), side, quantity);
        let order_id = match self.submit_call("close_exit", &request).await {
            Ok(id) => id,
            Err(error) => {
                self.record_failure(position_id, symbol, &error).await;
                self.mark_unprotected(position_id, symbol, &error).await;
                return Err(error);
            }
        };

        let mut protection = self.protection.lock().unwrap();
        let set = protection.entry(position_id).or_default();
        set.clear_stop();
        set.add_target(TargetLeg {
            order_id,
            limit_price: None,
            quantity,
            milestone: None,
        });

        Ok(())
    }

    // ==================== 브로커 호출 래퍼 ====================

    /// 타임아웃이 적용된 단일 브로커 호출.
    async fn with_timeout<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, BrokerError>>,
    ) -> Result<T, BrokerError> {
        let timeout = Duration::from_millis(self.config.broker_call_timeout_ms);
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            // 타임아웃은 성공이 아니라 일시적 실패로 취급
            Err(_) => Err(BrokerError::Timeout(format!(
                "broker call exceeded {}ms",
                timeout.as_millis()
            ))),
        }
    }

    /// 재시도가 적용된 주문 제출.
    async fn submit_call(
        &self,
        operation: &str,
        request: &OrderRequest,
    ) -> Result<BrokerOrderId, BrokerError> {
        let result = with_retry(operation, &self.retry, || {
            self.with_timeout(self.broker.submit_order(request))
        })
        .await;

        self.record_broker_outcome(&result);
        result
    }

    /// 재시도가 적용된 주문 취소.
    async fn cancel_call(&self, order_id: &BrokerOrderId) -> Result<(), BrokerError> {
        let result = with_retry("cancel_order", &self.retry, || {
            self.with_timeout(self.broker.cancel_order(order_id))
        })
        .await;

        self.record_broker_outcome(&result);
        result
    }

    /// 충돌 시 브로커 상태를 재조회하고 1회 재시도하는 제출.
    ///
    /// "shares locked" 충돌은 아직 살아있는 구형 보호 레그가
    /// 원인이므로, 미체결 주문을 재조회해 남은 레그를 취소한 뒤
    /// 한 번만 다시 제출합니다.
    async fn submit_with_conflict_resync(
        &self,
        symbol: &Symbol,
        request: &OrderRequest,
    ) -> Result<BrokerOrderId, BrokerError> {
        match self.submit_call("submit_stop", request).await {
            Err(error) if error.is_conflict() => {
                warn!(symbol = %symbol, error = %error, "충돌 감지, 브로커 상태 재동기화");

                let open_orders = self
                    .with_timeout(self.broker.get_open_orders(Some(symbol)))
                    .await?;

                for order in open_orders {
                    // 잔존 스톱 레그만 정리 (청산 주문은 건드리지 않음)
                    if order.side == request.side
                        && order.stop_price.is_some()
                        && order.status.is_live()
                    {
                        let _ = self.cancel_call(&order.id).await;
                    }
                }

                // 재동기화 후 단일 재시도
                self.submit_call("submit_stop_resync", request).await
            }
            other => other,
        }
    }

    /// 스톱 레그 취소를 시도하고 결과를 해석합니다.
    async fn cancel_stop_leg(&self, leg: &StopLeg) -> CancelOutcome {
        match self.cancel_call(&leg.order_id).await {
            Ok(()) => CancelOutcome::Cancelled,
            Err(error) if error.is_conflict() => {
                // 로컬 상태가 스테일: 주문 상태 재조회로 재동기화
                match self.with_timeout(self.broker.get_order(&leg.order_id)).await {
                    Ok(order) if order.status == BrokerOrderStatus::Filled => {
                        CancelOutcome::AlreadyFilled
                    }
                    Ok(order) if !order.status.is_live() => CancelOutcome::Cancelled,
                    Ok(_) => {
                        // 여전히 살아있음 - 1회 재시도
                        match self.cancel_call(&leg.order_id).await {
                            Ok(()) => CancelOutcome::Cancelled,
                            Err(error) => CancelOutcome::Failed(error),
                        }
                    }
                    Err(_) => CancelOutcome::Failed(error),
                }
            }
            Err(error) => CancelOutcome::Failed(error),
        }
    }

    // ==================== 상태 반영 ====================

    /// 새 스톱 레그를 보호 집합과 트래커에 반영합니다.
    async fn commit_stop(
        &self,
        position_id: Uuid,
        order_id: BrokerOrderId,
        stop_price: Price,
        quantity: Quantity,
    ) {
        {
            let mut protection = self.protection.lock().unwrap();
            let set = protection.entry(position_id).or_default();
            set.replace_stop(order_id, stop_price, quantity);
        }

        let mut tracker = self.tracker.write().await;
        let _ = tracker.record_stop_moved(position_id, stop_price);
    }

    /// 이전 가격으로 스톱을 복원합니다 (best-effort 롤백).
    ///
    /// 복원까지 실패하면 포지션은 보호 상실로 플래그되고 운영자
    /// 알림이 발행됩니다. 무한 재시도는 하지 않습니다.
    async fn restore_stop(
        &self,
        position_id: Uuid,
        symbol: &Symbol,
        side: Side,
        prior_price: Price,
        quantity: Quantity,
    ) {
        let request = OrderRequest::stop_loss(symbol.clone(), side, quantity, prior_price);

        match self.submit_call("restore_stop", &request).await {
            Ok(order_id) => {
                warn!(
                    position_id = %position_id,
                    symbol = %symbol,
                    stop = %prior_price,
                    "롤백: 이전 가격으로 스톱 복원됨"
                );
                self.commit_stop(position_id, order_id, prior_price, quantity)
                    .await;
            }
            Err(error) => {
                self.mark_unprotected(position_id, symbol, &error).await;
            }
        }
    }

    /// 포지션을 보호 상실 상태로 플래그하고 알림을 발행합니다.
    async fn mark_unprotected(&self, position_id: Uuid, symbol: &Symbol, error: &BrokerError) {
        {
            let mut protection = self.protection.lock().unwrap();
            if let Some(set) = protection.get_mut(&position_id) {
                set.clear_stop();
            }
        }

        {
            let mut tracker = self.tracker.write().await;
            let _ = tracker.flag_protection_lost(position_id);
        }

        self.alerts
            .alert(Alert::ProtectionLost {
                position_id,
                symbol: symbol.clone(),
                reason: error.to_string(),
            })
            .await;
    }

    /// 실패를 복구 관리자에 보고합니다.
    async fn record_failure(&self, position_id: Uuid, symbol: &Symbol, error: &BrokerError) {
        if error.is_fatal() {
            self.recovery
                .record_fatal(position_id, symbol, &error.to_string())
                .await;
        }
    }

    /// 브로커 호출 최종 결과를 circuit breaker에 기록합니다.
    fn record_broker_outcome<T>(&self, result: &Result<T, BrokerError>) {
        match result {
            Ok(_) => self.recovery.record_broker_success(),
            Err(error) => {
                if error.is_connectivity() {
                    self.breaker_failure(error);
                }
            }
        }
    }

    fn breaker_failure(&self, error: &BrokerError) {
        // record_broker_failure는 async (알림 발행 가능)이므로 분리 실행
        let recovery = self.recovery.clone();
        let error = error.clone();
        tokio::spawn(async move {
            recovery.record_broker_failure(&error).await;
        });
    }

    // ==================== 내부 조회 ====================

    fn stop_leg(&self, position_id: Uuid) -> Option<StopLeg> {
        let protection = self.protection.lock().unwrap();
        protection.get(&position_id).and_then(|set| set.stop.clone())
    }
}

/// 스톱 취소 시도의 결과.
enum CancelOutcome {
    /// 취소 확인됨 (또는 이미 취소되어 있었음)
    Cancelled,
    /// 스톱이 이미 체결됨 - 커맨드를 포기해야 함
    AlreadyFilled,
    /// 취소 실패
    Failed(BrokerError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use guardian_broker::{BrokerOp, SimulatedBroker};
    use guardian_core::{MemoryAlertSink, Position};
    use rust_decimal_macros::dec;

    fn btc() -> Symbol {
        Symbol::crypto("BTC", "USDT")
    }

    struct Fixture {
        sequencer: OrderSequencer,
        broker: Arc<SimulatedBroker>,
        tracker: Arc<RwLock<PositionTracker>>,
        alerts: Arc<MemoryAlertSink>,
        position_id: Uuid,
    }

    /// 진입 100 / 초기 손절 98 / 수량 10의 롱 포지션이 등록되고
    /// 초기 스톱이 제출된 상태의 픽스처.
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
        let config = EngineConfig {
            retry_base_delay_ms: 1,
            ..Default::default()
        };
        let recovery = Arc::new(ErrorRecoveryManager::new(&config, alerts.clone()));

        let sequencer = OrderSequencer::new(
            broker.clone(),
            tracker.clone(),
            recovery,
            alerts.clone(),
            config,
        );
        sequencer.bootstrap_protection(&snapshot).await.unwrap();

        Fixture {
            sequencer,
            broker,
            tracker,
            alerts,
            position_id,
        }
    }

    #[tokio::test]
    async fn test_bootstrap_places_initial_stop() {
        let f = fixture().await;

        let set = f.sequencer.protection_set(f.position_id).unwrap();
        assert_eq!(set.stop.as_ref().unwrap().stop_price, dec!(98));

        let live = f.broker.live_orders(&btc());
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].stop_price, Some(dec!(98)));
    }

    #[tokio::test]
    async fn test_replace_stop_cancel_before_create() {
        let f = fixture().await;

        // create-before-cancel이면 SimulatedBroker가 SharesLocked로
        // 거부하므로, 성공 자체가 순서 보장의 증거
        let command = ProtectionCommand::MoveStop {
            position_id: f.position_id,
            symbol: btc(),
            side: Side::Buy,
            new_stop: dec!(100),
            quantity: dec!(10),
        };
        f.sequencer.shared().execute_command(&command).await.unwrap();

        let live = f.broker.live_orders(&btc());
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].stop_price, Some(dec!(100)));

        // 트래커에도 반영됨
        let snapshot = f.tracker.read().await.snapshot_by_id(f.position_id).unwrap();
        assert_eq!(snapshot.current_stop_price, dec!(100));
    }

    #[tokio::test]
    async fn test_transient_failure_retried() {
        let f = fixture().await;

        // 취소 1회, 제출 1회 일시 실패 주입
        f.broker
            .fail_next(BrokerOp::Cancel, BrokerError::Network("blip".to_string()));
        f.broker
            .fail_next(BrokerOp::Submit, BrokerError::Timeout("slow".to_string()));

        let command = ProtectionCommand::MoveStop {
            position_id: f.position_id,
            symbol: btc(),
            side: Side::Buy,
            new_stop: dec!(100),
            quantity: dec!(10),
        };
        f.sequencer.shared().execute_command(&command).await.unwrap();

        let live = f.broker.live_orders(&btc());
        assert_eq!(live[0].stop_price, Some(dec!(100)));
    }

    #[tokio::test]
    async fn test_rollback_restores_prior_stop_on_fatal_create() {
        let f = fixture().await;

        // 새 스톱 제출만 치명적으로 실패
        f.broker.fail_next(
            BrokerOp::Submit,
            BrokerError::OrderRejected("price out of band".to_string()),
        );

        let command = ProtectionCommand::MoveStop {
            position_id: f.position_id,
            symbol: btc(),
            side: Side::Buy,
            new_stop: dec!(100),
            quantity: dec!(10),
        };
        let result = f.sequencer.shared().execute_command(&command).await;
        assert!(result.is_err());

        // 이전 가격 98로 스톱이 복원됨
        let live = f.broker.live_orders(&btc());
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].stop_price, Some(dec!(98)));

        let set = f.sequencer.protection_set(f.position_id).unwrap();
        assert_eq!(set.stop.as_ref().unwrap().stop_price, dec!(98));
    }

    #[tokio::test]
    async fn test_protection_lost_when_restore_also_fails() {
        // 취소 성공, 생성 거부, 복원도 거부되는 최악 경로
        let f = fixture().await;

        f.broker.fail_next(
            BrokerOp::Submit,
            BrokerError::OrderRejected("rejected".to_string()),
        );
        f.broker.fail_next(
            BrokerOp::Submit,
            BrokerError::OrderRejected("rejected again".to_string()),
        );

        let command = ProtectionCommand::MoveStop {
            position_id: f.position_id,
            symbol: btc(),
            side: Side::Buy,
            new_stop: dec!(100),
            quantity: dec!(10),
        };
        let result = f.sequencer.shared().execute_command(&command).await;
        assert!(result.is_err());

        // 보호 상실: 알림 발행 + 포지션 플래그, 추가 재시도 없음
        let snapshot = f.tracker.read().await.snapshot_by_id(f.position_id).unwrap();
        assert!(snapshot.protection_lost);

        let alerts = f.alerts.alerts();
        assert!(alerts
            .iter()
            .any(|r| matches!(r.alert, Alert::ProtectionLost { .. })));

        // 제출 호출 총량: 본래 생성 1 + 복원 1 (bootstrap 1 제외)
        assert_eq!(f.broker.call_count(BrokerOp::Submit), 3);
    }

    #[tokio::test]
    async fn test_milestone_exit_batch_reduces_stop() {
        let f = fixture().await;

        let command = ProtectionCommand::MilestoneExit {
            position_id: f.position_id,
            symbol: btc(),
            side: Side::Buy,
            threshold: dec!(2.0),
            quantity: dec!(5),
            stop_price_after: Some(dec!(100)),
            stop_quantity_after: dec!(5),
            closes_position: false,
        };
        f.sequencer.shared().execute_command(&command).await.unwrap();

        let live = f.broker.live_orders(&btc());
        // 청산 주문 1 + 축소된 스톱 1
        assert_eq!(live.len(), 2);

        let stop = live.iter().find(|o| o.stop_price.is_some()).unwrap();
        assert_eq!(stop.stop_price, Some(dec!(100)));
        assert_eq!(stop.quantity, dec!(5));

        let exit = live.iter().find(|o| o.stop_price.is_none()).unwrap();
        assert_eq!(exit.quantity, dec!(5));

        // 청산 주문이 타겟 레그로 분류됨
        let kind = f.sequencer.classify_fill(&exit.id).unwrap();
        assert_eq!(
            kind,
            FillKind::MilestoneExit {
                position_id: f.position_id,
                threshold: dec!(2.0)
            }
        );
    }

    #[tokio::test]
    async fn test_final_milestone_exit_no_new_stop() {
        let f = fixture().await;

        let command = ProtectionCommand::MilestoneExit {
            position_id: f.position_id,
            symbol: btc(),
            side: Side::Buy,
            threshold: dec!(4.0),
            quantity: dec!(10),
            stop_price_after: None,
            stop_quantity_after: dec!(0),
            closes_position: true,
        };
        f.sequencer.shared().execute_command(&command).await.unwrap();

        let live = f.broker.live_orders(&btc());
        assert_eq!(live.len(), 1);
        assert!(live[0].stop_price.is_none());
    }

    #[tokio::test]
    async fn test_stop_fill_classification() {
        let f = fixture().await;

        let set = f.sequencer.protection_set(f.position_id).unwrap();
        let stop_id = set.stop.unwrap().order_id;

        let kind = f.sequencer.classify_fill(&stop_id).unwrap();
        assert_eq!(
            kind,
            FillKind::Stop {
                position_id: f.position_id
            }
        );
    }

    #[tokio::test]
    async fn test_closed_position_command_dropped() {
        let f = fixture().await;

        // 포지션 종료
        {
            let mut tracker = f.tracker.write().await;
            tracker
                .record_full_exit(
                    f.position_id,
                    dec!(10),
                    guardian_core::TransitionTrigger::StopFilled,
                )
                .unwrap();
        }

        let submits_before = f.broker.call_count(BrokerOp::Submit);

        // 큐를 통한 커맨드는 워커 dequeue 시점에 폐기됨
        f.sequencer.enqueue(ProtectionCommand::MoveStop {
            position_id: f.position_id,
            symbol: btc(),
            side: Side::Buy,
            new_stop: dec!(101),
            quantity: dec!(10),
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.broker.call_count(BrokerOp::Submit), submits_before);
    }

    #[tokio::test]
    async fn test_manual_close_cancels_legs_and_exits() {
        let f = fixture().await;

        let command = ProtectionCommand::Close {
            position_id: f.position_id,
            symbol: btc(),
            side: Side::Buy,
            quantity: dec!(10),
            reason: "manual close".to_string(),
        };
        f.sequencer.shared().execute_command(&command).await.unwrap();

        let live = f.broker.live_orders(&btc());
        assert_eq!(live.len(), 1);
        assert!(live[0].stop_price.is_none());

        let kind = f.sequencer.classify_fill(&live[0].id).unwrap();
        assert_eq!(
            kind,
            FillKind::ManualExit {
                position_id: f.position_id
            }
        );
    }
}
