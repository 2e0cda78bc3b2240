//! 포지션 추적 및 관리.
//!
//! 제공 기능:
//! - 틱 수신에 따른 실시간 포지션/R-배수 업데이트
//! - 보호 레그 체결 반영 (마일스톤/스톱)
//! - 복사 기반 스냅샷 조회
//! - Reconciliation 보정의 유일한 진입점 (외부 종료 흡수)
//!
//! 트래커는 순수 인메모리 구조이며 네트워크 I/O로 블록되지 않습니다.
//! 지연 한도 측정과 알림은 엔진이 담당합니다.

use chrono::{DateTime, Utc};
use guardian_core::{
    Position, PositionSnapshot, Price, Quantity, RiskState, Side, StateTransitionEvent, Symbol,
    TransitionTrigger,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

/// 포지션 트래커 에러 타입.
#[derive(Debug, Error)]
pub enum PositionTrackerError {
    #[error("Position not found: {0}")]
    PositionNotFound(Uuid),

    #[error("Position not found for symbol: {0}")]
    SymbolPositionNotFound(String),

    #[error("Position already tracked for symbol: {0}")]
    SymbolAlreadyTracked(String),

    #[error("Stale tick for {symbol}: age {age_ms}ms exceeds bound {bound_ms}ms")]
    StaleTick {
        symbol: String,
        age_ms: i64,
        bound_ms: i64,
    },
}

/// 시장 가격 틱.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceTick {
    /// 틱 가격
    pub price: Price,
    /// 틱 생성 시각
    pub timestamp: DateTime<Utc>,
}

impl PriceTick {
    /// 현재 시각의 틱을 생성합니다.
    pub fn now(price: Price) -> Self {
        Self {
            price,
            timestamp: Utc::now(),
        }
    }
}

/// 포지션 변경 이벤트.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PositionEvent {
    /// 보호 대상으로 등록됨
    Registered {
        position_id: Uuid,
        symbol: String,
        side: Side,
        quantity: Quantity,
        entry_price: Price,
        timestamp: DateTime<Utc>,
    },
    /// 가격 업데이트
    PriceUpdated {
        position_id: Uuid,
        price: Price,
        r_multiple: Decimal,
        timestamp: DateTime<Utc>,
    },
    /// 스톱 가격 이동
    StopMoved {
        position_id: Uuid,
        old_stop: Price,
        new_stop: Price,
        timestamp: DateTime<Utc>,
    },
    /// 마일스톤 청산 체결
    MilestoneFilled {
        position_id: Uuid,
        threshold: Decimal,
        quantity: Quantity,
        price: Price,
        remaining: Quantity,
        timestamp: DateTime<Utc>,
    },
    /// 포지션 종료
    Closed {
        position_id: Uuid,
        trigger: TransitionTrigger,
        timestamp: DateTime<Utc>,
    },
}

impl PositionEvent {
    /// 이벤트에서 포지션 ID를 가져온다.
    pub fn position_id(&self) -> Uuid {
        match self {
            PositionEvent::Registered { position_id, .. } => *position_id,
            PositionEvent::PriceUpdated { position_id, .. } => *position_id,
            PositionEvent::StopMoved { position_id, .. } => *position_id,
            PositionEvent::MilestoneFilled { position_id, .. } => *position_id,
            PositionEvent::Closed { position_id, .. } => *position_id,
        }
    }
}

/// 모든 보호 대상 포지션을 관리하는 포지션 트래커.
///
/// 포지션 상태의 유일한 진실의 원천입니다. 외부 호출자는 복사된
/// 스냅샷만 받으며 내부 참조를 보유하지 않습니다.
#[derive(Debug)]
pub struct PositionTracker {
    /// ID별 모든 오픈 포지션
    positions: HashMap<Uuid, Position>,
    /// 심볼별 오픈 포지션 (symbol -> position_id)
    positions_by_symbol: HashMap<String, Uuid>,
    /// 종료된 포지션 이력
    closed_positions: Vec<Position>,
    /// 포지션 이벤트 이력
    events: Vec<PositionEvent>,
    /// 틱 허용 최대 스테일 시간 (밀리초)
    tick_staleness_ms: i64,
    /// 최대 이력 크기
    max_history_size: usize,
}

impl PositionTracker {
    /// 새 포지션 트래커를 생성한다.
    pub fn new(tick_staleness_ms: u64) -> Self {
        Self {
            positions: HashMap::new(),
            positions_by_symbol: HashMap::new(),
            closed_positions: Vec::new(),
            events: Vec::new(),
            tick_staleness_ms: tick_staleness_ms as i64,
            max_history_size: 10000,
        }
    }

    // ==================== 등록 ====================

    /// 이미 오픈된 포지션을 보호 대상으로 등록한다.
    pub fn register(&mut self, position: Position) -> Result<Uuid, PositionTrackerError> {
        let symbol_str = position.symbol.to_string();

        if self.positions_by_symbol.contains_key(&symbol_str) {
            return Err(PositionTrackerError::SymbolAlreadyTracked(symbol_str));
        }

        let position_id = position.id;

        self.events.push(PositionEvent::Registered {
            position_id,
            symbol: symbol_str.clone(),
            side: position.side,
            quantity: position.remaining_quantity,
            entry_price: position.entry_price,
            timestamp: Utc::now(),
        });

        self.positions.insert(position_id, position);
        self.positions_by_symbol.insert(symbol_str, position_id);
        self.trim_history();

        Ok(position_id)
    }

    // ==================== 틱 업데이트 ====================

    /// 틱을 반영하고 갱신된 스냅샷을 반환한다.
    ///
    /// 허용 한도보다 오래된 틱은 폐기됩니다 (StaleTick).
    pub fn update(
        &mut self,
        symbol: &Symbol,
        tick: &PriceTick,
    ) -> Result<PositionSnapshot, PositionTrackerError> {
        let symbol_str = symbol.to_string();

        let age_ms = (Utc::now() - tick.timestamp).num_milliseconds();
        if age_ms > self.tick_staleness_ms {
            return Err(PositionTrackerError::StaleTick {
                symbol: symbol_str,
                age_ms,
                bound_ms: self.tick_staleness_ms,
            });
        }

        let position = self.position_by_symbol_mut(&symbol_str)?;
        position.update_price(tick.price);
        let snapshot = position.snapshot();

        self.events.push(PositionEvent::PriceUpdated {
            position_id: snapshot.id,
            price: tick.price,
            r_multiple: snapshot.r_multiple,
            timestamp: Utc::now(),
        });
        self.trim_history();

        Ok(snapshot)
    }

    // ==================== 상태 전이 및 체결 반영 ====================

    /// 상태 머신이 평가한 전이를 적용한다.
    ///
    /// 커맨드 실패는 전이를 롤백하지 않습니다. 전이 테이블에 어긋나는
    /// 전이는 무시됩니다.
    pub fn apply_transition(
        &mut self,
        position_id: Uuid,
        to: RiskState,
    ) -> Result<(), PositionTrackerError> {
        let position = self
            .positions
            .get_mut(&position_id)
            .ok_or(PositionTrackerError::PositionNotFound(position_id))?;

        if position.state.can_transition_to(to) {
            position.state = to;
            position.updated_at = Utc::now();
        }
        Ok(())
    }

    /// 스톱 이동 성공을 반영한다 (OrderSequencer 결과 핸들러 전용).
    pub fn record_stop_moved(
        &mut self,
        position_id: Uuid,
        new_stop: Price,
    ) -> Result<(), PositionTrackerError> {
        let position = self
            .positions
            .get_mut(&position_id)
            .ok_or(PositionTrackerError::PositionNotFound(position_id))?;

        let old_stop = position.current_stop_price;
        position.current_stop_price = new_stop;
        position.updated_at = Utc::now();

        self.events.push(PositionEvent::StopMoved {
            position_id,
            old_stop,
            new_stop,
            timestamp: Utc::now(),
        });
        self.trim_history();

        Ok(())
    }

    /// 마일스톤 청산 체결을 반영한다.
    pub fn record_milestone_fill(
        &mut self,
        position_id: Uuid,
        threshold: Decimal,
        quantity: Quantity,
        price: Price,
    ) -> Result<PositionSnapshot, PositionTrackerError> {
        let position = self
            .positions
            .get_mut(&position_id)
            .ok_or(PositionTrackerError::PositionNotFound(position_id))?;

        let filled = position.record_milestone_fill(threshold, quantity, price);
        let remaining = position.remaining_quantity;
        let snapshot = position.snapshot();

        self.events.push(PositionEvent::MilestoneFilled {
            position_id,
            threshold,
            quantity: filled,
            price,
            remaining,
            timestamp: Utc::now(),
        });

        if snapshot.state == RiskState::Closed {
            self.finalize_closed(position_id, TransitionTrigger::MilestoneExitFilled);
        }
        self.trim_history();

        Ok(snapshot)
    }

    /// 전량 청산 체결을 반영한다 (스톱 체결 또는 수동 종료).
    ///
    /// 스톱/종료 레그는 잔여 전량을 커버하므로 포지션은 종료됩니다.
    pub fn record_full_exit(
        &mut self,
        position_id: Uuid,
        quantity: Quantity,
        trigger: TransitionTrigger,
    ) -> Result<PositionSnapshot, PositionTrackerError> {
        let position = self
            .positions
            .get_mut(&position_id)
            .ok_or(PositionTrackerError::PositionNotFound(position_id))?;

        position.reduce(quantity);
        if !position.is_closed() {
            // 부분 체결 잔량이 남아도 종료 처리
            position.mark_closed();
        }
        let snapshot = position.snapshot();

        self.finalize_closed(position_id, trigger);
        self.trim_history();

        Ok(snapshot)
    }

    /// 마일스톤 청산 커맨드 제출을 기록한다 (중복 스케줄 방지).
    pub fn mark_milestone_scheduled(
        &mut self,
        position_id: Uuid,
        threshold: Decimal,
    ) -> Result<(), PositionTrackerError> {
        let position = self
            .positions
            .get_mut(&position_id)
            .ok_or(PositionTrackerError::PositionNotFound(position_id))?;

        position.mark_milestone_scheduled(threshold);
        Ok(())
    }

    /// 보호 상실 플래그를 설정한다.
    pub fn flag_protection_lost(&mut self, position_id: Uuid) -> Result<(), PositionTrackerError> {
        let position = self
            .positions
            .get_mut(&position_id)
            .ok_or(PositionTrackerError::PositionNotFound(position_id))?;

        position.protection_lost = true;
        position.updated_at = Utc::now();
        Ok(())
    }

    // ==================== Reconciliation 보정 ====================

    /// 브로커측에 존재하지 않는 포지션을 외부 종료로 흡수한다.
    ///
    /// ReconciliationLoop 전용입니다. 이것이 OrderSequencer를 거치지
    /// 않고 트래커 상태가 브로커 진실로 보정되는 유일한 경로입니다.
    pub fn absorb_external_close(
        &mut self,
        position_id: Uuid,
    ) -> Result<StateTransitionEvent, PositionTrackerError> {
        let position = self
            .positions
            .get_mut(&position_id)
            .ok_or(PositionTrackerError::PositionNotFound(position_id))?;

        let from = position.state;
        let symbol = position.symbol.clone();
        position.mark_closed();

        self.finalize_closed(position_id, TransitionTrigger::ClosedExternally);
        self.trim_history();

        Ok(StateTransitionEvent::new(
            position_id,
            symbol,
            from,
            RiskState::Closed,
            TransitionTrigger::ClosedExternally,
        ))
    }

    // ==================== 조회 ====================

    /// 심볼의 스냅샷을 반환한다 (복사 기반).
    pub fn snapshot(&self, symbol: &str) -> Option<PositionSnapshot> {
        self.positions_by_symbol
            .get(symbol)
            .and_then(|id| self.positions.get(id))
            .map(|p| p.snapshot())
    }

    /// ID로 스냅샷을 반환한다.
    pub fn snapshot_by_id(&self, position_id: Uuid) -> Option<PositionSnapshot> {
        self.positions.get(&position_id).map(|p| p.snapshot())
    }

    /// 모든 오픈 포지션의 스냅샷 목록.
    pub fn open_snapshots(&self) -> Vec<PositionSnapshot> {
        self.positions.values().map(|p| p.snapshot()).collect()
    }

    /// 크래시 복구 영속화를 위해 오픈 포지션 전체를 복제해 반환한다.
    pub fn export_positions(&self) -> Vec<Position> {
        self.positions.values().cloned().collect()
    }

    /// 심볼에 대한 오픈 포지션이 있는지 확인한다.
    pub fn has_position(&self, symbol: &str) -> bool {
        self.positions_by_symbol.contains_key(symbol)
    }

    /// 오픈 포지션 개수.
    pub fn open_position_count(&self) -> usize {
        self.positions.len()
    }

    /// 종료된 포지션 이력.
    pub fn closed_positions(&self) -> &[Position] {
        &self.closed_positions
    }

    /// 포지션 이벤트 이력.
    pub fn events(&self) -> &[PositionEvent] {
        &self.events
    }

    // ==================== 내부 ====================

    fn position_by_symbol_mut(
        &mut self,
        symbol: &str,
    ) -> Result<&mut Position, PositionTrackerError> {
        let pos_id = self
            .positions_by_symbol
            .get(symbol)
            .copied()
            .ok_or_else(|| PositionTrackerError::SymbolPositionNotFound(symbol.to_string()))?;

        self.positions
            .get_mut(&pos_id)
            .ok_or(PositionTrackerError::PositionNotFound(pos_id))
    }

    /// 종료된 포지션을 이력으로 이동하고 Closed 이벤트를 기록한다.
    fn finalize_closed(&mut self, position_id: Uuid, trigger: TransitionTrigger) {
        if let Some(position) = self.positions.remove(&position_id) {
            self.positions_by_symbol.remove(&position.symbol.to_string());
            self.closed_positions.push(position);
            self.events.push(PositionEvent::Closed {
                position_id,
                trigger,
                timestamp: Utc::now(),
            });
        }
    }

    fn trim_history(&mut self) {
        if self.events.len() > self.max_history_size {
            let drain_count = self.events.len() - self.max_history_size;
            self.events.drain(0..drain_count);
        }
        if self.closed_positions.len() > self.max_history_size {
            let drain_count = self.closed_positions.len() - self.max_history_size;
            self.closed_positions.drain(0..drain_count);
        }
    }
}
