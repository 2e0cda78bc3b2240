//! 보호 대상 포지션 추적.
//!
//! 이 모듈은 포지션 관련 타입을 정의합니다:
//! - `Position` - 보호 엔진이 관리하는 개별 포지션 엔티티
//! - `MilestoneFill` - 마일스톤 부분 청산 원장 항목
//! - `PositionSnapshot` - 복사 기반 읽기 전용 뷰
//!
//! R-배수는 파생 값이며 절대 진실의 원천으로 저장되지 않습니다.
//! 매 틱마다 재계산되고 표시용으로만 캐시됩니다.

use crate::domain::state::RiskState;
use crate::domain::Side;
use crate::types::{Price, Quantity, Symbol};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 마일스톤 부분 청산 원장 항목.
///
/// 불변식: 모든 항목의 수량 합 + 잔여 수량 == 원래 수량.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MilestoneFill {
    /// 청산을 유발한 R-배수 임계값
    pub threshold: Decimal,
    /// 청산된 수량
    pub quantity: Quantity,
    /// 체결 가격
    pub price: Price,
    /// 체결 시각
    pub timestamp: DateTime<Utc>,
}

/// 보호 엔진이 관리하는 트레이딩 포지션.
///
/// PositionTracker가 배타적으로 소유하며, 상태 머신이 승인한 커맨드
/// 또는 Reconciliation 보정을 통해서만 변경됩니다.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    /// 내부 포지션 ID
    pub id: Uuid,
    /// 거래 심볼
    pub symbol: Symbol,
    /// 포지션 방향 (롱 = Buy, 숏 = Sell)
    pub side: Side,
    /// 원래 진입 수량
    pub original_quantity: Quantity,
    /// 현재 잔여 수량
    pub remaining_quantity: Quantity,
    /// 진입 가격
    pub entry_price: Price,
    /// 원래 리스크 정의 손절가 (R-배수 계산 기준)
    pub initial_stop_price: Price,
    /// 현재 손절가
    pub current_stop_price: Price,
    /// 현재 시장 가격
    pub current_price: Price,
    /// 표시용 캐시 R-배수 (진실의 원천 아님)
    pub cached_r_multiple: Decimal,
    /// 리스크 상태
    pub state: RiskState,
    /// 마일스톤 청산 원장
    pub milestone_fills: Vec<MilestoneFill>,
    /// 청산 커맨드가 이미 제출된 마일스톤 (중복 스케줄 방지)
    #[serde(default)]
    pub scheduled_milestones: Vec<Decimal>,
    /// 보호 상실 플래그 (복구 불가 실패 후 운영자 주의 필요)
    pub protection_lost: bool,
    /// 포지션 오픈 시각
    pub opened_at: DateTime<Utc>,
    /// 마지막 업데이트 시각
    pub updated_at: DateTime<Utc>,
    /// 포지션 종료 시각 (오픈 상태면 None)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
}

impl Position {
    /// 이미 오픈된 포지션을 보호 대상으로 등록하기 위해 생성합니다.
    pub fn new(
        symbol: Symbol,
        side: Side,
        quantity: Quantity,
        entry_price: Price,
        initial_stop_price: Price,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            symbol,
            side,
            original_quantity: quantity,
            remaining_quantity: quantity,
            entry_price,
            initial_stop_price,
            current_stop_price: initial_stop_price,
            current_price: entry_price,
            cached_r_multiple: Decimal::ZERO,
            state: RiskState::InitialRisk,
            milestone_fills: Vec::new(),
            scheduled_milestones: Vec::new(),
            protection_lost: false,
            opened_at: now,
            updated_at: now,
            closed_at: None,
        }
    }

    /// 현재 가격 기준 R-배수를 계산합니다.
    ///
    /// 롱: `(현재가 - 진입가) / (진입가 - 초기 손절가)`
    /// 숏: 부호 반전. 초기 리스크가 0이면 0을 반환합니다.
    pub fn r_multiple(&self) -> Decimal {
        self.r_multiple_at(self.current_price)
    }

    /// 주어진 가격 기준 R-배수를 계산합니다.
    pub fn r_multiple_at(&self, price: Price) -> Decimal {
        let initial_risk = match self.side {
            Side::Buy => self.entry_price - self.initial_stop_price,
            Side::Sell => self.initial_stop_price - self.entry_price,
        };

        if initial_risk <= Decimal::ZERO {
            return Decimal::ZERO;
        }

        let favorable_move = match self.side {
            Side::Buy => price - self.entry_price,
            Side::Sell => self.entry_price - price,
        };

        favorable_move / initial_risk
    }

    /// 현재 가격을 갱신하고 캐시 R-배수를 재계산합니다.
    pub fn update_price(&mut self, price: Price) {
        self.current_price = price;
        self.cached_r_multiple = self.r_multiple();
        self.updated_at = Utc::now();
    }

    /// 마일스톤 부분 청산 체결을 원장에 기록하고 잔여 수량을 줄입니다.
    ///
    /// 청산 수량이 잔여 수량을 초과하면 잔여 수량으로 절사합니다.
    /// 잔여 수량이 0이 되면 포지션을 종료 처리합니다.
    pub fn record_milestone_fill(
        &mut self,
        threshold: Decimal,
        quantity: Quantity,
        price: Price,
    ) -> Quantity {
        let fill_qty = quantity.min(self.remaining_quantity);
        self.remaining_quantity -= fill_qty;
        self.milestone_fills.push(MilestoneFill {
            threshold,
            quantity: fill_qty,
            price,
            timestamp: Utc::now(),
        });
        self.updated_at = Utc::now();

        if self.remaining_quantity.is_zero() {
            self.mark_closed();
        }

        debug_assert_eq!(
            self.exited_quantity() + self.remaining_quantity,
            self.original_quantity
        );

        fill_qty
    }

    /// 잔여 수량을 줄입니다 (스톱 체결, 외부 청산 등 마일스톤 외 사유).
    pub fn reduce(&mut self, quantity: Quantity) -> Quantity {
        let fill_qty = quantity.min(self.remaining_quantity);
        self.remaining_quantity -= fill_qty;
        self.updated_at = Utc::now();

        if self.remaining_quantity.is_zero() {
            self.mark_closed();
        }

        fill_qty
    }

    /// 포지션을 종료 상태로 표시합니다.
    pub fn mark_closed(&mut self) {
        self.remaining_quantity = Decimal::ZERO;
        self.state = RiskState::Closed;
        self.closed_at = Some(Utc::now());
        self.updated_at = Utc::now();
    }

    /// 마일스톤 원장 기준 누적 청산 수량.
    pub fn exited_quantity(&self) -> Quantity {
        self.milestone_fills.iter().map(|f| f.quantity).sum()
    }

    /// 주어진 임계값의 마일스톤 청산이 이미 기록되었는지 확인합니다.
    pub fn milestone_done(&self, threshold: Decimal) -> bool {
        self.milestone_fills.iter().any(|f| f.threshold == threshold)
    }

    /// 마일스톤 청산 커맨드가 제출되었음을 기록합니다.
    ///
    /// 체결 전에 같은 임계값이 다시 평가되어도 중복 청산이
    /// 스케줄되지 않습니다.
    pub fn mark_milestone_scheduled(&mut self, threshold: Decimal) {
        if !self.scheduled_milestones.contains(&threshold) {
            self.scheduled_milestones.push(threshold);
        }
    }

    /// 포지션이 오픈 상태인지 확인합니다.
    pub fn is_open(&self) -> bool {
        self.closed_at.is_none() && self.remaining_quantity > Decimal::ZERO
    }

    /// 포지션이 종료되었는지 확인합니다.
    pub fn is_closed(&self) -> bool {
        self.closed_at.is_some() || self.remaining_quantity.is_zero()
    }

    /// 진입가 대비 본전 이상으로 보호되었는지 확인합니다.
    pub fn is_breakeven_protected(&self) -> bool {
        match self.side {
            Side::Buy => self.current_stop_price >= self.entry_price,
            Side::Sell => self.current_stop_price <= self.entry_price,
        }
    }

    /// 복사 기반 읽기 전용 스냅샷을 생성합니다.
    pub fn snapshot(&self) -> PositionSnapshot {
        PositionSnapshot {
            id: self.id,
            symbol: self.symbol.clone(),
            side: self.side,
            original_quantity: self.original_quantity,
            remaining_quantity: self.remaining_quantity,
            entry_price: self.entry_price,
            initial_stop_price: self.initial_stop_price,
            current_stop_price: self.current_stop_price,
            current_price: self.current_price,
            r_multiple: self.r_multiple(),
            state: self.state,
            milestones_done: self.milestone_fills.iter().map(|f| f.threshold).collect(),
            milestones_scheduled: self.scheduled_milestones.clone(),
            protection_lost: self.protection_lost,
            taken_at: Utc::now(),
        }
    }
}

/// 포지션의 복사 기반 읽기 전용 뷰.
///
/// 호출자는 변경 경계를 넘어 참조를 보유하지 않습니다.
/// `taken_at`으로 스테일 여부를 판정할 수 있습니다.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSnapshot {
    /// 포지션 ID
    pub id: Uuid,
    /// 거래 심볼
    pub symbol: Symbol,
    /// 포지션 방향
    pub side: Side,
    /// 원래 수량
    pub original_quantity: Quantity,
    /// 잔여 수량
    pub remaining_quantity: Quantity,
    /// 진입 가격
    pub entry_price: Price,
    /// 초기 손절가
    pub initial_stop_price: Price,
    /// 현재 손절가
    pub current_stop_price: Price,
    /// 현재 가격
    pub current_price: Price,
    /// 스냅샷 시점 R-배수
    pub r_multiple: Decimal,
    /// 리스크 상태
    pub state: RiskState,
    /// 완료된 마일스톤 임계값 목록
    pub milestones_done: Vec<Decimal>,
    /// 청산 커맨드가 제출된 마일스톤 임계값 목록
    pub milestones_scheduled: Vec<Decimal>,
    /// 보호 상실 플래그
    pub protection_lost: bool,
    /// 스냅샷 생성 시각
    pub taken_at: DateTime<Utc>,
}

impl PositionSnapshot {
    /// 스냅샷이 주어진 한도보다 오래되었는지 확인합니다.
    pub fn is_stale(&self, max_age_ms: i64) -> bool {
        (Utc::now() - self.taken_at).num_milliseconds() > max_age_ms
    }
}
