//! 포지션의 브로커측 보호 주문 집합.
//!
//! 이 모듈은 포지션 하나를 보호하는 브로커 주문 레그를 정의합니다:
//! - `StopLeg` - 손절 레그 (항상 정확히 하나)
//! - `TargetLeg` - 타겟/익절 레그 (0개 이상)
//! - `ProtectionOrderSet` - 레그 집합 전체
//!
//! 불변식: 오픈 포지션마다 활성 스톱 주문은 항상 정확히 하나,
//! 활성 타겟 주문은 최대 N개. 집합은 OrderSequencer에 의해서만
//! 전체 단위로 변경됩니다.

use crate::domain::order::BrokerOrderId;
use crate::types::{Price, Quantity};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// 손절 레그.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopLeg {
    /// 브로커 주문 ID
    pub order_id: BrokerOrderId,
    /// 스톱 트리거 가격
    pub stop_price: Price,
    /// 주문 수량
    pub quantity: Quantity,
}

/// 타겟(청산) 레그.
///
/// 마일스톤 시장가 청산은 지정가 없이 접수되므로 `limit_price`는
/// 선택적입니다. 수동 종료 청산은 마일스톤이 없습니다.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetLeg {
    /// 브로커 주문 ID
    pub order_id: BrokerOrderId,
    /// 지정가 (시장가 청산이면 None)
    pub limit_price: Option<Price>,
    /// 주문 수량
    pub quantity: Quantity,
    /// 연관된 R-배수 마일스톤 (수동 종료면 None)
    pub milestone: Option<Decimal>,
}

/// 포지션 하나의 브로커측 보호 주문 집합.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProtectionOrderSet {
    /// 활성 스톱 레그 (보호 중이면 Some)
    pub stop: Option<StopLeg>,
    /// 활성 타겟 레그 목록
    pub targets: Vec<TargetLeg>,
}

impl ProtectionOrderSet {
    /// 스톱 레그 하나로 새 집합을 생성합니다.
    pub fn with_stop(order_id: BrokerOrderId, stop_price: Price, quantity: Quantity) -> Self {
        Self {
            stop: Some(StopLeg {
                order_id,
                stop_price,
                quantity,
            }),
            targets: Vec::new(),
        }
    }

    /// 스톱 레그를 새 주문으로 교체합니다.
    ///
    /// 이전 스톱 레그를 반환합니다 (롤백 시 원래 가격 복원에 사용).
    pub fn replace_stop(
        &mut self,
        order_id: BrokerOrderId,
        stop_price: Price,
        quantity: Quantity,
    ) -> Option<StopLeg> {
        self.stop.replace(StopLeg {
            order_id,
            stop_price,
            quantity,
        })
    }

    /// 스톱 레그를 제거합니다 (체결 또는 취소 확인 후).
    pub fn clear_stop(&mut self) -> Option<StopLeg> {
        self.stop.take()
    }

    /// 타겟 레그를 추가합니다.
    pub fn add_target(&mut self, leg: TargetLeg) {
        self.targets.push(leg);
    }

    /// 주문 ID로 타겟 레그를 제거합니다.
    pub fn remove_target(&mut self, order_id: &BrokerOrderId) -> Option<TargetLeg> {
        let idx = self.targets.iter().position(|t| &t.order_id == order_id)?;
        Some(self.targets.remove(idx))
    }

    /// 주어진 주문 ID가 스톱 레그인지 확인합니다.
    pub fn is_stop_order(&self, order_id: &BrokerOrderId) -> bool {
        self.stop.as_ref().map(|s| &s.order_id) == Some(order_id)
    }

    /// 주어진 주문 ID가 타겟 레그인지 확인합니다.
    pub fn is_target_order(&self, order_id: &BrokerOrderId) -> bool {
        self.targets.iter().any(|t| &t.order_id == order_id)
    }

    /// 주어진 주문 ID가 이 집합에 속하는지 확인합니다.
    pub fn contains(&self, order_id: &BrokerOrderId) -> bool {
        self.is_stop_order(order_id) || self.is_target_order(order_id)
    }

    /// 활성 보호 레그들의 총 수량.
    pub fn active_quantity(&self) -> Quantity {
        let stop_qty = self.stop.as_ref().map(|s| s.quantity).unwrap_or_default();
        let target_qty: Quantity = self.targets.iter().map(|t| t.quantity).sum();
        stop_qty + target_qty
    }

    /// 활성 주문 ID 목록.
    pub fn order_ids(&self) -> Vec<BrokerOrderId> {
        let mut ids: Vec<BrokerOrderId> = self
            .stop
            .iter()
            .map(|s| s.order_id.clone())
            .collect();
        ids.extend(self.targets.iter().map(|t| t.order_id.clone()));
        ids
    }

    /// 포지션이 스톱으로 보호되고 있는지 확인합니다.
    pub fn is_protected(&self) -> bool {
        self.stop.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_replace_stop_returns_previous() {
        let mut set =
            ProtectionOrderSet::with_stop(BrokerOrderId::new("S1"), dec!(98), dec!(10));

        let prev = set
            .replace_stop(BrokerOrderId::new("S2"), dec!(100), dec!(10))
            .unwrap();

        assert_eq!(prev.order_id, BrokerOrderId::new("S1"));
        assert_eq!(prev.stop_price, dec!(98));
        assert_eq!(set.stop.as_ref().unwrap().stop_price, dec!(100));
    }

    #[test]
    fn test_single_stop_invariant() {
        let mut set =
            ProtectionOrderSet::with_stop(BrokerOrderId::new("S1"), dec!(98), dec!(10));
        set.replace_stop(BrokerOrderId::new("S2"), dec!(100), dec!(10));

        // 교체 후에도 스톱 레그는 정확히 하나
        assert!(set.is_protected());
        assert_eq!(set.order_ids().len(), 1);
    }

    #[test]
    fn test_target_lifecycle() {
        let mut set =
            ProtectionOrderSet::with_stop(BrokerOrderId::new("S1"), dec!(98), dec!(10));

        set.add_target(TargetLeg {
            order_id: BrokerOrderId::new("T1"),
            limit_price: None,
            quantity: dec!(5),
            milestone: Some(dec!(2.0)),
        });

        assert!(set.is_target_order(&BrokerOrderId::new("T1")));
        assert!(set.contains(&BrokerOrderId::new("T1")));
        assert_eq!(set.active_quantity(), dec!(15));

        let removed = set.remove_target(&BrokerOrderId::new("T1")).unwrap();
        assert_eq!(removed.milestone, Some(dec!(2.0)));
        assert!(set.targets.is_empty());
    }

    #[test]
    fn test_unknown_order_id() {
        let set = ProtectionOrderSet::with_stop(BrokerOrderId::new("S1"), dec!(98), dec!(10));
        assert!(!set.contains(&BrokerOrderId::new("X")));
    }
}
