//! 포지션 리스크 상태 및 전이 테이블.
//!
//! 이 모듈은 포지션별 보호 상태 머신의 상태 타입을 정의합니다:
//! - `RiskState` - 리스크 상태 열거형
//! - `TransitionTrigger` - 상태 전이를 유발한 원인
//! - `StateTransitionEvent` - 영속화되는 전이 감사 기록
//!
//! 상태 전이는 명시적 테이블로 정의되며 단조적입니다.
//! 어떤 상태도 재방문되지 않으며 `Closed`는 최종 상태입니다.

use crate::types::Symbol;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// 포지션의 리스크 상태.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskState {
    /// 초기 리스크 - 스톱은 원래 손절가, 타겟 미조정
    InitialRisk,
    /// 본전 보호 - 스톱이 진입가 이상으로 이동됨 (1R)
    BreakevenProtected,
    /// 부분 익절 완료 - 원 수량의 50% 청산됨 (2R)
    PartialProfitTaken,
    /// 고급 익절 완료 - 누적 75% 청산됨 (3R)
    AdvancedProfitTaken,
    /// 종료 - 잔여 수량 0 (최종 상태)
    Closed,
}

/// 허용되는 순방향 전이 테이블.
///
/// `Closed`로의 전이는 어느 상태에서나 허용되므로 테이블에 포함하지 않고
/// `can_transition_to`에서 별도로 처리합니다.
const FORWARD_TRANSITIONS: &[(RiskState, RiskState)] = &[
    (RiskState::InitialRisk, RiskState::BreakevenProtected),
    (RiskState::BreakevenProtected, RiskState::PartialProfitTaken),
    (RiskState::PartialProfitTaken, RiskState::AdvancedProfitTaken),
];

impl RiskState {
    /// 단조성 검증을 위한 상태 순위.
    pub fn rank(&self) -> u8 {
        match self {
            RiskState::InitialRisk => 0,
            RiskState::BreakevenProtected => 1,
            RiskState::PartialProfitTaken => 2,
            RiskState::AdvancedProfitTaken => 3,
            RiskState::Closed => 4,
        }
    }

    /// 테이블상의 다음 순방향 상태를 반환합니다.
    pub fn successor(&self) -> Option<RiskState> {
        FORWARD_TRANSITIONS
            .iter()
            .find(|(from, _)| from == self)
            .map(|(_, to)| *to)
    }

    /// 주어진 상태로의 전이가 허용되는지 확인합니다.
    ///
    /// 잔여 수량이 0이 되면 어느 상태에서든 `Closed`로 전이할 수 있습니다.
    pub fn can_transition_to(&self, next: RiskState) -> bool {
        if next == RiskState::Closed {
            return *self != RiskState::Closed;
        }
        FORWARD_TRANSITIONS.contains(&(*self, next))
    }

    /// 최종 상태인지 확인합니다.
    pub fn is_terminal(&self) -> bool {
        *self == RiskState::Closed
    }
}

impl fmt::Display for RiskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskState::InitialRisk => write!(f, "initial_risk"),
            RiskState::BreakevenProtected => write!(f, "breakeven_protected"),
            RiskState::PartialProfitTaken => write!(f, "partial_profit_taken"),
            RiskState::AdvancedProfitTaken => write!(f, "advanced_profit_taken"),
            RiskState::Closed => write!(f, "closed"),
        }
    }
}

/// 상태 전이를 유발한 원인.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum TransitionTrigger {
    /// R-배수 임계값 도달
    RMultipleCrossed {
        /// 도달한 R-배수 임계값
        threshold: Decimal,
    },
    /// 스톱 주문 체결
    StopFilled,
    /// 마일스톤 청산 주문 체결
    MilestoneExitFilled,
    /// 브로커측에서 외부적으로 종료됨 (브라켓 체결, 수동 개입 등)
    ClosedExternally,
    /// 수동 종료 요청
    ManualClose,
}

impl fmt::Display for TransitionTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransitionTrigger::RMultipleCrossed { threshold } => {
                write!(f, "r_multiple_crossed({})", threshold)
            }
            TransitionTrigger::StopFilled => write!(f, "stop_filled"),
            TransitionTrigger::MilestoneExitFilled => write!(f, "milestone_exit_filled"),
            TransitionTrigger::ClosedExternally => write!(f, "closed_externally"),
            TransitionTrigger::ManualClose => write!(f, "manual_close"),
        }
    }
}

/// 상태 전이 감사 기록.
///
/// 추가 전용이며 외부 저장소에 영속화됩니다. 생성 후 변경되지 않습니다.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransitionEvent {
    /// 포지션 ID
    pub position_id: Uuid,
    /// 포지션 심볼
    pub symbol: Symbol,
    /// 이전 상태
    pub from: RiskState,
    /// 새 상태
    pub to: RiskState,
    /// 전이 원인
    pub trigger: TransitionTrigger,
    /// 전이 시각
    pub timestamp: DateTime<Utc>,
}

impl StateTransitionEvent {
    /// 새 전이 이벤트를 생성합니다.
    pub fn new(
        position_id: Uuid,
        symbol: Symbol,
        from: RiskState,
        to: RiskState,
        trigger: TransitionTrigger,
    ) -> Self {
        Self {
            position_id,
            symbol,
            from,
            to,
            trigger,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_forward_transition_order() {
        // 고정된 순서: InitialRisk -> Breakeven -> Partial -> Advanced
        assert_eq!(
            RiskState::InitialRisk.successor(),
            Some(RiskState::BreakevenProtected)
        );
        assert_eq!(
            RiskState::BreakevenProtected.successor(),
            Some(RiskState::PartialProfitTaken)
        );
        assert_eq!(
            RiskState::PartialProfitTaken.successor(),
            Some(RiskState::AdvancedProfitTaken)
        );
        assert_eq!(RiskState::AdvancedProfitTaken.successor(), None);
        assert_eq!(RiskState::Closed.successor(), None);
    }

    #[test]
    fn test_no_backward_transitions() {
        // 역방향 전이는 테이블에 존재하지 않음
        assert!(!RiskState::BreakevenProtected.can_transition_to(RiskState::InitialRisk));
        assert!(!RiskState::PartialProfitTaken.can_transition_to(RiskState::BreakevenProtected));
        assert!(!RiskState::AdvancedProfitTaken.can_transition_to(RiskState::PartialProfitTaken));
    }

    #[test]
    fn test_no_skip_in_table() {
        // 테이블상 건너뛰기 전이는 허용되지 않음 (마일스톤 갭은
        // 상태 머신이 순차 전이 두 번으로 처리)
        assert!(!RiskState::InitialRisk.can_transition_to(RiskState::PartialProfitTaken));
        assert!(!RiskState::InitialRisk.can_transition_to(RiskState::AdvancedProfitTaken));
        assert!(!RiskState::BreakevenProtected.can_transition_to(RiskState::AdvancedProfitTaken));
    }

    #[test]
    fn test_closed_from_any_state() {
        assert!(RiskState::InitialRisk.can_transition_to(RiskState::Closed));
        assert!(RiskState::BreakevenProtected.can_transition_to(RiskState::Closed));
        assert!(RiskState::PartialProfitTaken.can_transition_to(RiskState::Closed));
        assert!(RiskState::AdvancedProfitTaken.can_transition_to(RiskState::Closed));
        // Closed는 최종 상태
        assert!(!RiskState::Closed.can_transition_to(RiskState::Closed));
    }

    #[test]
    fn test_rank_monotonic_over_table() {
        for (from, to) in super::FORWARD_TRANSITIONS {
            assert!(to.rank() > from.rank());
        }
    }

    #[test]
    fn test_transition_event_serde() {
        let event = StateTransitionEvent::new(
            Uuid::new_v4(),
            Symbol::crypto("BTC", "USDT"),
            RiskState::InitialRisk,
            RiskState::BreakevenProtected,
            TransitionTrigger::RMultipleCrossed {
                threshold: dec!(1.0),
            },
        );

        let json = serde_json::to_string(&event).unwrap();
        let parsed: StateTransitionEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.from, RiskState::InitialRisk);
        assert_eq!(parsed.to, RiskState::BreakevenProtected);
    }
}
