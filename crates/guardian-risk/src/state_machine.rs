//! 포지션별 리스크 상태 머신.
//!
//! R-배수 임계값 교차에 따라 상태 전이를 결정하고 보호 액션을
//! 커맨드로 방출합니다. 순수 로직입니다: I/O도 시계도 없으며,
//! 스냅샷 하나를 받아 커맨드 목록과 전이 목록을 돌려줍니다.
//!
//! 평가된 전이는 커맨드 실패로 롤백되지 않습니다. 상태 머신은
//! *커맨드*를 재시도하지 *전이*를 재시도하지 않습니다.

use crate::config::ProtectionConfig;
use crate::scheduler::PartialProfitScheduler;
use crate::trailing::propose_stop;
use guardian_core::{
    PositionSnapshot, Price, Quantity, RiskState, Side, Symbol, TransitionTrigger,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 커맨드 지연 한도 분류.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// 스톱 갱신 (한도 100ms)
    StopUpdate,
    /// 마일스톤 청산 (한도 200ms)
    MilestoneExit,
    /// 전량 청산
    Close,
}

/// OrderSequencer가 실행할 보호 커맨드.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProtectionCommand {
    /// 스톱 레그를 새 가격으로 교체 (cancel-before-create)
    MoveStop {
        /// 대상 포지션
        position_id: Uuid,
        /// 심볼
        symbol: Symbol,
        /// 포지션 방향
        side: Side,
        /// 새 스톱 가격
        new_stop: Price,
        /// 스톱 레그 수량 (현재 잔여 수량)
        quantity: Quantity,
    },
    /// 마일스톤 부분 청산 + 스톱 레그 축소를 하나의 논리적 배치로 실행
    MilestoneExit {
        /// 대상 포지션
        position_id: Uuid,
        /// 심볼
        symbol: Symbol,
        /// 포지션 방향
        side: Side,
        /// 도달한 R-배수 임계값
        threshold: Decimal,
        /// 청산 수량
        quantity: Quantity,
        /// 청산 후 스톱 가격 (포지션 종료 시 None)
        stop_price_after: Option<Price>,
        /// 청산 후 스톱 수량
        stop_quantity_after: Quantity,
        /// 이 청산이 포지션을 종료하는지 여부
        closes_position: bool,
    },
    /// 전량 청산 (수동 종료 요청 등)
    Close {
        /// 대상 포지션
        position_id: Uuid,
        /// 심볼
        symbol: Symbol,
        /// 포지션 방향
        side: Side,
        /// 청산 수량
        quantity: Quantity,
        /// 종료 사유
        reason: String,
    },
}

impl ProtectionCommand {
    /// 커맨드의 지연 한도 분류를 반환합니다.
    pub fn kind(&self) -> CommandKind {
        match self {
            ProtectionCommand::MoveStop { .. } => CommandKind::StopUpdate,
            ProtectionCommand::MilestoneExit { .. } => CommandKind::MilestoneExit,
            ProtectionCommand::Close { .. } => CommandKind::Close,
        }
    }

    /// 대상 포지션 ID를 반환합니다.
    pub fn position_id(&self) -> Uuid {
        match self {
            ProtectionCommand::MoveStop { position_id, .. } => *position_id,
            ProtectionCommand::MilestoneExit { position_id, .. } => *position_id,
            ProtectionCommand::Close { position_id, .. } => *position_id,
        }
    }

    /// 대상 심볼을 반환합니다.
    pub fn symbol(&self) -> &Symbol {
        match self {
            ProtectionCommand::MoveStop { symbol, .. } => symbol,
            ProtectionCommand::MilestoneExit { symbol, .. } => symbol,
            ProtectionCommand::Close { symbol, .. } => symbol,
        }
    }
}

/// 단일 상태 전이.
#[derive(Debug, Clone, PartialEq)]
pub struct StateTransition {
    /// 이전 상태
    pub from: RiskState,
    /// 새 상태
    pub to: RiskState,
    /// 전이 원인
    pub trigger: TransitionTrigger,
}

/// 평가 결과: 적용할 전이와 제출할 커맨드.
#[derive(Debug, Clone, Default)]
pub struct Evaluation {
    /// 적용할 상태 전이 (순서대로)
    pub transitions: Vec<StateTransition>,
    /// 제출할 커맨드 (오름차순 R 순서)
    pub commands: Vec<ProtectionCommand>,
}

impl Evaluation {
    /// 액션이 없는지 확인합니다.
    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty() && self.commands.is_empty()
    }
}

/// 포지션별 리스크 상태 머신.
#[derive(Debug, Clone)]
pub struct RiskStateMachine {
    config: ProtectionConfig,
}

impl RiskStateMachine {
    /// 주어진 설정으로 상태 머신을 생성합니다.
    pub fn new(config: ProtectionConfig) -> Self {
        Self { config }
    }

    /// 설정 참조를 반환합니다.
    pub fn config(&self) -> &ProtectionConfig {
        &self.config
    }

    /// 마일스톤 테이블 인덱스에 대응하는 상태를 반환합니다.
    ///
    /// 첫 마일스톤(2R) -> PartialProfitTaken, 둘째(3R) ->
    /// AdvancedProfitTaken. 마지막 마일스톤 청산은 체결 시 잔여
    /// 수량 0으로 Closed에 도달하므로 새 상태를 만들지 않습니다.
    fn state_for_milestone(index: usize) -> Option<RiskState> {
        match index {
            0 => Some(RiskState::PartialProfitTaken),
            1 => Some(RiskState::AdvancedProfitTaken),
            _ => None,
        }
    }

    /// PositionChanged 이벤트마다 호출되는 평가 함수.
    ///
    /// 현재 R-배수를 기준으로 필요한 전이와 커맨드를 계산합니다.
    /// 마일스톤 갭 (한 틱에 여러 임계값 교차)은 오름차순으로 모두
    /// 같은 평가 패스에서 스케줄됩니다.
    pub fn evaluate(&self, snapshot: &PositionSnapshot) -> Evaluation {
        let mut eval = Evaluation::default();

        if snapshot.state.is_terminal() || snapshot.remaining_quantity.is_zero() {
            return eval;
        }

        let symbol_key = snapshot.symbol.to_string();
        let breakeven_threshold = self.config.breakeven_threshold_for(&symbol_key);
        let trail_mode = self.config.trail_mode_for(&symbol_key);
        let r = snapshot.r_multiple;

        let mut state = snapshot.state;

        // 본전 보호 전이 (1R)
        if state == RiskState::InitialRisk && r >= breakeven_threshold {
            eval.transitions.push(StateTransition {
                from: state,
                to: RiskState::BreakevenProtected,
                trigger: TransitionTrigger::RMultipleCrossed {
                    threshold: breakeven_threshold,
                },
            });
            state = RiskState::BreakevenProtected;
        }

        // 스톱 가격 제안 (단조 클램프 포함)
        let proposed_stop = propose_stop(
            snapshot.side,
            snapshot.entry_price,
            snapshot.current_price,
            snapshot.initial_stop_price,
            snapshot.current_stop_price,
            r,
            breakeven_threshold,
            &trail_mode,
        );
        let stop_improved = proposed_stop != snapshot.current_stop_price;

        // 마일스톤 청산 스케줄. 체결 대기 중인(이미 제출된) 마일스톤도
        // 완료로 간주해 같은 임계값의 중복 청산을 막는다
        let mut milestones_settled = snapshot.milestones_done.clone();
        milestones_settled.extend(snapshot.milestones_scheduled.iter().copied());

        let exits = PartialProfitScheduler::exits_due(
            &self.config,
            snapshot.original_quantity,
            snapshot.remaining_quantity,
            &milestones_settled,
            r,
        );

        if exits.is_empty() {
            // 청산 없이 스톱만 개선된 경우
            if stop_improved {
                eval.commands.push(ProtectionCommand::MoveStop {
                    position_id: snapshot.id,
                    symbol: snapshot.symbol.clone(),
                    side: snapshot.side,
                    new_stop: proposed_stop,
                    quantity: snapshot.remaining_quantity,
                });
            }
            return eval;
        }

        // 청산이 있으면 스톱 이동은 각 청산 배치에 포함됨
        // (부분 청산 후 스톱 레그 수량은 잔여 수량으로 축소되어야 함)
        let mut remaining = snapshot.remaining_quantity;

        for exit in exits {
            remaining -= exit.quantity;

            let milestone_index = self
                .config
                .milestones
                .iter()
                .position(|m| m.threshold == exit.threshold);

            eval.commands.push(ProtectionCommand::MilestoneExit {
                position_id: snapshot.id,
                symbol: snapshot.symbol.clone(),
                side: snapshot.side,
                threshold: exit.threshold,
                quantity: exit.quantity,
                stop_price_after: if exit.closes_position {
                    None
                } else {
                    Some(proposed_stop)
                },
                stop_quantity_after: remaining,
                closes_position: exit.closes_position,
            });

            // 마일스톤에 대응하는 상태 전이 적용
            if let Some(index) = milestone_index {
                if let Some(next_state) = Self::state_for_milestone(index) {
                    if state.can_transition_to(next_state) {
                        eval.transitions.push(StateTransition {
                            from: state,
                            to: next_state,
                            trigger: TransitionTrigger::RMultipleCrossed {
                                threshold: exit.threshold,
                            },
                        });
                        state = next_state;
                    }
                }
            }
        }

        eval
    }
}
