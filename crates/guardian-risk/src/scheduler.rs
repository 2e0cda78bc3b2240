//! 부분 익절 스케줄링.
//!
//! 원래 포지션 수량과 현재 R-배수로부터 지금 청산해야 할 증분 수량을
//! 결정합니다. 마일스톤이 건너뛰어진 경우 (한 틱에 1.5R에서 3.5R로
//! 갭 상승 등) 놓친 마일스톤 전부가 오름차순으로 한 번의 평가에서
//! 스케줄됩니다.

use crate::config::ProtectionConfig;
use guardian_core::Quantity;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// 스케줄된 단일 마일스톤 청산.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MilestoneExit {
    /// 이 청산을 유발한 R-배수 임계값
    pub threshold: Decimal,
    /// 지금 청산할 증분 수량
    pub quantity: Quantity,
    /// 이 청산이 포지션을 완전히 종료하는지 여부
    pub closes_position: bool,
}

/// 부분 익절 스케줄러.
///
/// 상태가 없는 순수 계산입니다. 완료된 마일스톤 목록은 호출자
/// (포지션의 마일스톤 원장)가 제공합니다.
#[derive(Debug, Clone, Default)]
pub struct PartialProfitScheduler;

impl PartialProfitScheduler {
    /// 현재 R-배수에서 청산해야 할 마일스톤들을 오름차순으로 반환합니다.
    ///
    /// 청산 수량은 원래 수량 기준 비율로 계산하되, 마지막 마일스톤은
    /// 잔여 수량 전체를 청산하여 반올림 오차를 흡수합니다.
    /// 수량 보존: 반환된 수량 합은 잔여 수량을 초과하지 않습니다.
    pub fn exits_due(
        config: &ProtectionConfig,
        original_quantity: Quantity,
        remaining_quantity: Quantity,
        milestones_done: &[Decimal],
        r_multiple: Decimal,
    ) -> Vec<MilestoneExit> {
        let mut exits = Vec::new();
        let mut remaining = remaining_quantity;

        for level in &config.milestones {
            if remaining.is_zero() {
                break;
            }
            if r_multiple < level.threshold {
                break;
            }
            if milestones_done.contains(&level.threshold) {
                continue;
            }

            let is_final = config.is_final_milestone(level.threshold);
            let quantity = if is_final {
                // 마지막 마일스톤: 잔여 전량 청산
                remaining
            } else {
                (original_quantity * level.exit_fraction).min(remaining)
            };

            if quantity.is_zero() {
                continue;
            }

            remaining -= quantity;
            exits.push(MilestoneExit {
                threshold: level.threshold,
                quantity,
                closes_position: remaining.is_zero(),
            });
        }

        exits
    }
}
