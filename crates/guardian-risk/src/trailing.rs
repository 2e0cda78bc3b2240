//! 트레일링 스톱 계산.
//!
//! 이 모듈은 새 스톱 가격 후보를 계산하는 순수 함수를 제공합니다.
//! 계약은 단조성 하나입니다: 계산된 스톱은 어떤 트레일 거리
//! 공식이 적용되든 절대 포지션에 불리한 방향으로 움직이지 않습니다.
//!
//! - 본전 임계값 미만: 제안 스톱 = 원래 리스크 정의 손절가 (변경 없음)
//! - 본전 임계값 이상: 제안 스톱 = 진입가 (본전), 또는 트레일 공식이
//!   더 유리한 값을 내면 그 값
//! - 이전 스톱보다 불리한 제안은 폐기됨 (롱은 max, 숏은 min)

use guardian_core::{Price, Side};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// 트레일링 스톱 모드.
///
/// 구체적 트레일 거리 공식은 플러그형입니다. 모든 모드는
/// `clamp_monotonic`을 통과하므로 단조성 계약을 공유합니다.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum TrailMode {
    /// 본전 고정: 1R 도달 시 스톱을 진입가로 이동, 이후 유지
    BreakevenOnly,
    /// 유리한 가격 변동의 고정 비율만큼 스톱을 따라 올림
    FixedFraction {
        /// 잠글 유리한 변동 비율 (0 < fraction < 1, 예: 0.5)
        fraction: Decimal,
    },
}

impl Default for TrailMode {
    fn default() -> Self {
        Self::BreakevenOnly
    }
}

/// 제안 스톱을 이전 스톱에 대해 단조 클램프합니다.
///
/// 롱: `max(prior, proposed)`, 숏: `min(prior, proposed)`.
pub fn clamp_monotonic(side: Side, prior_stop: Price, proposed: Price) -> Price {
    match side {
        Side::Buy => prior_stop.max(proposed),
        Side::Sell => prior_stop.min(proposed),
    }
}

/// 새 스톱 가격 후보를 계산합니다.
///
/// 순수 함수이며 반환값은 항상 `prior_stop` 이상으로 유리합니다.
/// 변경이 필요 없는 경우 `prior_stop`을 그대로 반환합니다.
#[allow(clippy::too_many_arguments)]
pub fn propose_stop(
    side: Side,
    entry_price: Price,
    current_price: Price,
    initial_stop: Price,
    prior_stop: Price,
    r_multiple: Decimal,
    breakeven_threshold: Decimal,
    mode: &TrailMode,
) -> Price {
    // 본전 임계값 미만에서는 원래 손절가를 유지
    if r_multiple < breakeven_threshold {
        return clamp_monotonic(side, prior_stop, initial_stop);
    }

    let proposed = match mode {
        TrailMode::BreakevenOnly => entry_price,
        TrailMode::FixedFraction { fraction } => {
            // 유리한 변동의 일정 비율을 잠금. fraction < 1이므로
            // 결과는 항상 현재가보다 유리한 쪽에 남음
            let fraction = (*fraction).clamp(Decimal::ZERO, dec!(0.99));
            let favorable = match side {
                Side::Buy => current_price - entry_price,
                Side::Sell => entry_price - current_price,
            };
            let locked = favorable.max(Decimal::ZERO) * fraction;
            match side {
                Side::Buy => entry_price + locked,
                Side::Sell => entry_price - locked,
            }
        }
    };

    // 본전보다 불리한 제안은 본전으로 끌어올림
    let proposed = match side {
        Side::Buy => proposed.max(entry_price),
        Side::Sell => proposed.min(entry_price),
    };

    clamp_monotonic(side, prior_stop, proposed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_below_breakeven_keeps_initial_stop() {
        // 진입 100, 손절 98, 현재 101 (R = 0.5)
        let stop = propose_stop(
            Side::Buy,
            dec!(100),
            dec!(101),
            dec!(98),
            dec!(98),
            dec!(0.5),
            dec!(1.0),
            &TrailMode::BreakevenOnly,
        );
        assert_eq!(stop, dec!(98));
    }

    #[test]
    fn test_breakeven_at_one_r() {
        // R = 1.0에서 스톱이 진입가로 이동
        let stop = propose_stop(
            Side::Buy,
            dec!(100),
            dec!(102),
            dec!(98),
            dec!(98),
            dec!(1.0),
            dec!(1.0),
            &TrailMode::BreakevenOnly,
        );
        assert_eq!(stop, dec!(100));
    }

    #[test]
    fn test_breakeven_short() {
        // 숏: 진입 100, 손절 102, 현재 98 (R = 1.0) -> 스톱 100
        let stop = propose_stop(
            Side::Sell,
            dec!(100),
            dec!(98),
            dec!(102),
            dec!(102),
            dec!(1.0),
            dec!(1.0),
            &TrailMode::BreakevenOnly,
        );
        assert_eq!(stop, dec!(100));
    }

    #[test]
    fn test_fixed_fraction_trails_above_breakeven() {
        // 진입 100, 현재 108, fraction 0.5 -> 스톱 104
        let stop = propose_stop(
            Side::Buy,
            dec!(100),
            dec!(108),
            dec!(98),
            dec!(100),
            dec!(4.0),
            dec!(1.0),
            &TrailMode::FixedFraction {
                fraction: dec!(0.5),
            },
        );
        assert_eq!(stop, dec!(104));
    }

    #[test]
    fn test_worse_proposal_discarded() {
        // 이전 스톱 104, 가격 하락으로 제안이 102가 되어도 104 유지
        let stop = propose_stop(
            Side::Buy,
            dec!(100),
            dec!(104),
            dec!(98),
            dec!(104),
            dec!(2.0),
            dec!(1.0),
            &TrailMode::FixedFraction {
                fraction: dec!(0.5),
            },
        );
        assert_eq!(stop, dec!(104));
    }

    #[test]
    fn test_breakeven_never_regresses() {
        // 본전 이동 후 R이 다시 1 미만으로 떨어져도 스톱은 본전 유지
        let stop = propose_stop(
            Side::Buy,
            dec!(100),
            dec!(100.5),
            dec!(98),
            dec!(100),
            dec!(0.25),
            dec!(1.0),
            &TrailMode::BreakevenOnly,
        );
        assert_eq!(stop, dec!(100));
    }

    #[test]
    fn test_clamp_monotonic_short() {
        assert_eq!(clamp_monotonic(Side::Sell, dec!(100), dec!(102)), dec!(100));
        assert_eq!(clamp_monotonic(Side::Sell, dec!(100), dec!(99)), dec!(99));
    }

    proptest! {
        /// 단조성: 제안 스톱은 이전 스톱보다 불리해질 수 없다.
        #[test]
        fn prop_long_stop_never_regresses(
            entry in 50i64..200,
            move_ticks in 0i64..400,
            prior_offset in -10i64..20,
            fraction_pct in 0i64..99,
        ) {
            let entry = Decimal::from(entry);
            let current = entry + Decimal::from(move_ticks) / dec!(10);
            let initial_stop = entry - dec!(2);
            let prior_stop = initial_stop + Decimal::from(prior_offset) / dec!(10);
            let r = (current - entry) / dec!(2);
            let mode = TrailMode::FixedFraction {
                fraction: Decimal::from(fraction_pct) / dec!(100),
            };

            let stop = propose_stop(
                Side::Buy, entry, current, initial_stop, prior_stop,
                r, dec!(1.0), &mode,
            );

            prop_assert!(stop >= prior_stop);
        }

        /// 본전 보호 이후에는 어떤 입력에서도 스톱이 진입가 아래로 내려가지 않는다.
        #[test]
        fn prop_breakeven_is_floor_once_reached(
            entry in 50i64..200,
            move_ticks in -100i64..400,
            fraction_pct in 0i64..99,
        ) {
            let entry = Decimal::from(entry);
            let current = entry + Decimal::from(move_ticks) / dec!(10);
            let initial_stop = entry - dec!(2);
            // 이미 본전 보호된 상태에서 출발
            let prior_stop = entry;
            let r = (current - entry) / dec!(2);
            let mode = TrailMode::FixedFraction {
                fraction: Decimal::from(fraction_pct) / dec!(100),
            };

            let stop = propose_stop(
                Side::Buy, entry, current, initial_stop, prior_stop,
                r, dec!(1.0), &mode,
            );

            prop_assert!(stop >= entry);
        }
    }
}
