//! 정밀한 금융 계산을 위한 Decimal 유틸리티.

use rust_decimal::Decimal;

/// 금융 정밀도를 위한 가격 타입.
pub type Price = Decimal;

/// 주문 수량을 위한 타입.
pub type Quantity = Decimal;

/// Decimal 연산을 위한 확장 트레이트.
pub trait DecimalExt {
    /// 절대값을 반환합니다.
    fn abs_value(&self) -> Decimal;

    /// 지정된 소수점 자릿수로 반올림합니다.
    fn round_to(&self, dp: u32) -> Decimal;
}

impl DecimalExt for Decimal {
    fn abs_value(&self) -> Decimal {
        if self.is_sign_negative() {
            -*self
        } else {
            *self
        }
    }

    fn round_to(&self, dp: u32) -> Decimal {
        self.round_dp_with_strategy(dp, rust_decimal::RoundingStrategy::MidpointAwayFromZero)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_abs_value() {
        assert_eq!(dec!(-3.5).abs_value(), dec!(3.5));
        assert_eq!(dec!(3.5).abs_value(), dec!(3.5));
    }

    #[test]
    fn test_round_to() {
        assert_eq!(dec!(1.005).round_to(2), dec!(1.01));
    }
}
