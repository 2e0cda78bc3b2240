//! 보호 정책 설정.
//!
//! 마일스톤 임계값, 청산 비율, 트레일링 모드를 정의합니다.
//! 마일스톤 테이블은 데이터 주도 방식이며, 검증을 통해
//! 임계값의 단조 증가와 청산 비율 합계를 보장합니다.

use crate::trailing::TrailMode;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// 설정 검증 에러.
#[derive(Debug, Error)]
pub enum ConfigValidationError {
    #[error("Milestone thresholds must be strictly increasing: {0} then {1}")]
    ThresholdsNotIncreasing(Decimal, Decimal),

    #[error("Milestone threshold {0} must exceed breakeven threshold {1}")]
    ThresholdBelowBreakeven(Decimal, Decimal),

    #[error("Exit fractions must sum to 1, got {0}")]
    FractionSumMismatch(Decimal),

    #[error("Exit fraction must be positive, got {0}")]
    NonPositiveFraction(Decimal),

    #[error("Milestone table must not be empty")]
    EmptyMilestones,
}

/// 단일 마일스톤 레벨: R-배수 임계값과 청산 비율.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MilestoneLevel {
    /// R-배수 임계값 (예: 2.0)
    pub threshold: Decimal,
    /// 원래 수량 대비 청산 비율 (예: 0.5는 50%)
    pub exit_fraction: Decimal,
}

impl MilestoneLevel {
    /// 새 마일스톤 레벨 생성.
    pub fn new(threshold: Decimal, exit_fraction: Decimal) -> Self {
        Self {
            threshold,
            exit_fraction,
        }
    }
}

/// 심볼별 보호 설정 재정의.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SymbolProtectionConfig {
    /// 이 심볼의 본전 임계값 (전역 설정 재정의)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub breakeven_threshold: Option<Decimal>,
    /// 이 심볼의 트레일링 모드 (전역 설정 재정의)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trail_mode: Option<TrailMode>,
}

/// 전역 보호 정책 설정.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectionConfig {
    /// 본전 보호 진입 R-배수 임계값 (기본값: 1.0)
    #[serde(default = "default_breakeven_threshold")]
    pub breakeven_threshold: Decimal,

    /// 마일스톤 테이블 (기본값: 2R 50%, 3R 25%, 4R 25%)
    #[serde(default = "default_milestones")]
    pub milestones: Vec<MilestoneLevel>,

    /// 트레일링 스톱 모드 (기본값: 본전 고정)
    #[serde(default)]
    pub trail_mode: TrailMode,

    /// 심볼별 설정 (전역 설정을 재정의함)
    #[serde(default)]
    pub symbol_configs: HashMap<String, SymbolProtectionConfig>,
}

fn default_breakeven_threshold() -> Decimal {
    dec!(1.0)
}

fn default_milestones() -> Vec<MilestoneLevel> {
    vec![
        MilestoneLevel::new(dec!(2.0), dec!(0.50)),
        MilestoneLevel::new(dec!(3.0), dec!(0.25)),
        MilestoneLevel::new(dec!(4.0), dec!(0.25)),
    ]
}

impl Default for ProtectionConfig {
    fn default() -> Self {
        Self {
            breakeven_threshold: default_breakeven_threshold(),
            milestones: default_milestones(),
            trail_mode: TrailMode::default(),
            symbol_configs: HashMap::new(),
        }
    }
}

impl ProtectionConfig {
    /// 설정을 검증합니다.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.milestones.is_empty() {
            return Err(ConfigValidationError::EmptyMilestones);
        }

        let mut fraction_sum = Decimal::ZERO;
        let mut prev_threshold: Option<Decimal> = None;

        for level in &self.milestones {
            if level.threshold <= self.breakeven_threshold {
                return Err(ConfigValidationError::ThresholdBelowBreakeven(
                    level.threshold,
                    self.breakeven_threshold,
                ));
            }

            if let Some(prev) = prev_threshold {
                if level.threshold <= prev {
                    return Err(ConfigValidationError::ThresholdsNotIncreasing(
                        prev,
                        level.threshold,
                    ));
                }
            }
            prev_threshold = Some(level.threshold);

            if level.exit_fraction <= Decimal::ZERO {
                return Err(ConfigValidationError::NonPositiveFraction(
                    level.exit_fraction,
                ));
            }
            fraction_sum += level.exit_fraction;
        }

        if fraction_sum != Decimal::ONE {
            return Err(ConfigValidationError::FractionSumMismatch(fraction_sum));
        }

        Ok(())
    }

    /// 심볼에 적용되는 본전 임계값을 반환합니다.
    pub fn breakeven_threshold_for(&self, symbol: &str) -> Decimal {
        self.symbol_configs
            .get(symbol)
            .and_then(|c| c.breakeven_threshold)
            .unwrap_or(self.breakeven_threshold)
    }

    /// 심볼에 적용되는 트레일링 모드를 반환합니다.
    pub fn trail_mode_for(&self, symbol: &str) -> TrailMode {
        self.symbol_configs
            .get(symbol)
            .and_then(|c| c.trail_mode.clone())
            .unwrap_or_else(|| self.trail_mode.clone())
    }

    /// 마지막 마일스톤인지 확인합니다 (잔여 전량 청산 대상).
    pub fn is_final_milestone(&self, threshold: Decimal) -> bool {
        self.milestones
            .last()
            .map(|m| m.threshold == threshold)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        let config = ProtectionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.milestones.len(), 3);
        assert_eq!(config.breakeven_threshold, dec!(1.0));
    }

    #[test]
    fn test_thresholds_must_increase() {
        let mut config = ProtectionConfig::default();
        config.milestones = vec![
            MilestoneLevel::new(dec!(3.0), dec!(0.5)),
            MilestoneLevel::new(dec!(2.0), dec!(0.5)),
        ];

        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::ThresholdsNotIncreasing(_, _))
        ));
    }

    #[test]
    fn test_fractions_must_sum_to_one() {
        let mut config = ProtectionConfig::default();
        config.milestones = vec![
            MilestoneLevel::new(dec!(2.0), dec!(0.5)),
            MilestoneLevel::new(dec!(3.0), dec!(0.3)),
        ];

        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::FractionSumMismatch(_))
        ));
    }

    #[test]
    fn test_threshold_below_breakeven_rejected() {
        let mut config = ProtectionConfig::default();
        config.milestones = vec![MilestoneLevel::new(dec!(0.5), dec!(1.0))];

        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::ThresholdBelowBreakeven(_, _))
        ));
    }

    #[test]
    fn test_symbol_override() {
        let mut config = ProtectionConfig::default();
        config.symbol_configs.insert(
            "BTC/USDT".to_string(),
            SymbolProtectionConfig {
                breakeven_threshold: Some(dec!(1.5)),
                trail_mode: None,
            },
        );

        assert_eq!(config.breakeven_threshold_for("BTC/USDT"), dec!(1.5));
        assert_eq!(config.breakeven_threshold_for("ETH/USDT"), dec!(1.0));
    }

    #[test]
    fn test_final_milestone() {
        let config = ProtectionConfig::default();
        assert!(config.is_final_milestone(dec!(4.0)));
        assert!(!config.is_final_milestone(dec!(2.0)));
    }
}
