//! 설정 관리.
//!
//! 이 모듈은 보호 엔진의 런타임 설정을 정의하고 관리합니다.
//! TOML 파일과 `GUARDIAN__` 접두사 환경 변수로부터 로드됩니다.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// 애플리케이션 설정.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    /// 로깅 설정
    #[serde(default)]
    pub logging: LoggingConfig,
    /// 엔진 런타임 설정
    #[serde(default)]
    pub engine: EngineConfig,
}

/// 로깅 설정.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// 로그 레벨
    pub level: String,
    /// 로그 형식 (pretty, json, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// 엔진 런타임 설정.
///
/// 지연 한도, 재시도 정책, Reconciliation 주기 등 보호 엔진의
/// 시간 관련 동작을 제어합니다.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// 틱 처리 지연 한도 (밀리초, 초과 시 경고 로그)
    #[serde(default = "default_tick_budget_ms")]
    pub tick_budget_ms: u64,

    /// 스톱 갱신 커맨드 제출 한도 (밀리초)
    #[serde(default = "default_stop_command_budget_ms")]
    pub stop_command_budget_ms: u64,

    /// 마일스톤 청산 커맨드 제출 한도 (밀리초)
    #[serde(default = "default_milestone_command_budget_ms")]
    pub milestone_command_budget_ms: u64,

    /// 스냅샷 허용 최대 스테일 시간 (밀리초)
    #[serde(default = "default_snapshot_staleness_ms")]
    pub snapshot_staleness_ms: u64,

    /// 틱 허용 최대 스테일 시간 (밀리초, 초과 시 폐기)
    #[serde(default = "default_tick_staleness_ms")]
    pub tick_staleness_ms: u64,

    /// Reconciliation 주기 (초)
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,

    /// 브로커 호출 타임아웃 (밀리초)
    #[serde(default = "default_broker_call_timeout_ms")]
    pub broker_call_timeout_ms: u64,

    /// 일시적 실패 최대 재시도 횟수
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// 재시도 기본 대기 시간 (밀리초, 지수 백오프 기준)
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// 방어 모드 진입 기준: 윈도우 내 치명적 실패 횟수
    #[serde(default = "default_fatal_failure_threshold")]
    pub fatal_failure_threshold: u32,

    /// 치명적 실패 집계 윈도우 (초)
    #[serde(default = "default_fatal_failure_window_secs")]
    pub fatal_failure_window_secs: u64,
}

fn default_tick_budget_ms() -> u64 {
    50
}
fn default_stop_command_budget_ms() -> u64 {
    100
}
fn default_milestone_command_budget_ms() -> u64 {
    200
}
fn default_snapshot_staleness_ms() -> u64 {
    100
}
fn default_tick_staleness_ms() -> u64 {
    1000
}
fn default_reconcile_interval_secs() -> u64 {
    60
}
fn default_broker_call_timeout_ms() -> u64 {
    5000
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_base_delay_ms() -> u64 {
    1000
}
fn default_fatal_failure_threshold() -> u32 {
    3
}
fn default_fatal_failure_window_secs() -> u64 {
    300
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_budget_ms: default_tick_budget_ms(),
            stop_command_budget_ms: default_stop_command_budget_ms(),
            milestone_command_budget_ms: default_milestone_command_budget_ms(),
            snapshot_staleness_ms: default_snapshot_staleness_ms(),
            tick_staleness_ms: default_tick_staleness_ms(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
            broker_call_timeout_ms: default_broker_call_timeout_ms(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            fatal_failure_threshold: default_fatal_failure_threshold(),
            fatal_failure_window_secs: default_fatal_failure_window_secs(),
        }
    }
}

impl AppConfig {
    /// 파일과 환경 변수에서 설정을 로드합니다.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("GUARDIAN")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// 기본 경로에서 설정을 로드합니다.
    pub fn load_default() -> Result<Self, config::ConfigError> {
        Self::load("config/default.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.tick_budget_ms, 50);
        assert_eq!(config.stop_command_budget_ms, 100);
        assert_eq!(config.milestone_command_budget_ms, 200);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.reconcile_interval_secs, 60);
    }

    #[test]
    fn test_config_deserialize_partial() {
        // 일부 필드만 지정해도 나머지는 기본값으로 채워짐
        let toml_str = r#"
            [engine]
            reconcile_interval_secs = 30

            [logging]
            level = "debug"
            format = "json"
        "#;

        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.engine.reconcile_interval_secs, 30);
        assert_eq!(config.engine.max_retries, 3);
        assert_eq!(config.logging.level, "debug");
    }
}
