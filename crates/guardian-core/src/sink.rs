//! 이벤트 영속화 및 알림 싱크 추상화.
//!
//! 상태 전이 기록, 크래시 복구용 포지션 저장, 운영 알림을 외부
//! 시스템으로 내보내기 위한 백엔드 중립적인 인터페이스를
//! 제공합니다. 실제 저장소/메트릭 백엔드는 이 trait들을
//! 구현합니다.

use crate::domain::position::Position;
use crate::domain::state::StateTransitionEvent;
use crate::types::Symbol;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

/// 운영 알림.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Alert {
    /// 지연 시간 한도 초과
    LatencyViolation {
        /// 대상 포지션
        position_id: Uuid,
        /// 작업 설명
        operation: String,
        /// 측정된 지연 (ms)
        elapsed_ms: u64,
        /// 허용 한도 (ms)
        budget_ms: u64,
    },
    /// 보호 상실 - 포지션이 스톱 없이 노출됨
    ProtectionLost {
        /// 대상 포지션
        position_id: Uuid,
        /// 심볼
        symbol: Symbol,
        /// 상실 사유
        reason: String,
    },
    /// 방어 모드 전환
    DefensiveMode {
        /// 활성화 여부
        engaged: bool,
        /// 사유
        reason: String,
    },
    /// Reconciliation 보정 발생
    ReconciliationCorrection {
        /// 대상 포지션
        position_id: Uuid,
        /// 심볼
        symbol: Symbol,
        /// 보정 내용
        detail: String,
    },
}

/// 알림 발생 시각이 포함된 레코드.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRecord {
    /// 알림 내용
    pub alert: Alert,
    /// 발생 시각
    pub timestamp: DateTime<Utc>,
}

/// 상태 전이 이벤트 저장소.
///
/// 추가 전용입니다. 기록된 이벤트는 변경되지 않습니다.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// 전이 이벤트를 추가합니다.
    async fn append(&self, event: StateTransitionEvent);
}

/// 운영 알림 싱크.
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// 알림을 내보냅니다.
    async fn alert(&self, alert: Alert);
}

/// 크래시 복구용 포지션 저장소.
///
/// 마지막으로 알려진 포지션 상태를 저장/조회합니다. 프로세스
/// 재시작 시 `load_all`로 복원한 포지션을 엔진에 다시 등록합니다.
#[async_trait]
pub trait PositionStore: Send + Sync {
    /// 포지션 상태를 저장합니다 (같은 ID는 덮어씀).
    async fn save(&self, position: &Position);

    /// 종료된 포지션을 저장소에서 제거합니다.
    async fn remove(&self, position_id: Uuid);

    /// 저장된 모든 포지션을 반환합니다.
    async fn load_all(&self) -> Vec<Position>;
}

/// 테스트 및 기본 배선용 인메모리 이벤트 저장소.
#[derive(Debug, Default)]
pub struct MemoryEventStore {
    events: Mutex<Vec<StateTransitionEvent>>,
}

impl MemoryEventStore {
    /// 새 인메모리 저장소를 생성합니다.
    pub fn new() -> Self {
        Self::default()
    }

    /// 기록된 이벤트의 복사본을 반환합니다.
    pub fn events(&self) -> Vec<StateTransitionEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn append(&self, event: StateTransitionEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// 테스트 및 기본 배선용 인메모리 알림 싱크.
#[derive(Debug, Default)]
pub struct MemoryAlertSink {
    alerts: Mutex<Vec<AlertRecord>>,
}

impl MemoryAlertSink {
    /// 새 인메모리 싱크를 생성합니다.
    pub fn new() -> Self {
        Self::default()
    }

    /// 기록된 알림의 복사본을 반환합니다.
    pub fn alerts(&self) -> Vec<AlertRecord> {
        self.alerts.lock().unwrap().clone()
    }
}

#[async_trait]
impl AlertSink for MemoryAlertSink {
    async fn alert(&self, alert: Alert) {
        self.alerts.lock().unwrap().push(AlertRecord {
            alert,
            timestamp: Utc::now(),
        });
    }
}

/// 테스트 및 기본 배선용 인메모리 포지션 저장소.
#[derive(Debug, Default)]
pub struct MemoryPositionStore {
    positions: Mutex<HashMap<Uuid, Position>>,
}

impl MemoryPositionStore {
    /// 새 인메모리 저장소를 생성합니다.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PositionStore for MemoryPositionStore {
    async fn save(&self, position: &Position) {
        self.positions
            .lock()
            .unwrap()
            .insert(position.id, position.clone());
    }

    async fn remove(&self, position_id: Uuid) {
        self.positions.lock().unwrap().remove(&position_id);
    }

    async fn load_all(&self) -> Vec<Position> {
        self.positions.lock().unwrap().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::state::{RiskState, TransitionTrigger};
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_memory_event_store() {
        let store = MemoryEventStore::new();
        let event = StateTransitionEvent::new(
            Uuid::new_v4(),
            Symbol::crypto("BTC", "USDT"),
            RiskState::InitialRisk,
            RiskState::BreakevenProtected,
            TransitionTrigger::RMultipleCrossed {
                threshold: dec!(1.0),
            },
        );

        store.append(event).await;
        assert_eq!(store.events().len(), 1);
    }

    #[tokio::test]
    async fn test_memory_position_store() {
        use crate::domain::Side;

        let store = MemoryPositionStore::new();
        let position = Position::new(
            Symbol::crypto("BTC", "USDT"),
            Side::Buy,
            dec!(10),
            dec!(100),
            dec!(98),
        );
        let id = position.id;

        store.save(&position).await;
        assert_eq!(store.load_all().await.len(), 1);

        // 같은 ID 저장은 덮어씀
        store.save(&position).await;
        assert_eq!(store.load_all().await.len(), 1);

        store.remove(id).await;
        assert!(store.load_all().await.is_empty());
    }

    #[tokio::test]
    async fn test_memory_alert_sink() {
        let sink = MemoryAlertSink::new();
        sink.alert(Alert::DefensiveMode {
            engaged: true,
            reason: "sustained broker failures".to_string(),
        })
        .await;

        let alerts = sink.alerts();
        assert_eq!(alerts.len(), 1);
        assert!(matches!(
            alerts[0].alert,
            Alert::DefensiveMode { engaged: true, .. }
        ));
    }
}
