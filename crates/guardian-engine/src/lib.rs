//! 수익 보호 엔진 런타임.
//!
//! 이 crate는 다음을 제공합니다:
//! - 포지션 트래커: 틱/체결 반영과 복사 기반 스냅샷
//! - 주문 시퀀서: 심볼별 직렬화, cancel-before-create,
//!   best-effort 롤백을 갖춘 유일한 브로커 주문 변경자
//! - Reconciliation 루프: 브로커 진실과의 주기적 대사
//! - 에러 복구 관리자: 실패 분류와 방어 모드
//! - 보호 엔진: 전체 조합 루트
//!
//! # 예제
//!
//! ```rust,ignore
//! use guardian_engine::ProtectionEngine;
//!
//! let engine = ProtectionEngine::new(broker, protection, engine_cfg, events, alerts)?;
//! let id = engine.watch(symbol, Side::Buy, qty, entry, stop).await?;
//! engine.on_tick(&symbol, PriceTick::now(price)).await?;
//! ```

pub mod engine;
pub mod reconcile;
pub mod recovery;
pub mod sequencer;
pub mod tracker;

// 주요 타입 재내보내기
pub use engine::ProtectionEngine;
pub use reconcile::{ReconcileReport, ReconciliationLoop};
pub use recovery::{ErrorRecoveryManager, FailureClass};
pub use sequencer::{FillKind, OrderSequencer};
pub use tracker::{PositionEvent, PositionTracker, PositionTrackerError, PriceTick};
