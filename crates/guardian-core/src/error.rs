//! 보호 엔진의 에러 타입.
//!
//! 이 모듈은 엔진 전반에서 사용되는 에러 분류 체계를 정의합니다.
//! 각 분류는 서로 다른 복구 정책을 가집니다:
//! - transient: 백오프 재시도
//! - conflict: 브로커 상태 재동기화 후 1회 재시도
//! - fatal: 알림 후 재시도 중단

use thiserror::Error;

/// 보호 엔진 에러.
#[derive(Debug, Error)]
pub enum GuardianError {
    /// 일시적 브로커 에러 (네트워크/요청 한도) - 백오프 재시도 대상
    #[error("일시적 브로커 에러: {0}")]
    TransientBroker(String),

    /// 주문 상태 충돌 (로컬 상태와 브로커 상태 불일치) - 재동기화 후 1회 재시도
    #[error("주문 충돌: {0}")]
    OrderConflict(String),

    /// 브로커의 주문 거부 - 해당 작업에 치명적, 재시도 안 함
    #[error("브로커 거부: {0}")]
    BrokerRejection(String),

    /// 스테일 데이터 (틱이 허용 한도보다 오래됨) - 폐기 후 다음 틱 대기
    #[error("스테일 데이터: {0}")]
    StaleData(String),

    /// 검증 실패 (예: 제안된 스톱이 단조성 위반) - 조용히 폐기
    #[error("검증 실패: {0}")]
    Validation(String),

    /// 포지션 에러 (찾을 수 없음, 잘못된 작업 등)
    #[error("포지션 에러: {0}")]
    Position(String),

    /// 내부 에러
    #[error("내부 에러: {0}")]
    Internal(String),
}

/// 보호 엔진 작업을 위한 Result 타입.
pub type GuardianResult<T> = Result<T, GuardianError>;

impl GuardianError {
    /// 백오프 재시도 대상인지 확인합니다.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GuardianError::TransientBroker(_))
    }

    /// 재동기화 후 단일 재시도 대상인지 확인합니다.
    pub fn is_conflict(&self) -> bool {
        matches!(self, GuardianError::OrderConflict(_))
    }

    /// 재시도하면 안 되는 치명적 에러인지 확인합니다.
    pub fn is_fatal(&self) -> bool {
        matches!(self, GuardianError::BrokerRejection(_))
    }

    /// 알림 없이 조용히 폐기되는 에러인지 확인합니다.
    pub fn is_discardable(&self) -> bool {
        matches!(
            self,
            GuardianError::StaleData(_) | GuardianError::Validation(_)
        )
    }
}

impl From<serde_json::Error> for GuardianError {
    fn from(err: serde_json::Error) -> Self {
        GuardianError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(GuardianError::TransientBroker("timeout".to_string()).is_retryable());
        assert!(GuardianError::OrderConflict("shares locked".to_string()).is_conflict());
        assert!(GuardianError::BrokerRejection("invalid order".to_string()).is_fatal());
        assert!(GuardianError::StaleData("old tick".to_string()).is_discardable());
        assert!(GuardianError::Validation("stop regression".to_string()).is_discardable());
    }

    #[test]
    fn test_classes_are_disjoint() {
        let errors = [
            GuardianError::TransientBroker("a".to_string()),
            GuardianError::OrderConflict("b".to_string()),
            GuardianError::BrokerRejection("c".to_string()),
        ];

        for err in &errors {
            let count = [err.is_retryable(), err.is_conflict(), err.is_fatal()]
                .iter()
                .filter(|b| **b)
                .count();
            assert_eq!(count, 1);
        }
    }
}
