//! 브로커 에러 타입.

use guardian_core::GuardianError;
use thiserror::Error;

/// 브로커 관련 에러.
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    /// 네트워크/연결 에러
    #[error("Network error: {0}")]
    Network(String),

    /// 브로커 연결 끊김
    #[error("Disconnected: {0}")]
    Disconnected(String),

    /// 요청 한도 초과
    #[error("Rate limit exceeded")]
    RateLimited,

    /// 요청 타임아웃 - 성공으로 간주하지 않음
    #[error("Request timeout: {0}")]
    Timeout(String),

    /// 주식 잠김 충돌 - 보호 레그가 이미 해당 수량을 점유 중
    #[error("Shares locked: {0}")]
    SharesLocked(String),

    /// 주문을 찾을 수 없음 (로컬 상태가 스테일)
    #[error("Order not found: {0}")]
    OrderNotFound(String),

    /// 주문 거부됨 - 재시도 불가
    #[error("Order rejected: {0}")]
    OrderRejected(String),

    /// 포지션을 찾을 수 없음
    #[error("Position not found: {0}")]
    PositionNotFound(String),

    /// 응답 파싱 에러
    #[error("Parse error: {0}")]
    Parse(String),

    /// 알 수 없는 에러
    #[error("Unknown error: {0}")]
    Unknown(String),
}

/// 브로커 작업을 위한 Result 타입.
pub type BrokerResult<T> = Result<T, BrokerError>;

impl BrokerError {
    /// 백오프 후 재시도 가능한 일시적 에러인지 확인.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BrokerError::Network(_)
                | BrokerError::Disconnected(_)
                | BrokerError::RateLimited
                | BrokerError::Timeout(_)
        )
    }

    /// 브로커 상태 재동기화가 필요한 충돌 에러인지 확인.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            BrokerError::SharesLocked(_) | BrokerError::OrderNotFound(_)
        )
    }

    /// 재시도하면 안 되는 치명적 에러인지 확인.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BrokerError::OrderRejected(_))
    }

    /// 연결 장애성 에러인지 확인 (circuit breaker 집계 대상).
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            BrokerError::Network(_) | BrokerError::Disconnected(_) | BrokerError::Timeout(_)
        )
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        BrokerError::Parse(err.to_string())
    }
}

impl From<BrokerError> for GuardianError {
    fn from(err: BrokerError) -> Self {
        if err.is_conflict() {
            GuardianError::OrderConflict(err.to_string())
        } else if err.is_fatal() {
            GuardianError::BrokerRejection(err.to_string())
        } else if err.is_retryable() {
            GuardianError::TransientBroker(err.to_string())
        } else {
            GuardianError::Internal(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(BrokerError::Network("refused".to_string()).is_retryable());
        assert!(BrokerError::Timeout("5s".to_string()).is_retryable());
        assert!(BrokerError::SharesLocked("stop leg".to_string()).is_conflict());
        assert!(BrokerError::OrderRejected("bad price".to_string()).is_fatal());
        assert!(!BrokerError::OrderRejected("bad price".to_string()).is_retryable());
    }

    #[test]
    fn test_guardian_error_mapping() {
        let err: GuardianError = BrokerError::RateLimited.into();
        assert!(err.is_retryable());

        let err: GuardianError = BrokerError::SharesLocked("legs".to_string()).into();
        assert!(err.is_conflict());

        let err: GuardianError = BrokerError::OrderRejected("no".to_string()).into();
        assert!(err.is_fatal());
    }
}
