//! 브로커 trait 정의.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use guardian_core::{BrokerOrderId, OrderRequest, OrderType, Price, Quantity, Side, Symbol};
use serde::{Deserialize, Serialize};

use crate::BrokerResult;

/// 브로커가 보고하는 주문 상태.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerOrderStatus {
    /// 브로커에 접수되어 대기 중
    Open,
    /// 부분 체결됨
    PartiallyFilled,
    /// 전량 체결됨
    Filled,
    /// 취소됨
    Cancelled,
    /// 거부됨
    Rejected,
}

impl BrokerOrderStatus {
    /// 주문이 아직 살아있는지 확인합니다.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            BrokerOrderStatus::Open | BrokerOrderStatus::PartiallyFilled
        )
    }
}

/// 브로커측 주문 뷰.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerOrder {
    /// 브로커 주문 ID
    pub id: BrokerOrderId,
    /// 거래 심볼
    pub symbol: Symbol,
    /// 주문 방향
    pub side: Side,
    /// 주문 유형
    pub order_type: OrderType,
    /// 주문 수량
    pub quantity: Quantity,
    /// 체결된 수량
    pub filled_quantity: Quantity,
    /// 지정가
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<Price>,
    /// 스톱 가격
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_price: Option<Price>,
    /// 현재 상태
    pub status: BrokerOrderStatus,
}

/// 브로커측 포지션 뷰.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerPosition {
    /// 거래 심볼
    pub symbol: Symbol,
    /// 포지션 방향
    pub side: Side,
    /// 보유 수량
    pub quantity: Quantity,
    /// 평균 진입 가격
    pub entry_price: Price,
}

/// 체결 이벤트.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillEvent {
    /// 체결된 주문 ID
    pub order_id: BrokerOrderId,
    /// 거래 심볼
    pub symbol: Symbol,
    /// 체결 수량
    pub quantity: Quantity,
    /// 체결 가격
    pub price: Price,
    /// 체결 시각
    pub timestamp: DateTime<Utc>,
}

/// 브로커 이벤트 스트림의 이벤트.
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    /// 주문 체결
    Fill(FillEvent),
    /// 주문 취소 확인
    Cancelled {
        /// 취소된 주문 ID
        order_id: BrokerOrderId,
    },
    /// 주문 거부
    Rejected {
        /// 거부된 주문 ID
        order_id: BrokerOrderId,
        /// 거부 사유
        reason: String,
    },
}

/// 통합 브로커 인터페이스.
///
/// 보호 엔진이 소비하는 유일한 브로커 seam입니다. 실제 브로커 SDK는
/// 이 trait의 구현체 뒤에 숨겨지며, 모든 호출은 호출자가 설정한
/// 타임아웃 안에서 수행됩니다.
#[async_trait]
pub trait Broker: Send + Sync {
    /// 브로커 이름 반환.
    fn name(&self) -> &str;

    /// 새 주문 제출. 성공 시 브로커가 할당한 주문 ID 반환.
    async fn submit_order(&self, request: &OrderRequest) -> BrokerResult<BrokerOrderId>;

    /// 주문 취소.
    async fn cancel_order(&self, order_id: &BrokerOrderId) -> BrokerResult<()>;

    /// 주문 상태 조회.
    async fn get_order(&self, order_id: &BrokerOrderId) -> BrokerResult<BrokerOrder>;

    /// 미체결 주문 조회. 심볼이 None이면 전체 조회.
    async fn get_open_orders(&self, symbol: Option<&Symbol>) -> BrokerResult<Vec<BrokerOrder>>;

    /// 현재 포지션 조회.
    async fn get_positions(&self) -> BrokerResult<Vec<BrokerPosition>>;
}
