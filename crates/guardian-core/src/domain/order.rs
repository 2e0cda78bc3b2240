//! 주문 타입 정의.
//!
//! 이 모듈은 보호 주문 관련 타입을 정의합니다:
//! - `Side` - 주문 방향 (매수/매도)
//! - `OrderType` - 주문 유형 (시장가, 지정가, 손절 등)
//! - `TimeInForce` - 주문 유효 기간
//! - `OrderRequest` - 브로커 제출용 주문 요청
//! - `BrokerOrderId` - 브로커가 할당한 주문 식별자

use crate::types::{Price, Quantity, Symbol};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 주문 방향 (매수 또는 매도).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// 매수
    Buy,
    /// 매도
    Sell,
}

impl Side {
    /// 반대 방향을 반환합니다.
    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// 주문 유형.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    /// 시장가 주문 - 현재 시장 가격으로 즉시 체결
    Market,
    /// 지정가 주문
    Limit,
    /// 손절 주문 (스톱 레그)
    StopLoss,
    /// 지정가 익절 주문 (타겟 레그)
    TakeProfitLimit,
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderType::Market => write!(f, "MARKET"),
            OrderType::Limit => write!(f, "LIMIT"),
            OrderType::StopLoss => write!(f, "STOP_LOSS"),
            OrderType::TakeProfitLimit => write!(f, "TAKE_PROFIT_LIMIT"),
        }
    }
}

/// 주문 유효 기간.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeInForce {
    /// 취소될 때까지 유효 (Good Till Cancelled)
    GTC,
    /// 즉시 체결 또는 취소 (Immediate Or Cancel)
    IOC,
    /// 전량 체결 또는 취소 (Fill Or Kill)
    FOK,
}

/// 브로커가 할당한 주문 식별자.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BrokerOrderId(pub String);

impl BrokerOrderId {
    /// 새 브로커 주문 ID를 생성합니다.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// 내부 문자열 참조를 반환합니다.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BrokerOrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 브로커 제출용 주문 요청.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    /// 거래 심볼
    pub symbol: Symbol,
    /// 주문 방향
    pub side: Side,
    /// 주문 유형
    pub order_type: OrderType,
    /// 거래 수량
    pub quantity: Quantity,
    /// 지정가 (지정가 주문에 필수)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<Price>,
    /// 스톱 가격 (스톱 주문용)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_price: Option<Price>,
    /// 주문 유효 기간
    pub time_in_force: TimeInForce,
    /// 감소 전용 주문 여부 (보호 레그는 항상 true)
    pub reduce_only: bool,
    /// 클라이언트 주문 ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_order_id: Option<String>,
}

impl OrderRequest {
    /// 손절 주문을 생성합니다. 방향은 포지션 방향의 반대입니다.
    pub fn stop_loss(
        symbol: Symbol,
        position_side: Side,
        quantity: Quantity,
        stop_price: Price,
    ) -> Self {
        Self {
            symbol,
            side: position_side.opposite(),
            order_type: OrderType::StopLoss,
            quantity,
            price: None,
            stop_price: Some(stop_price),
            time_in_force: TimeInForce::GTC,
            reduce_only: true,
            client_order_id: None,
        }
    }

    /// 지정가 익절 주문을 생성합니다.
    pub fn take_profit(
        symbol: Symbol,
        position_side: Side,
        quantity: Quantity,
        limit_price: Price,
    ) -> Self {
        Self {
            symbol,
            side: position_side.opposite(),
            order_type: OrderType::TakeProfitLimit,
            quantity,
            price: Some(limit_price),
            stop_price: None,
            time_in_force: TimeInForce::GTC,
            reduce_only: true,
            client_order_id: None,
        }
    }

    /// 시장가 청산 주문을 생성합니다 (마일스톤 부분 청산용).
    pub fn market_exit(symbol: Symbol, position_side: Side, quantity: Quantity) -> Self {
        Self {
            symbol,
            side: position_side.opposite(),
            order_type: OrderType::Market,
            quantity,
            price: None,
            stop_price: None,
            time_in_force: TimeInForce::GTC,
            reduce_only: true,
            client_order_id: None,
        }
    }

    /// 클라이언트 주문 ID를 설정합니다.
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_order_id = Some(client_id.into());
        self
    }
}
