//! 시뮬레이션 브로커 구현.
//!
//! 엔진 테스트와 모의 운영을 위한 인메모리 브로커입니다.
//! 제공 기능:
//! - 주문 접수/취소/조회 및 포지션 관리
//! - 작업별 실패 주입 (재시도/롤백 경로 테스트용)
//! - "shares locked" 충돌 재현: 보호 레그 수량이 포지션 수량을
//!   초과하면 접수를 거부
//! - 체결 주입 및 이벤트 스트림

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use guardian_core::{BrokerOrderId, OrderRequest, Price, Quantity, Side, Symbol};
use rust_decimal::Decimal;
use tokio::sync::mpsc;

use crate::traits::{
    Broker, BrokerEvent, BrokerOrder, BrokerOrderStatus, BrokerPosition, FillEvent,
};
use crate::{BrokerError, BrokerResult};

/// 실패 주입 대상 브로커 작업.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BrokerOp {
    /// 주문 제출
    Submit,
    /// 주문 취소
    Cancel,
    /// 주문 조회
    GetOrder,
    /// 미체결 주문 조회
    GetOpenOrders,
    /// 포지션 조회
    GetPositions,
}

#[derive(Debug, Default)]
struct SimState {
    orders: HashMap<String, BrokerOrder>,
    positions: HashMap<Symbol, BrokerPosition>,
    next_id: u64,
    fail_queue: HashMap<BrokerOp, VecDeque<BrokerError>>,
    call_counts: HashMap<BrokerOp, u32>,
}

impl SimState {
    /// 주입된 실패가 있으면 꺼내서 반환합니다.
    fn take_failure(&mut self, op: BrokerOp) -> Option<BrokerError> {
        self.call_counts.entry(op).and_modify(|c| *c += 1).or_insert(1);
        self.fail_queue.get_mut(&op)?.pop_front()
    }

    /// 심볼의 살아있는 감소 전용 주문 총 수량.
    fn live_reduce_only_quantity(&self, symbol: &Symbol, exit_side: Side) -> Quantity {
        self.orders
            .values()
            .filter(|o| {
                o.symbol == *symbol && o.side == exit_side && o.status.is_live()
            })
            .map(|o| o.quantity - o.filled_quantity)
            .sum()
    }
}

/// 인메모리 시뮬레이션 브로커.
pub struct SimulatedBroker {
    state: Mutex<SimState>,
    events: mpsc::UnboundedSender<BrokerEvent>,
}

impl SimulatedBroker {
    /// 새 시뮬레이션 브로커와 이벤트 수신기를 생성합니다.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<BrokerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                state: Mutex::new(SimState::default()),
                events: tx,
            },
            rx,
        )
    }

    // ==================== 테스트 헬퍼 ====================

    /// 브로커측 포지션을 설정합니다.
    pub fn set_position(&self, symbol: Symbol, side: Side, quantity: Quantity, entry: Price) {
        let mut state = self.state.lock().unwrap();
        state.positions.insert(
            symbol.clone(),
            BrokerPosition {
                symbol,
                side,
                quantity,
                entry_price: entry,
            },
        );
    }

    /// 브로커측 포지션을 제거합니다 (외부 종료 시뮬레이션).
    pub fn remove_position(&self, symbol: &Symbol) {
        let mut state = self.state.lock().unwrap();
        state.positions.remove(symbol);
        // 포지션이 사라지면 연관 보호 주문도 브로커측에서 취소됨
        for order in state.orders.values_mut() {
            if order.symbol == *symbol && order.status.is_live() {
                order.status = BrokerOrderStatus::Cancelled;
            }
        }
    }

    /// 다음 해당 작업 호출이 주어진 에러로 실패하도록 주입합니다.
    ///
    /// 같은 작업에 여러 번 주입하면 호출 순서대로 소비됩니다.
    pub fn fail_next(&self, op: BrokerOp, error: BrokerError) {
        let mut state = self.state.lock().unwrap();
        state.fail_queue.entry(op).or_default().push_back(error);
    }

    /// 작업별 누적 호출 횟수를 반환합니다.
    pub fn call_count(&self, op: BrokerOp) -> u32 {
        let state = self.state.lock().unwrap();
        state.call_counts.get(&op).copied().unwrap_or(0)
    }

    /// 주문을 체결 처리하고 Fill 이벤트를 발행합니다.
    ///
    /// 감소 전용 주문이면 브로커측 포지션 수량도 줄입니다.
    pub fn fill_order(&self, order_id: &BrokerOrderId, price: Price) -> BrokerResult<FillEvent> {
        let mut state = self.state.lock().unwrap();

        let order = state
            .orders
            .get_mut(order_id.as_str())
            .ok_or_else(|| BrokerError::OrderNotFound(order_id.to_string()))?;

        if !order.status.is_live() {
            return Err(BrokerError::OrderNotFound(format!(
                "{} is not live",
                order_id
            )));
        }

        let quantity = order.quantity - order.filled_quantity;
        order.filled_quantity = order.quantity;
        order.status = BrokerOrderStatus::Filled;
        let symbol = order.symbol.clone();

        // 포지션 수량 감소
        let mut position_closed = false;
        if let Some(position) = state.positions.get_mut(&symbol) {
            position.quantity -= quantity.min(position.quantity);
            if position.quantity.is_zero() {
                position_closed = true;
            }
        }
        if position_closed {
            state.positions.remove(&symbol);
        }

        let fill = FillEvent {
            order_id: order_id.clone(),
            symbol,
            quantity,
            price,
            timestamp: Utc::now(),
        };

        let _ = self.events.send(BrokerEvent::Fill(fill.clone()));
        Ok(fill)
    }

    /// 심볼의 살아있는 주문 목록을 접수 순서로 반환합니다.
    pub fn live_orders(&self, symbol: &Symbol) -> Vec<BrokerOrder> {
        let state = self.state.lock().unwrap();
        let mut orders: Vec<BrokerOrder> = state
            .orders
            .values()
            .filter(|o| o.symbol == *symbol && o.status.is_live())
            .cloned()
            .collect();
        orders.sort_by_key(|o| {
            o.id.as_str()
                .trim_start_matches("SIM-")
                .parse::<u64>()
                .unwrap_or(0)
        });
        orders
    }
}

#[async_trait]
impl Broker for SimulatedBroker {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn submit_order(&self, request: &OrderRequest) -> BrokerResult<BrokerOrderId> {
        let mut state = self.state.lock().unwrap();

        if let Some(err) = state.take_failure(BrokerOp::Submit) {
            return Err(err);
        }

        // "shares locked" 재현: 감소 전용 주문의 총 수량이 브로커측
        // 포지션 수량을 초과하면 거부
        if request.reduce_only {
            let position_qty = state
                .positions
                .get(&request.symbol)
                .map(|p| p.quantity)
                .unwrap_or(Decimal::ZERO);
            let live_qty = state.live_reduce_only_quantity(&request.symbol, request.side);

            if live_qty + request.quantity > position_qty {
                return Err(BrokerError::SharesLocked(format!(
                    "{}: live {} + new {} > position {}",
                    request.symbol, live_qty, request.quantity, position_qty
                )));
            }
        }

        state.next_id += 1;
        let order_id = BrokerOrderId::new(format!("SIM-{}", state.next_id));

        state.orders.insert(
            order_id.as_str().to_string(),
            BrokerOrder {
                id: order_id.clone(),
                symbol: request.symbol.clone(),
                side: request.side,
                order_type: request.order_type,
                quantity: request.quantity,
                filled_quantity: Decimal::ZERO,
                price: request.price,
                stop_price: request.stop_price,
                status: BrokerOrderStatus::Open,
            },
        );

        Ok(order_id)
    }

    async fn cancel_order(&self, order_id: &BrokerOrderId) -> BrokerResult<()> {
        let mut state = self.state.lock().unwrap();

        if let Some(err) = state.take_failure(BrokerOp::Cancel) {
            return Err(err);
        }

        let order = state
            .orders
            .get_mut(order_id.as_str())
            .ok_or_else(|| BrokerError::OrderNotFound(order_id.to_string()))?;

        if !order.status.is_live() {
            return Err(BrokerError::OrderNotFound(format!(
                "{} is not live",
                order_id
            )));
        }

        order.status = BrokerOrderStatus::Cancelled;
        let _ = self.events.send(BrokerEvent::Cancelled {
            order_id: order_id.clone(),
        });

        Ok(())
    }

    async fn get_order(&self, order_id: &BrokerOrderId) -> BrokerResult<BrokerOrder> {
        let mut state = self.state.lock().unwrap();

        if let Some(err) = state.take_failure(BrokerOp::GetOrder) {
            return Err(err);
        }

        state
            .orders
            .get(order_id.as_str())
            .cloned()
            .ok_or_else(|| BrokerError::OrderNotFound(order_id.to_string()))
    }

    async fn get_open_orders(&self, symbol: Option<&Symbol>) -> BrokerResult<Vec<BrokerOrder>> {
        let mut state = self.state.lock().unwrap();

        if let Some(err) = state.take_failure(BrokerOp::GetOpenOrders) {
            return Err(err);
        }

        Ok(state
            .orders
            .values()
            .filter(|o| o.status.is_live())
            .filter(|o| symbol.map(|s| o.symbol == *s).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn get_positions(&self) -> BrokerResult<Vec<BrokerPosition>> {
        let mut state = self.state.lock().unwrap();

        if let Some(err) = state.take_failure(BrokerOp::GetPositions) {
            return Err(err);
        }

        Ok(state.positions.values().cloned().collect())
    }
}
