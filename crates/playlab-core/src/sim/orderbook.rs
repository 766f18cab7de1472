//! Pending-order book for the simulated exchange.
//!
//! Indexed by order id with deterministic iteration (ids are zero-padded
//! sequential, so map order equals submission order). Bounded capacity; the
//! order book is the single source of truth for pending orders.

use std::collections::BTreeMap;

use crate::bar::Bar;
use crate::error::{CoreError, Result};
use crate::sim::types::{Order, OrderStatus, OrderType, TriggerDirection};

/// Default safety limit on concurrent pending orders.
pub const DEFAULT_MAX_ORDERS: usize = 100;

#[derive(Debug)]
pub struct OrderBook {
    max_orders: usize,
    orders: BTreeMap<String, Order>,
    order_counter: u64,
}

impl OrderBook {
    pub fn new(max_orders: usize) -> Self {
        Self {
            max_orders,
            orders: BTreeMap::new(),
            order_counter: 0,
        }
    }

    /// Next sequential order id (deterministic across runs).
    pub fn next_order_id(&mut self) -> String {
        self.order_counter += 1;
        format!("order-{:06}", self.order_counter)
    }

    /// Add an order; assigns an id when empty. Overflow is a loud error.
    pub fn add_order(&mut self, mut order: Order) -> Result<String> {
        if self.orders.len() >= self.max_orders {
            return Err(CoreError::OrderBookFull(self.max_orders));
        }
        if order.order_id.is_empty() {
            order.order_id = self.next_order_id();
        }
        let order_id = order.order_id.clone();
        self.orders.insert(order_id.clone(), order);
        Ok(order_id)
    }

    pub fn get_order(&self, order_id: &str) -> Option<&Order> {
        self.orders.get(order_id)
    }

    /// Cancel by id; returns false when not found.
    pub fn cancel_order(&mut self, order_id: &str) -> bool {
        match self.orders.remove(order_id) {
            Some(mut order) => {
                order.status = OrderStatus::Cancelled;
                true
            }
            None => false,
        }
    }

    /// Cancel all orders, optionally filtered by symbol. Returns the count.
    pub fn cancel_all(&mut self, symbol: Option<&str>) -> usize {
        let to_cancel: Vec<String> = self
            .orders
            .values()
            .filter(|o| symbol.map(|s| o.symbol == s).unwrap_or(true))
            .map(|o| o.order_id.clone())
            .collect();
        for order_id in &to_cancel {
            self.cancel_order(order_id);
        }
        to_cancel.len()
    }

    /// Conditional orders whose trigger condition fires against bar OHLC.
    ///
    /// Bybit semantics: RisesTo fires when `bar.high >= trigger`, FallsTo
    /// when `bar.low <= trigger`. Orders stay in the book; the caller
    /// decides what to do with them.
    pub fn check_triggers(&self, bar: &Bar) -> Vec<Order> {
        let mut triggered = Vec::new();
        for order in self.orders.values() {
            if !order.is_conditional() {
                continue;
            }
            let trigger_price = match order.trigger_price {
                Some(p) => p,
                None => continue,
            };
            let direction = order.trigger_direction.unwrap_or(TriggerDirection::RisesTo);
            let fires = match direction {
                TriggerDirection::RisesTo => bar.high >= trigger_price,
                TriggerDirection::FallsTo => bar.low <= trigger_price,
            };
            if fires {
                triggered.push(order.clone());
            }
        }
        triggered
    }

    /// Pending orders, optionally filtered by type and symbol, in id order.
    pub fn get_pending_orders(
        &self,
        order_type: Option<OrderType>,
        symbol: Option<&str>,
    ) -> Vec<Order> {
        self.orders
            .values()
            .filter(|o| o.status == OrderStatus::Pending)
            .filter(|o| order_type.map(|t| o.order_type == t).unwrap_or(true))
            .filter(|o| symbol.map(|s| o.symbol == s).unwrap_or(true))
            .cloned()
            .collect()
    }

    /// Mark filled and remove from the book.
    pub fn mark_filled(&mut self, order_id: &str) {
        if let Some(mut order) = self.orders.remove(order_id) {
            order.status = OrderStatus::Filled;
        }
    }

    /// Mark rejected and remove from the book.
    pub fn mark_rejected(&mut self, order_id: &str) {
        if let Some(mut order) = self.orders.remove(order_id) {
            order.status = OrderStatus::Rejected;
        }
    }

    /// Amend a pending order. `0` for SL/TP removes the attachment.
    ///
    /// Only `pending` orders may be amended; price fields only apply to the
    /// order types that carry them.
    pub fn amend_order(
        &mut self,
        order_id: &str,
        limit_price: Option<f64>,
        trigger_price: Option<f64>,
        size_usdt: Option<f64>,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
    ) -> bool {
        let order = match self.orders.get_mut(order_id) {
            Some(o) if o.status == OrderStatus::Pending => o,
            _ => return false,
        };

        if let Some(price) = limit_price {
            if matches!(order.order_type, OrderType::Limit | OrderType::StopLimit) {
                order.limit_price = Some(price);
            }
        }
        if let Some(price) = trigger_price {
            if order.is_conditional() {
                order.trigger_price = Some(price);
            }
        }
        if let Some(size) = size_usdt {
            if size > 0.0 {
                order.size_usdt = size;
            }
        }
        if let Some(sl) = stop_loss {
            order.stop_loss = if sl > 0.0 { Some(sl) } else { None };
        }
        if let Some(tp) = take_profit {
            order.take_profit = if tp > 0.0 { Some(tp) } else { None };
        }
        true
    }

    pub fn count(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    /// Snapshot of all pending orders (id order).
    pub fn orders(&self) -> Vec<Order> {
        self.orders.values().cloned().collect()
    }

    /// Clear all orders. Call when starting a new backtest.
    pub fn reset(&mut self) {
        self.orders.clear();
        self.order_counter = 0;
    }
}

impl Default for OrderBook {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ORDERS)
    }
}
