use serde::{Deserialize, Serialize};

use stockroom_core::{Entity, FulfillmentId, FulfillmentLineId, OrderId, OrderLineId, StockId};

/// Fulfillment status lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FulfillmentStatus {
    Fulfilled,
    Refunded,
    Returned,
    Replaced,
    RefundedAndReturned,
    Canceled,
    WaitingForApproval,
}

/// How a fulfillment's lines count against the order totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReturnKind {
    /// Goods came back; counted as returned.
    Returned,
    /// Goods were swapped; removed from both total and fulfilled.
    Replaced,
}

impl FulfillmentStatus {
    /// `None` for fulfillments that do not affect return accounting.
    pub fn return_kind(self) -> Option<ReturnKind> {
        match self {
            Self::Returned | Self::RefundedAndReturned => Some(ReturnKind::Returned),
            Self::Replaced => Some(ReturnKind::Replaced),
            _ => None,
        }
    }

    pub fn is_awaiting_approval(self) -> bool {
        matches!(self, Self::WaitingForApproval)
    }
}

/// Shipment (or return/replacement record) of part of an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fulfillment {
    pub id: FulfillmentId,
    pub order_id: OrderId,
    pub status: FulfillmentStatus,
    /// 1-based sequence within the order.
    pub fulfillment_order: u32,
}

impl Fulfillment {
    pub fn new(order_id: OrderId, status: FulfillmentStatus, fulfillment_order: u32) -> Self {
        Self {
            id: FulfillmentId::new(),
            order_id,
            status,
            fulfillment_order,
        }
    }
}

impl Entity for Fulfillment {
    type Id = FulfillmentId;

    fn id(&self) -> FulfillmentId {
        self.id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FulfillmentLine {
    pub id: FulfillmentLineId,
    pub fulfillment_id: FulfillmentId,
    pub order_line_id: OrderLineId,
    /// Stock the goods left from, when known.
    pub stock_id: Option<StockId>,
    pub quantity: i32,
}

impl FulfillmentLine {
    pub fn new(fulfillment_id: FulfillmentId, order_line_id: OrderLineId, quantity: i32) -> Self {
        Self {
            id: FulfillmentLineId::new(),
            fulfillment_id,
            order_line_id,
            stock_id: None,
            quantity,
        }
    }

    pub fn from_stock(mut self, stock_id: StockId) -> Self {
        self.stock_id = Some(stock_id);
        self
    }
}

impl Entity for FulfillmentLine {
    type Id = FulfillmentLineId;

    fn id(&self) -> FulfillmentLineId {
        self.id
    }
}
