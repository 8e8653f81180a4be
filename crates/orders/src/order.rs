use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockroom_core::{
    ChannelId, CountryCode, DomainError, DomainResult, Entity, OrderId, OrderLineId, VariantId,
    WarehouseId,
};
use stockroom_warehouse::ProductVariant;

/// Order status lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Draft,
    Unconfirmed,
    Unfulfilled,
    PartiallyFulfilled,
    Fulfilled,
    PartiallyReturned,
    Returned,
    Canceled,
}

/// Order line: variant, ordered quantity and how much of it shipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub id: OrderLineId,
    pub order_id: OrderId,
    pub variant_id: VariantId,
    pub quantity: i32,
    pub quantity_fulfilled: i32,
}

impl OrderLine {
    pub fn new(order_id: OrderId, variant_id: VariantId, quantity: i32) -> DomainResult<Self> {
        if quantity < 0 {
            return Err(DomainError::validation("order line quantity cannot be negative"));
        }
        Ok(Self {
            id: OrderLineId::new(),
            order_id,
            variant_id,
            quantity,
            quantity_fulfilled: 0,
        })
    }

    pub fn quantity_unfulfilled(&self) -> i32 {
        self.quantity - self.quantity_fulfilled
    }
}

impl Entity for OrderLine {
    type Id = OrderLineId;

    fn id(&self) -> OrderLineId {
        self.id
    }
}

/// Order as far as stock allocation and status reconciliation care.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub channel_id: ChannelId,
    pub status: OrderStatus,
    pub shipping_country: Option<CountryCode>,
    pub lines: Vec<OrderLine>,
}

impl Order {
    pub fn new(channel_id: ChannelId) -> Self {
        Self {
            id: OrderId::new(),
            channel_id,
            status: OrderStatus::Unfulfilled,
            shipping_country: None,
            lines: Vec::new(),
        }
    }

    pub fn with_shipping_country(mut self, country: CountryCode) -> Self {
        self.shipping_country = Some(country);
        self
    }

    /// Append a line for `variant_id` and return a copy of it.
    pub fn add_line(&mut self, variant_id: VariantId, quantity: i32) -> DomainResult<OrderLine> {
        let line = OrderLine::new(self.id, variant_id, quantity)?;
        self.lines.push(line.clone());
        Ok(line)
    }

    pub fn line(&self, line_id: OrderLineId) -> Option<&OrderLine> {
        self.lines.iter().find(|l| l.id == line_id)
    }

    /// Record shipped quantity on a line. Fulfilled quantity stays within
    /// `0..=quantity`.
    pub fn add_quantity_fulfilled(&mut self, line_id: OrderLineId, quantity: i32) -> DomainResult<()> {
        let order_id = self.id;
        let line = self
            .lines
            .iter_mut()
            .find(|l| l.id == line_id)
            .ok_or_else(|| DomainError::validation(format!("order line {line_id} not in order {order_id}")))?;

        let fulfilled = line.quantity_fulfilled + quantity;
        if fulfilled < 0 || fulfilled > line.quantity {
            return Err(DomainError::invariant(format!(
                "fulfilled quantity {fulfilled} outside 0..={} for line {line_id}",
                line.quantity
            )));
        }
        line.quantity_fulfilled = fulfilled;
        Ok(())
    }
}

impl Entity for Order {
    type Id = OrderId;

    fn id(&self) -> OrderId {
        self.id
    }
}

/// A line handed to the allocator together with what it needs to know about
/// the variant.
///
/// `quantity` is the amount to act on. It equals the line quantity when
/// allocating a fresh order and is a delta when editing one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLineInfo {
    pub line: OrderLine,
    pub quantity: i32,
    pub variant: ProductVariant,
    /// Warehouse the line is pinned to (e.g. chosen at fulfillment).
    pub warehouse_id: Option<WarehouseId>,
}

impl OrderLineInfo {
    pub fn new(line: OrderLine, variant: ProductVariant) -> DomainResult<Self> {
        if line.variant_id != variant.id {
            return Err(DomainError::validation(format!(
                "line {} is for variant {}, not {}",
                line.id, line.variant_id, variant.id
            )));
        }
        Ok(Self {
            quantity: line.quantity,
            line,
            variant,
            warehouse_id: None,
        })
    }

    pub fn with_quantity(mut self, quantity: i32) -> Self {
        self.quantity = quantity;
        self
    }

    pub fn with_warehouse(mut self, warehouse_id: WarehouseId) -> Self {
        self.warehouse_id = Some(warehouse_id);
        self
    }

    pub fn order_line_id(&self) -> OrderLineId {
        self.line.id
    }

    pub fn variant_id(&self) -> VariantId {
        self.variant.id
    }

    pub fn tracks_inventory(&self) -> bool {
        self.variant.track_inventory
    }

    pub fn is_preorder(&self, now: DateTime<Utc>) -> bool {
        self.variant.is_preorder_active(now)
    }
}
