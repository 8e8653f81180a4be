use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockroom_core::{
    AllocationId, ChannelListingId, Entity, OrderLineId, PreorderAllocationId, StockId, VariantId,
    WarehouseId,
};

/// On-hand quantity of one variant in one warehouse.
///
/// `(warehouse_id, variant_id)` is unique. `quantity` never goes below zero:
/// every mutator clamps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stock {
    pub id: StockId,
    pub warehouse_id: WarehouseId,
    pub variant_id: VariantId,
    quantity: i32,
}

impl Stock {
    pub fn new(warehouse_id: WarehouseId, variant_id: VariantId, quantity: i32) -> Self {
        Self::with_id(StockId::new(), warehouse_id, variant_id, quantity)
    }

    pub fn with_id(
        id: StockId,
        warehouse_id: WarehouseId,
        variant_id: VariantId,
        quantity: i32,
    ) -> Self {
        Self {
            id,
            warehouse_id,
            variant_id,
            quantity: quantity.max(0),
        }
    }

    pub fn quantity(&self) -> i32 {
        self.quantity
    }

    pub fn set_quantity(&mut self, quantity: i32) {
        self.quantity = quantity.max(0);
    }

    /// Negative `by` is ignored; use [`Stock::decrease_quantity`].
    pub fn increase_quantity(&mut self, by: i32) {
        self.set_quantity(self.quantity.saturating_add(by.max(0)));
    }

    /// Negative `by` is ignored; use [`Stock::increase_quantity`].
    pub fn decrease_quantity(&mut self, by: i32) {
        self.set_quantity(self.quantity.saturating_sub(by.max(0)));
    }

    /// Quantity still free once `allocated` units are reserved. May be
    /// negative only if the ledger was corrupted externally.
    pub fn available(&self, allocated: i32) -> i32 {
        self.quantity - allocated
    }
}

impl Entity for Stock {
    type Id = StockId;

    fn id(&self) -> StockId {
        self.id
    }
}

/// Reservation of quantity from one stock against one order line.
///
/// `(order_line_id, stock_id)` is unique; a line holding capacity in several
/// warehouses has one row per stock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: AllocationId,
    pub order_line_id: OrderLineId,
    pub stock_id: StockId,
    pub quantity_allocated: i32,
    pub created_at: DateTime<Utc>,
}

impl Allocation {
    pub fn new(order_line_id: OrderLineId, stock_id: StockId, quantity_allocated: i32) -> Self {
        Self {
            id: AllocationId::new(),
            order_line_id,
            stock_id,
            quantity_allocated,
            created_at: Utc::now(),
        }
    }

    /// Release up to `quantity` units; returns how many were released.
    pub fn release(&mut self, quantity: i32) -> i32 {
        let released = quantity.clamp(0, self.quantity_allocated.max(0));
        self.quantity_allocated -= released;
        released
    }

    pub fn is_empty(&self) -> bool {
        self.quantity_allocated <= 0
    }

    /// Oldest-first ordering used when releasing capacity.
    pub fn age_key(&self) -> (DateTime<Utc>, AllocationId) {
        (self.created_at, self.id)
    }
}

impl Entity for Allocation {
    type Id = AllocationId;

    fn id(&self) -> AllocationId {
        self.id
    }
}

/// Reservation against a variant's channel listing for a preorder variant
/// (no physical stock exists yet).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreorderAllocation {
    pub id: PreorderAllocationId,
    pub order_line_id: OrderLineId,
    pub channel_listing_id: ChannelListingId,
    pub quantity: i32,
}

impl PreorderAllocation {
    pub fn new(order_line_id: OrderLineId, channel_listing_id: ChannelListingId, quantity: i32) -> Self {
        Self {
            id: PreorderAllocationId::new(),
            order_line_id,
            channel_listing_id,
            quantity,
        }
    }
}

impl Entity for PreorderAllocation {
    type Id = PreorderAllocationId;

    fn id(&self) -> PreorderAllocationId {
        self.id
    }
}
