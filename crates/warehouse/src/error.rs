use serde::{Deserialize, Serialize};
use thiserror::Error;

use stockroom_core::{OrderLineId, VariantId, WarehouseId};

/// One under-stocked request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsufficientStockItem {
    pub variant_id: VariantId,
    /// Quantity that could have been served.
    pub available_quantity: i32,
    pub requested_quantity: i32,
    pub order_line_id: Option<OrderLineId>,
    pub warehouse_id: Option<WarehouseId>,
}

impl InsufficientStockItem {
    pub fn new(variant_id: VariantId, available_quantity: i32, requested_quantity: i32) -> Self {
        Self {
            variant_id,
            available_quantity: available_quantity.max(0),
            requested_quantity,
            order_line_id: None,
            warehouse_id: None,
        }
    }

    pub fn for_line(mut self, order_line_id: OrderLineId) -> Self {
        self.order_line_id = Some(order_line_id);
        self
    }

    pub fn in_warehouse(mut self, warehouse_id: Option<WarehouseId>) -> Self {
        self.warehouse_id = warehouse_id;
        self
    }
}

/// Requested reservation exceeds what inventory can serve.
///
/// Always carries every failing item of the request, never just the first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("insufficient stock for {} item(s)", .items.len())]
pub struct InsufficientStock {
    pub items: Vec<InsufficientStockItem>,
}

impl InsufficientStock {
    pub fn new(items: Vec<InsufficientStockItem>) -> Self {
        Self { items }
    }

    pub fn single(item: InsufficientStockItem) -> Self {
        Self { items: vec![item] }
    }

    /// `Ok(())` when nothing is under-stocked.
    pub fn check(items: Vec<InsufficientStockItem>) -> Result<(), Self> {
        if items.is_empty() {
            Ok(())
        } else {
            Err(Self { items })
        }
    }

    pub fn merge(mut self, other: InsufficientStock) -> Self {
        self.items.extend(other.items);
        self
    }

    pub fn variant_ids(&self) -> Vec<VariantId> {
        self.items.iter().map(|i| i.variant_id).collect()
    }
}
