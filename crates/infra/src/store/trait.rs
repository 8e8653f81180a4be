use std::sync::Arc;

use thiserror::Error;

use stockroom_core::{
    AllocationId, ChannelListingId, OrderLineId, PreorderAllocationId, StockId, VariantId,
    WarehouseId,
};
use stockroom_warehouse::{Allocation, PreorderAllocation, Stock, VariantChannelListing};

/// Persistence failure.
///
/// These are infrastructure errors; callers wrap them into
/// `StockError::System`.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("constraint violated: {0}")]
    Constraint(String),

    #[error("storage failure: {0}")]
    Storage(String),
}

/// Stock row selection. `None` fields do not restrict.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StockFilter {
    pub variant_ids: Option<Vec<VariantId>>,
    pub warehouse_ids: Option<Vec<WarehouseId>>,
    pub stock_ids: Option<Vec<StockId>>,
}

impl StockFilter {
    pub fn for_variants(variant_ids: impl IntoIterator<Item = VariantId>) -> Self {
        Self {
            variant_ids: Some(variant_ids.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn by_ids(stock_ids: impl IntoIterator<Item = StockId>) -> Self {
        Self {
            stock_ids: Some(stock_ids.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn in_warehouses(mut self, warehouse_ids: impl IntoIterator<Item = WarehouseId>) -> Self {
        self.warehouse_ids = Some(warehouse_ids.into_iter().collect());
        self
    }

    pub fn matches(&self, stock: &Stock) -> bool {
        self.variant_ids.as_ref().is_none_or(|ids| ids.contains(&stock.variant_id))
            && self.warehouse_ids.as_ref().is_none_or(|ids| ids.contains(&stock.warehouse_id))
            && self.stock_ids.as_ref().is_none_or(|ids| ids.contains(&stock.id))
    }
}

/// Allocation row selection. `None` fields do not restrict.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocationFilter {
    pub order_line_ids: Option<Vec<OrderLineId>>,
    pub stock_ids: Option<Vec<StockId>>,
}

impl AllocationFilter {
    pub fn for_lines(order_line_ids: impl IntoIterator<Item = OrderLineId>) -> Self {
        Self {
            order_line_ids: Some(order_line_ids.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn on_stocks(stock_ids: impl IntoIterator<Item = StockId>) -> Self {
        Self {
            stock_ids: Some(stock_ids.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn matches(&self, allocation: &Allocation) -> bool {
        self.order_line_ids
            .as_ref()
            .is_none_or(|ids| ids.contains(&allocation.order_line_id))
            && self.stock_ids.as_ref().is_none_or(|ids| ids.contains(&allocation.stock_id))
    }
}

/// Preorder allocation row selection. `None` fields do not restrict.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreorderAllocationFilter {
    pub order_line_ids: Option<Vec<OrderLineId>>,
    pub channel_listing_ids: Option<Vec<ChannelListingId>>,
}

impl PreorderAllocationFilter {
    pub fn for_lines(order_line_ids: impl IntoIterator<Item = OrderLineId>) -> Self {
        Self {
            order_line_ids: Some(order_line_ids.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn on_listings(listing_ids: impl IntoIterator<Item = ChannelListingId>) -> Self {
        Self {
            channel_listing_ids: Some(listing_ids.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn matches(&self, allocation: &PreorderAllocation) -> bool {
        self.order_line_ids
            .as_ref()
            .is_none_or(|ids| ids.contains(&allocation.order_line_id))
            && self
                .channel_listing_ids
                .as_ref()
                .is_none_or(|ids| ids.contains(&allocation.channel_listing_id))
    }
}

/// Stock ledger storage.
///
/// Reads on the store itself take no locks and may be stale; they serve
/// display paths. Anything that writes goes through a [`StockTransaction`]
/// obtained from [`StockStore::begin`].
#[async_trait::async_trait]
pub trait StockStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn StockTransaction>, StoreError>;

    async fn filter_stocks(&self, filter: &StockFilter) -> Result<Vec<Stock>, StoreError>;

    async fn filter_allocations(&self, filter: &AllocationFilter) -> Result<Vec<Allocation>, StoreError>;

    async fn filter_preorder_allocations(
        &self,
        filter: &PreorderAllocationFilter,
    ) -> Result<Vec<PreorderAllocation>, StoreError>;
}

/// One unit of work against the stock ledger.
///
/// Row locks taken through `lock_*` are held until the transaction commits
/// or is dropped. Dropping without commit rolls back every write. Locks are
/// taken in ascending id order within each call; callers lock stocks before
/// channel listings.
#[async_trait::async_trait]
pub trait StockTransaction: Send {
    /// Lock and return matching stocks, ordered by id.
    async fn lock_stocks(&mut self, filter: &StockFilter) -> Result<Vec<Stock>, StoreError>;

    /// Allocations as seen by this transaction (including its own writes).
    async fn filter_allocations(&mut self, filter: &AllocationFilter) -> Result<Vec<Allocation>, StoreError>;

    /// Insert or update stocks keyed on `(warehouse_id, variant_id)`.
    /// Returns the stored rows; an existing row keeps its id.
    async fn upsert_stocks(&mut self, stocks: Vec<Stock>) -> Result<Vec<Stock>, StoreError>;

    /// Insert or update allocations keyed on `(order_line_id, stock_id)`;
    /// the stored quantity is replaced by the given one.
    async fn upsert_allocations(&mut self, allocations: Vec<Allocation>) -> Result<(), StoreError>;

    async fn delete_allocations(&mut self, ids: &[AllocationId]) -> Result<(), StoreError>;

    /// Lock and return every channel listing of `variant_ids`, ordered by id.
    async fn lock_channel_listings(
        &mut self,
        variant_ids: &[VariantId],
    ) -> Result<Vec<VariantChannelListing>, StoreError>;

    async fn filter_preorder_allocations(
        &mut self,
        filter: &PreorderAllocationFilter,
    ) -> Result<Vec<PreorderAllocation>, StoreError>;

    /// Insert or update preorder allocations keyed on
    /// `(order_line_id, channel_listing_id)`.
    async fn upsert_preorder_allocations(&mut self, allocations: Vec<PreorderAllocation>) -> Result<(), StoreError>;

    async fn delete_preorder_allocations(&mut self, ids: &[PreorderAllocationId]) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

#[async_trait::async_trait]
impl<S> StockStore for Arc<S>
where
    S: StockStore + ?Sized,
{
    async fn begin(&self) -> Result<Box<dyn StockTransaction>, StoreError> {
        (**self).begin().await
    }

    async fn filter_stocks(&self, filter: &StockFilter) -> Result<Vec<Stock>, StoreError> {
        (**self).filter_stocks(filter).await
    }

    async fn filter_allocations(&self, filter: &AllocationFilter) -> Result<Vec<Allocation>, StoreError> {
        (**self).filter_allocations(filter).await
    }

    async fn filter_preorder_allocations(
        &self,
        filter: &PreorderAllocationFilter,
    ) -> Result<Vec<PreorderAllocation>, StoreError> {
        (**self).filter_preorder_allocations(filter).await
    }
}
