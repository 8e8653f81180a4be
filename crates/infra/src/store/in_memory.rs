//! In-memory stock ledger.
//!
//! Row locks are per-row async mutexes owned by the transaction that took
//! them. Writes are staged on the transaction and applied in one step on
//! commit, after unique and reference checks; dropping the transaction
//! discards them and releases its locks.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::{Mutex as RowMutex, OwnedMutexGuard};

use stockroom_core::{AllocationId, ChannelListingId, Entity, PreorderAllocationId, StockId, VariantId};
use stockroom_warehouse::{Allocation, PreorderAllocation, Stock, VariantChannelListing};

use super::r#trait::{
    AllocationFilter, PreorderAllocationFilter, StockFilter, StockStore, StockTransaction, StoreError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum RowKey {
    Stock(StockId),
    Listing(ChannelListingId),
}

/// Insert or replace a row under its own id.
fn put<E: Entity>(table: &mut BTreeMap<E::Id, E>, row: E) {
    table.insert(row.id(), row);
}

#[derive(Debug, Clone, Default)]
struct Tables {
    stocks: BTreeMap<StockId, Stock>,
    allocations: BTreeMap<AllocationId, Allocation>,
    listings: BTreeMap<ChannelListingId, VariantChannelListing>,
    preorder_allocations: BTreeMap<PreorderAllocationId, PreorderAllocation>,
}

impl Tables {
    fn stock_by_key(&self, stock: &Stock) -> Option<&Stock> {
        self.stocks
            .values()
            .find(|s| s.warehouse_id == stock.warehouse_id && s.variant_id == stock.variant_id)
    }

    fn validate(&self) -> Result<(), StoreError> {
        let mut stock_keys = HashSet::new();
        for stock in self.stocks.values() {
            if !stock_keys.insert((stock.warehouse_id, stock.variant_id)) {
                return Err(StoreError::Constraint(format!(
                    "duplicate stock for warehouse {} and variant {}",
                    stock.warehouse_id, stock.variant_id
                )));
            }
        }

        let mut allocation_keys = HashSet::new();
        for allocation in self.allocations.values() {
            if !allocation_keys.insert((allocation.order_line_id, allocation.stock_id)) {
                return Err(StoreError::Constraint(format!(
                    "duplicate allocation for line {} on stock {}",
                    allocation.order_line_id, allocation.stock_id
                )));
            }
            if !self.stocks.contains_key(&allocation.stock_id) {
                return Err(StoreError::Constraint(format!(
                    "allocation {} references missing stock {}",
                    allocation.id, allocation.stock_id
                )));
            }
            if allocation.quantity_allocated < 0 {
                return Err(StoreError::Constraint(format!(
                    "allocation {} has negative quantity",
                    allocation.id
                )));
            }
        }

        let mut listing_keys = HashSet::new();
        for listing in self.listings.values() {
            if !listing_keys.insert((listing.variant_id, listing.channel_id)) {
                return Err(StoreError::Constraint(format!(
                    "duplicate listing for variant {} in channel {}",
                    listing.variant_id, listing.channel_id
                )));
            }
        }

        let mut preorder_keys = HashSet::new();
        for allocation in self.preorder_allocations.values() {
            if !preorder_keys.insert((allocation.order_line_id, allocation.channel_listing_id)) {
                return Err(StoreError::Constraint(format!(
                    "duplicate preorder allocation for line {} on listing {}",
                    allocation.order_line_id, allocation.channel_listing_id
                )));
            }
            if !self.listings.contains_key(&allocation.channel_listing_id) {
                return Err(StoreError::Constraint(format!(
                    "preorder allocation {} references missing listing {}",
                    allocation.id, allocation.channel_listing_id
                )));
            }
            if allocation.quantity < 0 {
                return Err(StoreError::Constraint(format!(
                    "preorder allocation {} has negative quantity",
                    allocation.id
                )));
            }
        }

        Ok(())
    }
}

/// Writes of one transaction; `None` marks a deletion.
#[derive(Debug, Default)]
struct Staged {
    stocks: BTreeMap<StockId, Stock>,
    allocations: BTreeMap<AllocationId, Option<Allocation>>,
    preorder_allocations: BTreeMap<PreorderAllocationId, Option<PreorderAllocation>>,
}

impl Staged {
    fn apply_to(&self, tables: &mut Tables) {
        for stock in self.stocks.values() {
            put(&mut tables.stocks, stock.clone());
        }
        for (id, allocation) in &self.allocations {
            match allocation {
                Some(row) => tables.allocations.insert(*id, row.clone()),
                None => tables.allocations.remove(id),
            };
        }
        for (id, allocation) in &self.preorder_allocations {
            match allocation {
                Some(row) => tables.preorder_allocations.insert(*id, row.clone()),
                None => tables.preorder_allocations.remove(id),
            };
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    tables: RwLock<Tables>,
    row_locks: Mutex<HashMap<RowKey, Arc<RowMutex<()>>>>,
    latency: Option<Duration>,
}

impl Shared {
    fn committed(&self) -> Tables {
        self.tables.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn row_lock(&self, key: RowKey) -> Arc<RowMutex<()>> {
        let mut locks = self.row_locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(key).or_default().clone()
    }

    async fn delay(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

/// In-memory stock store for tests/dev.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStockStore {
    shared: Arc<Shared>,
}

impl InMemoryStockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store whose transactional calls each take at least `latency`.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                latency: Some(latency),
                ..Shared::default()
            }),
        }
    }

    /// Insert or replace a stock (keyed on warehouse and variant) outside
    /// any transaction. Returns the stored row.
    pub fn seed_stock(&self, stock: Stock) -> Stock {
        let mut tables = self.shared.tables.write().unwrap_or_else(PoisonError::into_inner);
        let stored = match tables.stock_by_key(&stock) {
            Some(existing) => Stock::with_id(existing.id, stock.warehouse_id, stock.variant_id, stock.quantity()),
            None => stock,
        };
        put(&mut tables.stocks, stored.clone());
        stored
    }

    pub fn seed_allocation(&self, allocation: Allocation) {
        let mut tables = self.shared.tables.write().unwrap_or_else(PoisonError::into_inner);
        put(&mut tables.allocations, allocation);
    }

    pub fn seed_listing(&self, listing: VariantChannelListing) {
        let mut tables = self.shared.tables.write().unwrap_or_else(PoisonError::into_inner);
        put(&mut tables.listings, listing);
    }

    pub fn stocks(&self) -> Vec<Stock> {
        self.shared.committed().stocks.into_values().collect()
    }

    pub fn allocations(&self) -> Vec<Allocation> {
        self.shared.committed().allocations.into_values().collect()
    }

    pub fn preorder_allocations(&self) -> Vec<PreorderAllocation> {
        self.shared.committed().preorder_allocations.into_values().collect()
    }

    pub fn listings(&self) -> Vec<VariantChannelListing> {
        self.shared.committed().listings.into_values().collect()
    }
}

#[async_trait::async_trait]
impl StockStore for InMemoryStockStore {
    async fn begin(&self) -> Result<Box<dyn StockTransaction>, StoreError> {
        Ok(Box::new(InMemoryStockTransaction {
            shared: Arc::clone(&self.shared),
            held: BTreeMap::new(),
            staged: Staged::default(),
        }))
    }

    async fn filter_stocks(&self, filter: &StockFilter) -> Result<Vec<Stock>, StoreError> {
        Ok(self
            .shared
            .committed()
            .stocks
            .into_values()
            .filter(|s| filter.matches(s))
            .collect())
    }

    async fn filter_allocations(&self, filter: &AllocationFilter) -> Result<Vec<Allocation>, StoreError> {
        Ok(self
            .shared
            .committed()
            .allocations
            .into_values()
            .filter(|a| filter.matches(a))
            .collect())
    }

    async fn filter_preorder_allocations(
        &self,
        filter: &PreorderAllocationFilter,
    ) -> Result<Vec<PreorderAllocation>, StoreError> {
        Ok(self
            .shared
            .committed()
            .preorder_allocations
            .into_values()
            .filter(|a| filter.matches(a))
            .collect())
    }
}

/// Transaction over [`InMemoryStockStore`].
pub struct InMemoryStockTransaction {
    shared: Arc<Shared>,
    held: BTreeMap<RowKey, OwnedMutexGuard<()>>,
    staged: Staged,
}

impl InMemoryStockTransaction {
    /// Committed rows overlaid with this transaction's writes.
    fn view(&self) -> Tables {
        let mut tables = self.shared.committed();
        self.staged.apply_to(&mut tables);
        tables
    }

    /// Take row locks in the given (ascending) order, skipping held ones.
    async fn acquire(&mut self, keys: Vec<RowKey>) {
        for key in keys {
            if self.held.contains_key(&key) {
                continue;
            }
            let guard = self.shared.row_lock(key).lock_owned().await;
            self.held.insert(key, guard);
        }
    }
}

#[async_trait::async_trait]
impl StockTransaction for InMemoryStockTransaction {
    async fn lock_stocks(&mut self, filter: &StockFilter) -> Result<Vec<Stock>, StoreError> {
        self.shared.delay().await;
        let keys: Vec<RowKey> = self
            .view()
            .stocks
            .values()
            .filter(|s| filter.matches(s))
            .map(|s| RowKey::Stock(s.id))
            .collect();
        self.acquire(keys).await;

        // Re-read: rows may have changed while waiting for the locks.
        Ok(self
            .view()
            .stocks
            .into_values()
            .filter(|s| filter.matches(s) && self.held.contains_key(&RowKey::Stock(s.id)))
            .collect())
    }

    async fn filter_allocations(&mut self, filter: &AllocationFilter) -> Result<Vec<Allocation>, StoreError> {
        self.shared.delay().await;
        Ok(self
            .view()
            .allocations
            .into_values()
            .filter(|a| filter.matches(a))
            .collect())
    }

    async fn upsert_stocks(&mut self, stocks: Vec<Stock>) -> Result<Vec<Stock>, StoreError> {
        self.shared.delay().await;
        let mut view = self.view();
        let mut stored = Vec::with_capacity(stocks.len());
        for stock in stocks {
            let row = match view.stock_by_key(&stock) {
                Some(existing) => {
                    Stock::with_id(existing.id, stock.warehouse_id, stock.variant_id, stock.quantity())
                }
                None => stock,
            };
            view.stocks.insert(row.id, row.clone());
            self.staged.stocks.insert(row.id, row.clone());
            stored.push(row);
        }
        Ok(stored)
    }

    async fn upsert_allocations(&mut self, allocations: Vec<Allocation>) -> Result<(), StoreError> {
        self.shared.delay().await;
        let mut view = self.view();
        for allocation in allocations {
            let row = match view
                .allocations
                .values()
                .find(|a| a.order_line_id == allocation.order_line_id && a.stock_id == allocation.stock_id)
            {
                Some(existing) => Allocation {
                    quantity_allocated: allocation.quantity_allocated,
                    ..existing.clone()
                },
                None => allocation,
            };
            view.allocations.insert(row.id, row.clone());
            self.staged.allocations.insert(row.id, Some(row));
        }
        Ok(())
    }

    async fn delete_allocations(&mut self, ids: &[AllocationId]) -> Result<(), StoreError> {
        self.shared.delay().await;
        for id in ids {
            self.staged.allocations.insert(*id, None);
        }
        Ok(())
    }

    async fn lock_channel_listings(
        &mut self,
        variant_ids: &[VariantId],
    ) -> Result<Vec<VariantChannelListing>, StoreError> {
        self.shared.delay().await;
        let keys: Vec<RowKey> = self
            .view()
            .listings
            .values()
            .filter(|l| variant_ids.contains(&l.variant_id))
            .map(|l| RowKey::Listing(l.id))
            .collect();
        self.acquire(keys).await;

        Ok(self
            .view()
            .listings
            .into_values()
            .filter(|l| variant_ids.contains(&l.variant_id) && self.held.contains_key(&RowKey::Listing(l.id)))
            .collect())
    }

    async fn filter_preorder_allocations(
        &mut self,
        filter: &PreorderAllocationFilter,
    ) -> Result<Vec<PreorderAllocation>, StoreError> {
        self.shared.delay().await;
        Ok(self
            .view()
            .preorder_allocations
            .into_values()
            .filter(|a| filter.matches(a))
            .collect())
    }

    async fn upsert_preorder_allocations(&mut self, allocations: Vec<PreorderAllocation>) -> Result<(), StoreError> {
        self.shared.delay().await;
        let mut view = self.view();
        for allocation in allocations {
            let row = match view.preorder_allocations.values().find(|a| {
                a.order_line_id == allocation.order_line_id
                    && a.channel_listing_id == allocation.channel_listing_id
            }) {
                Some(existing) => PreorderAllocation {
                    quantity: allocation.quantity,
                    ..existing.clone()
                },
                None => allocation,
            };
            view.preorder_allocations.insert(row.id, row.clone());
            self.staged.preorder_allocations.insert(row.id, Some(row));
        }
        Ok(())
    }

    async fn delete_preorder_allocations(&mut self, ids: &[PreorderAllocationId]) -> Result<(), StoreError> {
        self.shared.delay().await;
        for id in ids {
            self.staged.preorder_allocations.insert(*id, None);
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.shared.delay().await;
        let mut tables = self.shared.tables.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = tables.clone();
        self.staged.apply_to(&mut next);
        next.validate()?;
        *tables = next;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stockroom_core::{OrderLineId, WarehouseId};

    #[tokio::test]
    async fn writes_are_invisible_until_commit() {
        let store = InMemoryStockStore::new();
        let stock = store.seed_stock(Stock::new(WarehouseId::new(), VariantId::new(), 10));

        let mut tx = store.begin().await.unwrap();
        tx.upsert_allocations(vec![Allocation::new(OrderLineId::new(), stock.id, 4)])
            .await
            .unwrap();
        assert_eq!(tx.filter_allocations(&AllocationFilter::default()).await.unwrap().len(), 1);
        assert!(store.allocations().is_empty());

        tx.commit().await.unwrap();
        assert_eq!(store.allocations().len(), 1);
    }

    #[tokio::test]
    async fn dropping_a_transaction_rolls_back_and_releases_locks() {
        let store = InMemoryStockStore::new();
        let stock = store.seed_stock(Stock::new(WarehouseId::new(), VariantId::new(), 10));
        let filter = StockFilter::by_ids([stock.id]);

        {
            let mut tx = store.begin().await.unwrap();
            tx.lock_stocks(&filter).await.unwrap();
            tx.upsert_allocations(vec![Allocation::new(OrderLineId::new(), stock.id, 4)])
                .await
                .unwrap();
        }
        assert!(store.allocations().is_empty());

        let mut tx = store.begin().await.unwrap();
        let locked = tokio::time::timeout(Duration::from_secs(1), tx.lock_stocks(&filter))
            .await
            .expect("lock released on drop")
            .unwrap();
        assert_eq!(locked, vec![stock]);
    }

    #[tokio::test]
    async fn explicit_rollback_discards_writes_and_frees_locks() {
        let store = InMemoryStockStore::new();
        let stock = store.seed_stock(Stock::new(WarehouseId::new(), VariantId::new(), 10));
        let filter = StockFilter::by_ids([stock.id]);

        let mut tx = store.begin().await.unwrap();
        tx.lock_stocks(&filter).await.unwrap();
        tx.upsert_stocks(vec![Stock::new(stock.warehouse_id, stock.variant_id, 1)])
            .await
            .unwrap();
        tx.rollback().await.unwrap();
        assert_eq!(store.stocks()[0].quantity(), 10);

        let mut next = store.begin().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), next.lock_stocks(&filter))
            .await
            .expect("lock released on rollback")
            .unwrap();
    }

    #[tokio::test]
    async fn row_lock_blocks_second_transaction_until_commit() {
        let store = InMemoryStockStore::new();
        let stock = store.seed_stock(Stock::new(WarehouseId::new(), VariantId::new(), 10));
        let filter = StockFilter::by_ids([stock.id]);

        let mut first = store.begin().await.unwrap();
        first.lock_stocks(&filter).await.unwrap();

        let mut second = store.begin().await.unwrap();
        let blocked = tokio::time::timeout(Duration::from_millis(50), second.lock_stocks(&filter)).await;
        assert!(blocked.is_err());

        first
            .upsert_allocations(vec![Allocation::new(OrderLineId::new(), stock.id, 6)])
            .await
            .unwrap();
        first.commit().await.unwrap();

        second.lock_stocks(&filter).await.unwrap();
        let seen = second.filter_allocations(&AllocationFilter::on_stocks([stock.id])).await.unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].quantity_allocated, 6);
    }

    #[tokio::test]
    async fn upserts_keep_existing_ids_for_the_same_key() {
        let store = InMemoryStockStore::new();
        let warehouse = WarehouseId::new();
        let variant = VariantId::new();
        let stock = store.seed_stock(Stock::new(warehouse, variant, 1));
        let line = OrderLineId::new();
        let first = Allocation::new(line, stock.id, 1);
        store.seed_allocation(first.clone());

        let mut tx = store.begin().await.unwrap();
        let stored = tx.upsert_stocks(vec![Stock::new(warehouse, variant, 7)]).await.unwrap();
        assert_eq!(stored[0].id, stock.id);
        tx.upsert_allocations(vec![Allocation::new(line, stock.id, 5)]).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(store.stocks()[0].quantity(), 7);
        let allocations = store.allocations();
        assert_eq!(allocations.len(), 1);
        assert_eq!(allocations[0].id, first.id);
        assert_eq!(allocations[0].quantity_allocated, 5);
    }

    #[tokio::test]
    async fn commit_rejects_allocations_on_missing_stock() {
        let store = InMemoryStockStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.upsert_allocations(vec![Allocation::new(OrderLineId::new(), StockId::new(), 1)])
            .await
            .unwrap();

        let err = tx.commit().await.unwrap_err();
        assert!(matches!(err, StoreError::Constraint(_)));
        assert!(store.allocations().is_empty());
    }

    #[tokio::test]
    async fn concurrent_stock_creation_conflicts_on_commit() {
        let store = InMemoryStockStore::new();
        let (warehouse, variant) = (WarehouseId::new(), VariantId::new());

        let mut a = store.begin().await.unwrap();
        let mut b = store.begin().await.unwrap();
        a.upsert_stocks(vec![Stock::new(warehouse, variant, 1)]).await.unwrap();
        b.upsert_stocks(vec![Stock::new(warehouse, variant, 2)]).await.unwrap();

        a.commit().await.unwrap();
        assert!(matches!(b.commit().await, Err(StoreError::Constraint(_))));
        assert_eq!(store.stocks().len(), 1);
    }
}
