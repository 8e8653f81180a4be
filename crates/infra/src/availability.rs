//! Availability checks for carts, checkouts and product pages.
//!
//! Every read here is lock-free and may be stale by the time the caller acts
//! on it. Reservation safety lives in the allocator.

use std::collections::HashMap;

use tracing::{instrument, warn};

use stockroom_core::{ChannelId, CountryCode, VariantId};
use stockroom_warehouse::{
    available_per_variant, available_quantity, Allocation, InsufficientStock, InsufficientStockItem,
    Product, ProductVariant, Stock, VariantAvailability,
};

use crate::directory::{warehouse_scope, WarehouseDirectory};
use crate::error::{StockResult, SystemContext};
use crate::store::{AllocationFilter, StockFilter, StockStore};

pub struct AvailabilityCalculator<S, D> {
    store: S,
    directory: D,
}

impl<S, D> AvailabilityCalculator<S, D>
where
    S: StockStore,
    D: WarehouseDirectory,
{
    pub fn new(store: S, directory: D) -> Self {
        Self { store, directory }
    }

    /// Stocks of `variant_ids` visible for the destination and channel, with
    /// the allocations held against them.
    async fn scoped_stocks(
        &self,
        variant_ids: Vec<VariantId>,
        country: Option<&CountryCode>,
        channel_id: ChannelId,
    ) -> StockResult<(Vec<Stock>, Vec<Allocation>)> {
        let warehouses = warehouse_scope(&self.directory, country, channel_id)
            .await
            .system_context("resolve warehouse scope")?;
        let stocks = self
            .store
            .filter_stocks(&StockFilter::for_variants(variant_ids).in_warehouses(warehouses))
            .await
            .system_context("load stocks")?;
        let allocations = self.allocations_on(&stocks).await?;
        Ok((stocks, allocations))
    }

    async fn allocations_on(&self, stocks: &[Stock]) -> StockResult<Vec<Allocation>> {
        if stocks.is_empty() {
            return Ok(Vec::new());
        }
        self.store
            .filter_allocations(&AllocationFilter::on_stocks(stocks.iter().map(|s| s.id)))
            .await
            .system_context("load allocations")
    }

    /// On-hand quantity of `stocks` minus what is allocated against them.
    #[instrument(skip(self, stocks), fields(stock_count = stocks.len()), err)]
    pub async fn get_available_quantity(&self, stocks: &[Stock]) -> StockResult<i32> {
        let allocations = self.allocations_on(stocks).await?;
        Ok(available_quantity(stocks, &allocations))
    }

    /// Fail when `quantity` of `variant` cannot be served for the
    /// destination and channel. Untracked variants always pass.
    #[instrument(
        skip(self, variant, country),
        fields(variant_id = %variant.id, channel_id = %channel_id),
        err
    )]
    pub async fn check_stock_quantity(
        &self,
        variant: &ProductVariant,
        country: Option<&CountryCode>,
        channel_id: ChannelId,
        quantity: i32,
    ) -> StockResult<()> {
        if !variant.track_inventory {
            return Ok(());
        }

        let (stocks, allocations) = self.scoped_stocks(vec![variant.id], country, channel_id).await?;
        let available = if stocks.is_empty() {
            0
        } else {
            available_quantity(&stocks, &allocations)
        };
        if stocks.is_empty() || quantity > available {
            warn!(variant_id = %variant.id, available, requested = quantity, "insufficient stock");
            return Err(InsufficientStock::single(InsufficientStockItem::new(variant.id, available, quantity)).into());
        }
        Ok(())
    }

    /// Check many `(variant, quantity)` requests at once, reporting every
    /// under-stocked one in a single error.
    ///
    /// Requests with quantity ≤ 0 are skipped. A variant with no visible
    /// stock fails even when untracked; an untracked variant with stock
    /// never fails on quantity.
    #[instrument(skip(self, requests, country), fields(requests = requests.len(), channel_id = %channel_id), err)]
    pub async fn check_stock_quantity_bulk(
        &self,
        requests: &[(ProductVariant, i32)],
        country: Option<&CountryCode>,
        channel_id: ChannelId,
    ) -> StockResult<()> {
        let variant_ids: Vec<VariantId> = requests.iter().map(|(v, _)| v.id).collect();
        let (stocks, allocations) = self.scoped_stocks(variant_ids, country, channel_id).await?;
        let per_variant: HashMap<VariantId, VariantAvailability> = available_per_variant(&stocks, &allocations);

        let mut items = Vec::new();
        for (variant, quantity) in requests {
            if *quantity <= 0 {
                continue;
            }
            let availability = per_variant.get(&variant.id).copied().unwrap_or_default();
            if !availability.has_stock() || (variant.track_inventory && *quantity > availability.available) {
                items.push(InsufficientStockItem::new(variant.id, availability.available, *quantity));
            }
        }

        InsufficientStock::check(items).map_err(|err| {
            warn!(variant_ids = ?err.variant_ids(), "insufficient stock");
            err.into()
        })
    }

    /// Whether any variant of `product` has stock left for the destination
    /// and channel.
    #[instrument(skip(self, product, country), fields(product_id = %product.id, channel_id = %channel_id), err)]
    pub async fn is_product_in_stock(
        &self,
        product: &Product,
        country: Option<&CountryCode>,
        channel_id: ChannelId,
    ) -> StockResult<bool> {
        let variant_ids = product.variants.iter().map(|v| v.id).collect();
        let (stocks, allocations) = self.scoped_stocks(variant_ids, country, channel_id).await?;
        Ok(available_per_variant(&stocks, &allocations)
            .values()
            .any(|a| a.available > 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use stockroom_core::{OrderLineId, ProductId, WarehouseId};

    use crate::directory::{InMemoryWarehouseDirectory, ShippingZone};
    use crate::error::StockError;
    use crate::store::InMemoryStockStore;

    struct Fixture {
        store: InMemoryStockStore,
        channel: ChannelId,
        warehouse: WarehouseId,
        calculator: AvailabilityCalculator<InMemoryStockStore, Arc<InMemoryWarehouseDirectory>>,
    }

    fn fixture() -> Fixture {
        let store = InMemoryStockStore::new();
        let directory = Arc::new(InMemoryWarehouseDirectory::new());
        let channel = ChannelId::new();
        let warehouse = WarehouseId::new();
        directory.set_channel_warehouses(channel, vec![warehouse]);
        directory.add_shipping_zone(ShippingZone {
            name: "poland".into(),
            countries: vec![CountryCode::parse("PL").unwrap()],
            channel_ids: vec![channel],
            warehouse_ids: vec![warehouse],
        });
        Fixture {
            calculator: AvailabilityCalculator::new(store.clone(), directory),
            store,
            channel,
            warehouse,
        }
    }

    fn shortage(err: StockError) -> InsufficientStock {
        match err {
            StockError::InsufficientStock(err) => err,
            other => panic!("expected insufficient stock, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn available_quantity_subtracts_allocations() {
        let f = fixture();
        let stock = f.store.seed_stock(Stock::new(f.warehouse, VariantId::new(), 10));
        f.store.seed_allocation(Allocation::new(OrderLineId::new(), stock.id, 4));

        assert_eq!(f.calculator.get_available_quantity(&[stock]).await.unwrap(), 6);
        assert_eq!(f.calculator.get_available_quantity(&[]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn check_fails_above_available_and_without_stock() {
        let f = fixture();
        let pl = CountryCode::parse("PL").unwrap();
        let variant = ProductVariant::tracked(ProductId::new());
        f.store.seed_stock(Stock::new(f.warehouse, variant.id, 5));

        f.calculator
            .check_stock_quantity(&variant, Some(&pl), f.channel, 5)
            .await
            .unwrap();

        let err = shortage(
            f.calculator
                .check_stock_quantity(&variant, Some(&pl), f.channel, 6)
                .await
                .unwrap_err(),
        );
        assert_eq!(err.items[0].available_quantity, 5);
        assert_eq!(err.items[0].requested_quantity, 6);

        // No warehouse ships to the US.
        let us = CountryCode::parse("US").unwrap();
        let err = shortage(
            f.calculator
                .check_stock_quantity(&variant, Some(&us), f.channel, 1)
                .await
                .unwrap_err(),
        );
        assert_eq!(err.items[0].available_quantity, 0);
    }

    #[tokio::test]
    async fn untracked_variants_skip_the_single_check() {
        let f = fixture();
        let variant = ProductVariant::untracked(ProductId::new());
        f.calculator
            .check_stock_quantity(&variant, None, f.channel, 100)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn bulk_check_reports_every_failing_variant() {
        let f = fixture();
        let product = ProductId::new();
        let plenty = ProductVariant::tracked(product);
        let scarce = ProductVariant::tracked(product);
        let untracked = ProductVariant::untracked(product);
        let missing = ProductVariant::untracked(product);
        f.store.seed_stock(Stock::new(f.warehouse, plenty.id, 10));
        f.store.seed_stock(Stock::new(f.warehouse, scarce.id, 2));
        f.store.seed_stock(Stock::new(f.warehouse, untracked.id, 0));

        let requests = vec![
            (plenty.clone(), 10),
            (scarce.clone(), 3),
            (untracked.clone(), 50),
            (missing.clone(), 1),
            (scarce.clone(), 0),
        ];
        let err = shortage(
            f.calculator
                .check_stock_quantity_bulk(&requests, None, f.channel)
                .await
                .unwrap_err(),
        );
        assert_eq!(err.variant_ids(), vec![scarce.id, missing.id]);
        assert_eq!(err.items[0].available_quantity, 2);
        assert_eq!(err.items[1].available_quantity, 0);
    }

    #[tokio::test]
    async fn product_in_stock_when_any_variant_has_free_quantity() {
        let f = fixture();
        let product_id = ProductId::new();
        let a = ProductVariant::tracked(product_id);
        let b = ProductVariant::tracked(product_id);
        let stock_a = f.store.seed_stock(Stock::new(f.warehouse, a.id, 3));
        f.store.seed_allocation(Allocation::new(OrderLineId::new(), stock_a.id, 3));
        let product = Product {
            id: product_id,
            variants: vec![a, b.clone()],
        };

        assert!(!f.calculator.is_product_in_stock(&product, None, f.channel).await.unwrap());

        f.store.seed_stock(Stock::new(f.warehouse, b.id, 1));
        assert!(f.calculator.is_product_in_stock(&product, None, f.channel).await.unwrap());
    }
}
