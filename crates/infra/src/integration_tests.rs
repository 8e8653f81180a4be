//! End-to-end stock scenarios over the in-memory stores.
//!
//! Availability check → allocation → shipment → status reconciliation,
//! plus the contention and rollback cases the row locks exist for.

use std::sync::Arc;
use std::time::Duration;

use stockroom_core::{CountryCode, ProductId, WarehouseId};
use stockroom_orders::{Fulfillment, FulfillmentLine, FulfillmentStatus, Order, OrderLineInfo, OrderStatus};
use stockroom_warehouse::{
    Channel, InsufficientStock, PreorderSettings, ProductVariant, Stock, VariantChannelListing,
};

use crate::allocator::Allocator;
use crate::availability::AvailabilityCalculator;
use crate::directory::{InMemoryWarehouseDirectory, ShippingZone};
use crate::error::StockError;
use crate::orders::{InMemoryFulfillmentStore, InMemoryOrderStore, OrderStore};
use crate::reconciler::FulfillmentReconciler;
use crate::store::InMemoryStockStore;

type TestAllocator = Allocator<InMemoryStockStore, Arc<InMemoryWarehouseDirectory>>;

struct Harness {
    store: InMemoryStockStore,
    directory: Arc<InMemoryWarehouseDirectory>,
    channel: Channel,
    country: CountryCode,
    w1: WarehouseId,
    w2: WarehouseId,
    allocator: Arc<TestAllocator>,
}

impl Harness {
    fn new() -> Self {
        Self::with_store(InMemoryStockStore::new())
    }

    fn with_store(store: InMemoryStockStore) -> Self {
        stockroom_observability::init_test();

        let directory = Arc::new(InMemoryWarehouseDirectory::new());
        let channel = Channel::new("web");
        let country = CountryCode::parse("PL").unwrap();
        let (w1, w2) = (WarehouseId::new(), WarehouseId::new());
        directory.set_channel_warehouses(channel.id, vec![w1, w2]);
        directory.add_shipping_zone(ShippingZone {
            name: "poland".into(),
            countries: vec![country.clone()],
            channel_ids: vec![channel.id],
            warehouse_ids: vec![w1, w2],
        });

        Self {
            allocator: Arc::new(Allocator::new(store.clone(), Arc::clone(&directory))),
            store,
            directory,
            channel,
            country,
            w1,
            w2,
        }
    }

    fn availability(&self) -> AvailabilityCalculator<InMemoryStockStore, Arc<InMemoryWarehouseDirectory>> {
        AvailabilityCalculator::new(self.store.clone(), Arc::clone(&self.directory))
    }

    /// One-line order for `variant`, with its line info.
    fn order(&self, variant: &ProductVariant, quantity: i32) -> (Order, OrderLineInfo) {
        let mut order = Order::new(self.channel.id).with_shipping_country(self.country.clone());
        let line = order.add_line(variant.id, quantity).unwrap();
        let info = OrderLineInfo::new(line, variant.clone()).unwrap();
        (order, info)
    }

    fn line(&self, variant: &ProductVariant, quantity: i32) -> OrderLineInfo {
        self.order(variant, quantity).1
    }

    fn total_allocated(&self) -> i32 {
        self.store.allocations().iter().map(|a| a.quantity_allocated).sum()
    }
}

fn shortage(err: StockError) -> InsufficientStock {
    match err {
        StockError::InsufficientStock(err) => err,
        other => panic!("expected insufficient stock, got {other:?}"),
    }
}

#[tokio::test]
async fn check_then_allocate_then_overallocate() {
    let h = Harness::new();
    let variant = ProductVariant::tracked(ProductId::new());
    let stock = h.store.seed_stock(Stock::new(h.w1, variant.id, 10));

    h.availability()
        .check_stock_quantity(&variant, Some(&h.country), h.channel.id, 5)
        .await
        .unwrap();

    let first = h.line(&variant, 5);
    h.allocator
        .allocate_stocks(&[first.clone()], Some(&h.country), &h.channel)
        .await
        .unwrap();
    let rows = h.store.allocations();
    assert_eq!(rows.len(), 1);
    assert_eq!((rows[0].stock_id, rows[0].quantity_allocated), (stock.id, 5));

    let err = shortage(
        h.allocator
            .allocate_stocks(&[h.line(&variant, 6)], Some(&h.country), &h.channel)
            .await
            .unwrap_err(),
    );
    assert_eq!(err.items.len(), 1);
    assert_eq!(err.items[0].available_quantity, 5);
    assert_eq!(err.items[0].requested_quantity, 6);
    assert_eq!(h.total_allocated(), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_allocations_never_oversell() {
    let h = Harness::new();
    let variant = ProductVariant::tracked(ProductId::new());
    h.store.seed_stock(Stock::new(h.w1, variant.id, 10));

    let mut handles = Vec::new();
    for _ in 0..2 {
        let allocator = Arc::clone(&h.allocator);
        let channel = h.channel.clone();
        let line = h.line(&variant, 6);
        handles.push(tokio::spawn(async move {
            allocator.allocate_stocks(&[line], None, &channel).await
        }));
    }

    let mut succeeded = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => succeeded += 1,
            Err(err) => assert_eq!(shortage(err).items[0].available_quantity, 4),
        }
    }
    assert_eq!(succeeded, 1);
    assert_eq!(h.total_allocated(), 6);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_single_unit_allocations_fill_the_stock_exactly() {
    let h = Harness::new();
    let variant = ProductVariant::tracked(ProductId::new());
    h.store.seed_stock(Stock::new(h.w1, variant.id, 10));

    let handles: Vec<_> = (0..20)
        .map(|_| {
            let allocator = Arc::clone(&h.allocator);
            let channel = h.channel.clone();
            let line = h.line(&variant, 1);
            tokio::spawn(async move { allocator.allocate_stocks(&[line], None, &channel).await })
        })
        .collect();

    let mut succeeded = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            succeeded += 1;
        }
    }
    assert_eq!(succeeded, 10);
    assert_eq!(h.total_allocated(), 10);
}

#[tokio::test]
async fn batch_allocation_is_all_or_nothing() {
    let h = Harness::new();
    let product = ProductId::new();
    let plenty = ProductVariant::tracked(product);
    let scarce = ProductVariant::tracked(product);
    h.store.seed_stock(Stock::new(h.w1, plenty.id, 5));
    h.store.seed_stock(Stock::new(h.w1, scarce.id, 1));

    let scarce_line = h.line(&scarce, 2);
    let err = shortage(
        h.allocator
            .allocate_stocks(&[h.line(&plenty, 3), scarce_line.clone()], None, &h.channel)
            .await
            .unwrap_err(),
    );

    assert_eq!(err.variant_ids(), vec![scarce.id]);
    assert_eq!(err.items[0].order_line_id, Some(scarce_line.order_line_id()));
    assert_eq!(err.items[0].available_quantity, 1);
    assert!(h.store.allocations().is_empty());
}

#[tokio::test]
async fn deallocate_then_reallocate_restores_the_split() {
    let h = Harness::new();
    let variant = ProductVariant::tracked(ProductId::new());
    h.store.seed_stock(Stock::new(h.w1, variant.id, 3));
    h.store.seed_stock(Stock::new(h.w2, variant.id, 10));
    let line = h.line(&variant, 5);

    let split = |store: &InMemoryStockStore| {
        let mut rows: Vec<_> = store
            .allocations()
            .into_iter()
            .map(|a| (a.stock_id, a.quantity_allocated))
            .collect();
        rows.sort();
        rows
    };

    let available = h.availability();
    let stocks = h.store.stocks();
    assert_eq!(available.get_available_quantity(&stocks).await.unwrap(), 13);

    h.allocator.allocate_stocks(&[line.clone()], None, &h.channel).await.unwrap();
    let original = split(&h.store);
    assert_eq!(available.get_available_quantity(&stocks).await.unwrap(), 8);

    h.allocator.decrease_allocations(&[line.clone()]).await.unwrap();
    assert!(h.store.allocations().is_empty());
    assert_eq!(available.get_available_quantity(&stocks).await.unwrap(), 13);

    h.allocator.allocate_stocks(&[line], None, &h.channel).await.unwrap();
    assert_eq!(split(&h.store), original);
}

#[tokio::test]
async fn timed_out_operation_rolls_back_and_frees_its_locks() {
    let h = Harness::with_store(InMemoryStockStore::with_latency(Duration::from_millis(40)));
    let variant = ProductVariant::tracked(ProductId::new());
    h.store.seed_stock(Stock::new(h.w1, variant.id, 10));

    let hurried = Allocator::new(h.store.clone(), Arc::clone(&h.directory))
        .with_timeout(Some(Duration::from_millis(100)));
    let err = hurried
        .allocate_stocks(&[h.line(&variant, 4)], None, &h.channel)
        .await
        .unwrap_err();
    assert!(err.reference().is_some());
    assert!(h.store.allocations().is_empty());

    // Nothing stays locked behind the abandoned transaction.
    h.allocator
        .allocate_stocks(&[h.line(&variant, 4)], None, &h.channel)
        .await
        .unwrap();
    assert_eq!(h.total_allocated(), 4);
}

#[tokio::test]
async fn reservation_reports_stock_and_preorder_shortages_together() {
    let h = Harness::new();
    let product = ProductId::new();
    let tracked = ProductVariant::tracked(product);
    let preorder = ProductVariant::tracked(product).with_preorder(PreorderSettings {
        global_threshold: Some(10),
        end_date: None,
    });
    h.store.seed_stock(Stock::new(h.w1, tracked.id, 1));
    h.store
        .seed_listing(VariantChannelListing::new(preorder.id, h.channel.id).with_threshold(2));

    let err = shortage(
        h.allocator
            .reserve_order_lines(
                &[h.line(&tracked, 2), h.line(&preorder, 3)],
                Some(&h.country),
                &h.channel,
            )
            .await
            .unwrap_err(),
    );
    let mut failed = err.variant_ids();
    failed.sort();
    let mut expected = vec![tracked.id, preorder.id];
    expected.sort();
    assert_eq!(failed, expected);
    assert!(h.store.allocations().is_empty());
    assert!(h.store.preorder_allocations().is_empty());

    let reservation = h
        .allocator
        .reserve_order_lines(
            &[h.line(&tracked, 1), h.line(&preorder, 2)],
            Some(&h.country),
            &h.channel,
        )
        .await
        .unwrap();
    assert_eq!(reservation.allocations.len(), 1);
    assert_eq!(reservation.preorder_allocations.len(), 1);

    // The channel threshold is used up now.
    assert!(
        h.allocator
            .allocate_preorders(&[h.line(&preorder, 1)], &h.channel)
            .await
            .is_err()
    );
}

#[tokio::test]
async fn fulfillment_ships_stock_and_drives_order_status() {
    let h = Harness::new();
    let variant = ProductVariant::tracked(ProductId::new());
    let stock = h.store.seed_stock(Stock::new(h.w1, variant.id, 10));
    let (order, line) = h.order(&variant, 10);
    let orders = Arc::new(InMemoryOrderStore::new());
    orders.insert(order.clone());

    h.allocator
        .allocate_stocks(&[line.clone()], order.shipping_country.as_ref(), &h.channel)
        .await
        .unwrap();
    h.allocator
        .fulfill_order_lines(&[line.clone()], orders.as_ref(), false)
        .await
        .unwrap();

    assert!(h.store.allocations().is_empty());
    assert_eq!(h.store.stocks()[0].quantity(), 0);
    let shipped = orders.get_order(order.id).await.unwrap().unwrap();
    assert_eq!(shipped.line(line.order_line_id()).unwrap().quantity_fulfilled, 10);

    let fulfillments = Arc::new(InMemoryFulfillmentStore::new());
    let sent = Fulfillment::new(order.id, FulfillmentStatus::Fulfilled, 1);
    let returned = Fulfillment::new(order.id, FulfillmentStatus::Returned, 2);
    fulfillments.insert(
        sent.clone(),
        vec![FulfillmentLine::new(sent.id, line.order_line_id(), 10).from_stock(stock.id)],
    );
    fulfillments.insert(
        returned.clone(),
        vec![FulfillmentLine::new(returned.id, line.order_line_id(), 3)],
    );

    let reconciler = FulfillmentReconciler::new(Arc::clone(&orders), fulfillments);
    let totals = reconciler.calculate_quantity_including_returns(&shipped).await.unwrap();
    assert_eq!((totals.total, totals.fulfilled, totals.returned), (10, 10, 3));
    assert_eq!(
        reconciler.update_order_status(&shipped).await.unwrap(),
        OrderStatus::PartiallyReturned
    );
    assert_eq!(
        orders.get_order(order.id).await.unwrap().unwrap().status,
        OrderStatus::PartiallyReturned
    );

    // Returned goods go back on the shelf.
    h.allocator
        .increase_stock(&line.line, h.w1, 3, false)
        .await
        .unwrap();
    assert_eq!(h.store.stocks()[0].quantity(), 3);
}

#[tokio::test]
async fn failed_fulfillment_bookkeeping_leaves_stock_untouched() {
    let h = Harness::new();
    let variant = ProductVariant::tracked(ProductId::new());
    h.store.seed_stock(Stock::new(h.w1, variant.id, 10));
    let line = h.line(&variant, 4);
    h.allocator.allocate_stocks(&[line.clone()], None, &h.channel).await.unwrap();

    // The order was never stored, so recording the fulfilled quantity fails.
    let orders = InMemoryOrderStore::new();
    let err = h
        .allocator
        .fulfill_order_lines(&[line], &orders, false)
        .await
        .unwrap_err();

    assert!(err.insufficient_stock().is_none());
    assert_eq!(h.store.stocks()[0].quantity(), 10);
    assert_eq!(h.total_allocated(), 4);
}

#[tokio::test]
async fn one_rejected_line_keeps_every_order_line_unfulfilled() {
    let h = Harness::new();
    let variant = ProductVariant::tracked(ProductId::new());
    h.store.seed_stock(Stock::new(h.w1, variant.id, 10));
    let (stored, first) = h.order(&variant, 4);
    let second = h.line(&variant, 2);
    h.allocator
        .allocate_stocks(&[first.clone(), second.clone()], None, &h.channel)
        .await
        .unwrap();

    // Only the first line's order is known to the order store.
    let orders = InMemoryOrderStore::new();
    orders.insert(stored.clone());
    let err = h
        .allocator
        .fulfill_order_lines(&[first.clone(), second], &orders, false)
        .await
        .unwrap_err();

    assert!(err.insufficient_stock().is_none());
    assert_eq!(h.store.stocks()[0].quantity(), 10);
    assert_eq!(h.total_allocated(), 6);
    let order = orders.get_order(stored.id).await.unwrap().unwrap();
    assert_eq!(order.line(first.order_line_id()).unwrap().quantity_fulfilled, 0);
}
