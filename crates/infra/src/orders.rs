//! Order and fulfillment records consumed by the stock services.
//!
//! Orders are owned elsewhere; these traits cover only what fulfillment and
//! status reconciliation need to read and write.

use std::collections::hash_map::{Entry, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use stockroom_core::{FulfillmentId, OrderId, OrderLineId};
use stockroom_orders::{Fulfillment, FulfillmentLine, Order, OrderStatus};

use crate::store::StoreError;

#[async_trait::async_trait]
pub trait OrderStore: Send + Sync {
    async fn get_order(&self, order_id: OrderId) -> Result<Option<Order>, StoreError>;

    async fn save_status(&self, order_id: OrderId, status: OrderStatus) -> Result<(), StoreError>;

    /// Add each `(line, quantity)` to the line's fulfilled quantity, all or
    /// nothing: if any result falls outside `0..=line.quantity`, or a line
    /// is unknown, no line is changed.
    async fn add_quantities_fulfilled(&self, quantities: &[(OrderLineId, i32)]) -> Result<(), StoreError>;
}

#[async_trait::async_trait]
pub trait FulfillmentStore: Send + Sync {
    async fn fulfillments_for_order(&self, order_id: OrderId) -> Result<Vec<Fulfillment>, StoreError>;

    async fn fulfillment_lines(&self, fulfillment_id: FulfillmentId) -> Result<Vec<FulfillmentLine>, StoreError>;
}

#[async_trait::async_trait]
impl<S> OrderStore for Arc<S>
where
    S: OrderStore + ?Sized,
{
    async fn get_order(&self, order_id: OrderId) -> Result<Option<Order>, StoreError> {
        (**self).get_order(order_id).await
    }

    async fn save_status(&self, order_id: OrderId, status: OrderStatus) -> Result<(), StoreError> {
        (**self).save_status(order_id, status).await
    }

    async fn add_quantities_fulfilled(&self, quantities: &[(OrderLineId, i32)]) -> Result<(), StoreError> {
        (**self).add_quantities_fulfilled(quantities).await
    }
}

#[async_trait::async_trait]
impl<S> FulfillmentStore for Arc<S>
where
    S: FulfillmentStore + ?Sized,
{
    async fn fulfillments_for_order(&self, order_id: OrderId) -> Result<Vec<Fulfillment>, StoreError> {
        (**self).fulfillments_for_order(order_id).await
    }

    async fn fulfillment_lines(&self, fulfillment_id: FulfillmentId) -> Result<Vec<FulfillmentLine>, StoreError> {
        (**self).fulfillment_lines(fulfillment_id).await
    }
}

/// In-memory order store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryOrderStore {
    orders: RwLock<HashMap<OrderId, Order>>,
    status_writes: AtomicUsize,
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, order: Order) {
        self.orders
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(order.id, order);
    }

    /// Number of `save_status` calls so far.
    pub fn status_writes(&self) -> usize {
        self.status_writes.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn get_order(&self, order_id: OrderId) -> Result<Option<Order>, StoreError> {
        let orders = self.orders.read().unwrap_or_else(PoisonError::into_inner);
        Ok(orders.get(&order_id).cloned())
    }

    async fn save_status(&self, order_id: OrderId, status: OrderStatus) -> Result<(), StoreError> {
        let mut orders = self.orders.write().unwrap_or_else(PoisonError::into_inner);
        let order = orders
            .get_mut(&order_id)
            .ok_or_else(|| StoreError::Constraint(format!("order {order_id} does not exist")))?;
        order.status = status;
        self.status_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn add_quantities_fulfilled(&self, quantities: &[(OrderLineId, i32)]) -> Result<(), StoreError> {
        let mut orders = self.orders.write().unwrap_or_else(PoisonError::into_inner);

        // Apply to copies; nothing is stored unless every line succeeds.
        let mut touched: HashMap<OrderId, Order> = HashMap::new();
        for &(line_id, quantity) in quantities {
            let order_id = touched
                .values()
                .chain(orders.values())
                .find(|o| o.line(line_id).is_some())
                .map(|o| o.id)
                .ok_or_else(|| StoreError::Constraint(format!("order line {line_id} does not exist")))?;
            let order = match touched.entry(order_id) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => match orders.get(&order_id) {
                    Some(stored) => entry.insert(stored.clone()),
                    None => return Err(StoreError::Constraint(format!("order {order_id} does not exist"))),
                },
            };
            order
                .add_quantity_fulfilled(line_id, quantity)
                .map_err(|err| StoreError::Constraint(err.to_string()))?;
        }

        orders.extend(touched);
        Ok(())
    }
}

/// In-memory fulfillment store for tests/dev.
///
/// `with_lookup_delay` makes every line lookup sleep, so concurrent
/// readers actually overlap.
#[derive(Debug, Default)]
pub struct InMemoryFulfillmentStore {
    fulfillments: RwLock<Vec<Fulfillment>>,
    lines: RwLock<HashMap<FulfillmentId, Vec<FulfillmentLine>>>,
    lookup_delay: Option<Duration>,
    line_lookups: AtomicUsize,
}

impl InMemoryFulfillmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lookup_delay(delay: Duration) -> Self {
        Self {
            lookup_delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn insert(&self, fulfillment: Fulfillment, lines: Vec<FulfillmentLine>) {
        self.lines
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(fulfillment.id, lines);
        self.fulfillments
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(fulfillment);
    }

    /// Number of `fulfillment_lines` calls so far.
    pub fn line_lookups(&self) -> usize {
        self.line_lookups.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl FulfillmentStore for InMemoryFulfillmentStore {
    async fn fulfillments_for_order(&self, order_id: OrderId) -> Result<Vec<Fulfillment>, StoreError> {
        let fulfillments = self.fulfillments.read().unwrap_or_else(PoisonError::into_inner);
        Ok(fulfillments.iter().filter(|f| f.order_id == order_id).cloned().collect())
    }

    async fn fulfillment_lines(&self, fulfillment_id: FulfillmentId) -> Result<Vec<FulfillmentLine>, StoreError> {
        self.line_lookups.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.lookup_delay {
            tokio::time::sleep(delay).await;
        }
        let lines = self.lines.read().unwrap_or_else(PoisonError::into_inner);
        Ok(lines.get(&fulfillment_id).cloned().unwrap_or_default())
    }
}
