//! Order status reconciliation from fulfillment records.
//!
//! Return and replacement quantities are gathered concurrently: one worker per
//! returning fulfillment, each folding into a shared tally. Addition commutes,
//! so the result does not depend on worker completion order.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument};

use stockroom_orders::{resolve_order_status, Fulfillment, FulfillmentTotals, Order, OrderStatus, ReturnTally};

use crate::error::{StockResult, SystemContext};
use crate::orders::{FulfillmentStore, OrderStore};
use crate::store::StoreError;

pub struct FulfillmentReconciler<O, F: ?Sized> {
    orders: O,
    fulfillments: Arc<F>,
}

impl<O, F> FulfillmentReconciler<O, F>
where
    O: OrderStore,
    F: FulfillmentStore + ?Sized + 'static,
{
    pub fn new(orders: O, fulfillments: Arc<F>) -> Self {
        Self { orders, fulfillments }
    }

    async fn tally_returns(&self, fulfillments: Vec<Fulfillment>) -> StockResult<ReturnTally> {
        let tally = Arc::new(Mutex::new(ReturnTally::default()));
        let mut workers = JoinSet::new();

        for fulfillment in fulfillments {
            let Some(kind) = fulfillment.status.return_kind() else {
                continue;
            };
            let store = Arc::clone(&self.fulfillments);
            let tally = Arc::clone(&tally);
            workers.spawn(async move {
                let lines = store.fulfillment_lines(fulfillment.id).await?;
                let mut local = ReturnTally::default();
                for line in &lines {
                    local.add(kind, line.quantity);
                }
                tally.lock().await.merge(local);
                debug!(fulfillment_id = %fulfillment.id, lines = lines.len(), "fulfillment tallied");
                Ok::<(), StoreError>(())
            });
        }

        // Returning early drops the set, which aborts the remaining workers.
        while let Some(joined) = workers.join_next().await {
            joined
                .system_context("fulfillment worker failed")?
                .system_context("load fulfillment lines")?;
        }

        let tally = *tally.lock().await;
        Ok(tally)
    }

    /// `(total, fulfilled, returned)` of `order` with returned and replaced
    /// fulfillments folded in.
    #[instrument(skip(self, order), fields(order_id = %order.id), err)]
    pub async fn calculate_quantity_including_returns(&self, order: &Order) -> StockResult<FulfillmentTotals> {
        let fulfillments = self
            .fulfillments
            .fulfillments_for_order(order.id)
            .await
            .system_context("load fulfillments")?;
        let tally = self.tally_returns(fulfillments).await?;
        Ok(FulfillmentTotals::from_lines(&order.lines).including_returns(tally))
    }

    /// Recompute the status of `order`, persisting it only when it changed.
    #[instrument(skip(self, order), fields(order_id = %order.id, current = ?order.status), err)]
    pub async fn update_order_status(&self, order: &Order) -> StockResult<OrderStatus> {
        let fulfillments = self
            .fulfillments
            .fulfillments_for_order(order.id)
            .await
            .system_context("load fulfillments")?;
        let awaiting_approval = fulfillments.iter().any(|f| f.status.is_awaiting_approval());
        let tally = self.tally_returns(fulfillments).await?;
        let totals = FulfillmentTotals::from_lines(&order.lines).including_returns(tally);

        let status = resolve_order_status(order.status, totals, awaiting_approval);
        if status != order.status {
            self.orders
                .save_status(order.id, status)
                .await
                .system_context("save order status")?;
            info!(from = ?order.status, to = ?status, "order status changed");
        }
        Ok(status)
    }
}
