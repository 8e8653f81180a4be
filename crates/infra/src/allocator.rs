//! Reserving, releasing and shipping stock for order lines.
//!
//! ## Execution Flow
//!
//! ```text
//! begin transaction
//!   ↓
//! 1. Lock candidate stock rows (ascending id), then channel listings
//!   ↓
//! 2. Read allocations under those locks
//!   ↓
//! 3. Plan (pure, see `stockroom_warehouse::planner`)
//!   ↓
//! 4. Write rows, commit
//! ```
//!
//! Any failure before commit drops the transaction, which rolls back every
//! write of the operation. With a configured timeout, expiry drops the
//! operation future the same way and surfaces as a system error.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use stockroom_core::{AllocationId, CountryCode, OrderLineId, StockId, VariantId, WarehouseId};
use stockroom_orders::{OrderLine, OrderLineInfo};
use stockroom_warehouse::{
    merge_planned, plan_deallocation, Allocation, AllocationPlanner, Channel, InsufficientStock,
    InsufficientStockItem, LineAllocationState, LineRequest, PlannedAllocation, PreorderAllocation,
    PreorderPlanner, Stock,
};

use crate::directory::WarehouseDirectory;
use crate::error::{StockError, StockResult, SystemContext};
use crate::orders::OrderStore;
use crate::store::{AllocationFilter, PreorderAllocationFilter, StockFilter, StockStore, StockTransaction};

/// What a release or shipment did to one line's reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineRelease {
    pub order_line_id: OrderLineId,
    pub released: i32,
    pub state: LineAllocationState,
}

/// Rows written by [`Allocator::reserve_order_lines`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub allocations: Vec<PlannedAllocation>,
    pub preorder_allocations: Vec<PreorderAllocation>,
}

fn unique_variants<'a>(lines: impl IntoIterator<Item = &'a OrderLineInfo>) -> Vec<VariantId> {
    lines
        .into_iter()
        .map(|l| l.variant_id())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn log_shortage(err: InsufficientStock) -> StockError {
    warn!(variant_ids = ?err.variant_ids(), items = ?err.items, "insufficient stock");
    err.into()
}

/// Splits a merged result back into a shortage to carry on with, or a
/// failure to stop on.
fn shortage_or_fail<T>(result: StockResult<T>) -> StockResult<(Option<T>, Option<InsufficientStock>)> {
    match result {
        Ok(value) => Ok((Some(value), None)),
        Err(StockError::InsufficientStock(err)) => Ok((None, Some(err))),
        Err(err) => Err(err),
    }
}

pub struct Allocator<S, D> {
    store: S,
    directory: D,
    timeout: Option<Duration>,
}

impl<S, D> Allocator<S, D>
where
    S: StockStore,
    D: WarehouseDirectory,
{
    pub fn new(store: S, directory: D) -> Self {
        Self {
            store,
            directory,
            timeout: None,
        }
    }

    /// Bound every operation; on expiry the transaction is rolled back.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run<T>(&self, operation: &str, fut: impl Future<Output = StockResult<T>>) -> StockResult<T> {
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .system_context(&format!("{operation} timed out"))?,
            None => fut.await,
        }
    }

    async fn begin(&self) -> StockResult<Box<dyn StockTransaction>> {
        self.store.begin().await.system_context("begin stock transaction")
    }

    /// Channel warehouse order and the warehouses eligible for this call.
    ///
    /// Preferred warehouses (line pins, collection points) are eligible
    /// whenever they belong to the channel, regardless of shipping zones.
    async fn warehouses(
        &self,
        country: Option<&CountryCode>,
        channel: &Channel,
        preferred: &[WarehouseId],
    ) -> StockResult<(Vec<WarehouseId>, Vec<WarehouseId>)> {
        let channel_order = self
            .directory
            .channel_warehouses(channel.id)
            .await
            .system_context("load channel warehouses")?;

        let eligible = match country {
            Some(country) => {
                let shipping = self
                    .directory
                    .warehouses_shipping_to(country, channel.id)
                    .await
                    .system_context("load shipping warehouses")?;
                channel_order
                    .iter()
                    .copied()
                    .filter(|w| shipping.contains(w) || preferred.contains(w))
                    .collect()
            }
            None => channel_order.clone(),
        };
        Ok((channel_order, eligible))
    }

    /// Plan and stage allocations for `lines` inside `tx`.
    async fn allocate_in(
        &self,
        tx: &mut dyn StockTransaction,
        lines: &[&OrderLineInfo],
        country: Option<&CountryCode>,
        channel: &Channel,
        collection_point: Option<WarehouseId>,
    ) -> StockResult<Vec<PlannedAllocation>> {
        if lines.is_empty() {
            return Ok(Vec::new());
        }

        let preferred: Vec<WarehouseId> = lines
            .iter()
            .filter_map(|l| l.warehouse_id)
            .chain(collection_point)
            .collect();
        let (channel_order, eligible) = self.warehouses(country, channel, &preferred).await?;

        let filter = StockFilter::for_variants(unique_variants(lines.iter().copied())).in_warehouses(eligible);
        let stocks = tx.lock_stocks(&filter).await.system_context("lock stocks")?;
        let existing = if stocks.is_empty() {
            Vec::new()
        } else {
            tx.filter_allocations(&AllocationFilter::on_stocks(stocks.iter().map(|s| s.id)))
                .await
                .system_context("load allocations")?
        };

        let mut planner = AllocationPlanner::new(channel.allocation_strategy, &channel_order, stocks, &existing);
        for line in lines {
            planner.plan_line(&LineRequest {
                order_line_id: line.order_line_id(),
                variant_id: line.variant_id(),
                quantity: line.quantity,
                preferred_warehouse: line.warehouse_id.or(collection_point),
            });
        }
        let planned = planner.finish().map_err(log_shortage)?;

        tx.upsert_allocations(merge_planned(&planned, &existing))
            .await
            .system_context("write allocations")?;
        Ok(planned)
    }

    /// Plan and stage preorder allocations for `lines` inside `tx`.
    async fn allocate_preorders_in(
        &self,
        tx: &mut dyn StockTransaction,
        lines: &[&OrderLineInfo],
        channel: &Channel,
    ) -> StockResult<Vec<PreorderAllocation>> {
        if lines.is_empty() {
            return Ok(Vec::new());
        }

        let listings = tx
            .lock_channel_listings(&unique_variants(lines.iter().copied()))
            .await
            .system_context("lock channel listings")?;
        let existing = tx
            .filter_preorder_allocations(&PreorderAllocationFilter::on_listings(listings.iter().map(|l| l.id)))
            .await
            .system_context("load preorder allocations")?;

        let mut planner = PreorderPlanner::new(channel.id, listings, &existing);
        for line in lines {
            planner.plan_line(line.order_line_id(), &line.variant, line.quantity);
        }
        let planned = planner.finish().map_err(log_shortage)?;

        let rows = planned
            .iter()
            .map(|p| {
                match existing
                    .iter()
                    .find(|e| e.order_line_id == p.order_line_id && e.channel_listing_id == p.channel_listing_id)
                {
                    Some(current) => PreorderAllocation {
                        quantity: current.quantity + p.quantity,
                        ..current.clone()
                    },
                    None => p.clone(),
                }
            })
            .collect();
        tx.upsert_preorder_allocations(rows)
            .await
            .system_context("write preorder allocations")?;
        Ok(planned)
    }

    /// Release allocations of `lines` (oldest first) and, with
    /// `update_stocks`, take the shipped quantity off the stocks.
    async fn decrease_in(
        &self,
        tx: &mut dyn StockTransaction,
        lines: &[&OrderLineInfo],
        update_stocks: bool,
        allow_stock_to_be_exceeded: bool,
    ) -> StockResult<Vec<LineRelease>> {
        let lines: Vec<&OrderLineInfo> = lines.iter().copied().filter(|l| l.quantity > 0).collect();
        if lines.is_empty() {
            return Ok(Vec::new());
        }

        let stocks = tx
            .lock_stocks(&StockFilter::for_variants(unique_variants(lines.iter().copied())))
            .await
            .system_context("lock stocks")?;
        let mut stocks: BTreeMap<StockId, Stock> = stocks.into_iter().map(|s| (s.id, s)).collect();
        let mut ledger: BTreeMap<AllocationId, Allocation> = if stocks.is_empty() {
            BTreeMap::new()
        } else {
            tx.filter_allocations(&AllocationFilter::on_stocks(stocks.keys().copied()))
                .await
                .system_context("load allocations")?
                .into_iter()
                .map(|a| (a.id, a))
                .collect()
        };

        let mut changed_allocations = BTreeSet::new();
        let mut changed_stocks = BTreeSet::new();
        let mut shortfalls = Vec::new();
        let mut releases = Vec::with_capacity(lines.len());

        for line in &lines {
            let line_id = line.order_line_id();
            let held: Vec<Allocation> = ledger
                .values()
                .filter(|a| a.order_line_id == line_id)
                .cloned()
                .collect();
            let plan = plan_deallocation(&held, line.quantity);
            for row in &plan.changed {
                changed_allocations.insert(row.id);
                ledger.insert(row.id, row.clone());
            }

            if update_stocks {
                match line.warehouse_id {
                    Some(warehouse_id) => {
                        let allocated_on = |stock_id: StockId| -> i32 {
                            ledger
                                .values()
                                .filter(|a| a.stock_id == stock_id)
                                .map(|a| a.quantity_allocated)
                                .sum()
                        };
                        let target = stocks
                            .values()
                            .find(|s| s.warehouse_id == warehouse_id && s.variant_id == line.variant_id())
                            .map(|s| (s.id, s.available(allocated_on(s.id))));
                        match target {
                            Some((stock_id, free)) if line.quantity <= free || allow_stock_to_be_exceeded => {
                                if let Some(stock) = stocks.get_mut(&stock_id) {
                                    stock.decrease_quantity(line.quantity);
                                    changed_stocks.insert(stock_id);
                                }
                            }
                            Some((_, free)) => shortfalls.push(
                                InsufficientStockItem::new(line.variant_id(), free.max(0), line.quantity)
                                    .for_line(line_id)
                                    .in_warehouse(Some(warehouse_id)),
                            ),
                            None if allow_stock_to_be_exceeded => {}
                            None => shortfalls.push(
                                InsufficientStockItem::new(line.variant_id(), 0, line.quantity)
                                    .for_line(line_id)
                                    .in_warehouse(Some(warehouse_id)),
                            ),
                        }
                    }
                    None => {
                        for (stock_id, stock) in stocks.iter_mut() {
                            let released = plan.released_from(*stock_id, &held);
                            if released > 0 {
                                stock.decrease_quantity(released);
                                changed_stocks.insert(*stock_id);
                            }
                        }
                        if plan.released < line.quantity && !allow_stock_to_be_exceeded {
                            shortfalls.push(
                                InsufficientStockItem::new(line.variant_id(), plan.released, line.quantity)
                                    .for_line(line_id),
                            );
                        }
                    }
                }
            }

            let remaining: i32 = ledger
                .values()
                .filter(|a| a.order_line_id == line_id)
                .map(|a| a.quantity_allocated)
                .sum();
            releases.push(LineRelease {
                order_line_id: line_id,
                released: plan.released,
                state: LineAllocationState::after_release(line.line.quantity_unfulfilled(), remaining),
            });
        }

        InsufficientStock::check(shortfalls).map_err(log_shortage)?;

        let (emptied, kept): (Vec<Allocation>, Vec<Allocation>) = changed_allocations
            .iter()
            .filter_map(|id| ledger.remove(id))
            .partition(Allocation::is_empty);
        tx.upsert_allocations(kept).await.system_context("write allocations")?;
        tx.delete_allocations(&emptied.iter().map(|a| a.id).collect::<Vec<_>>())
            .await
            .system_context("delete allocations")?;
        if !changed_stocks.is_empty() {
            let rows = changed_stocks.iter().filter_map(|id| stocks.remove(id)).collect();
            tx.upsert_stocks(rows).await.system_context("write stocks")?;
        }
        Ok(releases)
    }

    /// Reserve stock for every inventory-tracked line, all or nothing.
    pub async fn allocate_stocks(
        &self,
        lines: &[OrderLineInfo],
        country: Option<&CountryCode>,
        channel: &Channel,
    ) -> StockResult<Vec<PlannedAllocation>> {
        self.allocate_stocks_with(lines, country, channel, None).await
    }

    /// [`Allocator::allocate_stocks`], trying `collection_point` first.
    #[instrument(
        skip(self, lines, country, channel),
        fields(lines = lines.len(), channel_id = %channel.id),
        err
    )]
    pub async fn allocate_stocks_with(
        &self,
        lines: &[OrderLineInfo],
        country: Option<&CountryCode>,
        channel: &Channel,
        collection_point: Option<WarehouseId>,
    ) -> StockResult<Vec<PlannedAllocation>> {
        self.run("allocate_stocks", async {
            let tracked: Vec<&OrderLineInfo> = lines.iter().filter(|l| l.tracks_inventory()).collect();
            if tracked.is_empty() {
                return Ok(Vec::new());
            }

            let mut tx = self.begin().await?;
            let planned = self
                .allocate_in(tx.as_mut(), &tracked, country, channel, collection_point)
                .await?;
            tx.commit().await.system_context("commit allocations")?;

            info!(lines = tracked.len(), allocations = planned.len(), "stock allocated");
            Ok(planned)
        })
        .await
    }

    /// Reserve additional quantity for already allocated lines.
    /// `line.quantity` is the delta; `country` is the order's shipping
    /// country.
    #[instrument(skip(self, lines, country, channel), fields(lines = lines.len(), channel_id = %channel.id), err)]
    pub async fn increase_allocations(
        &self,
        lines: &[OrderLineInfo],
        country: Option<&CountryCode>,
        channel: &Channel,
    ) -> StockResult<Vec<PlannedAllocation>> {
        self.run("increase_allocations", async {
            let tracked: Vec<&OrderLineInfo> = lines
                .iter()
                .filter(|l| l.tracks_inventory() && l.quantity > 0)
                .collect();
            if tracked.is_empty() {
                return Ok(Vec::new());
            }

            let mut tx = self.begin().await?;
            let planned = self.allocate_in(tx.as_mut(), &tracked, country, channel, None).await?;
            tx.commit().await.system_context("commit allocations")?;

            info!(lines = tracked.len(), allocations = planned.len(), "allocations increased");
            Ok(planned)
        })
        .await
    }

    /// Shrink the allocations of inventory-tracked lines by `line.quantity`;
    /// stock quantities are untouched.
    pub async fn decrease_allocations(&self, lines: &[OrderLineInfo]) -> StockResult<Vec<LineRelease>> {
        self.decrease_stock_with(lines, false, false).await
    }

    /// Release `line.quantity` per line, oldest allocation first. With
    /// `update_stocks` the quantity also leaves the stock (goods shipped).
    pub async fn decrease_stock(&self, lines: &[OrderLineInfo], update_stocks: bool) -> StockResult<Vec<LineRelease>> {
        self.decrease_stock_with(lines, update_stocks, false).await
    }

    #[instrument(skip(self, lines), fields(lines = lines.len()), err)]
    pub async fn decrease_stock_with(
        &self,
        lines: &[OrderLineInfo],
        update_stocks: bool,
        allow_stock_to_be_exceeded: bool,
    ) -> StockResult<Vec<LineRelease>> {
        self.run("decrease_stock", async {
            let tracked: Vec<&OrderLineInfo> = lines.iter().filter(|l| l.tracks_inventory()).collect();
            if tracked.is_empty() {
                return Ok(Vec::new());
            }

            let mut tx = self.begin().await?;
            let releases = self
                .decrease_in(tx.as_mut(), &tracked, update_stocks, allow_stock_to_be_exceeded)
                .await?;
            tx.commit().await.system_context("commit deallocation")?;

            let released: i32 = releases.iter().map(|r| r.released).sum();
            info!(lines = tracked.len(), released, update_stocks, "stock released");
            Ok(releases)
        })
        .await
    }

    /// Reserve preorder quantity against channel listings for lines whose
    /// variant is currently in preorder, all or nothing.
    #[instrument(skip(self, lines, channel), fields(lines = lines.len(), channel_id = %channel.id), err)]
    pub async fn allocate_preorders(
        &self,
        lines: &[OrderLineInfo],
        channel: &Channel,
    ) -> StockResult<Vec<PreorderAllocation>> {
        self.run("allocate_preorders", async {
            let now = Utc::now();
            let preorders: Vec<&OrderLineInfo> = lines.iter().filter(|l| l.is_preorder(now)).collect();
            if preorders.is_empty() {
                return Ok(Vec::new());
            }

            let mut tx = self.begin().await?;
            let planned = self.allocate_preorders_in(tx.as_mut(), &preorders, channel).await?;
            tx.commit().await.system_context("commit preorder allocations")?;

            info!(lines = preorders.len(), "preorders allocated");
            Ok(planned)
        })
        .await
    }

    /// Reserve a whole order: preorder lines against listings, other tracked
    /// lines against stock, in one transaction. Shortages from both paths
    /// are reported together.
    #[instrument(skip(self, lines, country, channel), fields(lines = lines.len(), channel_id = %channel.id), err)]
    pub async fn reserve_order_lines(
        &self,
        lines: &[OrderLineInfo],
        country: Option<&CountryCode>,
        channel: &Channel,
    ) -> StockResult<Reservation> {
        self.run("reserve_order_lines", async {
            let now = Utc::now();
            let (preorders, regular): (Vec<&OrderLineInfo>, Vec<&OrderLineInfo>) =
                lines.iter().partition(|l| l.is_preorder(now));
            let tracked: Vec<&OrderLineInfo> = regular.into_iter().filter(|l| l.tracks_inventory()).collect();

            let mut tx = self.begin().await?;
            let (allocations, stock_shortage) =
                shortage_or_fail(self.allocate_in(tx.as_mut(), &tracked, country, channel, None).await)?;
            let (preorder_allocations, preorder_shortage) =
                shortage_or_fail(self.allocate_preorders_in(tx.as_mut(), &preorders, channel).await)?;

            let shortage = match (stock_shortage, preorder_shortage) {
                (None, None) => None,
                (Some(a), Some(b)) => Some(a.merge(b)),
                (Some(err), None) | (None, Some(err)) => Some(err),
            };
            if let Some(err) = shortage {
                tx.rollback().await.system_context("roll back reservation")?;
                return Err(err.into());
            }
            tx.commit().await.system_context("commit reservation")?;

            let reservation = Reservation {
                allocations: allocations.unwrap_or_default(),
                preorder_allocations: preorder_allocations.unwrap_or_default(),
            };
            info!(
                allocations = reservation.allocations.len(),
                preorder_allocations = reservation.preorder_allocations.len(),
                "order lines reserved"
            );
            Ok(reservation)
        })
        .await
    }

    /// Drop every stock and preorder reservation of `lines` (cancellation).
    #[instrument(skip(self, lines), fields(lines = lines.len()), err)]
    pub async fn release_order_lines(&self, lines: &[OrderLineInfo]) -> StockResult<Vec<LineRelease>> {
        self.run("release_order_lines", async {
            if lines.is_empty() {
                return Ok(Vec::new());
            }
            let line_ids: Vec<OrderLineId> = lines.iter().map(|l| l.order_line_id()).collect();
            let variant_ids = unique_variants(lines);

            let mut tx = self.begin().await?;
            tx.lock_stocks(&StockFilter::for_variants(variant_ids.clone()))
                .await
                .system_context("lock stocks")?;
            let allocations = tx
                .filter_allocations(&AllocationFilter::for_lines(line_ids.iter().copied()))
                .await
                .system_context("load allocations")?;
            tx.lock_channel_listings(&variant_ids)
                .await
                .system_context("lock channel listings")?;
            let preorders = tx
                .filter_preorder_allocations(&PreorderAllocationFilter::for_lines(line_ids.iter().copied()))
                .await
                .system_context("load preorder allocations")?;

            let mut released: HashMap<OrderLineId, i32> = HashMap::new();
            for a in &allocations {
                *released.entry(a.order_line_id).or_insert(0) += a.quantity_allocated;
            }
            for p in &preorders {
                *released.entry(p.order_line_id).or_insert(0) += p.quantity;
            }

            tx.delete_allocations(&allocations.iter().map(|a| a.id).collect::<Vec<_>>())
                .await
                .system_context("delete allocations")?;
            tx.delete_preorder_allocations(&preorders.iter().map(|p| p.id).collect::<Vec<_>>())
                .await
                .system_context("delete preorder allocations")?;
            tx.commit().await.system_context("commit release")?;

            info!(lines = line_ids.len(), "order lines released");
            Ok(line_ids
                .into_iter()
                .map(|order_line_id| LineRelease {
                    order_line_id,
                    released: released.get(&order_line_id).copied().unwrap_or(0),
                    state: LineAllocationState::Released,
                })
                .collect())
        })
        .await
    }

    /// Put `quantity` back into (or create) the stock of `line`'s variant in
    /// `warehouse_id`; with `allocate` the line's reservation grows with it.
    #[instrument(skip(self, line), fields(order_line_id = %line.id), err)]
    pub async fn increase_stock(
        &self,
        line: &OrderLine,
        warehouse_id: WarehouseId,
        quantity: i32,
        allocate: bool,
    ) -> StockResult<Stock> {
        if quantity <= 0 {
            return Err(StockError::system(
                "increase stock",
                anyhow::anyhow!("restock quantity must be positive, got {quantity}"),
            ));
        }
        self.run("increase_stock", async {
            let mut tx = self.begin().await?;
            let locked = tx
                .lock_stocks(&StockFilter::for_variants([line.variant_id]).in_warehouses([warehouse_id]))
                .await
                .system_context("lock stocks")?;

            let stock = match locked.into_iter().next() {
                Some(mut stock) => {
                    stock.increase_quantity(quantity);
                    stock
                }
                None => Stock::new(warehouse_id, line.variant_id, quantity),
            };
            let stock = tx
                .upsert_stocks(vec![stock])
                .await
                .system_context("write stock")?
                .into_iter()
                .next()
                .ok_or_else(|| StockError::system("write stock", anyhow::anyhow!("upsert returned no row")))?;

            if allocate {
                let existing = tx
                    .filter_allocations(&AllocationFilter {
                        order_line_ids: Some(vec![line.id]),
                        stock_ids: Some(vec![stock.id]),
                    })
                    .await
                    .system_context("load allocations")?;
                let row = match existing.into_iter().next() {
                    Some(mut current) => {
                        current.quantity_allocated += quantity;
                        current
                    }
                    None => Allocation::new(line.id, stock.id, quantity),
                };
                tx.upsert_allocations(vec![row]).await.system_context("write allocation")?;
            }
            tx.commit().await.system_context("commit restock")?;

            info!(stock_id = %stock.id, quantity = stock.quantity(), "stock increased");
            Ok(stock)
        })
        .await
    }

    /// Ship `lines`: release their allocations, take the quantity off the
    /// stocks and record it as fulfilled on the order, in one unit of work.
    /// Fulfilled quantities are recorded as one batch; if any line is
    /// rejected, nothing is written to either the orders or the stock ledger.
    #[instrument(skip(self, lines, orders), fields(lines = lines.len()), err)]
    pub async fn fulfill_order_lines<O>(
        &self,
        lines: &[OrderLineInfo],
        orders: &O,
        allow_stock_to_be_exceeded: bool,
    ) -> StockResult<Vec<LineRelease>>
    where
        O: OrderStore + ?Sized,
    {
        self.run("fulfill_order_lines", async {
            let tracked: Vec<&OrderLineInfo> = lines.iter().filter(|l| l.tracks_inventory()).collect();

            let mut tx = self.begin().await?;
            let releases = self
                .decrease_in(tx.as_mut(), &tracked, true, allow_stock_to_be_exceeded)
                .await?;
            let fulfilled: Vec<(OrderLineId, i32)> =
                lines.iter().map(|l| (l.order_line_id(), l.quantity)).collect();
            orders
                .add_quantities_fulfilled(&fulfilled)
                .await
                .system_context("record fulfilled quantities")?;
            tx.commit().await.system_context("commit fulfillment")?;

            info!(lines = lines.len(), "order lines fulfilled");
            Ok(releases)
        })
        .await
    }

    /// Reservation state of a line from the ledger (lock-free).
    #[instrument(skip(self, line), fields(order_line_id = %line.order_line_id()), err)]
    pub async fn line_allocation_state(&self, line: &OrderLineInfo) -> StockResult<LineAllocationState> {
        let line_ids = [line.order_line_id()];
        let allocated: i32 = self
            .store
            .filter_allocations(&AllocationFilter::for_lines(line_ids))
            .await
            .system_context("load allocations")?
            .iter()
            .map(|a| a.quantity_allocated)
            .sum();
        let preordered: i32 = self
            .store
            .filter_preorder_allocations(&PreorderAllocationFilter::for_lines(line_ids))
            .await
            .system_context("load preorder allocations")?
            .iter()
            .map(|p| p.quantity)
            .sum();

        Ok(LineAllocationState::from_quantities(
            line.line.quantity_unfulfilled(),
            allocated + preordered,
        ))
    }
}
