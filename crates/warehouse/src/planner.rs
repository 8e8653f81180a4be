//! Allocation planning.
//!
//! The planners decide *what* to write given a locked snapshot of stocks,
//! listings and existing reservations. They perform no IO; the infra layer
//! owns locking and persistence.

use std::cmp::Reverse;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use stockroom_core::{ChannelId, ChannelListingId, OrderLineId, StockId, VariantId, WarehouseId};

use crate::availability::allocated_per_stock;
use crate::catalog::{ProductVariant, VariantChannelListing};
use crate::channel::AllocationStrategy;
use crate::error::{InsufficientStock, InsufficientStockItem};
use crate::stock::{Allocation, PreorderAllocation, Stock};

/// Reservation state of a single order line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LineAllocationState {
    Unallocated,
    PartiallyAllocated,
    FullyAllocated,
    Released,
}

impl LineAllocationState {
    pub fn from_quantities(required: i32, allocated: i32) -> Self {
        if allocated <= 0 {
            Self::Unallocated
        } else if allocated < required {
            Self::PartiallyAllocated
        } else {
            Self::FullyAllocated
        }
    }

    /// State after part of a line's reservation was given back.
    pub fn after_release(required: i32, remaining: i32) -> Self {
        if remaining <= 0 {
            Self::Released
        } else {
            Self::from_quantities(required, remaining)
        }
    }
}

/// One line asking for stock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineRequest {
    pub order_line_id: OrderLineId,
    pub variant_id: VariantId,
    pub quantity: i32,
    /// Warehouse tried first (collection point or the line's own warehouse).
    pub preferred_warehouse: Option<WarehouseId>,
}

/// Quantity to reserve from one stock for one line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedAllocation {
    pub order_line_id: OrderLineId,
    pub stock_id: StockId,
    pub quantity: i32,
}

/// Greedy, all-or-nothing stock allocation over a locked stock snapshot.
///
/// Candidate order per line is fully determined by the strategy, the
/// channel's warehouse order and stock ids, so identical inputs always give
/// the same split. Capacity taken by one line is visible to later lines.
#[derive(Debug, Clone)]
pub struct AllocationPlanner {
    strategy: AllocationStrategy,
    warehouse_rank: HashMap<WarehouseId, usize>,
    stocks_by_variant: HashMap<VariantId, Vec<Stock>>,
    allocated: HashMap<StockId, i32>,
    planned: Vec<PlannedAllocation>,
    shortfalls: Vec<InsufficientStockItem>,
}

impl AllocationPlanner {
    pub fn new(
        strategy: AllocationStrategy,
        warehouse_order: &[WarehouseId],
        mut stocks: Vec<Stock>,
        existing: &[Allocation],
    ) -> Self {
        stocks.sort_by_key(|s| s.id);

        let mut stocks_by_variant: HashMap<VariantId, Vec<Stock>> = HashMap::new();
        for stock in stocks {
            stocks_by_variant.entry(stock.variant_id).or_default().push(stock);
        }

        let warehouse_rank = warehouse_order
            .iter()
            .enumerate()
            .map(|(rank, id)| (*id, rank))
            .collect();

        Self {
            strategy,
            warehouse_rank,
            stocks_by_variant,
            allocated: allocated_per_stock(existing),
            planned: Vec::new(),
            shortfalls: Vec::new(),
        }
    }

    fn rank(&self, warehouse_id: WarehouseId) -> usize {
        self.warehouse_rank.get(&warehouse_id).copied().unwrap_or(usize::MAX)
    }

    /// Free quantity of a stock given everything allocated or planned so far.
    pub fn free(&self, stock: &Stock) -> i32 {
        stock.available(self.allocated_on(stock.id))
    }

    pub fn allocated_on(&self, stock_id: StockId) -> i32 {
        self.allocated.get(&stock_id).copied().unwrap_or(0)
    }

    /// Candidate stocks for a variant in consumption order.
    pub fn candidates(&self, variant_id: VariantId, preferred: Option<WarehouseId>) -> Vec<&Stock> {
        let mut candidates: Vec<&Stock> = self
            .stocks_by_variant
            .get(&variant_id)
            .map(|stocks| stocks.iter().collect())
            .unwrap_or_default();

        // Stable sorts: ties keep stock-id order.
        match self.strategy {
            AllocationStrategy::PrioritizeSortingOrder => {
                candidates.sort_by_key(|s| self.rank(s.warehouse_id));
            }
            AllocationStrategy::PrioritizeHighStock => {
                candidates.sort_by_key(|s| Reverse(self.free(s)));
            }
        }
        if let Some(preferred) = preferred {
            candidates.sort_by_key(|s| s.warehouse_id != preferred);
        }
        candidates
    }

    /// Plan one line. Returns `false` (and records a shortfall) when the line
    /// cannot be fully served; nothing is reserved for it in that case.
    pub fn plan_line(&mut self, request: &LineRequest) -> bool {
        if request.quantity <= 0 {
            return true;
        }

        let mut line_plan = Vec::new();
        let mut remaining = request.quantity;
        for stock in self.candidates(request.variant_id, request.preferred_warehouse) {
            if remaining == 0 {
                break;
            }
            let take = remaining.min(self.free(stock));
            if take > 0 {
                line_plan.push(PlannedAllocation {
                    order_line_id: request.order_line_id,
                    stock_id: stock.id,
                    quantity: take,
                });
                remaining -= take;
            }
        }

        if remaining > 0 {
            self.shortfalls.push(
                InsufficientStockItem::new(
                    request.variant_id,
                    request.quantity - remaining,
                    request.quantity,
                )
                .for_line(request.order_line_id)
                .in_warehouse(request.preferred_warehouse),
            );
            return false;
        }

        for planned in &line_plan {
            *self.allocated.entry(planned.stock_id).or_insert(0) += planned.quantity;
        }
        self.planned.extend(line_plan);
        true
    }

    /// All planned allocations, or every shortfall if any line failed.
    pub fn finish(self) -> Result<Vec<PlannedAllocation>, InsufficientStock> {
        InsufficientStock::check(self.shortfalls)?;
        Ok(self.planned)
    }
}

/// Fold planned quantities into allocation rows, growing an existing row when
/// the line already holds the same stock.
pub fn merge_planned(planned: &[PlannedAllocation], existing: &[Allocation]) -> Vec<Allocation> {
    let mut rows: Vec<Allocation> = Vec::new();
    for plan in planned {
        if let Some(row) = rows
            .iter_mut()
            .find(|r| r.order_line_id == plan.order_line_id && r.stock_id == plan.stock_id)
        {
            row.quantity_allocated += plan.quantity;
            continue;
        }
        let row = match existing
            .iter()
            .find(|a| a.order_line_id == plan.order_line_id && a.stock_id == plan.stock_id)
        {
            Some(current) => Allocation {
                quantity_allocated: current.quantity_allocated + plan.quantity,
                ..current.clone()
            },
            None => Allocation::new(plan.order_line_id, plan.stock_id, plan.quantity),
        };
        rows.push(row);
    }
    rows
}

/// Result of releasing quantity from one line's allocations.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Deallocation {
    /// Rows whose quantity changed (empty rows are to be deleted).
    pub changed: Vec<Allocation>,
    pub released: i32,
}

impl Deallocation {
    pub fn released_from(&self, stock_id: StockId, before: &[Allocation]) -> i32 {
        self.changed
            .iter()
            .filter(|a| a.stock_id == stock_id)
            .map(|a| {
                let prior = before
                    .iter()
                    .find(|b| b.id == a.id)
                    .map(|b| b.quantity_allocated)
                    .unwrap_or(0);
                prior - a.quantity_allocated
            })
            .sum()
    }
}

/// Release up to `quantity` from `allocations`, oldest first.
///
/// Releasing more than is allocated releases what exists; this is a
/// best-effort operation, not a failure.
pub fn plan_deallocation(allocations: &[Allocation], quantity: i32) -> Deallocation {
    let mut ordered: Vec<Allocation> = allocations.to_vec();
    ordered.sort_by_key(Allocation::age_key);

    let requested = quantity.max(0);
    let mut remaining = requested;
    let mut changed = Vec::new();
    for mut allocation in ordered {
        if remaining == 0 {
            break;
        }
        if allocation.is_empty() {
            continue;
        }
        remaining -= allocation.release(remaining);
        changed.push(allocation);
    }

    Deallocation {
        changed,
        released: requested - remaining,
    }
}

/// All-or-nothing preorder allocation against channel listings.
#[derive(Debug, Clone)]
pub struct PreorderPlanner {
    channel_id: ChannelId,
    listings_by_variant: HashMap<VariantId, Vec<VariantChannelListing>>,
    allocated: HashMap<ChannelListingId, i32>,
    planned: Vec<PreorderAllocation>,
    shortfalls: Vec<InsufficientStockItem>,
}

impl PreorderPlanner {
    /// `listings` must contain every channel listing of the involved variants
    /// (all channels), so global thresholds see the full picture.
    pub fn new(
        channel_id: ChannelId,
        listings: Vec<VariantChannelListing>,
        existing: &[PreorderAllocation],
    ) -> Self {
        let mut listings_by_variant: HashMap<VariantId, Vec<VariantChannelListing>> = HashMap::new();
        for listing in listings {
            listings_by_variant.entry(listing.variant_id).or_default().push(listing);
        }

        let mut allocated = HashMap::new();
        for allocation in existing {
            *allocated.entry(allocation.channel_listing_id).or_insert(0) += allocation.quantity;
        }

        Self {
            channel_id,
            listings_by_variant,
            allocated,
            planned: Vec::new(),
            shortfalls: Vec::new(),
        }
    }

    fn used(&self, listing: &VariantChannelListing) -> i32 {
        self.allocated.get(&listing.id).copied().unwrap_or(0) + listing.preorder_quantity_sold
    }

    /// Units still open for preorder of `variant` in this planner's channel.
    /// `None` means unlimited.
    pub fn remaining(&self, variant: &ProductVariant) -> Option<i32> {
        let listings = self.listings_by_variant.get(&variant.id)?;
        let listing = listings.iter().find(|l| l.channel_id == self.channel_id)?;

        let channel_free = listing
            .preorder_quantity_threshold
            .map(|threshold| threshold - self.used(listing));
        let global_free = variant
            .preorder_global_threshold()
            .map(|threshold| threshold - listings.iter().map(|l| self.used(l)).sum::<i32>());

        match (channel_free, global_free) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn plan_line(&mut self, order_line_id: OrderLineId, variant: &ProductVariant, quantity: i32) -> bool {
        if quantity <= 0 {
            return true;
        }

        let listing_id = self
            .listings_by_variant
            .get(&variant.id)
            .and_then(|ls| ls.iter().find(|l| l.channel_id == self.channel_id))
            .map(|l| l.id);
        let Some(listing_id) = listing_id else {
            self.shortfalls
                .push(InsufficientStockItem::new(variant.id, 0, quantity).for_line(order_line_id));
            return false;
        };

        if let Some(free) = self.remaining(variant) {
            if quantity > free {
                self.shortfalls
                    .push(InsufficientStockItem::new(variant.id, free, quantity).for_line(order_line_id));
                return false;
            }
        }

        *self.allocated.entry(listing_id).or_insert(0) += quantity;
        self.planned
            .push(PreorderAllocation::new(order_line_id, listing_id, quantity));
        true
    }

    pub fn finish(self) -> Result<Vec<PreorderAllocation>, InsufficientStock> {
        InsufficientStock::check(self.shortfalls)?;
        Ok(self.planned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use proptest::prelude::*;
    use stockroom_core::ProductId;

    use crate::catalog::PreorderSettings;

    fn request(variant_id: VariantId, quantity: i32) -> LineRequest {
        LineRequest {
            order_line_id: OrderLineId::new(),
            variant_id,
            quantity,
            preferred_warehouse: None,
        }
    }

    #[test]
    fn fills_a_line_from_one_stock_when_possible() {
        let variant = VariantId::new();
        let w1 = WarehouseId::new();
        let stock = Stock::new(w1, variant, 10);

        let mut planner = AllocationPlanner::new(
            AllocationStrategy::PrioritizeSortingOrder,
            &[w1],
            vec![stock.clone()],
            &[],
        );
        let line = request(variant, 5);
        assert!(planner.plan_line(&line));

        let planned = planner.finish().unwrap();
        assert_eq!(
            planned,
            vec![PlannedAllocation {
                order_line_id: line.order_line_id,
                stock_id: stock.id,
                quantity: 5
            }]
        );
    }

    #[test]
    fn follows_channel_warehouse_order_then_spills_over() {
        let variant = VariantId::new();
        let (w1, w2) = (WarehouseId::new(), WarehouseId::new());
        let s1 = Stock::new(w1, variant, 3);
        let s2 = Stock::new(w2, variant, 10);

        // w2 is the channel's first warehouse.
        let mut planner = AllocationPlanner::new(
            AllocationStrategy::PrioritizeSortingOrder,
            &[w2, w1],
            vec![s1.clone(), s2.clone()],
            &[Allocation::new(OrderLineId::new(), s2.id, 8)],
        );
        assert!(planner.plan_line(&request(variant, 4)));

        let planned = planner.finish().unwrap();
        assert_eq!(planned.len(), 2);
        assert_eq!((planned[0].stock_id, planned[0].quantity), (s2.id, 2));
        assert_eq!((planned[1].stock_id, planned[1].quantity), (s1.id, 2));
    }

    #[test]
    fn high_stock_strategy_prefers_most_free_quantity() {
        let variant = VariantId::new();
        let (w1, w2) = (WarehouseId::new(), WarehouseId::new());
        let small = Stock::new(w1, variant, 4);
        let large = Stock::new(w2, variant, 9);

        let mut planner = AllocationPlanner::new(
            AllocationStrategy::PrioritizeHighStock,
            &[w1, w2],
            vec![small, large.clone()],
            &[],
        );
        assert!(planner.plan_line(&request(variant, 3)));
        let planned = planner.finish().unwrap();
        assert_eq!(planned[0].stock_id, large.id);
    }

    #[test]
    fn preferred_warehouse_goes_first() {
        let variant = VariantId::new();
        let (w1, w2) = (WarehouseId::new(), WarehouseId::new());
        let s1 = Stock::new(w1, variant, 10);
        let s2 = Stock::new(w2, variant, 10);

        let mut planner = AllocationPlanner::new(
            AllocationStrategy::PrioritizeSortingOrder,
            &[w1, w2],
            vec![s1, s2.clone()],
            &[],
        );
        let mut line = request(variant, 2);
        line.preferred_warehouse = Some(w2);
        assert!(planner.plan_line(&line));
        assert_eq!(planner.finish().unwrap()[0].stock_id, s2.id);
    }

    #[test]
    fn later_lines_see_capacity_taken_by_earlier_lines() {
        let variant = VariantId::new();
        let w1 = WarehouseId::new();
        let stock = Stock::new(w1, variant, 10);

        let mut planner = AllocationPlanner::new(
            AllocationStrategy::PrioritizeSortingOrder,
            &[w1],
            vec![stock],
            &[],
        );
        assert!(planner.plan_line(&request(variant, 6)));
        assert!(!planner.plan_line(&request(variant, 6)));

        let err = planner.finish().unwrap_err();
        assert_eq!(err.items.len(), 1);
        assert_eq!(err.items[0].available_quantity, 4);
        assert_eq!(err.items[0].requested_quantity, 6);
    }

    #[test]
    fn reports_every_failing_line() {
        let (v1, v2, v3) = (VariantId::new(), VariantId::new(), VariantId::new());
        let w1 = WarehouseId::new();
        let stocks = vec![Stock::new(w1, v1, 1), Stock::new(w1, v2, 5)];

        let mut planner =
            AllocationPlanner::new(AllocationStrategy::PrioritizeSortingOrder, &[w1], stocks, &[]);
        planner.plan_line(&request(v1, 2));
        planner.plan_line(&request(v2, 5));
        planner.plan_line(&request(v3, 1));

        let err = planner.finish().unwrap_err();
        assert_eq!(err.variant_ids(), vec![v1, v3]);
        assert_eq!(err.items[1].available_quantity, 0);
    }

    #[test]
    fn merge_grows_existing_rows_for_the_same_line_and_stock() {
        let line = OrderLineId::new();
        let stock = StockId::new();
        let existing = vec![Allocation::new(line, stock, 2)];
        let planned = vec![PlannedAllocation {
            order_line_id: line,
            stock_id: stock,
            quantity: 3,
        }];

        let rows = merge_planned(&planned, &existing);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, existing[0].id);
        assert_eq!(rows[0].quantity_allocated, 5);
    }

    #[test]
    fn deallocation_releases_oldest_first_and_is_best_effort() {
        let line = OrderLineId::new();
        let now = Utc::now();
        let mut newer = Allocation::new(line, StockId::new(), 4);
        newer.created_at = now;
        let mut older = Allocation::new(line, StockId::new(), 2);
        older.created_at = now - Duration::minutes(5);

        let plan = plan_deallocation(&[newer.clone(), older.clone()], 3);
        assert_eq!(plan.released, 3);
        assert_eq!(plan.changed[0].id, older.id);
        assert!(plan.changed[0].is_empty());
        assert_eq!(plan.changed[1].quantity_allocated, 3);
        assert_eq!(plan.released_from(newer.stock_id, &[newer.clone(), older.clone()]), 1);

        let over = plan_deallocation(&[newer, older], 50);
        assert_eq!(over.released, 6);
        assert!(over.changed.iter().all(Allocation::is_empty));
    }

    #[test]
    fn line_state_transitions() {
        assert_eq!(LineAllocationState::from_quantities(5, 0), LineAllocationState::Unallocated);
        assert_eq!(LineAllocationState::from_quantities(5, 2), LineAllocationState::PartiallyAllocated);
        assert_eq!(LineAllocationState::from_quantities(5, 5), LineAllocationState::FullyAllocated);
        assert_eq!(LineAllocationState::after_release(5, 0), LineAllocationState::Released);
        assert_eq!(LineAllocationState::after_release(5, 1), LineAllocationState::PartiallyAllocated);
    }

    fn preorder_variant(global: Option<i32>) -> ProductVariant {
        ProductVariant::tracked(ProductId::new()).with_preorder(PreorderSettings {
            global_threshold: global,
            end_date: None,
        })
    }

    #[test]
    fn preorder_respects_channel_threshold() {
        let channel = ChannelId::new();
        let variant = preorder_variant(None);
        let listing = VariantChannelListing::new(variant.id, channel).with_threshold(5);
        let existing = vec![PreorderAllocation::new(OrderLineId::new(), listing.id, 3)];

        let mut planner = PreorderPlanner::new(channel, vec![listing], &existing);
        assert_eq!(planner.remaining(&variant), Some(2));
        assert!(planner.plan_line(OrderLineId::new(), &variant, 2));
        assert!(!planner.plan_line(OrderLineId::new(), &variant, 1));

        let err = planner.finish().unwrap_err();
        assert_eq!(err.items[0].available_quantity, 0);
    }

    #[test]
    fn preorder_respects_global_threshold_across_channels() {
        let (ours, other) = (ChannelId::new(), ChannelId::new());
        let variant = preorder_variant(Some(10));
        let our_listing = VariantChannelListing::new(variant.id, ours);
        let mut other_listing = VariantChannelListing::new(variant.id, other);
        other_listing.preorder_quantity_sold = 4;
        let existing = vec![PreorderAllocation::new(OrderLineId::new(), other_listing.id, 3)];

        let mut planner = PreorderPlanner::new(ours, vec![our_listing, other_listing], &existing);
        assert_eq!(planner.remaining(&variant), Some(3));
        assert!(!planner.plan_line(OrderLineId::new(), &variant, 4));
        let err = planner.finish().unwrap_err();
        assert_eq!(err.items[0].available_quantity, 3);
    }

    #[test]
    fn preorder_without_channel_listing_is_unavailable() {
        let variant = preorder_variant(None);
        let mut planner = PreorderPlanner::new(ChannelId::new(), vec![], &[]);
        assert!(!planner.plan_line(OrderLineId::new(), &variant, 1));
        assert_eq!(planner.finish().unwrap_err().items[0].available_quantity, 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: a plan never reserves more than a stock's free quantity,
        /// and a successful line is always served in full.
        #[test]
        fn plan_never_oversells(
            quantities in prop::collection::vec(0i32..20, 1..5),
            pre_allocated in prop::collection::vec(0i32..10, 0..5),
            requests in prop::collection::vec(1i32..15, 1..6),
            high_stock in any::<bool>(),
        ) {
            let variant = VariantId::new();
            let warehouses: Vec<WarehouseId> = quantities.iter().map(|_| WarehouseId::new()).collect();
            let stocks: Vec<Stock> = quantities
                .iter()
                .zip(&warehouses)
                .map(|(q, w)| Stock::new(*w, variant, *q))
                .collect();
            let existing: Vec<Allocation> = pre_allocated
                .iter()
                .enumerate()
                .filter_map(|(i, q)| {
                    let stock = &stocks[i % stocks.len()];
                    let q = (*q).min(stock.quantity());
                    (q > 0).then(|| Allocation::new(OrderLineId::new(), stock.id, q))
                })
                .filter({
                    let mut used: HashMap<StockId, i32> = HashMap::new();
                    let caps: HashMap<StockId, i32> = stocks.iter().map(|s| (s.id, s.quantity())).collect();
                    move |a: &Allocation| {
                        let entry = used.entry(a.stock_id).or_insert(0);
                        if *entry + a.quantity_allocated <= caps[&a.stock_id] {
                            *entry += a.quantity_allocated;
                            true
                        } else {
                            false
                        }
                    }
                })
                .collect();

            let strategy = if high_stock {
                AllocationStrategy::PrioritizeHighStock
            } else {
                AllocationStrategy::PrioritizeSortingOrder
            };
            let mut planner = AllocationPlanner::new(strategy, &warehouses, stocks.clone(), &existing);
            let mut served = Vec::new();
            for quantity in &requests {
                let line = request(variant, *quantity);
                if planner.plan_line(&line) {
                    served.push(line);
                }
            }

            let planned = match planner.finish() {
                Ok(planned) => planned,
                Err(_) => return Ok(()),
            };

            let mut totals = allocated_per_stock(&existing);
            for p in &planned {
                *totals.entry(p.stock_id).or_insert(0) += p.quantity;
            }
            for stock in &stocks {
                prop_assert!(totals.get(&stock.id).copied().unwrap_or(0) <= stock.quantity());
            }
            for line in &served {
                let got: i32 = planned
                    .iter()
                    .filter(|p| p.order_line_id == line.order_line_id)
                    .map(|p| p.quantity)
                    .sum();
                prop_assert_eq!(got, line.quantity);
            }
        }

        /// Property: the same inputs always produce the same split.
        #[test]
        fn plan_is_deterministic(
            quantities in prop::collection::vec(0i32..20, 1..5),
            wanted in 1i32..30,
        ) {
            let variant = VariantId::new();
            let warehouses: Vec<WarehouseId> = quantities.iter().map(|_| WarehouseId::new()).collect();
            let stocks: Vec<Stock> = quantities
                .iter()
                .zip(&warehouses)
                .map(|(q, w)| Stock::new(*w, variant, *q))
                .collect();
            let line = request(variant, wanted);

            let run = |stocks: Vec<Stock>| {
                let mut planner = AllocationPlanner::new(
                    AllocationStrategy::PrioritizeHighStock,
                    &warehouses,
                    stocks,
                    &[],
                );
                planner.plan_line(&line);
                planner.finish()
            };

            let mut reversed = stocks.clone();
            reversed.reverse();
            prop_assert_eq!(run(stocks), run(reversed));
        }
    }
}
