//! Availability arithmetic over stock and allocation rows.
//!
//! Pure functions: callers decide which rows are in scope and whether the
//! read is locked.

use std::collections::{HashMap, HashSet};

use stockroom_core::{StockId, VariantId};

use crate::stock::{Allocation, Stock};

/// Sum of `quantity_allocated` per stock.
pub fn allocated_per_stock(allocations: &[Allocation]) -> HashMap<StockId, i32> {
    let mut allocated = HashMap::new();
    for allocation in allocations {
        *allocated.entry(allocation.stock_id).or_insert(0) += allocation.quantity_allocated;
    }
    allocated
}

/// On-hand quantity of `stocks` minus everything allocated against them,
/// floored at zero.
///
/// Every stock row counts, even when two rows carry the same quantity.
/// Allocations referencing stocks outside `stocks` are ignored.
pub fn available_quantity(stocks: &[Stock], allocations: &[Allocation]) -> i32 {
    let in_scope: HashSet<StockId> = stocks.iter().map(|s| s.id).collect();
    let on_hand: i64 = stocks.iter().map(|s| i64::from(s.quantity())).sum();
    let allocated: i64 = allocations
        .iter()
        .filter(|a| in_scope.contains(&a.stock_id))
        .map(|a| i64::from(a.quantity_allocated))
        .sum();

    (on_hand - allocated).clamp(0, i64::from(i32::MAX)) as i32
}

/// Availability of one variant within a stock set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VariantAvailability {
    pub available: i32,
    pub stock_count: usize,
}

impl VariantAvailability {
    pub fn has_stock(&self) -> bool {
        self.stock_count > 0
    }
}

/// Group stocks by variant and compute each group's available quantity.
pub fn available_per_variant(
    stocks: &[Stock],
    allocations: &[Allocation],
) -> HashMap<VariantId, VariantAvailability> {
    let mut groups: HashMap<VariantId, Vec<Stock>> = HashMap::new();
    for stock in stocks {
        groups.entry(stock.variant_id).or_default().push(stock.clone());
    }

    groups
        .into_iter()
        .map(|(variant_id, group)| {
            let availability = VariantAvailability {
                available: available_quantity(&group, allocations),
                stock_count: group.len(),
            };
            (variant_id, availability)
        })
        .collect()
}
