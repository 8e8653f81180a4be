//! Warehouse stock domain.
//!
//! Stock rows, allocations, availability arithmetic and the allocation
//! planners, implemented purely as deterministic domain logic (no IO, no
//! locking, no storage).

pub mod availability;
pub mod catalog;
pub mod channel;
pub mod error;
pub mod planner;
pub mod stock;

pub use availability::{
    allocated_per_stock, available_per_variant, available_quantity, VariantAvailability,
};
pub use catalog::{PreorderSettings, Product, ProductVariant, VariantChannelListing};
pub use channel::{AllocationStrategy, Channel};
pub use error::{InsufficientStock, InsufficientStockItem};
pub use planner::{
    merge_planned, plan_deallocation, AllocationPlanner, Deallocation, LineAllocationState,
    LineRequest, PlannedAllocation, PreorderPlanner,
};
pub use stock::{Allocation, PreorderAllocation, Stock};
