//! Infrastructure layer: stock ledger storage, allocation services, config.
//!
//! The domain crates decide *what* to reserve; this crate takes the locks,
//! runs the planners inside a transaction and persists the result.

pub mod allocator;
pub mod availability;
pub mod config;
pub mod directory;
pub mod error;
pub mod orders;
pub mod reconciler;
pub mod store;

#[cfg(test)]
mod integration_tests;

pub use allocator::{Allocator, LineRelease, Reservation};
pub use availability::AvailabilityCalculator;
pub use config::{connect_stock_store, StockConfig};
pub use directory::{warehouse_scope, InMemoryWarehouseDirectory, ShippingZone, WarehouseDirectory};
pub use error::{StockError, StockResult};
pub use orders::{FulfillmentStore, InMemoryFulfillmentStore, InMemoryOrderStore, OrderStore};
pub use reconciler::FulfillmentReconciler;
