//! Stock ledger persistence boundary.
//!
//! `StockStore` serves lock-free reads and opens transactions;
//! `StockTransaction` carries row locks and staged writes until commit.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::{InMemoryStockStore, InMemoryStockTransaction};
pub use postgres::{PostgresStockStore, PostgresStockTransaction};
pub use r#trait::{
    AllocationFilter, PreorderAllocationFilter, StockFilter, StockStore, StockTransaction, StoreError,
};
