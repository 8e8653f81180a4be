//! Orders domain as seen by stock allocation.
//!
//! Order lines, fulfillments and the order-status rules, implemented purely
//! as deterministic domain logic (no IO, no HTTP, no storage).

pub mod fulfillment;
pub mod order;
pub mod status;

pub use fulfillment::{Fulfillment, FulfillmentLine, FulfillmentStatus, ReturnKind};
pub use order::{Order, OrderLine, OrderLineInfo, OrderStatus};
pub use status::{resolve_order_status, FulfillmentTotals, ReturnTally};
