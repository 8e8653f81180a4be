//! `stockroom-core`: shared domain building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod entity;
pub mod error;
pub mod id;
pub mod value_object;

pub use entity::Entity;
pub use error::{DomainError, DomainResult};
pub use id::{
    AllocationId, ChannelId, ChannelListingId, FulfillmentId, FulfillmentLineId, OrderId,
    OrderLineId, PreorderAllocationId, ProductId, StockId, VariantId, WarehouseId,
};
pub use value_object::{CountryCode, ValueObject};
