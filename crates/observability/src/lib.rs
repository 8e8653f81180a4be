//! Shared tracing setup for services and tests.

pub mod subscriber;

pub use subscriber::{init, init_test};
