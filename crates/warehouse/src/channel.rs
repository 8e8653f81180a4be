use serde::{Deserialize, Serialize};

use stockroom_core::ChannelId;

/// How candidate stocks are ordered before greedy consumption.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AllocationStrategy {
    /// Follow the channel's warehouse sort order.
    #[default]
    PrioritizeSortingOrder,
    /// Prefer the stock with the most free quantity.
    PrioritizeHighStock,
}

/// Sales channel (storefront, marketplace, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: ChannelId,
    pub slug: String,
    pub allocation_strategy: AllocationStrategy,
}

impl Channel {
    pub fn new(slug: impl Into<String>) -> Self {
        Self {
            id: ChannelId::new(),
            slug: slug.into(),
            allocation_strategy: AllocationStrategy::default(),
        }
    }

    pub fn with_strategy(mut self, strategy: AllocationStrategy) -> Self {
        self.allocation_strategy = strategy;
        self
    }
}
