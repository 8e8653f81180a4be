//! Catalog data supplied by the product/variant service.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockroom_core::{ChannelId, ChannelListingId, Entity, ProductId, VariantId};

/// Preorder configuration of a variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreorderSettings {
    /// Cap on preorder units across all channels (`None` = unlimited).
    pub global_threshold: Option<i32>,
    /// Preorder ends at this instant (`None` = until switched off).
    pub end_date: Option<DateTime<Utc>>,
}

/// Sellable variant, as far as stock allocation is concerned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductVariant {
    pub id: VariantId,
    pub product_id: ProductId,
    pub track_inventory: bool,
    pub preorder: Option<PreorderSettings>,
}

impl ProductVariant {
    pub fn tracked(product_id: ProductId) -> Self {
        Self {
            id: VariantId::new(),
            product_id,
            track_inventory: true,
            preorder: None,
        }
    }

    pub fn untracked(product_id: ProductId) -> Self {
        Self {
            track_inventory: false,
            ..Self::tracked(product_id)
        }
    }

    pub fn with_preorder(mut self, settings: PreorderSettings) -> Self {
        self.preorder = Some(settings);
        self
    }

    /// Whether the variant is sold against a channel listing rather than
    /// physical stock at `now`.
    pub fn is_preorder_active(&self, now: DateTime<Utc>) -> bool {
        match &self.preorder {
            Some(settings) => settings.end_date.is_none_or(|end| end > now),
            None => false,
        }
    }

    pub fn preorder_global_threshold(&self) -> Option<i32> {
        self.preorder.as_ref().and_then(|p| p.global_threshold)
    }
}

impl Entity for ProductVariant {
    type Id = VariantId;

    fn id(&self) -> VariantId {
        self.id
    }
}

/// A product and its variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub variants: Vec<ProductVariant>,
}

/// A variant's availability in one channel; the preorder inventory source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantChannelListing {
    pub id: ChannelListingId,
    pub variant_id: VariantId,
    pub channel_id: ChannelId,
    /// Cap on preorder units in this channel (`None` = unlimited).
    pub preorder_quantity_threshold: Option<i32>,
    /// Preorder units already sold and converted out of preorder allocations.
    pub preorder_quantity_sold: i32,
}

impl VariantChannelListing {
    pub fn new(variant_id: VariantId, channel_id: ChannelId) -> Self {
        Self {
            id: ChannelListingId::new(),
            variant_id,
            channel_id,
            preorder_quantity_threshold: None,
            preorder_quantity_sold: 0,
        }
    }

    pub fn with_threshold(mut self, threshold: i32) -> Self {
        self.preorder_quantity_threshold = Some(threshold);
        self
    }
}

impl Entity for VariantChannelListing {
    type Id = ChannelListingId;

    fn id(&self) -> ChannelListingId {
        self.id
    }
}
