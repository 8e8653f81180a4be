//! Which warehouses may serve a channel and a destination country.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use stockroom_core::{ChannelId, CountryCode, WarehouseId};

use crate::store::StoreError;

/// Shipping and channel configuration, owned by another service.
#[async_trait::async_trait]
pub trait WarehouseDirectory: Send + Sync {
    /// Warehouses assigned to a channel, in the channel's sort order.
    async fn channel_warehouses(&self, channel_id: ChannelId) -> Result<Vec<WarehouseId>, StoreError>;

    /// Warehouses whose shipping zones cover `country` for `channel_id`.
    async fn warehouses_shipping_to(
        &self,
        country: &CountryCode,
        channel_id: ChannelId,
    ) -> Result<Vec<WarehouseId>, StoreError>;
}

#[async_trait::async_trait]
impl<D> WarehouseDirectory for Arc<D>
where
    D: WarehouseDirectory + ?Sized,
{
    async fn channel_warehouses(&self, channel_id: ChannelId) -> Result<Vec<WarehouseId>, StoreError> {
        (**self).channel_warehouses(channel_id).await
    }

    async fn warehouses_shipping_to(
        &self,
        country: &CountryCode,
        channel_id: ChannelId,
    ) -> Result<Vec<WarehouseId>, StoreError> {
        (**self).warehouses_shipping_to(country, channel_id).await
    }
}

/// Warehouses eligible for a channel and optional destination, in the
/// channel's sort order.
///
/// Without a country every channel warehouse is eligible.
pub async fn warehouse_scope<D>(
    directory: &D,
    country: Option<&CountryCode>,
    channel_id: ChannelId,
) -> Result<Vec<WarehouseId>, StoreError>
where
    D: WarehouseDirectory + ?Sized,
{
    let ordered = directory.channel_warehouses(channel_id).await?;
    let Some(country) = country else {
        return Ok(ordered);
    };

    let shipping = directory.warehouses_shipping_to(country, channel_id).await?;
    Ok(ordered.into_iter().filter(|w| shipping.contains(w)).collect())
}

/// Group of countries served by a set of warehouses for a set of channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShippingZone {
    pub name: String,
    pub countries: Vec<CountryCode>,
    pub channel_ids: Vec<ChannelId>,
    pub warehouse_ids: Vec<WarehouseId>,
}

/// In-memory directory for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryWarehouseDirectory {
    channels: RwLock<HashMap<ChannelId, Vec<WarehouseId>>>,
    zones: RwLock<Vec<ShippingZone>>,
}

impl InMemoryWarehouseDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign warehouses to a channel; order is the channel's sort order.
    pub fn set_channel_warehouses(&self, channel_id: ChannelId, warehouses: Vec<WarehouseId>) {
        self.channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(channel_id, warehouses);
    }

    pub fn add_shipping_zone(&self, zone: ShippingZone) {
        self.zones.write().unwrap_or_else(PoisonError::into_inner).push(zone);
    }
}

#[async_trait::async_trait]
impl WarehouseDirectory for InMemoryWarehouseDirectory {
    async fn channel_warehouses(&self, channel_id: ChannelId) -> Result<Vec<WarehouseId>, StoreError> {
        let channels = self.channels.read().unwrap_or_else(PoisonError::into_inner);
        Ok(channels.get(&channel_id).cloned().unwrap_or_default())
    }

    async fn warehouses_shipping_to(
        &self,
        country: &CountryCode,
        channel_id: ChannelId,
    ) -> Result<Vec<WarehouseId>, StoreError> {
        let zones = self.zones.read().unwrap_or_else(PoisonError::into_inner);
        let mut warehouses: Vec<WarehouseId> = zones
            .iter()
            .filter(|z| z.countries.contains(country) && z.channel_ids.contains(&channel_id))
            .flat_map(|z| z.warehouse_ids.iter().copied())
            .collect();
        warehouses.sort();
        warehouses.dedup();
        Ok(warehouses)
    }
}
