use std::{collections::HashMap, sync::Arc};

use data_model::{
    DeviceState,
    GpuCard,
    GpuCardId,
    GpuDevice,
    HostCapacity,
    HostId,
    ResourceState,
    VgpuProfile,
    VgpuProfileId,
};
use state_store::{error::Result, scanner::InventoryRead, InventoryState};

/// Memoizes card and profile lookups while walking a host's devices.
pub struct CatalogNames<'r, R: InventoryRead> {
    reader: &'r R,
    cards: HashMap<GpuCardId, GpuCard>,
    profiles: HashMap<VgpuProfileId, VgpuProfile>,
}

impl<'r, R: InventoryRead> CatalogNames<'r, R> {
    pub fn new(reader: &'r R) -> Self {
        Self {
            reader,
            cards: HashMap::new(),
            profiles: HashMap::new(),
        }
    }

    pub fn card(&mut self, card_id: GpuCardId) -> Result<GpuCard> {
        if let Some(card) = self.cards.get(&card_id) {
            return Ok(card.clone());
        }
        let card = self.reader.require_card(card_id)?;
        self.cards.insert(card_id, card.clone());
        Ok(card)
    }

    pub fn profile(&mut self, profile_id: VgpuProfileId) -> Result<VgpuProfile> {
        if let Some(profile) = self.profiles.get(&profile_id) {
            return Ok(profile.clone());
        }
        let profile = self.reader.require_profile(profile_id)?;
        self.profiles.insert(profile_id, profile.clone());
        Ok(profile)
    }
}

/// Counts `devices` per (card name, profile name). Only free, enabled
/// devices count as free.
pub fn summarize<R: InventoryRead>(
    reader: &R,
    host_id: &HostId,
    devices: &[GpuDevice],
) -> Result<HostCapacity> {
    let mut names = CatalogNames::new(reader);
    let mut capacity = HostCapacity::new(host_id.clone());
    for device in devices {
        let card = names.card(device.card_id)?;
        let profile = names.profile(device.vgpu_profile_id)?;
        let free = device.state == DeviceState::Free
            && device.resource_state == ResourceState::Enabled;
        capacity.record(&card.name, &profile.name, free);
    }
    Ok(capacity)
}

pub struct CapacityAggregator {
    state: Arc<InventoryState>,
}

impl CapacityAggregator {
    pub fn new(state: Arc<InventoryState>) -> Self {
        Self { state }
    }

    /// Reads from one committed snapshot, so a concurrent allocation is seen
    /// either entirely or not at all.
    #[tracing::instrument(skip(self), fields(host_id = %host_id))]
    pub fn capacity_snapshot(&self, host_id: &HostId) -> Result<HostCapacity> {
        let reader = self.state.reader();
        reader.require_host(host_id)?;
        let devices = reader.devices_for_host(host_id)?;
        summarize(&reader, host_id, &devices)
    }
}
