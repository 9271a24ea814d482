use std::sync::Arc;

use data_model::{GpuDevice, GpuDeviceId, HostId, ResourceState};
use itertools::Itertools;
use state_store::{
    error::{InventoryError, Result},
    scanner::InventoryRead,
    transaction::StoreTransaction,
    InventoryState,
};
use tracing::info;

/// Administrative enable/disable of devices.
pub struct ResourceStateController {
    state: Arc<InventoryState>,
}

impl ResourceStateController {
    pub fn new(state: Arc<InventoryState>) -> Self {
        Self { state }
    }

    /// Moves every device in `device_ids` to `target`. The batch is all or
    /// nothing: one device bound to a VM fails it with `InUse`.
    #[tracing::instrument(skip(self, device_ids), fields(target = %target, devices = device_ids.len()))]
    pub async fn set_resource_state(
        &self,
        device_ids: &[GpuDeviceId],
        target: ResourceState,
    ) -> Result<Vec<GpuDevice>> {
        let device_ids: Vec<GpuDeviceId> = device_ids.iter().copied().unique().collect();
        let hosts = self.hosts_of(&device_ids)?;
        self.state
            .run_in_hosts_txn(&hosts, |txn| apply_resource_state(txn, &device_ids, target))
            .await
    }

    fn hosts_of(&self, device_ids: &[GpuDeviceId]) -> Result<Vec<HostId>> {
        let reader = self.state.reader();
        device_ids
            .iter()
            .map(|id| reader.require_device(*id).map(|device| device.host_id))
            .collect()
    }
}

fn apply_resource_state(
    txn: &StoreTransaction,
    device_ids: &[GpuDeviceId],
    target: ResourceState,
) -> Result<Vec<GpuDevice>> {
    let mut devices = Vec::with_capacity(device_ids.len());
    for id in device_ids {
        let device = txn.get_device_for_update(*id)?;
        if let Some(vm_id) = &device.vm_id {
            return Err(InventoryError::InUse(format!(
                "gpu device {} at {} on host {} is bound to vm {}",
                device.id, device.bus_address, device.host_id, vm_id
            )));
        }
        devices.push(device);
    }

    let mut updated = Vec::with_capacity(devices.len());
    for previous in devices {
        if previous.resource_state == target && !previous.disabled_when_lost {
            info!(
                device_id = previous.id.0,
                host_id = %previous.host_id,
                "gpu device already {}", target
            );
            updated.push(previous);
            continue;
        }
        let mut device = previous.clone();
        device.set_resource_state(target);
        txn.update_device(&previous, &device)?;
        info!(
            device_id = device.id.0,
            host_id = %device.host_id,
            bus_address = %device.bus_address,
            "set gpu device resource state to {}", target
        );
        updated.push(device);
    }
    Ok(updated)
}
