use std::{collections::HashMap, sync::Arc};

use data_model::{
    AllocatedDevice,
    AllocationResponse,
    GpuDevice,
    GpuDeviceId,
    HostId,
    VgpuProfileId,
    Vm,
    VmId,
};
use itertools::Itertools;
use metrics::{allocator::Metrics, AutoIncrement, Timer};
use opentelemetry::KeyValue;
use state_store::{
    error::{InventoryError, Result},
    scanner::InventoryRead,
    transaction::StoreTransaction,
    InventoryState,
};
use tracing::{debug, info, warn};

use crate::{
    capacity::{summarize, CatalogNames},
    packing::select_devices,
};

pub struct Allocator {
    state: Arc<InventoryState>,
    metrics: Metrics,
}

impl Allocator {
    pub fn new(state: Arc<InventoryState>) -> Self {
        Self {
            state,
            metrics: Metrics::new(),
        }
    }

    /// Claims `count` devices of `profile_id` on `host_id` for `vm_id`.
    ///
    /// Devices the VM already holds on the host are released first, so a
    /// retried call never leaks a previous claim. Everything happens in one
    /// host transaction; on failure nothing changes.
    #[tracing::instrument(
        skip(self),
        fields(host_id = %host_id, vm_id = %vm_id, profile_id = profile_id.0)
    )]
    pub async fn allocate(
        &self,
        host_id: &HostId,
        vm_id: &VmId,
        profile_id: VgpuProfileId,
        count: usize,
    ) -> Result<AllocationResponse> {
        let _timer = Timer::start(&self.metrics.allocate_latency);
        let result = self.try_allocate(host_id, vm_id, profile_id, count).await;
        match &result {
            Ok(response) => {
                let labels = &[KeyValue::new("tier", response.tier.to_string())];
                self.metrics.allocations.increment(labels);
                info!(
                    tier = %response.tier,
                    devices = ?response.devices.iter().map(|d| d.id.0).collect::<Vec<_>>(),
                    "allocated gpu devices"
                );
            }
            Err(err) => {
                let labels = &[KeyValue::new("reason", failure_reason(err))];
                self.metrics.allocation_failures.increment(labels);
                warn!(error = %err, count, "gpu allocation failed");
            }
        }
        result
    }

    async fn try_allocate(
        &self,
        host_id: &HostId,
        vm_id: &VmId,
        profile_id: VgpuProfileId,
        count: usize,
    ) -> Result<AllocationResponse> {
        if count == 0 {
            return Err(InventoryError::InvalidArgument(format!(
                "allocation of vgpu profile {} on host {} for vm {} must request at least one device",
                profile_id, host_id, vm_id
            )));
        }
        Vm::validate_id(vm_id).map_err(InventoryError::InvalidArgument)?;
        self.state
            .run_in_host_txn(host_id, |txn| {
                claim_devices(txn, host_id, vm_id, profile_id, count)
            })
            .await
    }

    /// Frees every device bound to `vm_id` on any host. Returns the released
    /// ids; an unknown or idle VM releases nothing.
    #[tracing::instrument(skip(self), fields(vm_id = %vm_id))]
    pub async fn release(&self, vm_id: &VmId) -> Result<Vec<GpuDeviceId>> {
        let mut released = Vec::new();
        loop {
            // An allocation on another host may bind the VM after the hosts
            // were read; those devices are picked up by the next round.
            let hosts = self.bound_hosts(vm_id)?;
            if hosts.is_empty() {
                break;
            }
            let batch = self
                .state
                .run_in_hosts_txn(&hosts, |txn| release_on_hosts(txn, vm_id, &hosts))
                .await?;
            released.extend(batch);
        }
        if released.is_empty() {
            debug!("vm holds no gpu devices");
        } else {
            self.metrics.devices_released.add(released.len() as u64, &[]);
            info!(devices = ?released.iter().map(|id| id.0).collect::<Vec<_>>(), "released gpu devices");
        }
        Ok(released)
    }

    fn bound_hosts(&self, vm_id: &VmId) -> Result<Vec<HostId>> {
        Ok(self
            .state
            .reader()
            .devices_for_vm(vm_id)?
            .into_iter()
            .map(|device| device.host_id)
            .unique()
            .collect())
    }
}

fn failure_reason(err: &InventoryError) -> &'static str {
    match err {
        InventoryError::InsufficientCapacity { .. } => "insufficient_capacity",
        InventoryError::NotFound { .. } => "not_found",
        InventoryError::InvalidArgument(_) => "invalid_argument",
        _ => "internal",
    }
}

fn release_on_hosts(txn: &StoreTransaction, vm_id: &VmId, hosts: &[HostId]) -> Result<Vec<GpuDeviceId>> {
    let mut released = Vec::new();
    for previous in txn.devices_for_vm(vm_id)? {
        if !hosts.contains(&previous.host_id) {
            continue;
        }
        let mut device = previous.clone();
        device.release();
        txn.update_device(&previous, &device)?;
        released.push(device.id);
    }
    Ok(released)
}

fn claim_devices(
    txn: &StoreTransaction,
    host_id: &HostId,
    vm_id: &VmId,
    profile_id: VgpuProfileId,
    count: usize,
) -> Result<AllocationResponse> {
    txn.require_host(host_id)?;
    let profile = txn.require_profile(profile_id)?;
    let mut devices = txn.devices_for_host(host_id)?;
    if !devices.iter().any(|device| device.card_id == profile.card_id) {
        return Err(InventoryError::not_found(
            "gpu card of vgpu profile",
            format!("{} (profile {}) on host {}", profile.card_id, profile.id, host_id),
        ));
    }

    for device in devices.iter_mut().filter(|d| d.vm_id.as_ref() == Some(vm_id)) {
        let previous = device.clone();
        device.release();
        txn.update_device(&previous, device)?;
        debug!(
            device_id = device.id.0,
            bus_address = %device.bus_address,
            "released earlier claim before re-allocating"
        );
    }

    let candidates: Vec<&GpuDevice> = devices
        .iter()
        .filter(|device| device.vgpu_profile_id == profile.id && device.is_allocatable())
        .collect();
    let insufficient = |available: usize| InventoryError::InsufficientCapacity {
        host_id: host_id.clone(),
        profile_id,
        requested: count,
        available,
    };
    if candidates.len() < count {
        return Err(insufficient(candidates.len()));
    }
    let Some((selected, tier)) = select_devices(&candidates, count) else {
        return Err(insufficient(candidates.len()));
    };

    for device in devices.iter_mut().filter(|d| selected.contains(&d.id)) {
        let previous = device.clone();
        device.claim(vm_id.clone());
        txn.update_device(&previous, device)?;
    }

    let by_id: HashMap<GpuDeviceId, &GpuDevice> =
        devices.iter().map(|device| (device.id, device)).collect();
    let mut names = CatalogNames::new(txn);
    let mut allocated = Vec::with_capacity(selected.len());
    for id in &selected {
        let device = by_id
            .get(id)
            .ok_or_else(|| InventoryError::not_found("gpu device", id))?;
        let card = names.card(device.card_id)?;
        let parent_bus_address = device
            .parent_device_id
            .and_then(|parent_id| by_id.get(&parent_id))
            .map(|parent| parent.bus_address.clone());
        allocated.push(AllocatedDevice {
            id: device.id,
            bus_address: device.bus_address.clone(),
            parent_bus_address,
            device_type: device.device_type,
            card_name: card.name.clone(),
            profile_name: profile.name.clone(),
            vendor_id: card.vendor_id.clone(),
            hardware_device_id: card.device_id.clone(),
            numa_node: device.numa_node.clone(),
            pci_root: device.pci_root.clone(),
        });
    }

    Ok(AllocationResponse {
        host_id: host_id.clone(),
        vm_id: vm_id.clone(),
        tier,
        devices: allocated,
        capacity: summarize(txn, host_id, &devices)?,
    })
}
