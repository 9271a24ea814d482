use anyhow::{anyhow, Result};
use data_model::{
    DeviceState,
    GpuCardBuilder,
    GpuDeviceBuilder,
    Host,
    ResourceState,
    VgpuProfileBuilder,
    Vm,
};
use inventory_utils::OptionInspectNone;
use rocksdb::{ColumnFamily, TransactionDB};
use strum::AsRefStr;
use tracing::{error, info};

use crate::{
    error::{InventoryError, Result as InventoryResult},
    requests::{
        CreateGpuCardRequest,
        CreateGpuDeviceRequest,
        CreateVgpuProfileRequest,
        RequestPayload,
        UpdateGpuDeviceRequest,
        UpdateOutcome,
        UpsertHostRequest,
    },
    scanner::InventoryRead,
    transaction::StoreTransaction,
};

#[derive(AsRefStr, strum::Display, strum::EnumIter, Debug, Clone, Copy, PartialEq, Eq)]
pub enum InventoryColumns {
    Hosts,     //  HostId -> Host
    Vms,       //  VmId -> Vm
    VmsByName, //  VmName -> VmId

    GpuCards,             //  GpuCardId -> GpuCard
    GpuCardsByHardwareId, //  VendorId|DeviceId -> GpuCardId

    VgpuProfiles,       //  VgpuProfileId -> VgpuProfile
    VgpuProfilesByName, //  GpuCardId|Name -> VgpuProfileId

    GpuDevices,       //  GpuDeviceId -> GpuDevice
    GpuDevicesByHost, //  HostId|BusAddress -> GpuDeviceId
    GpuDevicesByVm,   //  VmId|GpuDeviceId -> HostId
}

impl InventoryColumns {
    pub fn cf<'a>(&self, db: &'a TransactionDB) -> Result<&'a ColumnFamily> {
        db.cf_handle(self.as_ref())
            .inspect_none(|| {
                error!("failed to get column family handle for {}", self.as_ref());
            })
            .ok_or_else(|| anyhow!("missing column family {}", self.as_ref()))
    }
}

/// Applies one administrative request inside `txn`.
pub(crate) fn apply(
    txn: &StoreTransaction,
    payload: &RequestPayload,
) -> InventoryResult<UpdateOutcome> {
    match payload {
        RequestPayload::UpsertHost(req) => upsert_host(txn, req),
        RequestPayload::RemoveHost(req) => {
            let host = txn.delete_host(&req.host_id)?;
            info!(host_id = %host.id, "removed host");
            Ok(UpdateOutcome::Host(host))
        }
        RequestPayload::RegisterVm(req) => {
            let vm = match txn.get_vm(&req.vm_id)? {
                Some(existing) => Vm {
                    name: req.name.clone(),
                    ..existing
                },
                None => Vm::new(req.vm_id.clone(), req.name.clone()),
            };
            txn.put_vm(&vm)?;
            Ok(UpdateOutcome::Vm(vm))
        }
        RequestPayload::DeregisterVm(req) => Ok(UpdateOutcome::Vm(txn.delete_vm(&req.vm_id)?)),
        RequestPayload::CreateGpuCard(req) => create_card(txn, req),
        RequestPayload::DeleteGpuCard(req) => {
            let card = txn.delete_card(req.card_id)?;
            info!(card_id = card.id.0, "deleted gpu card");
            Ok(UpdateOutcome::Card(card))
        }
        RequestPayload::CreateVgpuProfile(req) => create_profile(txn, req),
        RequestPayload::DeleteVgpuProfile(req) => {
            Ok(UpdateOutcome::Profile(txn.delete_profile(req.profile_id)?))
        }
        RequestPayload::CreateGpuDevice(req) => create_device(txn, req),
        RequestPayload::UpdateGpuDevice(req) => update_device(txn, req),
        RequestPayload::DeleteGpuDevice(req) => {
            let device = txn.delete_device(req.device_id)?;
            info!(
                host_id = %device.host_id,
                device_id = device.id.0,
                bus_address = %device.bus_address,
                "deleted gpu device"
            );
            Ok(UpdateOutcome::Device(device))
        }
    }
}

fn upsert_host(txn: &StoreTransaction, req: &UpsertHostRequest) -> InventoryResult<UpdateOutcome> {
    let host = match txn.get_host(&req.host_id)? {
        Some(existing) => Host {
            name: req.name.clone(),
            ..existing
        },
        None => Host::new(req.host_id.clone(), req.name.clone()),
    };
    txn.put_host(&host)?;
    Ok(UpdateOutcome::Host(host))
}

fn create_card(txn: &StoreTransaction, req: &CreateGpuCardRequest) -> InventoryResult<UpdateOutcome> {
    let card = GpuCardBuilder::default()
        .id(txn.next_card_id())
        .vendor_id(req.vendor_id.trim().to_string())
        .device_id(req.device_id.trim().to_string())
        .vendor_name(req.vendor_name.clone())
        .device_name(req.device_name.clone())
        .name(req.name.clone())
        .build()
        .map_err(|e| anyhow!("failed to build gpu card: {}", e))?;
    let passthrough = txn.insert_card(&card)?;
    info!(
        card_id = card.id.0,
        passthrough_profile_id = passthrough.id.0,
        "created gpu card"
    );
    Ok(UpdateOutcome::Card(card))
}

fn create_profile(
    txn: &StoreTransaction,
    req: &CreateVgpuProfileRequest,
) -> InventoryResult<UpdateOutcome> {
    let profile = VgpuProfileBuilder::default()
        .id(txn.next_profile_id())
        .card_id(req.card_id)
        .name(req.name.trim().to_string())
        .description(req.description.clone())
        .max_instances_per_gpu(req.max_instances_per_gpu)
        .display(req.display.clone())
        .build()
        .map_err(|e| anyhow!("failed to build vgpu profile: {}", e))?;
    txn.insert_profile(&profile)?;
    Ok(UpdateOutcome::Profile(profile))
}

fn create_device(
    txn: &StoreTransaction,
    req: &CreateGpuDeviceRequest,
) -> InventoryResult<UpdateOutcome> {
    if req.bus_address.trim().is_empty() {
        return Err(InventoryError::InvalidArgument(format!(
            "gpu device on host {} needs a bus address",
            req.host_id
        )));
    }
    let device = GpuDeviceBuilder::default()
        .id(txn.next_device_id())
        .host_id(req.host_id.clone())
        .card_id(req.card_id)
        .vgpu_profile_id(req.vgpu_profile_id)
        .bus_address(req.bus_address.trim().to_string())
        .device_type(req.device_type)
        .numa_node(req.numa_node.clone())
        .pci_root(req.pci_root.clone())
        .parent_device_id(req.parent_device_id)
        .state(DeviceState::Free)
        .resource_state(ResourceState::Enabled)
        .build()
        .map_err(|e| anyhow!("failed to build gpu device: {}", e))?;
    txn.insert_device(&device)?;
    info!(
        host_id = %device.host_id,
        device_id = device.id.0,
        bus_address = %device.bus_address,
        "created gpu device"
    );
    Ok(UpdateOutcome::Device(device))
}

fn update_device(
    txn: &StoreTransaction,
    req: &UpdateGpuDeviceRequest,
) -> InventoryResult<UpdateOutcome> {
    let previous = txn.get_device_for_update(req.device_id)?;
    if previous.vm_id.is_some() {
        return Err(InventoryError::InUse(format!(
            "gpu device {} at {} on host {} is allocated",
            previous.id, previous.bus_address, previous.host_id
        )));
    }
    let mut device = previous.clone();
    if let Some(card_id) = req.card_id {
        device.card_id = card_id;
    }
    if let Some(profile_id) = req.vgpu_profile_id {
        device.vgpu_profile_id = profile_id;
    }
    if let Some(device_type) = req.device_type {
        device.device_type = device_type;
    }
    if let Some(numa_node) = &req.numa_node {
        device.numa_node = Some(numa_node.clone());
    }
    if let Some(pci_root) = &req.pci_root {
        device.pci_root = Some(pci_root.clone());
    }
    if let Some(parent_id) = req.parent_device_id {
        device.parent_device_id = Some(parent_id);
    }
    if device != previous {
        txn.update_device(&previous, &device)?;
    }
    Ok(UpdateOutcome::Device(device))
}
