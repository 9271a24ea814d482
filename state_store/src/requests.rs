use data_model::{
    DeviceType,
    GpuCard,
    GpuCardId,
    GpuDevice,
    GpuDeviceId,
    Host,
    HostId,
    VgpuDisplayProperties,
    VgpuProfile,
    VgpuProfileId,
    Vm,
    VmId,
};
use serde::Serialize;

pub struct StateMachineUpdateRequest {
    pub payload: RequestPayload,
}

#[derive(Debug, Clone, strum::Display)]
pub enum RequestPayload {
    UpsertHost(UpsertHostRequest),
    RemoveHost(RemoveHostRequest),
    RegisterVm(RegisterVmRequest),
    DeregisterVm(DeregisterVmRequest),
    CreateGpuCard(CreateGpuCardRequest),
    DeleteGpuCard(DeleteGpuCardRequest),
    CreateVgpuProfile(CreateVgpuProfileRequest),
    DeleteVgpuProfile(DeleteVgpuProfileRequest),
    CreateGpuDevice(CreateGpuDeviceRequest),
    UpdateGpuDevice(UpdateGpuDeviceRequest),
    DeleteGpuDevice(DeleteGpuDeviceRequest),
}

#[derive(Debug, Clone)]
pub struct UpsertHostRequest {
    pub host_id: HostId,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct RemoveHostRequest {
    pub host_id: HostId,
}

#[derive(Debug, Clone)]
pub struct RegisterVmRequest {
    pub vm_id: VmId,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct DeregisterVmRequest {
    pub vm_id: VmId,
}

#[derive(Debug, Clone)]
pub struct CreateGpuCardRequest {
    pub vendor_id: String,
    pub device_id: String,
    pub vendor_name: String,
    pub device_name: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct DeleteGpuCardRequest {
    pub card_id: GpuCardId,
}

#[derive(Debug, Clone)]
pub struct CreateVgpuProfileRequest {
    pub card_id: GpuCardId,
    pub name: String,
    pub description: String,
    pub max_instances_per_gpu: u32,
    pub display: VgpuDisplayProperties,
}

#[derive(Debug, Clone)]
pub struct DeleteVgpuProfileRequest {
    pub profile_id: VgpuProfileId,
}

#[derive(Debug, Clone)]
pub struct CreateGpuDeviceRequest {
    pub host_id: HostId,
    pub card_id: GpuCardId,
    pub vgpu_profile_id: VgpuProfileId,
    pub bus_address: String,
    pub device_type: DeviceType,
    pub numa_node: Option<String>,
    pub pci_root: Option<String>,
    pub parent_device_id: Option<GpuDeviceId>,
}

/// Fields left as `None` keep their current value.
#[derive(Debug, Clone, Default)]
pub struct UpdateGpuDeviceRequest {
    pub device_id: GpuDeviceId,
    pub card_id: Option<GpuCardId>,
    pub vgpu_profile_id: Option<VgpuProfileId>,
    pub device_type: Option<DeviceType>,
    pub numa_node: Option<String>,
    pub pci_root: Option<String>,
    pub parent_device_id: Option<GpuDeviceId>,
}

#[derive(Debug, Clone)]
pub struct DeleteGpuDeviceRequest {
    pub device_id: GpuDeviceId,
}

impl RequestPayload {
    /// The host whose serialization boundary the request must run under,
    /// when it is known without reading the store.
    pub fn host_id(&self) -> Option<&HostId> {
        match self {
            RequestPayload::UpsertHost(req) => Some(&req.host_id),
            RequestPayload::RemoveHost(req) => Some(&req.host_id),
            RequestPayload::CreateGpuDevice(req) => Some(&req.host_id),
            _ => None,
        }
    }

    /// Device whose host must be looked up before the request can be
    /// serialized with that host.
    pub fn device_id(&self) -> Option<GpuDeviceId> {
        match self {
            RequestPayload::UpdateGpuDevice(req) => Some(req.device_id),
            RequestPayload::DeleteGpuDevice(req) => Some(req.device_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum UpdateOutcome {
    Host(Host),
    Vm(Vm),
    Card(GpuCard),
    Profile(VgpuProfile),
    Device(GpuDevice),
}
