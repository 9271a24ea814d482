use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Subcommand, ValueEnum};
use data_model::{
    DeviceFact,
    DeviceType,
    GpuCardId,
    GpuDeviceId,
    HostId,
    ResourceState,
    VgpuDisplayProperties,
    VgpuProfileId,
    VmId,
};
use serde::Serialize;
use serde_json::Value;
use state_store::{
    requests::{
        CreateGpuCardRequest,
        CreateGpuDeviceRequest,
        CreateVgpuProfileRequest,
        DeleteGpuCardRequest,
        DeleteGpuDeviceRequest,
        DeleteVgpuProfileRequest,
        DeregisterVmRequest,
        RegisterVmRequest,
        RemoveHostRequest,
        RequestPayload,
        UpdateGpuDeviceRequest,
        UpsertHostRequest,
    },
    scanner::InventoryRead,
};

use crate::service::Service;

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Yaml,
}

impl OutputFormat {
    pub fn render(&self, value: &Value) -> Result<String> {
        match self {
            OutputFormat::Json => Ok(serde_json::to_string_pretty(value)?),
            OutputFormat::Yaml => Ok(serde_yaml::to_string(value)?),
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum DeviceTypeArg {
    Pci,
    Mdev,
    VgpuOnly,
}

impl From<DeviceTypeArg> for DeviceType {
    fn from(value: DeviceTypeArg) -> Self {
        match value {
            DeviceTypeArg::Pci => DeviceType::Pci,
            DeviceTypeArg::Mdev => DeviceType::Mdev,
            DeviceTypeArg::VgpuOnly => DeviceType::VgpuOnly,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ResourceStateArg {
    Enabled,
    Disabled,
}

impl From<ResourceStateArg> for ResourceState {
    fn from(value: ResourceStateArg) -> Self {
        match value {
            ResourceStateArg::Enabled => ResourceState::Enabled,
            ResourceStateArg::Disabled => ResourceState::Disabled,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum HostCmd {
    /// Register a host or rename it
    Upsert {
        host_id: String,
        #[arg(long, help = "display name, defaults to the host id")]
        name: Option<String>,
    },
    /// Remove a host that has no devices left
    Remove { host_id: String },
    List,
}

#[derive(Debug, Subcommand)]
pub enum VmCmd {
    /// Register a VM so host reports can name it as a device occupant
    Register {
        vm_id: String,
        #[arg(long)]
        name: String,
    },
    Deregister {
        vm_id: String,
    },
    List,
}

#[derive(Debug, Subcommand)]
pub enum CardCmd {
    Create {
        #[arg(long)]
        vendor_id: String,
        #[arg(long)]
        device_id: String,
        #[arg(long, default_value = "")]
        vendor_name: String,
        #[arg(long, default_value = "")]
        device_name: String,
        #[arg(long)]
        name: String,
    },
    List,
    Delete {
        card_id: u64,
    },
}

#[derive(Debug, Subcommand)]
pub enum ProfileCmd {
    Create {
        #[arg(long)]
        card: u64,
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long, default_value_t = 1)]
        max_instances: u32,
        #[arg(long)]
        video_ram_mb: Option<u64>,
        #[arg(long)]
        max_heads: Option<u32>,
        #[arg(long)]
        max_resolution_x: Option<u32>,
        #[arg(long)]
        max_resolution_y: Option<u32>,
    },
    /// Profiles of one card
    List {
        #[arg(long)]
        card: u64,
    },
    Delete {
        profile_id: u64,
    },
}

#[derive(Debug, Subcommand)]
pub enum DeviceCmd {
    Create {
        #[arg(long)]
        host: String,
        #[arg(long)]
        card: u64,
        #[arg(long)]
        profile: u64,
        #[arg(long)]
        bus_address: String,
        #[arg(long, value_enum, default_value_t = DeviceTypeArg::Pci)]
        device_type: DeviceTypeArg,
        #[arg(long)]
        numa_node: Option<String>,
        #[arg(long)]
        pci_root: Option<String>,
        #[arg(long)]
        parent: Option<u64>,
    },
    /// Change the catalog binding, topology or parent of a free device
    Update {
        device_id: u64,
        #[arg(long)]
        card: Option<u64>,
        #[arg(long)]
        profile: Option<u64>,
        #[arg(long, value_enum)]
        device_type: Option<DeviceTypeArg>,
        #[arg(long)]
        numa_node: Option<String>,
        #[arg(long)]
        pci_root: Option<String>,
        #[arg(long)]
        parent: Option<u64>,
    },
    /// Devices of one host, bound to one VM, or all of them
    List {
        #[arg(long, conflicts_with = "vm")]
        host: Option<String>,
        #[arg(long)]
        vm: Option<String>,
    },
    Get {
        device_id: u64,
    },
    Delete {
        device_id: u64,
    },
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    #[command(subcommand)]
    Host(HostCmd),
    #[command(subcommand)]
    Vm(VmCmd),
    #[command(subcommand)]
    Card(CardCmd),
    #[command(subcommand)]
    Profile(ProfileCmd),
    #[command(subcommand)]
    Device(DeviceCmd),
    /// Merge a host's device report into the inventory
    Reconcile {
        #[arg(long)]
        host: String,
        #[arg(long, help = "path to a JSON array of device facts")]
        facts: PathBuf,
    },
    /// Claim devices of one vGPU profile on a host for a VM
    Allocate {
        #[arg(long)]
        host: String,
        #[arg(long)]
        vm: String,
        #[arg(long)]
        profile: u64,
        #[arg(long, default_value_t = 1)]
        count: usize,
    },
    /// Free every device bound to a VM
    Release {
        #[arg(long)]
        vm: String,
    },
    /// Free and total devices per (card, profile) on a host
    Capacity {
        #[arg(long)]
        host: String,
    },
    /// Enable or disable devices for allocation
    ResourceState {
        #[arg(long, value_enum)]
        target: ResourceStateArg,
        #[arg(required = true)]
        device_ids: Vec<u64>,
    },
}

fn to_value<T: Serialize>(value: T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

impl Commands {
    pub async fn run(self, service: &Service) -> Result<Value> {
        match self {
            Commands::Host(cmd) => cmd.run(service).await,
            Commands::Vm(cmd) => cmd.run(service).await,
            Commands::Card(cmd) => cmd.run(service).await,
            Commands::Profile(cmd) => cmd.run(service).await,
            Commands::Device(cmd) => cmd.run(service).await,
            Commands::Reconcile { host, facts } => {
                let facts_json = std::fs::read_to_string(&facts)
                    .with_context(|| format!("reading device facts from {}", facts.display()))?;
                let facts: Vec<DeviceFact> =
                    serde_json::from_str(&facts_json).context("parsing device facts")?;
                let summary = service
                    .reconciler
                    .reconcile(&HostId::new(host), &facts)
                    .await?;
                to_value(summary)
            }
            Commands::Allocate {
                host,
                vm,
                profile,
                count,
            } => {
                let response = service
                    .allocator
                    .allocate(&HostId::new(host), &VmId::new(vm), VgpuProfileId(profile), count)
                    .await?;
                to_value(response)
            }
            Commands::Release { vm } => {
                let released = service.allocator.release(&VmId::new(vm)).await?;
                to_value(released)
            }
            Commands::Capacity { host } => {
                to_value(service.capacity.capacity_snapshot(&HostId::new(host))?)
            }
            Commands::ResourceState { target, device_ids } => {
                let device_ids: Vec<GpuDeviceId> =
                    device_ids.into_iter().map(GpuDeviceId).collect();
                let devices = service
                    .resource_state
                    .set_resource_state(&device_ids, target.into())
                    .await?;
                to_value(devices)
            }
        }
    }
}

impl HostCmd {
    async fn run(self, service: &Service) -> Result<Value> {
        match self {
            HostCmd::Upsert { host_id, name } => {
                let name = name.unwrap_or_else(|| host_id.clone());
                to_value(
                    service
                        .write(RequestPayload::UpsertHost(UpsertHostRequest {
                            host_id: HostId::new(host_id),
                            name,
                        }))
                        .await?,
                )
            }
            HostCmd::Remove { host_id } => to_value(
                service
                    .write(RequestPayload::RemoveHost(RemoveHostRequest {
                        host_id: HostId::new(host_id),
                    }))
                    .await?,
            ),
            HostCmd::List => to_value(service.inventory_state.reader().list_hosts()?),
        }
    }
}

impl VmCmd {
    async fn run(self, service: &Service) -> Result<Value> {
        match self {
            VmCmd::Register { vm_id, name } => to_value(
                service
                    .write(RequestPayload::RegisterVm(RegisterVmRequest {
                        vm_id: VmId::new(vm_id),
                        name,
                    }))
                    .await?,
            ),
            VmCmd::Deregister { vm_id } => to_value(
                service
                    .write(RequestPayload::DeregisterVm(DeregisterVmRequest {
                        vm_id: VmId::new(vm_id),
                    }))
                    .await?,
            ),
            VmCmd::List => to_value(service.inventory_state.reader().list_vms()?),
        }
    }
}

impl CardCmd {
    async fn run(self, service: &Service) -> Result<Value> {
        match self {
            CardCmd::Create {
                vendor_id,
                device_id,
                vendor_name,
                device_name,
                name,
            } => to_value(
                service
                    .write(RequestPayload::CreateGpuCard(CreateGpuCardRequest {
                        vendor_id,
                        device_id,
                        vendor_name,
                        device_name,
                        name,
                    }))
                    .await?,
            ),
            CardCmd::List => to_value(service.inventory_state.reader().list_cards()?),
            CardCmd::Delete { card_id } => to_value(
                service
                    .write(RequestPayload::DeleteGpuCard(DeleteGpuCardRequest {
                        card_id: GpuCardId(card_id),
                    }))
                    .await?,
            ),
        }
    }
}

impl ProfileCmd {
    async fn run(self, service: &Service) -> Result<Value> {
        match self {
            ProfileCmd::Create {
                card,
                name,
                description,
                max_instances,
                video_ram_mb,
                max_heads,
                max_resolution_x,
                max_resolution_y,
            } => to_value(
                service
                    .write(RequestPayload::CreateVgpuProfile(CreateVgpuProfileRequest {
                        card_id: GpuCardId(card),
                        name,
                        description,
                        max_instances_per_gpu: max_instances,
                        display: VgpuDisplayProperties {
                            video_ram_mb,
                            max_heads,
                            max_resolution_x,
                            max_resolution_y,
                        },
                    }))
                    .await?,
            ),
            ProfileCmd::List { card } => to_value(
                service
                    .inventory_state
                    .reader()
                    .profiles_for_card(GpuCardId(card))?,
            ),
            ProfileCmd::Delete { profile_id } => to_value(
                service
                    .write(RequestPayload::DeleteVgpuProfile(DeleteVgpuProfileRequest {
                        profile_id: VgpuProfileId(profile_id),
                    }))
                    .await?,
            ),
        }
    }
}

impl DeviceCmd {
    async fn run(self, service: &Service) -> Result<Value> {
        match self {
            DeviceCmd::Create {
                host,
                card,
                profile,
                bus_address,
                device_type,
                numa_node,
                pci_root,
                parent,
            } => to_value(
                service
                    .write(RequestPayload::CreateGpuDevice(CreateGpuDeviceRequest {
                        host_id: HostId::new(host),
                        card_id: GpuCardId(card),
                        vgpu_profile_id: VgpuProfileId(profile),
                        bus_address,
                        device_type: device_type.into(),
                        numa_node,
                        pci_root,
                        parent_device_id: parent.map(GpuDeviceId),
                    }))
                    .await?,
            ),
            DeviceCmd::Update {
                device_id,
                card,
                profile,
                device_type,
                numa_node,
                pci_root,
                parent,
            } => to_value(
                service
                    .write(RequestPayload::UpdateGpuDevice(UpdateGpuDeviceRequest {
                        device_id: GpuDeviceId(device_id),
                        card_id: card.map(GpuCardId),
                        vgpu_profile_id: profile.map(VgpuProfileId),
                        device_type: device_type.map(DeviceType::from),
                        numa_node,
                        pci_root,
                        parent_device_id: parent.map(GpuDeviceId),
                    }))
                    .await?,
            ),
            DeviceCmd::List { host, vm } => {
                let reader = service.inventory_state.reader();
                let devices = match (host, vm) {
                    (Some(host), _) => reader.devices_for_host(&HostId::new(host))?,
                    (None, Some(vm)) => reader.devices_for_vm(&VmId::new(vm))?,
                    (None, None) => reader.all_devices()?,
                };
                to_value(devices)
            }
            DeviceCmd::Get { device_id } => to_value(
                service
                    .inventory_state
                    .reader()
                    .require_device(GpuDeviceId(device_id))?,
            ),
            DeviceCmd::Delete { device_id } => to_value(
                service
                    .write(RequestPayload::DeleteGpuDevice(DeleteGpuDeviceRequest {
                        device_id: GpuDeviceId(device_id),
                    }))
                    .await?,
            ),
        }
    }
}
