pub mod test_objects;

use std::{
    collections::BTreeMap,
    fmt::{self, Display},
};

use derive_builder::Builder;
use inventory_utils::{get_epoch_time_in_ms, non_blank};
use serde::{ser::SerializeStruct, Deserialize, Serialize, Serializer};
use strum::AsRefStr;

/// Name of the profile every card carries for whole-device passthrough.
pub const PASSTHROUGH_PROFILE_NAME: &str = "passthrough";

/// Bucket name for devices whose NUMA node or PCIe root is not known.
pub const UNKNOWN_TOPOLOGY: &str = "unknown";

/// Separator used by composite keys. Host ids must not contain it.
pub const KEY_SEPARATOR: char = '|';

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct HostId(String);

impl Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl HostId {
    pub fn new(id: String) -> Self {
        Self(id)
    }

    pub fn get(&self) -> &str {
        &self.0
    }
}

impl From<&str> for HostId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct VmId(String);

impl Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl VmId {
    pub fn new(id: String) -> Self {
        Self(id)
    }

    pub fn get(&self) -> &str {
        &self.0
    }
}

impl From<&str> for VmId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Numeric ids are stored zero padded so that key order is id order.
macro_rules! numeric_id {
    ($name:ident) => {
        #[derive(
            Debug,
            Clone,
            Copy,
            Default,
            Serialize,
            Deserialize,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            pub fn key(&self) -> String {
                format!("{:020}", self.0)
            }

            pub fn from_key(key: &[u8]) -> Option<Self> {
                std::str::from_utf8(key).ok()?.parse().ok().map(Self)
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }
    };
}

numeric_id!(GpuCardId);
numeric_id!(VgpuProfileId);
numeric_id!(GpuDeviceId);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Host {
    pub id: HostId,
    pub name: String,
    pub created_at: u64,
}

impl Host {
    pub fn new(id: HostId, name: String) -> Self {
        Self {
            id,
            name,
            created_at: get_epoch_time_in_ms(),
        }
    }

    pub fn key(&self) -> String {
        self.id.get().to_string()
    }

    /// Host ids prefix every per-host index key.
    pub fn validate_id(id: &HostId) -> Result<(), String> {
        validate_key_component("host id", id.get())
    }
}

/// Ids that prefix composite keys must be non-empty and must not contain
/// the key separator.
fn validate_key_component(kind: &str, value: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("{} must not be empty", kind));
    }
    if value.contains(KEY_SEPARATOR) {
        return Err(format!(
            "{} {} must not contain '{}'",
            kind, value, KEY_SEPARATOR
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Vm {
    pub id: VmId,
    pub name: String,
    pub created_at: u64,
}

impl Vm {
    pub fn new(id: VmId, name: String) -> Self {
        Self {
            id,
            name,
            created_at: get_epoch_time_in_ms(),
        }
    }

    pub fn key(&self) -> String {
        self.id.get().to_string()
    }

    pub fn validate_id(id: &VmId) -> Result<(), String> {
        validate_key_component("vm id", id.get())
    }
}

/// A GPU hardware model, identified by its (vendor id, device id) pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Builder)]
pub struct GpuCard {
    pub id: GpuCardId,
    pub vendor_id: String,
    pub device_id: String,
    #[builder(default)]
    pub vendor_name: String,
    #[builder(default)]
    pub device_name: String,
    pub name: String,
    #[builder(default = "get_epoch_time_in_ms()")]
    pub created_at: u64,
}

impl GpuCard {
    pub fn key(&self) -> String {
        self.id.key()
    }

    pub fn hardware_key(&self) -> String {
        GpuCard::hardware_key_from(&self.vendor_id, &self.device_id)
    }

    /// PCI ids are hex; "10DE" and "10de" name the same vendor.
    pub fn hardware_key_from(vendor_id: &str, device_id: &str) -> String {
        format!(
            "{}|{}",
            vendor_id.trim().to_ascii_lowercase(),
            device_id.trim().to_ascii_lowercase()
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VgpuDisplayProperties {
    #[serde(default)]
    pub video_ram_mb: Option<u64>,
    #[serde(default)]
    pub max_heads: Option<u32>,
    #[serde(default)]
    pub max_resolution_x: Option<u32>,
    #[serde(default)]
    pub max_resolution_y: Option<u32>,
}

/// A named virtual GPU configuration scoped to one card.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Builder)]
pub struct VgpuProfile {
    pub id: VgpuProfileId,
    pub card_id: GpuCardId,
    pub name: String,
    #[builder(default)]
    pub description: String,
    #[builder(default = "1")]
    pub max_instances_per_gpu: u32,
    #[builder(default)]
    #[serde(default)]
    pub display: VgpuDisplayProperties,
    #[builder(default = "get_epoch_time_in_ms()")]
    pub created_at: u64,
}

impl VgpuProfile {
    pub fn key(&self) -> String {
        self.id.key()
    }

    pub fn name_key(&self) -> String {
        VgpuProfile::name_key_from(&self.card_id, &self.name)
    }

    pub fn name_key_from(card_id: &GpuCardId, name: &str) -> String {
        format!("{}|{}", card_id.key(), name)
    }

    pub fn card_prefix(card_id: &GpuCardId) -> String {
        format!("{}|", card_id.key())
    }

    pub fn passthrough(id: VgpuProfileId, card_id: GpuCardId) -> Self {
        Self {
            id,
            card_id,
            name: PASSTHROUGH_PROFILE_NAME.to_string(),
            description: "whole device passthrough".to_string(),
            max_instances_per_gpu: 1,
            display: VgpuDisplayProperties::default(),
            created_at: get_epoch_time_in_ms(),
        }
    }

    pub fn is_passthrough(&self) -> bool {
        self.name == PASSTHROUGH_PROFILE_NAME
    }
}

#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default, AsRefStr, strum::Display,
)]
pub enum DeviceType {
    #[default]
    #[serde(rename = "PCI")]
    #[strum(serialize = "PCI")]
    Pci,
    #[serde(rename = "MDEV")]
    #[strum(serialize = "MDEV")]
    Mdev,
    #[serde(rename = "VGPUOnly")]
    #[strum(serialize = "VGPUOnly")]
    VgpuOnly,
}

#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default, AsRefStr, strum::Display,
)]
pub enum DeviceState {
    #[default]
    Free,
    Allocated,
    Error,
}

#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default, AsRefStr, strum::Display,
)]
pub enum ResourceState {
    #[default]
    Enabled,
    Disabled,
}

/// One physical or mediated GPU on a host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Builder)]
#[builder(build_fn(validate = "Self::validate"))]
pub struct GpuDevice {
    pub id: GpuDeviceId,
    pub host_id: HostId,
    pub card_id: GpuCardId,
    pub vgpu_profile_id: VgpuProfileId,
    pub bus_address: String,
    #[builder(default)]
    pub device_type: DeviceType,
    #[builder(default)]
    pub numa_node: Option<String>,
    #[builder(default)]
    pub pci_root: Option<String>,
    #[builder(default)]
    pub parent_device_id: Option<GpuDeviceId>,
    #[builder(default)]
    pub state: DeviceState,
    #[builder(default)]
    pub resource_state: ResourceState,
    #[builder(default)]
    pub vm_id: Option<VmId>,
    /// Set when losing the device is what disabled it, so that only that
    /// disable is undone when the device is reported again.
    #[builder(default)]
    #[serde(default)]
    pub disabled_when_lost: bool,
    #[builder(default = "get_epoch_time_in_ms()")]
    pub created_at: u64,
}

impl GpuDeviceBuilder {
    fn validate(&self) -> Result<(), String> {
        let state = self.state.unwrap_or_default();
        let vm_id = self.vm_id.clone().flatten();
        occupancy_consistent(state, vm_id.as_ref())
    }
}

fn occupancy_consistent(state: DeviceState, vm_id: Option<&VmId>) -> Result<(), String> {
    match (state, vm_id) {
        (DeviceState::Allocated, None) => Err("allocated device must be bound to a vm".to_string()),
        (DeviceState::Free | DeviceState::Error, Some(vm_id)) => Err(format!(
            "device in state {} must not be bound to vm {}",
            state, vm_id
        )),
        _ => Ok(()),
    }
}

/// Maps an unreported, blank, or "-1" topology value to the shared unknown
/// bucket. Linux reports NUMA node -1 when the platform has no affinity.
fn topology_bucket(value: Option<&str>) -> &str {
    match non_blank(value) {
        Some("-1") | None => UNKNOWN_TOPOLOGY,
        Some(v) => v,
    }
}

impl GpuDevice {
    pub fn key(&self) -> String {
        self.id.key()
    }

    pub fn host_index_key(&self) -> String {
        GpuDevice::host_index_key_from(&self.host_id, &self.bus_address)
    }

    pub fn host_index_key_from(host_id: &HostId, bus_address: &str) -> String {
        format!("{}|{}", host_id, bus_address)
    }

    pub fn host_prefix(host_id: &HostId) -> String {
        format!("{}|", host_id)
    }

    pub fn vm_index_key(&self) -> Option<String> {
        self.vm_id
            .as_ref()
            .map(|vm_id| GpuDevice::vm_index_key_from(vm_id, &self.id))
    }

    pub fn vm_index_key_from(vm_id: &VmId, device_id: &GpuDeviceId) -> String {
        format!("{}|{}", vm_id, device_id.key())
    }

    pub fn vm_prefix(vm_id: &VmId) -> String {
        format!("{}|", vm_id)
    }

    pub fn numa_bucket(&self) -> &str {
        topology_bucket(self.numa_node.as_deref())
    }

    pub fn pci_root_bucket(&self) -> &str {
        topology_bucket(self.pci_root.as_deref())
    }

    /// Free, enabled and unbound.
    pub fn is_allocatable(&self) -> bool {
        self.state == DeviceState::Free
            && self.resource_state == ResourceState::Enabled
            && self.vm_id.is_none()
    }

    pub fn check_occupancy(&self) -> Result<(), String> {
        occupancy_consistent(self.state, self.vm_id.as_ref())
    }

    pub fn claim(&mut self, vm_id: VmId) {
        self.state = DeviceState::Allocated;
        self.vm_id = Some(vm_id);
    }

    pub fn release(&mut self) {
        self.state = DeviceState::Free;
        self.vm_id = None;
    }

    /// A previously known device missing from the latest host report.
    pub fn mark_lost(&mut self) {
        if self.state != DeviceState::Error {
            self.disabled_when_lost = self.resource_state == ResourceState::Enabled;
        }
        self.state = DeviceState::Error;
        self.resource_state = ResourceState::Disabled;
        self.vm_id = None;
    }

    /// A lost device reported again. Re-enables it unless an administrator
    /// had disabled it before it went missing.
    pub fn revive(&mut self) {
        if self.disabled_when_lost {
            self.resource_state = ResourceState::Enabled;
        }
        self.disabled_when_lost = false;
    }

    /// An administrative resource-state change replaces whatever the
    /// reconciler decided.
    pub fn set_resource_state(&mut self, target: ResourceState) {
        self.resource_state = target;
        self.disabled_when_lost = false;
    }
}

fn default_passthrough_enabled() -> bool {
    true
}

/// A host agent's report of one device it currently sees.
///
/// Every field is optional on the wire so that a single unusable fact can be
/// skipped instead of failing the whole report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DeviceFact {
    #[serde(default)]
    pub vendor_id: String,
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub vendor_name: String,
    #[serde(default)]
    pub device_name: String,
    #[serde(default)]
    pub card_name: Option<String>,
    #[serde(default)]
    pub bus_address: Option<String>,
    #[serde(default)]
    pub model_name: String,
    #[serde(default)]
    pub parent_bus_address: Option<String>,
    #[serde(default)]
    pub numa_node: Option<String>,
    #[serde(default)]
    pub pci_root: Option<String>,
    #[serde(default = "default_passthrough_enabled")]
    pub passthrough_enabled: bool,
    #[serde(default)]
    pub max_instances: Option<u32>,
    #[serde(default)]
    pub display: VgpuDisplayProperties,
    #[serde(default)]
    pub vm_name: Option<String>,
}

impl DeviceFact {
    pub fn bus_address(&self) -> Option<&str> {
        non_blank(self.bus_address.as_deref())
    }

    pub fn parent_bus_address(&self) -> Option<&str> {
        non_blank(self.parent_bus_address.as_deref())
    }

    pub fn vm_name(&self) -> Option<&str> {
        non_blank(self.vm_name.as_deref())
    }

    pub fn model_name(&self) -> &str {
        self.model_name.trim()
    }

    pub fn card_display_name(&self) -> String {
        if let Some(name) = non_blank(self.card_name.as_deref()) {
            return name.to_string();
        }
        if let Some(name) = non_blank(Some(self.device_name.as_str())) {
            return name.to_string();
        }
        format!("{}:{}", self.vendor_id.trim(), self.device_id.trim())
    }

    pub fn device_type(&self) -> DeviceType {
        if self.passthrough_enabled {
            DeviceType::Pci
        } else {
            DeviceType::VgpuOnly
        }
    }

    /// Hint used when the fact introduces a new profile. Zero is treated as
    /// absent.
    pub fn max_instances(&self) -> u32 {
        self.max_instances.filter(|n| *n > 0).unwrap_or(1)
    }

    /// Returns the fact's bus address, or why the fact cannot be merged.
    pub fn validate(&self) -> Result<&str, String> {
        let Some(bus_address) = self.bus_address() else {
            return Err(format!(
                "fact for {}:{} model {:?} has no bus address",
                self.vendor_id, self.device_id, self.model_name
            ));
        };
        if self.vendor_id.trim().is_empty() || self.device_id.trim().is_empty() {
            return Err(format!(
                "fact at bus address {} has no vendor or device id",
                bus_address
            ));
        }
        if self.model_name().is_empty() {
            return Err(format!("fact at bus address {} has no model name", bus_address));
        }
        Ok(bus_address)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CapacityKey {
    pub card_name: String,
    pub profile_name: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capacity {
    pub free: u32,
    pub total: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityEntry {
    pub card_name: String,
    pub profile_name: String,
    pub free: u32,
    pub total: u32,
}

/// Free and total device counts per (card, profile) on one host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostCapacity {
    pub host_id: HostId,
    pub capacity: BTreeMap<CapacityKey, Capacity>,
}

impl HostCapacity {
    pub fn new(host_id: HostId) -> Self {
        Self {
            host_id,
            capacity: BTreeMap::new(),
        }
    }

    pub fn record(&mut self, card_name: &str, profile_name: &str, free: bool) {
        let entry = self
            .capacity
            .entry(CapacityKey {
                card_name: card_name.to_string(),
                profile_name: profile_name.to_string(),
            })
            .or_default();
        entry.total += 1;
        if free {
            entry.free += 1;
        }
    }

    pub fn get(&self, card_name: &str, profile_name: &str) -> Capacity {
        self.capacity
            .get(&CapacityKey {
                card_name: card_name.to_string(),
                profile_name: profile_name.to_string(),
            })
            .copied()
            .unwrap_or_default()
    }

    pub fn entries(&self) -> Vec<CapacityEntry> {
        self.capacity
            .iter()
            .map(|(key, capacity)| CapacityEntry {
                card_name: key.card_name.clone(),
                profile_name: key.profile_name.clone(),
                free: capacity.free,
                total: capacity.total,
            })
            .collect()
    }
}

// Struct keys don't survive JSON maps, so the capacity is written as a list.
impl Serialize for HostCapacity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("HostCapacity", 2)?;
        state.serialize_field("host_id", &self.host_id)?;
        state.serialize_field("entries", &self.entries())?;
        state.end()
    }
}

/// Which rung of the packing ladder satisfied an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, strum::Display)]
pub enum PackingTier {
    SameNumaSameRoot,
    SameNuma,
    Scattered,
}

/// What the host agent needs to attach one claimed device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatedDevice {
    pub id: GpuDeviceId,
    pub bus_address: String,
    pub parent_bus_address: Option<String>,
    pub device_type: DeviceType,
    pub card_name: String,
    pub profile_name: String,
    pub vendor_id: String,
    pub hardware_device_id: String,
    pub numa_node: Option<String>,
    pub pci_root: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AllocationResponse {
    pub host_id: HostId,
    pub vm_id: VmId,
    pub tier: PackingTier,
    pub devices: Vec<AllocatedDevice>,
    pub capacity: HostCapacity,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub marked_lost: usize,
    pub skipped: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(numa: Option<&str>, root: Option<&str>) -> GpuDevice {
        GpuDeviceBuilder::default()
            .id(GpuDeviceId(1))
            .host_id(HostId::from("h1"))
            .card_id(GpuCardId(1))
            .vgpu_profile_id(VgpuProfileId(1))
            .bus_address("0000:3b:00.0".to_string())
            .numa_node(numa.map(str::to_string))
            .pci_root(root.map(str::to_string))
            .build()
            .unwrap()
    }

    #[test]
    fn test_topology_buckets() {
        assert_eq!(device(Some("0"), Some("pci0000:00")).numa_bucket(), "0");
        assert_eq!(device(None, None).numa_bucket(), UNKNOWN_TOPOLOGY);
        assert_eq!(device(Some("  "), None).numa_bucket(), UNKNOWN_TOPOLOGY);
        assert_eq!(device(Some("-1"), None).numa_bucket(), UNKNOWN_TOPOLOGY);
        assert_eq!(device(None, Some("")).pci_root_bucket(), UNKNOWN_TOPOLOGY);
    }

    #[test]
    fn test_builder_rejects_inconsistent_occupancy() {
        let result = GpuDeviceBuilder::default()
            .id(GpuDeviceId(1))
            .host_id(HostId::from("h1"))
            .card_id(GpuCardId(1))
            .vgpu_profile_id(VgpuProfileId(1))
            .bus_address("0000:3b:00.0".to_string())
            .state(DeviceState::Allocated)
            .build();
        assert!(result.is_err());

        let result = GpuDeviceBuilder::default()
            .id(GpuDeviceId(1))
            .host_id(HostId::from("h1"))
            .card_id(GpuCardId(1))
            .vgpu_profile_id(VgpuProfileId(1))
            .bus_address("0000:3b:00.0".to_string())
            .vm_id(Some(VmId::from("vm-1")))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_claim_release_and_lost() {
        let mut device = device(Some("0"), None);
        assert!(device.is_allocatable());
        device.claim(VmId::from("vm-1"));
        assert!(!device.is_allocatable());
        assert!(device.check_occupancy().is_ok());
        device.release();
        assert!(device.is_allocatable());
        device.claim(VmId::from("vm-1"));
        device.mark_lost();
        assert_eq!(device.state, DeviceState::Error);
        assert_eq!(device.resource_state, ResourceState::Disabled);
        assert!(device.vm_id.is_none());
        assert!(device.check_occupancy().is_ok());
        assert!(device.disabled_when_lost);
    }

    #[test]
    fn test_revive_keeps_admin_disable() {
        let mut lost = device(Some("0"), None);
        lost.mark_lost();
        // Losing it again must not forget who disabled it.
        lost.mark_lost();
        lost.revive();
        assert_eq!(lost.resource_state, ResourceState::Enabled);

        let mut disabled = device(Some("0"), None);
        disabled.set_resource_state(ResourceState::Disabled);
        disabled.mark_lost();
        assert!(!disabled.disabled_when_lost);
        disabled.revive();
        assert_eq!(disabled.resource_state, ResourceState::Disabled);

        let mut disabled_while_lost = device(Some("0"), None);
        disabled_while_lost.mark_lost();
        disabled_while_lost.set_resource_state(ResourceState::Disabled);
        disabled_while_lost.revive();
        assert_eq!(disabled_while_lost.resource_state, ResourceState::Disabled);
    }

    #[test]
    fn test_numeric_id_keys_sort_numerically() {
        let small = GpuDeviceId(9).key();
        let large = GpuDeviceId(10).key();
        assert!(small < large);
        assert_eq!(GpuDeviceId::from_key(large.as_bytes()), Some(GpuDeviceId(10)));
        assert_eq!(GpuDeviceId::from_key(b"not-a-number"), None);
    }

    #[test]
    fn test_hardware_key_is_case_insensitive() {
        assert_eq!(
            GpuCard::hardware_key_from("10DE", "20B5"),
            GpuCard::hardware_key_from("10de", " 20b5")
        );
    }

    #[test]
    fn test_fact_validation() {
        let fact = DeviceFact {
            vendor_id: "10de".to_string(),
            device_id: "20b5".to_string(),
            bus_address: Some("0000:3b:00.0".to_string()),
            model_name: "passthrough".to_string(),
            passthrough_enabled: true,
            ..Default::default()
        };
        assert_eq!(fact.validate(), Ok("0000:3b:00.0"));
        assert_eq!(fact.device_type(), DeviceType::Pci);
        assert_eq!(fact.card_display_name(), "10de:20b5");

        let missing_bus = DeviceFact {
            bus_address: Some(" ".to_string()),
            ..fact.clone()
        };
        assert!(missing_bus.validate().is_err());

        let vgpu_only = DeviceFact {
            passthrough_enabled: false,
            max_instances: Some(0),
            ..fact
        };
        assert_eq!(vgpu_only.device_type(), DeviceType::VgpuOnly);
        assert_eq!(vgpu_only.max_instances(), 1);
    }

    #[test]
    fn test_fact_defaults_from_json() {
        let fact: DeviceFact = serde_json::from_str(
            r#"{"vendor_id":"10de","device_id":"20b5","bus_address":"0000:3b:00.0","model_name":"GRID A100-4C"}"#,
        )
        .unwrap();
        assert!(fact.passthrough_enabled);
        assert!(fact.vm_name().is_none());
    }

    #[test]
    fn test_host_capacity_serializes_as_entries() {
        let mut capacity = HostCapacity::new(HostId::from("h1"));
        capacity.record("A100", "passthrough", true);
        capacity.record("A100", "passthrough", false);
        assert_eq!(capacity.get("A100", "passthrough"), Capacity { free: 1, total: 2 });
        assert_eq!(capacity.get("A100", "missing"), Capacity::default());
        let json = serde_json::to_value(&capacity).unwrap();
        assert_eq!(json["entries"][0]["total"], 2);
        assert_eq!(json["host_id"], "h1");
    }

    #[test]
    fn test_host_id_validation() {
        assert!(Host::validate_id(&HostId::from("kvm-01")).is_ok());
        assert!(Host::validate_id(&HostId::from("")).is_err());
        assert!(Host::validate_id(&HostId::from("a|b")).is_err());
        assert!(Vm::validate_id(&VmId::from("vm-1")).is_ok());
        assert!(Vm::validate_id(&VmId::from(" ")).is_err());
    }
}
