use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
};

use anyhow::anyhow;
use data_model::{
    DeviceFact,
    DeviceState,
    DeviceType,
    GpuDevice,
    GpuDeviceBuilder,
    GpuDeviceId,
    HostId,
    ReconcileSummary,
    ResourceState,
    VmId,
};
use inventory_utils::non_blank;
use metrics::{reconciler::Metrics, Timer};
use state_store::{
    error::{InventoryError, Result},
    scanner::InventoryRead,
    transaction::StoreTransaction,
    InventoryState,
};
use tracing::{debug, info, warn};

/// Merges host agent reports into the device inventory.
pub struct Reconciler {
    state: Arc<InventoryState>,
    metrics: Metrics,
}

impl Reconciler {
    pub fn new(state: Arc<InventoryState>) -> Self {
        Self {
            state,
            metrics: Metrics::new(),
        }
    }

    /// Applies one full snapshot of the devices `host_id` currently sees.
    ///
    /// Known devices missing from the snapshot are marked lost, never
    /// deleted. Reconciling the same snapshot twice writes nothing the
    /// second time.
    #[tracing::instrument(skip(self, facts), fields(host_id = %host_id, facts = facts.len()))]
    pub async fn reconcile(&self, host_id: &HostId, facts: &[DeviceFact]) -> Result<ReconcileSummary> {
        let _timer = Timer::start(&self.metrics.reconcile_latency);
        let summary = self
            .state
            .run_in_host_txn(host_id, |txn| merge_report(txn, host_id, facts))
            .await?;

        self.metrics.devices_created.add(summary.created as u64, &[]);
        self.metrics.devices_lost.add(summary.marked_lost as u64, &[]);
        self.metrics.facts_skipped.add(summary.skipped.len() as u64, &[]);
        info!(
            created = summary.created,
            updated = summary.updated,
            unchanged = summary.unchanged,
            marked_lost = summary.marked_lost,
            skipped = summary.skipped.len(),
            "reconciled host device report"
        );
        Ok(summary)
    }
}

/// A reported device after merging, next to the row it replaces.
struct MergedDevice<'f> {
    previous: Option<GpuDevice>,
    device: GpuDevice,
    parent_bus_address: Option<&'f str>,
}

fn merge_report(
    txn: &StoreTransaction,
    host_id: &HostId,
    facts: &[DeviceFact],
) -> Result<ReconcileSummary> {
    txn.require_host(host_id)?;
    let persisted: HashMap<String, GpuDevice> = txn
        .devices_for_host(host_id)?
        .into_iter()
        .map(|device| (device.bus_address.clone(), device))
        .collect();

    let mut summary = ReconcileSummary::default();
    let mut merged: BTreeMap<String, MergedDevice> = BTreeMap::new();
    for fact in facts {
        let bus_address = match fact.validate() {
            Ok(bus_address) if merged.contains_key(bus_address) => {
                skip_fact(
                    &mut summary,
                    host_id,
                    format!("bus address {} is reported more than once", bus_address),
                );
                continue;
            }
            Ok(bus_address) => bus_address.to_string(),
            Err(reason) => {
                skip_fact(&mut summary, host_id, reason);
                continue;
            }
        };
        let device = merge_fact(txn, host_id, &bus_address, fact, persisted.get(&bus_address))?;
        merged.insert(
            bus_address.clone(),
            MergedDevice {
                previous: persisted.get(&bus_address).cloned(),
                device,
                parent_bus_address: fact.parent_bus_address(),
            },
        );
    }

    link_parents(host_id, &persisted, &mut merged);
    let reported: HashSet<String> = merged.keys().cloned().collect();

    // Parents are written before the children that point at them.
    let mut writes: Vec<MergedDevice> = merged.into_values().collect();
    writes.sort_by_key(|merged| merged.device.parent_device_id.is_some());
    for MergedDevice { previous, device, .. } in writes {
        match previous {
            None => {
                txn.insert_device(&device)?;
                summary.created += 1;
                info!(
                    device_id = device.id.0,
                    bus_address = %device.bus_address,
                    profile_id = device.vgpu_profile_id.0,
                    "discovered gpu device"
                );
            }
            Some(previous) if previous == device => summary.unchanged += 1,
            Some(previous) => {
                txn.update_device(&previous, &device)?;
                summary.updated += 1;
                debug!(
                    device_id = device.id.0,
                    bus_address = %device.bus_address,
                    state = %device.state,
                    "updated gpu device from report"
                );
            }
        }
    }

    for (bus_address, previous) in &persisted {
        if reported.contains(bus_address) {
            continue;
        }
        let mut device = previous.clone();
        device.mark_lost();
        if device == *previous {
            continue;
        }
        txn.update_device(previous, &device)?;
        summary.marked_lost += 1;
        warn!(
            device_id = device.id.0,
            bus_address = %bus_address,
            "gpu device missing from host report, marking it lost"
        );
    }
    Ok(summary)
}

fn skip_fact(summary: &mut ReconcileSummary, host_id: &HostId, reason: String) {
    let err = InventoryError::MalformedFact(reason);
    warn!(host_id = %host_id, error = %err, "skipping device fact");
    summary.skipped.push(err.to_string());
}

/// Builds the desired row for one well-formed fact. Parent links are left
/// alone here and resolved once the whole report is merged.
fn merge_fact(
    txn: &StoreTransaction,
    host_id: &HostId,
    bus_address: &str,
    fact: &DeviceFact,
    existing: Option<&GpuDevice>,
) -> Result<GpuDevice> {
    let card = txn.resolve_or_create_card(fact)?;
    let profile = txn.resolve_or_create_profile(&card, fact)?;
    let vm_id = occupying_vm(txn, bus_address, fact)?;
    let numa_node = non_blank(fact.numa_node.as_deref()).map(str::to_string);
    let pci_root = non_blank(fact.pci_root.as_deref()).map(str::to_string);

    let Some(existing) = existing else {
        let state = if vm_id.is_some() {
            DeviceState::Allocated
        } else {
            DeviceState::Free
        };
        return GpuDeviceBuilder::default()
            .id(txn.next_device_id())
            .host_id(host_id.clone())
            .card_id(card.id)
            .vgpu_profile_id(profile.id)
            .bus_address(bus_address.to_string())
            .device_type(fact.device_type())
            .numa_node(numa_node)
            .pci_root(pci_root)
            .state(state)
            .resource_state(ResourceState::Enabled)
            .vm_id(vm_id)
            .build()
            .map_err(|e| anyhow!("failed to build gpu device at {}: {}", bus_address, e).into());
    };

    let mut device = existing.clone();
    device.card_id = card.id;
    device.vgpu_profile_id = profile.id;
    device.device_type = reported_device_type(existing.device_type, fact);
    device.numa_node = numa_node;
    device.pci_root = pci_root;
    if existing.state == DeviceState::Error {
        device.revive();
    }
    match vm_id {
        Some(vm_id) => device.claim(vm_id),
        None => device.release(),
    }
    Ok(device)
}

/// Mediated devices are only ever typed by an administrator; a report can
/// not tell them apart from vGPU-only ones.
fn reported_device_type(current: DeviceType, fact: &DeviceFact) -> DeviceType {
    match (current, fact.device_type()) {
        (DeviceType::Mdev, DeviceType::VgpuOnly) => DeviceType::Mdev,
        (_, reported) => reported,
    }
}

fn occupying_vm(txn: &StoreTransaction, bus_address: &str, fact: &DeviceFact) -> Result<Option<VmId>> {
    let Some(vm_name) = fact.vm_name() else {
        return Ok(None);
    };
    match txn.find_vm_by_name(vm_name)? {
        Some(vm) => Ok(Some(vm.id)),
        None => {
            debug!(
                bus_address = %bus_address,
                vm_name = %vm_name,
                "occupying vm is not registered, treating device as free"
            );
            Ok(None)
        }
    }
}

/// Fills in missing parent links from the reported parent bus addresses.
/// Links that would break the two-level tree are dropped with a warning.
fn link_parents(
    host_id: &HostId,
    persisted: &HashMap<String, GpuDevice>,
    merged: &mut BTreeMap<String, MergedDevice<'_>>,
) {
    let mut id_by_bus: HashMap<String, GpuDeviceId> = persisted
        .iter()
        .map(|(bus_address, device)| (bus_address.clone(), device.id))
        .collect();
    let mut parent_of: HashMap<GpuDeviceId, Option<GpuDeviceId>> = persisted
        .values()
        .map(|device| (device.id, device.parent_device_id))
        .collect();
    for merged_device in merged.values() {
        let device = &merged_device.device;
        id_by_bus.insert(device.bus_address.clone(), device.id);
        parent_of.insert(device.id, device.parent_device_id);
    }

    for (bus_address, merged_device) in merged.iter_mut() {
        if merged_device.device.parent_device_id.is_some() {
            continue;
        }
        let Some(parent_bus_address) = merged_device.parent_bus_address else {
            continue;
        };
        let Some(&parent_id) = id_by_bus.get(parent_bus_address) else {
            debug!(
                host_id = %host_id,
                bus_address = %bus_address,
                parent_bus_address = %parent_bus_address,
                "parent device not known yet, leaving link unset"
            );
            continue;
        };
        let device_id = merged_device.device.id;
        let parent_is_child = parent_of.get(&parent_id).copied().flatten().is_some();
        let has_children = parent_of.values().any(|parent| *parent == Some(device_id));
        if parent_id == device_id || parent_is_child || has_children {
            warn!(
                host_id = %host_id,
                bus_address = %bus_address,
                parent_bus_address = %parent_bus_address,
                "reported parent link would nest devices more than two levels, ignoring it"
            );
            continue;
        }
        merged_device.device.parent_device_id = Some(parent_id);
        parent_of.insert(device_id, Some(parent_id));
    }
}
