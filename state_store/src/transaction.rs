use std::{
    fmt::Debug,
    sync::atomic::{AtomicU64, Ordering},
};

use anyhow::anyhow;
use data_model::{
    DeviceFact,
    DeviceState,
    GpuCard,
    GpuCardBuilder,
    GpuCardId,
    GpuDevice,
    GpuDeviceId,
    Host,
    HostId,
    VgpuProfile,
    VgpuProfileBuilder,
    VgpuProfileId,
    Vm,
    VmId,
    PASSTHROUGH_PROFILE_NAME,
};
use rocksdb::{ColumnFamily, Direction, IteratorMode, Transaction, TransactionDB};
use serde::{de::DeserializeOwned, Serialize};
use tracing::info;

use crate::{
    error::{InventoryError, Result},
    scanner::{InventoryRead, KVBytes},
    serializer::{JsonEncode, JsonEncoder},
    state_machine::InventoryColumns,
};

/// In-process id sequences for the numeric tables. Recovered from the
/// highest persisted key when the store opens.
#[derive(Debug, Default)]
pub struct IdSequences {
    cards: AtomicU64,
    profiles: AtomicU64,
    devices: AtomicU64,
}

impl IdSequences {
    pub(crate) fn recover(db: &TransactionDB) -> Result<Self> {
        Ok(Self {
            cards: AtomicU64::new(last_id(db, InventoryColumns::GpuCards)?),
            profiles: AtomicU64::new(last_id(db, InventoryColumns::VgpuProfiles)?),
            devices: AtomicU64::new(last_id(db, InventoryColumns::GpuDevices)?),
        })
    }
}

fn last_id(db: &TransactionDB, column: InventoryColumns) -> Result<u64> {
    let cf = column.cf(db)?;
    let Some(kv) = db.iterator_cf(cf, IteratorMode::End).next() else {
        return Ok(0);
    };
    let (key, _) = kv?;
    let id = std::str::from_utf8(&key)
        .ok()
        .and_then(|key| key.parse::<u64>().ok())
        .ok_or_else(|| anyhow!("invalid id key in {}: {:?}", column, key))?;
    Ok(id)
}

/// One RocksDB transaction with typed, integrity checked accessors for the
/// inventory tables. Uncommitted changes are rolled back on drop.
pub struct StoreTransaction<'db> {
    db: &'db TransactionDB,
    txn: Transaction<'db, TransactionDB>,
    sequences: &'db IdSequences,
}

impl<'db> StoreTransaction<'db> {
    pub(crate) fn new(
        db: &'db TransactionDB,
        txn: Transaction<'db, TransactionDB>,
        sequences: &'db IdSequences,
    ) -> Self {
        Self { db, txn, sequences }
    }

    pub(crate) fn commit(self) -> Result<()> {
        self.txn.commit()?;
        Ok(())
    }

    fn cf(&self, column: InventoryColumns) -> Result<&'db ColumnFamily> {
        Ok(column.cf(self.db)?)
    }

    /// Reads `key` and locks it until commit, whether or not it exists.
    fn get_for_update<T: DeserializeOwned>(
        &self,
        column: InventoryColumns,
        key: &str,
        exclusive: bool,
    ) -> Result<Option<T>> {
        let cf = self.cf(column)?;
        match self.txn.get_for_update_cf(cf, key, exclusive)? {
            Some(bytes) => Ok(Some(JsonEncoder::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Looks up a unique index entry ahead of a resolve-or-create. An entry
    /// that exists is only share-locked, so transactions of different hosts
    /// can hold it together. A missing entry is locked exclusively before the
    /// caller inserts it, which makes a concurrent creator wait for the
    /// winner's commit.
    fn lock_index_entry<T: DeserializeOwned>(
        &self,
        column: InventoryColumns,
        key: &str,
    ) -> Result<Option<T>> {
        if self.get_row::<T>(column, key)?.is_some() {
            if let Some(value) = self.get_for_update(column, key, false)? {
                return Ok(Some(value));
            }
        }
        self.get_for_update(column, key, true)
    }

    fn put<T: Serialize + Debug>(&self, column: InventoryColumns, key: &str, value: &T) -> Result<()> {
        let serialized = JsonEncoder::encode(value)?;
        self.txn.put_cf(self.cf(column)?, key, serialized)?;
        Ok(())
    }

    fn delete(&self, column: InventoryColumns, key: &str) -> Result<()> {
        self.txn.delete_cf(self.cf(column)?, key)?;
        Ok(())
    }

    pub fn next_card_id(&self) -> GpuCardId {
        GpuCardId(self.sequences.cards.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub fn next_profile_id(&self) -> VgpuProfileId {
        VgpuProfileId(self.sequences.profiles.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub fn next_device_id(&self) -> GpuDeviceId {
        GpuDeviceId(self.sequences.devices.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub fn put_host(&self, host: &Host) -> Result<()> {
        Host::validate_id(&host.id).map_err(InventoryError::InvalidArgument)?;
        self.put(InventoryColumns::Hosts, &host.key(), host)
    }

    pub fn delete_host(&self, host_id: &HostId) -> Result<Host> {
        let host: Host = self
            .get_for_update(InventoryColumns::Hosts, host_id.get(), true)?
            .ok_or_else(|| InventoryError::not_found("host", host_id))?;
        let devices = self.devices_for_host(host_id)?;
        if !devices.is_empty() {
            return Err(InventoryError::InUse(format!(
                "host {} still has {} gpu devices",
                host_id,
                devices.len()
            )));
        }
        self.delete(InventoryColumns::Hosts, &host.key())?;
        Ok(host)
    }

    pub fn put_vm(&self, vm: &Vm) -> Result<()> {
        Vm::validate_id(&vm.id).map_err(InventoryError::InvalidArgument)?;
        if vm.name.trim().is_empty() {
            return Err(InventoryError::InvalidArgument(format!(
                "vm {} must have a name",
                vm.id
            )));
        }
        if let Some(holder) = self.get_for_update::<VmId>(InventoryColumns::VmsByName, &vm.name, true)? {
            if holder != vm.id {
                return Err(InventoryError::Conflict(format!(
                    "vm name {} is already held by vm {}",
                    vm.name, holder
                )));
            }
        }
        if let Some(previous) = self.get_for_update::<Vm>(InventoryColumns::Vms, &vm.key(), true)? {
            if previous.name != vm.name {
                self.delete(InventoryColumns::VmsByName, &previous.name)?;
            }
        }
        self.put(InventoryColumns::Vms, &vm.key(), vm)?;
        self.put(InventoryColumns::VmsByName, &vm.name, &vm.id)
    }

    pub fn delete_vm(&self, vm_id: &VmId) -> Result<Vm> {
        let vm: Vm = self
            .get_for_update(InventoryColumns::Vms, vm_id.get(), true)?
            .ok_or_else(|| InventoryError::not_found("vm", vm_id))?;
        let bound = self.devices_for_vm(vm_id)?;
        if !bound.is_empty() {
            return Err(InventoryError::InUse(format!(
                "vm {} is still bound to {} gpu devices",
                vm_id,
                bound.len()
            )));
        }
        self.delete(InventoryColumns::Vms, &vm.key())?;
        self.delete(InventoryColumns::VmsByName, &vm.name)?;
        Ok(vm)
    }

    /// Inserts a card and its passthrough profile. The hardware identity
    /// index key stays locked until commit.
    pub fn insert_card(&self, card: &GpuCard) -> Result<VgpuProfile> {
        if card.vendor_id.trim().is_empty() || card.device_id.trim().is_empty() {
            return Err(InventoryError::InvalidArgument(format!(
                "gpu card {} needs a vendor id and a device id",
                card.name
            )));
        }
        let hardware_key = card.hardware_key();
        if let Some(existing) =
            self.get_for_update::<GpuCardId>(InventoryColumns::GpuCardsByHardwareId, &hardware_key, true)?
        {
            return Err(InventoryError::Conflict(format!(
                "gpu card {} already exists for vendor:device {}",
                existing, hardware_key
            )));
        }
        self.put(InventoryColumns::GpuCards, &card.key(), card)?;
        self.put(InventoryColumns::GpuCardsByHardwareId, &hardware_key, &card.id)?;

        let passthrough = VgpuProfile::passthrough(self.next_profile_id(), card.id);
        self.insert_profile(&passthrough)?;
        Ok(passthrough)
    }

    /// Returns the card for the fact's (vendor id, device id), creating it
    /// when it has never been seen. A concurrent creator holding the index
    /// lock makes this wait; once it commits the existing row is selected.
    pub fn resolve_or_create_card(&self, fact: &DeviceFact) -> Result<GpuCard> {
        let hardware_key = GpuCard::hardware_key_from(&fact.vendor_id, &fact.device_id);
        if let Some(card_id) =
            self.lock_index_entry::<GpuCardId>(InventoryColumns::GpuCardsByHardwareId, &hardware_key)?
        {
            return self.require_card(card_id);
        }
        let card = GpuCardBuilder::default()
            .id(self.next_card_id())
            .vendor_id(fact.vendor_id.trim().to_string())
            .device_id(fact.device_id.trim().to_string())
            .vendor_name(fact.vendor_name.clone())
            .device_name(fact.device_name.clone())
            .name(fact.card_display_name())
            .build()
            .map_err(|e| anyhow!("failed to build gpu card for {}: {}", hardware_key, e))?;
        self.insert_card(&card)?;
        info!(
            card_id = card.id.0,
            vendor_id = %card.vendor_id,
            device_id = %card.device_id,
            "created gpu card from discovery"
        );
        Ok(card)
    }

    pub fn delete_card(&self, card_id: GpuCardId) -> Result<GpuCard> {
        let card: GpuCard = self
            .get_for_update(InventoryColumns::GpuCards, &card_id.key(), true)?
            .ok_or_else(|| InventoryError::not_found("gpu card", card_id))?;
        let hardware_key = card.hardware_key();
        self.get_for_update::<GpuCardId>(InventoryColumns::GpuCardsByHardwareId, &hardware_key, true)?;
        let referencing = self
            .all_devices()?
            .into_iter()
            .filter(|d| d.card_id == card_id)
            .count();
        if referencing > 0 {
            return Err(InventoryError::InUse(format!(
                "gpu card {} is referenced by {} devices",
                card_id, referencing
            )));
        }
        for profile in self.profiles_for_card(card_id)? {
            self.delete(InventoryColumns::VgpuProfiles, &profile.key())?;
            self.delete(InventoryColumns::VgpuProfilesByName, &profile.name_key())?;
        }
        self.delete(InventoryColumns::GpuCards, &card.key())?;
        self.delete(InventoryColumns::GpuCardsByHardwareId, &hardware_key)?;
        Ok(card)
    }

    pub fn insert_profile(&self, profile: &VgpuProfile) -> Result<()> {
        if profile.name.trim().is_empty() {
            return Err(InventoryError::InvalidArgument(format!(
                "vgpu profile {} must have a name",
                profile.id
            )));
        }
        if profile.max_instances_per_gpu == 0 {
            return Err(InventoryError::InvalidArgument(format!(
                "vgpu profile {} must allow at least one instance per gpu",
                profile.name
            )));
        }
        // Shared lock so that a concurrent card delete waits for this insert.
        self.get_for_update::<GpuCard>(InventoryColumns::GpuCards, &profile.card_id.key(), false)?
            .ok_or_else(|| InventoryError::not_found("gpu card", profile.card_id))?;
        let name_key = profile.name_key();
        if let Some(existing) =
            self.get_for_update::<VgpuProfileId>(InventoryColumns::VgpuProfilesByName, &name_key, true)?
        {
            return Err(InventoryError::Conflict(format!(
                "vgpu profile {} already exists on gpu card {} as profile {}",
                profile.name, profile.card_id, existing
            )));
        }
        self.put(InventoryColumns::VgpuProfiles, &profile.key(), profile)?;
        self.put(InventoryColumns::VgpuProfilesByName, &name_key, &profile.id)
    }

    /// Same create race handling as [`Self::resolve_or_create_card`], keyed
    /// by (card id, profile name).
    pub fn resolve_or_create_profile(&self, card: &GpuCard, fact: &DeviceFact) -> Result<VgpuProfile> {
        let name = fact.model_name();
        let name_key = VgpuProfile::name_key_from(&card.id, name);
        if let Some(profile_id) =
            self.lock_index_entry::<VgpuProfileId>(InventoryColumns::VgpuProfilesByName, &name_key)?
        {
            return self.require_profile(profile_id);
        }
        let max_instances = if name == PASSTHROUGH_PROFILE_NAME {
            1
        } else {
            fact.max_instances()
        };
        let profile = VgpuProfileBuilder::default()
            .id(self.next_profile_id())
            .card_id(card.id)
            .name(name.to_string())
            .max_instances_per_gpu(max_instances)
            .display(fact.display.clone())
            .build()
            .map_err(|e| anyhow!("failed to build vgpu profile {}: {}", name_key, e))?;
        self.insert_profile(&profile)?;
        info!(
            profile_id = profile.id.0,
            card_id = card.id.0,
            profile = %profile.name,
            "created vgpu profile from discovery"
        );
        Ok(profile)
    }

    pub fn delete_profile(&self, profile_id: VgpuProfileId) -> Result<VgpuProfile> {
        let profile: VgpuProfile = self
            .get_for_update(InventoryColumns::VgpuProfiles, &profile_id.key(), true)?
            .ok_or_else(|| InventoryError::not_found("vgpu profile", profile_id))?;
        if profile.is_passthrough() {
            return Err(InventoryError::InvalidArgument(format!(
                "passthrough profile {} is removed together with gpu card {}",
                profile_id, profile.card_id
            )));
        }
        self.get_for_update::<VgpuProfileId>(
            InventoryColumns::VgpuProfilesByName,
            &profile.name_key(),
            true,
        )?;
        let referencing = self
            .all_devices()?
            .into_iter()
            .filter(|d| d.vgpu_profile_id == profile_id)
            .count();
        if referencing > 0 {
            return Err(InventoryError::InUse(format!(
                "vgpu profile {} is referenced by {} devices",
                profile_id, referencing
            )));
        }
        self.delete(InventoryColumns::VgpuProfiles, &profile.key())?;
        self.delete(InventoryColumns::VgpuProfilesByName, &profile.name_key())?;
        Ok(profile)
    }

    pub fn get_device_for_update(&self, device_id: GpuDeviceId) -> Result<GpuDevice> {
        self.get_for_update(InventoryColumns::GpuDevices, &device_id.key(), true)?
            .ok_or_else(|| InventoryError::not_found("gpu device", device_id))
    }

    /// Referential checks every device write must pass before it is
    /// persisted.
    fn check_device(&self, device: &GpuDevice) -> Result<()> {
        self.require_host(&device.host_id)?;
        device.check_occupancy().map_err(|reason| {
            InventoryError::InvalidArgument(format!("gpu device {}: {}", device.id, reason))
        })?;
        self.get_for_update::<GpuCard>(InventoryColumns::GpuCards, &device.card_id.key(), false)?
            .ok_or_else(|| InventoryError::not_found("gpu card", device.card_id))?;
        let profile: VgpuProfile = self
            .get_for_update(
                InventoryColumns::VgpuProfiles,
                &device.vgpu_profile_id.key(),
                false,
            )?
            .ok_or_else(|| InventoryError::not_found("vgpu profile", device.vgpu_profile_id))?;
        if profile.card_id != device.card_id {
            return Err(InventoryError::InvalidArgument(format!(
                "gpu device {} on host {}: vgpu profile {} belongs to card {}, not card {}",
                device.id, device.host_id, profile.id, profile.card_id, device.card_id
            )));
        }
        if let Some(parent_id) = device.parent_device_id {
            self.check_parent(device, parent_id)?;
        }
        Ok(())
    }

    /// Parent links form trees of depth at most two within one host.
    fn check_parent(&self, device: &GpuDevice, parent_id: GpuDeviceId) -> Result<()> {
        if parent_id == device.id {
            return Err(InventoryError::InvalidArgument(format!(
                "gpu device {} cannot be its own parent",
                device.id
            )));
        }
        let parent = self.require_device(parent_id)?;
        if parent.host_id != device.host_id {
            return Err(InventoryError::InvalidArgument(format!(
                "parent gpu device {} is on host {}, not host {}",
                parent_id, parent.host_id, device.host_id
            )));
        }
        if parent.parent_device_id.is_some() {
            return Err(InventoryError::InvalidArgument(format!(
                "parent gpu device {} at {} is itself a child device",
                parent_id, parent.bus_address
            )));
        }
        if self.has_children(&device.host_id, device.id)? {
            return Err(InventoryError::InvalidArgument(format!(
                "gpu device {} at {} has child devices and cannot take a parent",
                device.id, device.bus_address
            )));
        }
        Ok(())
    }

    pub fn has_children(&self, host_id: &HostId, device_id: GpuDeviceId) -> Result<bool> {
        Ok(self
            .devices_for_host(host_id)?
            .iter()
            .any(|d| d.parent_device_id == Some(device_id)))
    }

    pub fn insert_device(&self, device: &GpuDevice) -> Result<()> {
        self.check_device(device)?;
        let host_key = device.host_index_key();
        if let Some(existing) =
            self.get_for_update::<GpuDeviceId>(InventoryColumns::GpuDevicesByHost, &host_key, true)?
        {
            return Err(InventoryError::Conflict(format!(
                "host {} already has gpu device {} at bus address {}",
                device.host_id, existing, device.bus_address
            )));
        }
        self.put(InventoryColumns::GpuDevices, &device.key(), device)?;
        self.put(InventoryColumns::GpuDevicesByHost, &host_key, &device.id)?;
        if let Some(vm_key) = device.vm_index_key() {
            self.put(InventoryColumns::GpuDevicesByVm, &vm_key, &device.host_id)?;
        }
        Ok(())
    }

    /// Writes `device` over `previous`, keeping the secondary indexes in
    /// step.
    pub fn update_device(&self, previous: &GpuDevice, device: &GpuDevice) -> Result<()> {
        if previous.id != device.id || previous.host_id != device.host_id {
            return Err(InventoryError::InvalidArgument(format!(
                "gpu device {} cannot change identity or host",
                previous.id
            )));
        }
        self.check_device(device)?;
        if previous.bus_address != device.bus_address {
            let host_key = device.host_index_key();
            if let Some(existing) =
                self.get_for_update::<GpuDeviceId>(InventoryColumns::GpuDevicesByHost, &host_key, true)?
            {
                return Err(InventoryError::Conflict(format!(
                    "host {} already has gpu device {} at bus address {}",
                    device.host_id, existing, device.bus_address
                )));
            }
            self.delete(InventoryColumns::GpuDevicesByHost, &previous.host_index_key())?;
            self.put(InventoryColumns::GpuDevicesByHost, &host_key, &device.id)?;
        }
        let previous_vm_key = previous.vm_index_key();
        let vm_key = device.vm_index_key();
        if previous_vm_key != vm_key {
            if let Some(key) = previous_vm_key {
                self.delete(InventoryColumns::GpuDevicesByVm, &key)?;
            }
            if let Some(key) = vm_key {
                self.put(InventoryColumns::GpuDevicesByVm, &key, &device.host_id)?;
            }
        }
        self.put(InventoryColumns::GpuDevices, &device.key(), device)
    }

    pub fn delete_device(&self, device_id: GpuDeviceId) -> Result<GpuDevice> {
        let device = self.get_device_for_update(device_id)?;
        if device.state == DeviceState::Allocated {
            return Err(InventoryError::InUse(format!(
                "gpu device {} at {} on host {} is allocated to vm {}",
                device.id,
                device.bus_address,
                device.host_id,
                device.vm_id.as_ref().map(|v| v.to_string()).unwrap_or_default()
            )));
        }
        if self.has_children(&device.host_id, device.id)? {
            return Err(InventoryError::InUse(format!(
                "gpu device {} at {} on host {} has child devices",
                device.id, device.bus_address, device.host_id
            )));
        }
        self.delete(InventoryColumns::GpuDevices, &device.key())?;
        self.delete(InventoryColumns::GpuDevicesByHost, &device.host_index_key())?;
        if let Some(vm_key) = device.vm_index_key() {
            self.delete(InventoryColumns::GpuDevicesByVm, &vm_key)?;
        }
        Ok(device)
    }
}

impl InventoryRead for StoreTransaction<'_> {
    fn get_row<T: DeserializeOwned>(
        &self,
        column: InventoryColumns,
        key: &str,
    ) -> Result<Option<T>> {
        match self.txn.get_cf(self.cf(column)?, key)? {
            Some(bytes) => Ok(Some(JsonEncoder::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn scan_prefix(&self, column: InventoryColumns, prefix: &str) -> Result<Vec<KVBytes>> {
        let iter = self.txn.iterator_cf(
            self.cf(column)?,
            IteratorMode::From(prefix.as_bytes(), Direction::Forward),
        );
        let mut rows = Vec::new();
        for kv in iter {
            let (key, value) = kv?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            rows.push((key.to_vec(), value.to_vec()));
        }
        Ok(rows)
    }
}
