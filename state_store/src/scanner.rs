use std::sync::Arc;

use anyhow::anyhow;
use data_model::{
    GpuCard,
    GpuCardId,
    GpuDevice,
    GpuDeviceId,
    Host,
    HostId,
    VgpuProfile,
    VgpuProfileId,
    Vm,
    VmId,
};
use metrics::{state_store::Metrics, Timer};
use opentelemetry::KeyValue;
use rocksdb::{Direction, IteratorMode, SnapshotWithThreadMode, TransactionDB};
use serde::de::DeserializeOwned;

use crate::{
    error::{InventoryError, Result},
    serializer::{JsonEncode, JsonEncoder},
    state_machine::InventoryColumns,
};

pub type KVBytes = (Vec<u8>, Vec<u8>);

fn decode_values<T: DeserializeOwned>(rows: Vec<KVBytes>) -> Result<Vec<T>> {
    rows.iter()
        .map(|(_, value)| JsonEncoder::decode(value).map_err(InventoryError::from))
        .collect()
}

/// Typed queries over the inventory tables, shared by the snapshot reader
/// and by in-flight transactions so that both see rows the same way.
pub trait InventoryRead {
    fn get_row<T: DeserializeOwned>(&self, column: InventoryColumns, key: &str)
        -> Result<Option<T>>;

    /// All rows whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, column: InventoryColumns, prefix: &str) -> Result<Vec<KVBytes>>;

    fn get_host(&self, host_id: &HostId) -> Result<Option<Host>> {
        self.get_row(InventoryColumns::Hosts, host_id.get())
    }

    fn require_host(&self, host_id: &HostId) -> Result<Host> {
        self.get_host(host_id)?
            .ok_or_else(|| InventoryError::not_found("host", host_id))
    }

    fn list_hosts(&self) -> Result<Vec<Host>> {
        decode_values(self.scan_prefix(InventoryColumns::Hosts, "")?)
    }

    fn get_vm(&self, vm_id: &VmId) -> Result<Option<Vm>> {
        self.get_row(InventoryColumns::Vms, vm_id.get())
    }

    fn find_vm_by_name(&self, name: &str) -> Result<Option<Vm>> {
        let Some(vm_id) = self.get_row::<VmId>(InventoryColumns::VmsByName, name)? else {
            return Ok(None);
        };
        self.get_vm(&vm_id)
    }

    fn list_vms(&self) -> Result<Vec<Vm>> {
        decode_values(self.scan_prefix(InventoryColumns::Vms, "")?)
    }

    fn get_card(&self, card_id: GpuCardId) -> Result<Option<GpuCard>> {
        self.get_row(InventoryColumns::GpuCards, &card_id.key())
    }

    fn require_card(&self, card_id: GpuCardId) -> Result<GpuCard> {
        self.get_card(card_id)?
            .ok_or_else(|| InventoryError::not_found("gpu card", card_id))
    }

    fn list_cards(&self) -> Result<Vec<GpuCard>> {
        decode_values(self.scan_prefix(InventoryColumns::GpuCards, "")?)
    }

    fn card_by_hardware_id(&self, vendor_id: &str, device_id: &str) -> Result<Option<GpuCard>> {
        let key = GpuCard::hardware_key_from(vendor_id, device_id);
        let Some(card_id) = self.get_row::<GpuCardId>(InventoryColumns::GpuCardsByHardwareId, &key)?
        else {
            return Ok(None);
        };
        self.get_card(card_id)
    }

    fn get_profile(&self, profile_id: VgpuProfileId) -> Result<Option<VgpuProfile>> {
        self.get_row(InventoryColumns::VgpuProfiles, &profile_id.key())
    }

    fn require_profile(&self, profile_id: VgpuProfileId) -> Result<VgpuProfile> {
        self.get_profile(profile_id)?
            .ok_or_else(|| InventoryError::not_found("vgpu profile", profile_id))
    }

    fn profiles_for_card(&self, card_id: GpuCardId) -> Result<Vec<VgpuProfile>> {
        let prefix = VgpuProfile::card_prefix(&card_id);
        let mut profiles = Vec::new();
        for (_, value) in self.scan_prefix(InventoryColumns::VgpuProfilesByName, &prefix)? {
            let profile_id: VgpuProfileId = JsonEncoder::decode(&value)?;
            let profile = self.get_profile(profile_id)?.ok_or_else(|| {
                anyhow!("profile index of card {} points at missing profile {}", card_id, profile_id)
            })?;
            profiles.push(profile);
        }
        profiles.sort_by_key(|p| p.id);
        Ok(profiles)
    }

    fn get_device(&self, device_id: GpuDeviceId) -> Result<Option<GpuDevice>> {
        self.get_row(InventoryColumns::GpuDevices, &device_id.key())
    }

    fn require_device(&self, device_id: GpuDeviceId) -> Result<GpuDevice> {
        self.get_device(device_id)?
            .ok_or_else(|| InventoryError::not_found("gpu device", device_id))
    }

    /// Devices of one host ordered by id.
    fn devices_for_host(&self, host_id: &HostId) -> Result<Vec<GpuDevice>> {
        let prefix = GpuDevice::host_prefix(host_id);
        let mut devices = Vec::new();
        for (_, value) in self.scan_prefix(InventoryColumns::GpuDevicesByHost, &prefix)? {
            let device_id: GpuDeviceId = JsonEncoder::decode(&value)?;
            let device = self.get_device(device_id)?.ok_or_else(|| {
                anyhow!("host index of {} points at missing device {}", host_id, device_id)
            })?;
            devices.push(device);
        }
        devices.sort_by_key(|d| d.id);
        Ok(devices)
    }

    /// Devices bound to one VM on any host, ordered by id.
    fn devices_for_vm(&self, vm_id: &VmId) -> Result<Vec<GpuDevice>> {
        let prefix = GpuDevice::vm_prefix(vm_id);
        let mut devices = Vec::new();
        for (key, _) in self.scan_prefix(InventoryColumns::GpuDevicesByVm, &prefix)? {
            let Some(device_id) = GpuDeviceId::from_key(&key[prefix.len()..]) else {
                continue;
            };
            let device = self.get_device(device_id)?.ok_or_else(|| {
                anyhow!("vm index of {} points at missing device {}", vm_id, device_id)
            })?;
            devices.push(device);
        }
        Ok(devices)
    }

    fn all_devices(&self) -> Result<Vec<GpuDevice>> {
        decode_values(self.scan_prefix(InventoryColumns::GpuDevices, "")?)
    }
}

/// Point-in-time reader. Every query made through one reader observes the
/// same committed snapshot.
pub struct StateReader<'db> {
    db: &'db TransactionDB,
    snapshot: SnapshotWithThreadMode<'db, TransactionDB>,
    metrics: Arc<Metrics>,
}

impl<'db> StateReader<'db> {
    pub fn new(db: &'db TransactionDB, metrics: Arc<Metrics>) -> Self {
        Self {
            db,
            snapshot: db.snapshot(),
            metrics,
        }
    }
}

impl InventoryRead for StateReader<'_> {
    fn get_row<T: DeserializeOwned>(
        &self,
        column: InventoryColumns,
        key: &str,
    ) -> Result<Option<T>> {
        let kvs = &[KeyValue::new("op", "get"), KeyValue::new("column", column.to_string())];
        let _timer = Timer::start_with_labels(&self.metrics.state_read, kvs);
        let cf = column.cf(self.db)?;
        match self.snapshot.get_cf(cf, key)? {
            Some(bytes) => Ok(Some(JsonEncoder::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn scan_prefix(&self, column: InventoryColumns, prefix: &str) -> Result<Vec<KVBytes>> {
        let kvs = &[KeyValue::new("op", "scan"), KeyValue::new("column", column.to_string())];
        let _timer = Timer::start_with_labels(&self.metrics.state_read, kvs);
        let cf = column.cf(self.db)?;
        let iter = self
            .snapshot
            .iterator_cf(cf, IteratorMode::From(prefix.as_bytes(), Direction::Forward));
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
