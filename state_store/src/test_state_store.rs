use std::sync::Arc;

use anyhow::{anyhow, Result};
use data_model::{
    test_objects::tests::{
        TEST_CARD_NAME,
        TEST_HARDWARE_DEVICE_ID,
        TEST_HOST_ID,
        TEST_VENDOR_ID,
    },
    GpuCard,
    Host,
    HostId,
    Vm,
    VmId,
};
use tempfile::TempDir;

use crate::{
    error::InventoryError,
    requests::{
        CreateGpuCardRequest,
        RegisterVmRequest,
        RequestPayload,
        StateMachineUpdateRequest,
        UpdateOutcome,
        UpsertHostRequest,
    },
    InventoryState,
    TransactionConfig,
};

pub struct TestStateStore {
    pub inventory_state: Arc<InventoryState>,
    // The store lives in this directory; it is removed on drop.
    _temp_dir: TempDir,
}

impl TestStateStore {
    pub async fn new() -> Result<TestStateStore> {
        let temp_dir = tempfile::tempdir()?;
        let inventory_state =
            InventoryState::new(temp_dir.path().join("state"), TransactionConfig::default())
                .await?;
        Ok(TestStateStore {
            inventory_state,
            _temp_dir: temp_dir,
        })
    }

    pub async fn create_host(&self) -> Result<Host> {
        self.upsert_host(TEST_HOST_ID).await
    }

    pub async fn upsert_host(&self, host_id: &str) -> Result<Host> {
        let outcome = self
            .inventory_state
            .write(StateMachineUpdateRequest {
                payload: RequestPayload::UpsertHost(UpsertHostRequest {
                    host_id: HostId::from(host_id),
                    name: format!("{} name", host_id),
                }),
            })
            .await?;
        match outcome {
            UpdateOutcome::Host(host) => Ok(host),
            other => Err(anyhow!("unexpected outcome {:?}", other)),
        }
    }

    pub async fn create_card(&self) -> Result<GpuCard> {
        let outcome = self
            .inventory_state
            .write(StateMachineUpdateRequest {
                payload: RequestPayload::CreateGpuCard(CreateGpuCardRequest {
                    vendor_id: TEST_VENDOR_ID.to_string(),
                    device_id: TEST_HARDWARE_DEVICE_ID.to_string(),
                    vendor_name: "NVIDIA Corporation".to_string(),
                    device_name: "GA100".to_string(),
                    name: TEST_CARD_NAME.to_string(),
                }),
            })
            .await?;
        match outcome {
            UpdateOutcome::Card(card) => Ok(card),
            other => Err(anyhow!("unexpected outcome {:?}", other)),
        }
    }

    pub async fn register_vm(&self, vm_id: &str, name: &str) -> Result<Vm, InventoryError> {
        let outcome = self
            .inventory_state
            .write(StateMachineUpdateRequest {
                payload: RequestPayload::RegisterVm(RegisterVmRequest {
                    vm_id: VmId::from(vm_id),
                    name: name.to_string(),
                }),
            })
            .await?;
        match outcome {
            UpdateOutcome::Vm(vm) => Ok(vm),
            other => Err(anyhow!("unexpected outcome {:?}", other).into()),
        }
    }
}
