use std::sync::Arc;

use anyhow::Result;
use processor::{
    allocator::Allocator,
    capacity::CapacityAggregator,
    reconciler::Reconciler,
    resource_state::ResourceStateController,
};
use state_store::{
    requests::{RequestPayload, StateMachineUpdateRequest, UpdateOutcome},
    InventoryState,
};
use tracing::info;

use crate::config::InventoryConfig;

/// The inventory engine wired to one store.
pub struct Service {
    pub inventory_state: Arc<InventoryState>,
    pub reconciler: Reconciler,
    pub allocator: Allocator,
    pub capacity: CapacityAggregator,
    pub resource_state: ResourceStateController,
}

impl Service {
    pub async fn new(config: InventoryConfig) -> Result<Self> {
        let inventory_state =
            InventoryState::new(config.state_store_path.parse()?, config.transaction.clone())
                .await?;
        info!(
            state_store_path = %config.state_store_path,
            env = %config.env,
            "opened gpu inventory"
        );

        Ok(Self {
            reconciler: Reconciler::new(inventory_state.clone()),
            allocator: Allocator::new(inventory_state.clone()),
            capacity: CapacityAggregator::new(inventory_state.clone()),
            resource_state: ResourceStateController::new(inventory_state.clone()),
            inventory_state,
        })
    }

    pub async fn write(&self, payload: RequestPayload) -> Result<UpdateOutcome> {
        Ok(self
            .inventory_state
            .write(StateMachineUpdateRequest { payload })
            .await?)
    }
}
