use std::{fmt::Debug, path::Path};

use anyhow::Result;
use figment::{
    providers::{Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use state_store::TransactionConfig;

const LOCAL_ENV: &str = "local";

fn default_env() -> String {
    LOCAL_ENV.to_string()
}

fn default_state_store_path() -> String {
    "./gpu_inventory_storage/state".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InventoryConfig {
    #[serde(default = "default_env")]
    pub env: String,
    #[serde(default = "default_state_store_path")]
    pub state_store_path: String,
    #[serde(default)]
    pub transaction: TransactionConfig,
}

impl Default for InventoryConfig {
    fn default() -> Self {
        InventoryConfig {
            env: default_env(),
            state_store_path: default_state_store_path(),
            transaction: TransactionConfig::default(),
        }
    }
}

impl InventoryConfig {
    pub fn from_path(path: &Path) -> Result<InventoryConfig> {
        let config_str = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&config_str)
    }

    fn from_yaml_str(config_str: &str) -> Result<InventoryConfig> {
        let config: InventoryConfig = Figment::new().merge(Yaml::string(config_str)).extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.state_store_path.trim().is_empty() {
            return Err(anyhow::anyhow!("state_store_path must not be empty"));
        }
        if self.transaction.lock_timeout_ms == 0 {
            return Err(anyhow::anyhow!(
                "transaction.lock_timeout_ms must be positive"
            ));
        }
        if self.transaction.max_retries == 0 {
            return Err(anyhow::anyhow!(
                "transaction.max_retries must be at least 1"
            ));
        }
        Ok(())
    }

    pub fn structured_logging(&self) -> bool {
        self.env != LOCAL_ENV
    }
}
