use std::{fs, path::PathBuf, sync::Arc};

use anyhow::anyhow;
use dashmap::DashMap;
use data_model::{GpuDeviceId, HostId};
use error::Result;
use metrics::{state_store::Metrics, AutoIncrement, Timer};
use opentelemetry::KeyValue;
use requests::{StateMachineUpdateRequest, UpdateOutcome};
use rocksdb::{
    ColumnFamilyDescriptor,
    Options,
    Transaction,
    TransactionDB,
    TransactionDBOptions,
    TransactionOptions,
    WriteOptions,
};
use scanner::InventoryRead;
use serde::{Deserialize, Serialize};
use state_machine::InventoryColumns;
use strum::IntoEnumIterator;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use transaction::{IdSequences, StoreTransaction};

pub mod error;
pub mod requests;
pub mod scanner;
pub mod serializer;
pub mod state_machine;
pub mod test_state_store;
pub mod transaction;

fn default_lock_timeout_ms() -> u64 {
    1000
}

fn default_max_retries() -> u32 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransactionConfig {
    /// How long a transaction waits for a row lock held by another
    /// transaction before failing with a retryable error.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: default_lock_timeout_ms(),
            max_retries: default_max_retries(),
        }
    }
}

pub struct InventoryState {
    pub db: Arc<TransactionDB>,
    pub metrics: Arc<Metrics>,
    sequences: IdSequences,
    host_locks: DashMap<HostId, Arc<Mutex<()>>>,
    txn_config: TransactionConfig,
}

impl InventoryState {
    pub async fn new(path: PathBuf, txn_config: TransactionConfig) -> Result<Arc<Self>> {
        fs::create_dir_all(path.clone())
            .map_err(|e| anyhow!("failed to create state store dir: {}", e))?;

        let column_families = InventoryColumns::iter()
            .map(|cf| ColumnFamilyDescriptor::new(cf.to_string(), Options::default()));
        let mut db_opts = Options::default();
        db_opts.create_missing_column_families(true);
        db_opts.create_if_missing(true);
        let db = Arc::new(
            TransactionDB::open_cf_descriptors(
                &db_opts,
                &TransactionDBOptions::default(),
                path,
                column_families,
            )
            .map_err(|e| anyhow!("failed to open db: {}", e))?,
        );
        let sequences = IdSequences::recover(&db)?;
        info!(?sequences, "initialized gpu inventory store");

        Ok(Arc::new(Self {
            db,
            metrics: Arc::new(Metrics::new()),
            sequences,
            host_locks: DashMap::new(),
            txn_config,
        }))
    }

    pub fn reader(&self) -> scanner::StateReader<'_> {
        scanner::StateReader::new(&self.db, self.metrics.clone())
    }

    fn host_lock(&self, host_id: &HostId) -> Arc<Mutex<()>> {
        self.host_locks.entry(host_id.clone()).or_default().value().clone()
    }

    fn begin(&self) -> Transaction<'_, TransactionDB> {
        let mut txn_opts = TransactionOptions::default();
        txn_opts.set_lock_timeout(i64::try_from(self.txn_config.lock_timeout_ms).unwrap_or(i64::MAX));
        self.db.transaction_opt(&WriteOptions::default(), &txn_opts)
    }

    /// Runs `f` in one transaction and commits it. Errors roll the
    /// transaction back; lock contention re-runs `f` from scratch.
    fn run_txn<T, F>(&self, mut f: F) -> Result<T>
    where
        F: FnMut(&StoreTransaction) -> Result<T>,
    {
        let mut attempt = 0;
        loop {
            let txn = StoreTransaction::new(&self.db, self.begin(), &self.sequences);
            let result = f(&txn).and_then(|value| {
                txn.commit()?;
                Ok(value)
            });
            match result {
                Ok(value) => {
                    self.metrics.txn_commits.increment(&[]);
                    return Ok(value);
                }
                Err(err) if err.is_retryable() && attempt < self.txn_config.max_retries => {
                    attempt += 1;
                    self.metrics.txn_retries.increment(&[]);
                    warn!(attempt, error = %err, "retrying inventory transaction");
                }
                Err(err) => {
                    self.metrics.txn_errors.increment(&[]);
                    return Err(err);
                }
            }
        }
    }

    /// Serializes `f` with every other host-scoped operation on `host_id`
    /// and runs it in one transaction.
    pub async fn run_in_host_txn<T, F>(&self, host_id: &HostId, f: F) -> Result<T>
    where
        F: FnMut(&StoreTransaction) -> Result<T>,
    {
        let lock = self.host_lock(host_id);
        let _guard = lock.lock().await;
        self.run_txn(f)
    }

    /// Like [`Self::run_in_host_txn`] for operations spanning several hosts.
    /// Locks are taken in sorted order.
    pub async fn run_in_hosts_txn<T, F>(&self, host_ids: &[HostId], f: F) -> Result<T>
    where
        F: FnMut(&StoreTransaction) -> Result<T>,
    {
        let mut host_ids = host_ids.to_vec();
        host_ids.sort();
        host_ids.dedup();
        let mut guards = Vec::with_capacity(host_ids.len());
        for host_id in &host_ids {
            guards.push(self.host_lock(host_id).lock_owned().await);
        }
        self.run_txn(f)
    }

    /// Host a device lives on, read outside of any transaction. Device rows
    /// never move between hosts.
    pub fn host_of_device(&self, device_id: GpuDeviceId) -> Result<HostId> {
        Ok(self.reader().require_device(device_id)?.host_id)
    }

    #[tracing::instrument(
        skip(self, request),
        fields(
            request_type = request.payload.to_string(),
        )
    )]
    pub async fn write(&self, request: StateMachineUpdateRequest) -> Result<UpdateOutcome> {
        let timer_kv = &[KeyValue::new("request", request.payload.to_string())];
        debug!("writing inventory update request");
        let _timer = Timer::start_with_labels(&self.metrics.state_write, timer_kv);

        let payload = &request.payload;
        let host_id = match (payload.host_id(), payload.device_id()) {
            (Some(host_id), _) => Some(host_id.clone()),
            (None, Some(device_id)) => Some(self.host_of_device(device_id)?),
            (None, None) => None,
        };
        match host_id {
            Some(host_id) => {
                self.run_in_host_txn(&host_id, |txn| state_machine::apply(txn, payload))
                    .await
            }
            None => self.run_txn(|txn| state_machine::apply(txn, payload)),
        }
    }
}
