use data_model::{HostId, VgpuProfileId};
use rocksdb::ErrorKind;

pub type Result<T, E = InventoryError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum InventoryError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("in use: {0}")]
    InUse(String),

    #[error(
        "insufficient capacity on host {host_id} for profile {profile_id}: requested {requested}, available {available}"
    )]
    InsufficientCapacity {
        host_id: HostId,
        profile_id: VgpuProfileId,
        requested: usize,
        available: usize,
    },

    #[error("malformed device fact: {0}")]
    MalformedFact(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("storage error: {source}")]
    Storage {
        #[from]
        source: rocksdb::Error,
    },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl InventoryError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Lock waits that timed out and busy statuses are transient; the whole
    /// transaction can be re-run.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Storage { source } => matches!(
                source.kind(),
                ErrorKind::Busy | ErrorKind::TimedOut | ErrorKind::TryAgain
            ),
            _ => false,
        }
    }
}
