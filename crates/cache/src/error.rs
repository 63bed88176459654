use shelfmark_core::{CoreError, MainId};
use shelfmark_storage::StorageError;
use thiserror::Error;

use crate::locking::DowngradeLockError;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("invalid cache update: {0}")]
    InvalidCacheUpdate(String),

    #[error("database integrity error: {0}")]
    DatabaseIntegrity(String),

    #[error(transparent)]
    DowngradeLock(#[from] DowngradeLockError),

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("unknown field: {0}")]
    UnknownField(String),

    #[error("unknown title: {0}")]
    UnknownTitle(MainId),

    #[error("maintenance bot has stopped")]
    MaintenanceStopped,

    #[error("library has been closed")]
    LibraryClosed,

    #[error("worker thread error: {0}")]
    Worker(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("storage error: {0}")]
    Storage(StorageError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),
}

impl From<StorageError> for CacheError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::DatabaseIntegrity(msg) => CacheError::DatabaseIntegrity(msg),
            other => CacheError::Storage(other),
        }
    }
}

impl CacheError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        CacheError::InvalidCacheUpdate(msg.into())
    }

    pub(crate) fn integrity(msg: impl Into<String>) -> Self {
        CacheError::DatabaseIntegrity(msg.into())
    }
}
