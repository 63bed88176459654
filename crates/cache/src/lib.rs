//! In-memory mirror of a library's title/item relations, kept consistent
//! with its SQLite store.

pub mod backup;
pub mod cache;
pub mod config;
pub mod dirtied;
pub mod error;
pub mod fingerprint;
pub mod intralinks;
pub mod library;
pub mod link_attr;
pub mod locking;
pub mod maintenance;
pub mod metadata;
pub mod table;

pub use backup::{BackupStep, MetadataBackup, StopSignal};
pub use cache::{Cache, TitleRecord};
pub use config::LibraryConfig;
pub use error::CacheError;
pub use fingerprint::Fingerprint;
pub use library::{Library, WeakLibrary};
pub use link_attr::{AttributeSort, LinkAttributeKind, LinkAttributeTable};
pub use locking::{DowngradeLockError, LockManager, ReadGuard, SharedLock, WriteGuard};
pub use maintenance::{BotState, MaintenanceBot, MaintenanceQueue, Task};
pub use metadata::BookMetadata;
pub use table::{
    CacheTable, FieldDefinition, FieldUpdate, Groups, IdMap, TableSnapshot, UNTYPED, UpdateMap,
    UpdateOutcome,
};
