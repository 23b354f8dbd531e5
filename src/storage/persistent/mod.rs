//! Durable storage backend.
//!
//! - Write-ahead log replayed on open
//! - Exclusive lock on the data directory
//! - CRC32-framed records
//! - Snapshot segments produced by compaction
//!
//! # Layout
//!
//! ```text
//! <data_dir>/
//! ├── .lock
//! ├── kyrolink.wal
//! ├── weights.json
//! └── segments/
//!     └── segment_00003.seg
//! ```

mod codec;
mod file_lock;
mod segment;
mod stores;
mod wal;

pub use file_lock::DirLock;
pub use segment::{Segment, SegmentManager};
pub use stores::{
    CompactionResult, PersistentEntityStore, PersistentObservationStore, PersistentStores,
};
pub use wal::{WalEntry, WalEntryKind, WriteAheadLog};

use std::path::Path;

use crate::error::{LinkResult, ValidationError};

/// Configuration for the durable backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistentConfig {
    /// WAL size at which [`PersistentStores::needs_compaction`] turns true.
    pub max_wal_size: u64,
    /// Whether to fsync after every WAL append.
    pub sync_on_write: bool,
}

impl Default for PersistentConfig {
    fn default() -> Self {
        Self {
            max_wal_size: 64 * 1024 * 1024,
            sync_on_write: true,
        }
    }
}

impl PersistentConfig {
    /// Smallest accepted `max_wal_size`.
    pub const MIN_WAL_SIZE: u64 = 4 * 1024;

    /// Checks the configuration.
    ///
    /// # Errors
    /// `InvalidConfig` if `max_wal_size` is below [`Self::MIN_WAL_SIZE`].
    pub fn validate(self) -> Result<Self, ValidationError> {
        if self.max_wal_size < Self::MIN_WAL_SIZE {
            return Err(ValidationError::InvalidConfig {
                reason: format!(
                    "max_wal_size must be at least {} bytes (got {})",
                    Self::MIN_WAL_SIZE,
                    self.max_wal_size
                ),
            });
        }
        Ok(self)
    }
}

/// Opens or creates a KyroLink data directory.
///
/// # Errors
/// - `Validation` for a bad configuration
/// - `Storage` if the directory is locked, unreadable or its WAL cannot be
///   replayed
///
/// # Example
/// ```rust,no_run
/// use kyrolink::storage::open_database;
/// use kyrolink::ResolutionEngine;
///
/// let stores = open_database("./linkdata", None)?;
/// let engine = ResolutionEngine::with_defaults(stores.entities.clone());
/// # Ok::<(), kyrolink::LinkError>(())
/// ```
pub fn open_database(
    path: impl AsRef<Path>,
    config: Option<PersistentConfig>,
) -> LinkResult<PersistentStores> {
    let config = config.unwrap_or_default().validate()?;
    Ok(PersistentStores::open(path.as_ref(), config)?)
}
