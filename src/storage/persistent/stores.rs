//! Persistent store implementations.
//!
//! Each store keeps its state in memory behind a lock. Writes append to the
//! shared WAL while holding that lock and then apply the same mutation the
//! replay path applies, so live state and recovered state cannot diverge.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;

use crate::entity::{Claim, Entity, EntityId};
use crate::feature::FeatureSet;
use crate::index::{EntityIndex, MatchKey, Partition};
use crate::ledger::LedgerState;
use crate::observation::{Fingerprint, Observation, ObservationId, SourceId};
use crate::storage::memory::lock_err;
use crate::storage::traits::{EntityStore, ObservationStore, StorageError};
use crate::weights::WeightTable;

use super::file_lock::DirLock;
use super::segment::{SegmentManager, SnapshotRef};
use super::wal::{WalEntryKind, WriteAheadLog};
use super::PersistentConfig;

const WAL_FILE: &str = "kyrolink.wal";
const SEGMENTS_DIR: &str = "segments";
const WEIGHTS_FILE: &str = "weights.json";

fn wal_err(e: &std::io::Error) -> StorageError {
    StorageError::BackendError(format!("WAL write failed: {e}"))
}

fn io_err(context: &str, e: &std::io::Error) -> StorageError {
    StorageError::ConnectionError(format!("{context}: {e}"))
}

/// Entity and observation stores sharing one WAL and one data directory.
///
/// This is the entry point of the durable backend. The stores are handed to
/// the engine and ledger as `Arc`s; [`compact`](Self::compact) may run while
/// they are in use.
pub struct PersistentStores {
    dir: PathBuf,
    _lock: DirLock,
    wal: Arc<WriteAheadLog>,
    segments: Mutex<SegmentManager>,
    config: PersistentConfig,
    /// Entity index store.
    pub entities: Arc<PersistentEntityStore>,
    /// Observation ledger store.
    pub observations: Arc<PersistentObservationStore>,
}

impl std::fmt::Debug for PersistentStores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentStores")
            .field("dir", &self.dir)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PersistentStores {
    /// Opens or creates a data directory.
    ///
    /// Loads the newest snapshot segment, then replays WAL entries written
    /// after it.
    ///
    /// # Errors
    /// - `ConnectionError` if the directory cannot be created, is locked by
    ///   another process, or its files cannot be opened
    /// - `BackendError` if a WAL entry cannot be applied
    pub fn open(dir: &Path, config: PersistentConfig) -> Result<Self, StorageError> {
        fs::create_dir_all(dir).map_err(|e| io_err("failed to create data directory", &e))?;
        let lock = DirLock::acquire(dir).map_err(|e| io_err("failed to acquire lock", &e))?;

        let segments = SegmentManager::open(&dir.join(SEGMENTS_DIR))
            .map_err(|e| io_err("failed to open segments", &e))?;
        let snapshot = segments
            .load_latest()
            .map_err(|e| io_err("failed to load segment", &e))?
            .unwrap_or_default();
        let persisted = segments.persisted_sequence();

        let wal = Arc::new(
            WriteAheadLog::open(&dir.join(WAL_FILE), config.sync_on_write)
                .map_err(|e| io_err("failed to open WAL", &e))?,
        );
        wal.advance_to(persisted).map_err(|e| wal_err(&e))?;

        let stores = Self {
            dir: dir.to_path_buf(),
            _lock: lock,
            entities: Arc::new(PersistentEntityStore {
                wal: Arc::clone(&wal),
                index: RwLock::new(snapshot.entities),
            }),
            observations: Arc::new(PersistentObservationStore {
                wal: Arc::clone(&wal),
                state: RwLock::new(snapshot.ledger),
            }),
            wal,
            segments: Mutex::new(segments),
            config,
        };
        stores.replay_wal(persisted)?;
        Ok(stores)
    }

    fn replay_wal(&self, persisted: u64) -> Result<(), StorageError> {
        let iter = self
            .wal
            .iter()
            .map_err(|e| io_err("failed to read WAL", &e))?;

        let mut replayed = 0usize;
        for entry in iter {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(error = %e, "stopping WAL replay at unreadable entry");
                    break;
                }
            };
            if entry.sequence <= persisted {
                continue;
            }
            let applied = match &entry.kind {
                WalEntryKind::ObservationAppended(_)
                | WalEntryKind::FeaturesRecorded { .. }
                | WalEntryKind::ObservationResolved { .. } => self.observations.apply(entry.kind),
                WalEntryKind::EntityCreated(_)
                | WalEntryKind::ClaimsAttached { .. }
                | WalEntryKind::EntitiesMerged { .. } => self.entities.apply(entry.kind),
                WalEntryKind::Checkpoint { .. } => Ok(()),
            };
            applied.map_err(|e| {
                StorageError::BackendError(format!(
                    "failed to apply WAL entry {}: {e}",
                    entry.sequence
                ))
            })?;
            replayed += 1;
        }

        if replayed > 0 {
            tracing::info!(entries = replayed, dir = %self.dir.display(), "replayed WAL");
        }
        Ok(())
    }

    /// Writes the current state to a new segment and empties the WAL.
    ///
    /// Writers are blocked for the duration. If this fails partway, the WAL
    /// still holds every entry and is replayed on the next open.
    ///
    /// # Errors
    /// `BackendError` or `ConnectionError` on I/O failures.
    pub fn compact(&self) -> Result<CompactionResult, StorageError> {
        let index = self
            .entities
            .index
            .write()
            .map_err(|_| lock_err("compact.entities"))?;
        let ledger = self
            .observations
            .state
            .write()
            .map_err(|_| lock_err("compact.observations"))?;
        let mut segments = self
            .segments
            .lock()
            .map_err(|_| lock_err("compact.segments"))?;

        let current = self.wal.current_sequence().map_err(|e| wal_err(&e))?;
        let previous = segments.persisted_sequence();
        let wal_size_before = self.wal.size_bytes().unwrap_or(0);
        if current <= previous {
            return Ok(CompactionResult {
                entries_compacted: 0,
                segment_path: None,
                wal_size_before,
                wal_size_after: wal_size_before,
            });
        }

        let mut writer = segments
            .create_writer()
            .map_err(|e| io_err("failed to create segment", &e))?;
        let snapshot = SnapshotRef {
            entities: &index,
            ledger: &ledger,
        };
        if let Err(e) = writer.write(&snapshot, current) {
            let _ = writer.abort();
            return Err(StorageError::SerializationError(format!(
                "failed to write segment: {e}"
            )));
        }
        let segment = writer
            .finalize()
            .map_err(|e| io_err("failed to finalize segment", &e))?;
        let segment_path = segment.path().to_path_buf();
        let retired = segments.install(segment);

        self.wal
            .truncate()
            .map_err(|e| io_err("failed to truncate WAL", &e))?;
        self.wal
            .append(WalEntryKind::Checkpoint {
                up_to_sequence: current,
            })
            .map_err(|e| wal_err(&e))?;
        let wal_size_after = self.wal.size_bytes().unwrap_or(0);

        tracing::info!(
            up_to_sequence = current,
            entities = index.len(),
            observations = ledger.len(),
            retired_segments = retired,
            "compacted WAL into segment"
        );

        Ok(CompactionResult {
            entries_compacted: current - previous,
            segment_path: Some(segment_path),
            wal_size_before,
            wal_size_after,
        })
    }

    /// Returns true once the WAL has reached the configured size limit.
    #[must_use]
    pub fn needs_compaction(&self) -> bool {
        self.wal_size() >= self.config.max_wal_size
    }

    /// Current WAL size in bytes.
    #[must_use]
    pub fn wal_size(&self) -> u64 {
        self.wal.size_bytes().unwrap_or(0)
    }

    /// Number of segment files.
    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.segments.lock().map_or(0, |s| s.segment_count())
    }

    /// The data directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persists a weight table as `weights.json` (temp file + rename).
    ///
    /// # Errors
    /// `SerializationError` or `ConnectionError`.
    pub fn save_weights(&self, weights: &WeightTable) -> Result<(), StorageError> {
        let json = serde_json::to_vec_pretty(weights)
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;
        let path = self.dir.join(WEIGHTS_FILE);
        let temp = self.dir.join(format!("{WEIGHTS_FILE}.tmp"));
        fs::write(&temp, json).map_err(|e| io_err("failed to write weights", &e))?;
        fs::rename(&temp, &path).map_err(|e| io_err("failed to install weights", &e))
    }

    /// Loads the saved weight table, if one exists.
    ///
    /// # Errors
    /// `SerializationError` for a malformed or out-of-range table.
    pub fn load_weights(&self) -> Result<Option<WeightTable>, StorageError> {
        let path = self.dir.join(WEIGHTS_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path).map_err(|e| io_err("failed to read weights", &e))?;
        let table: WeightTable = serde_json::from_str(&raw)
            .map_err(|e| StorageError::SerializationError(format!("weights.json: {e}")))?;
        table
            .validate()
            .map_err(|e| StorageError::SerializationError(format!("weights.json: {e}")))?;
        Ok(Some(table))
    }
}

/// Result of a compaction.
#[derive(Debug, Clone)]
pub struct CompactionResult {
    /// WAL entries folded into the segment.
    pub entries_compacted: u64,
    /// New segment, if one was written.
    pub segment_path: Option<PathBuf>,
    /// WAL size before compaction.
    pub wal_size_before: u64,
    /// WAL size after compaction.
    pub wal_size_after: u64,
}

// --- Entity store ---

/// WAL-backed entity store.
pub struct PersistentEntityStore {
    wal: Arc<WriteAheadLog>,
    index: RwLock<EntityIndex>,
}

impl PersistentEntityStore {
    fn apply(&self, kind: WalEntryKind) -> Result<(), StorageError> {
        let mut index = self.index.write().map_err(|_| lock_err("entity.replay"))?;
        match kind {
            WalEntryKind::EntityCreated(entity) => index.insert_new(entity).map(|_| ()),
            WalEntryKind::ClaimsAttached { entity, claims, at } => {
                index.attach(entity, claims, at).map(|_| ())
            }
            WalEntryKind::EntitiesMerged { ids, at } => index.merge(&ids, at).map(|_| ()),
            _ => Ok(()),
        }
    }
}

impl EntityStore for PersistentEntityStore {
    fn candidates(&self, keys: &[MatchKey]) -> Result<BTreeSet<EntityId>, StorageError> {
        let index = self.index.read().map_err(|_| lock_err("entity.candidates"))?;
        Ok(index.candidates(keys))
    }

    fn get(&self, id: EntityId) -> Result<Option<Entity>, StorageError> {
        let index = self.index.read().map_err(|_| lock_err("entity.get"))?;
        Ok(index.get(id).cloned())
    }

    fn canonical_id(&self, id: EntityId) -> Result<EntityId, StorageError> {
        let index = self.index.read().map_err(|_| lock_err("entity.canonical_id"))?;
        index.canonical_id(id)
    }

    fn entity_for_observation(
        &self,
        observation: ObservationId,
    ) -> Result<Option<EntityId>, StorageError> {
        let index = self
            .index
            .read()
            .map_err(|_| lock_err("entity.entity_for_observation"))?;
        Ok(index.entity_for_observation(observation))
    }

    fn create(&self, claims: Vec<Claim>) -> Result<EntityId, StorageError> {
        let mut index = self.index.write().map_err(|_| lock_err("entity.create"))?;
        let entity = index.prepare(claims, Utc::now());
        self.wal
            .append(WalEntryKind::EntityCreated(entity.clone()))
            .map_err(|e| wal_err(&e))?;
        index.insert_new(entity)
    }

    fn attach(&self, id: EntityId, claims: Vec<Claim>) -> Result<usize, StorageError> {
        let mut index = self.index.write().map_err(|_| lock_err("entity.attach"))?;
        let id = index.canonical_id(id)?;
        if claims.is_empty() {
            return Ok(0);
        }
        let at = Utc::now();
        self.wal
            .append(WalEntryKind::ClaimsAttached {
                entity: id,
                claims: claims.clone(),
                at,
            })
            .map_err(|e| wal_err(&e))?;
        index.attach(id, claims, at)
    }

    fn merge(&self, ids: &[EntityId]) -> Result<EntityId, StorageError> {
        let mut index = self.index.write().map_err(|_| lock_err("entity.merge"))?;
        let mut group = BTreeSet::new();
        for id in ids {
            group.insert(index.canonical_id(*id)?);
        }
        if group.len() < 2 {
            return group.first().copied().ok_or_else(|| {
                StorageError::BackendError("cannot merge an empty set of entities".to_string())
            });
        }
        let ids: Vec<EntityId> = group.into_iter().collect();
        let at = Utc::now();
        self.wal
            .append(WalEntryKind::EntitiesMerged {
                ids: ids.clone(),
                at,
            })
            .map_err(|e| wal_err(&e))?;
        index.merge(&ids, at)
    }

    fn live_ids(&self) -> Result<Vec<EntityId>, StorageError> {
        let index = self.index.read().map_err(|_| lock_err("entity.live_ids"))?;
        Ok(index.live_ids())
    }

    fn live_count(&self) -> Result<usize, StorageError> {
        let index = self.index.read().map_err(|_| lock_err("entity.live_count"))?;
        Ok(index.len())
    }

    fn partition(&self) -> Result<Partition, StorageError> {
        let index = self.index.read().map_err(|_| lock_err("entity.partition"))?;
        Ok(index.partition())
    }
}

// --- Observation store ---

/// WAL-backed observation ledger.
pub struct PersistentObservationStore {
    wal: Arc<WriteAheadLog>,
    state: RwLock<LedgerState>,
}

impl PersistentObservationStore {
    fn apply(&self, kind: WalEntryKind) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("observation.replay"))?;
        match kind {
            WalEntryKind::ObservationAppended(observation) => {
                state.append(observation);
                Ok(())
            }
            WalEntryKind::FeaturesRecorded {
                observation,
                features,
            } => state.record_features(observation, features),
            WalEntryKind::ObservationResolved {
                observation,
                entity,
            } => state.record_resolution(observation, entity),
            _ => Ok(()),
        }
    }
}

impl ObservationStore for PersistentObservationStore {
    fn append(&self, observation: Observation) -> Result<(ObservationId, bool), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("observation.append"))?;
        if state.contains(observation.id) {
            return Ok((observation.id, false));
        }
        self.wal
            .append(WalEntryKind::ObservationAppended(observation.clone()))
            .map_err(|e| wal_err(&e))?;
        Ok(state.append(observation))
    }

    fn get(&self, id: ObservationId) -> Result<Option<Observation>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("observation.get"))?;
        Ok(state.get(id).cloned())
    }

    fn find_by_fingerprint(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Option<Observation>, StorageError> {
        let state = self
            .state
            .read()
            .map_err(|_| lock_err("observation.find_by_fingerprint"))?;
        Ok(state.find_by_fingerprint(fingerprint).cloned())
    }

    fn find_by_source(&self, source: &SourceId) -> Result<Vec<ObservationId>, StorageError> {
        let state = self
            .state
            .read()
            .map_err(|_| lock_err("observation.find_by_source"))?;
        Ok(state.find_by_source(source))
    }

    fn record_features(&self, id: ObservationId, features: FeatureSet) -> Result<(), StorageError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| lock_err("observation.record_features"))?;
        if !state.contains(id) {
            return Err(StorageError::ObservationNotFound(id));
        }
        self.wal
            .append(WalEntryKind::FeaturesRecorded {
                observation: id,
                features: features.clone(),
            })
            .map_err(|e| wal_err(&e))?;
        state.record_features(id, features)
    }

    fn features_of(&self, id: ObservationId) -> Result<Option<FeatureSet>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("observation.features_of"))?;
        Ok(state.features_of(id).cloned())
    }

    fn record_resolution(&self, id: ObservationId, entity: EntityId) -> Result<(), StorageError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| lock_err("observation.record_resolution"))?;
        if !state.contains(id) {
            return Err(StorageError::ObservationNotFound(id));
        }
        self.wal
            .append(WalEntryKind::ObservationResolved {
                observation: id,
                entity,
            })
            .map_err(|e| wal_err(&e))?;
        state.record_resolution(id, entity)
    }

    fn resolution_of(&self, id: ObservationId) -> Result<Option<EntityId>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("observation.resolution_of"))?;
        Ok(state.resolution_of(id))
    }

    fn ids(&self) -> Result<Vec<ObservationId>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("observation.ids"))?;
        Ok(state.ids())
    }

    fn len(&self) -> Result<usize, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("observation.len"))?;
        Ok(state.len())
    }
}
