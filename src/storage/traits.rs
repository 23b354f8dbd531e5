//! Abstract storage traits for KyroLink.
//!
//! These traits define the contract that storage backends must implement:
//! an append-only observation log and an entity/claim store that supports
//! point lookups by fingerprint, by entity id and by (kind, value).

use std::collections::BTreeSet;

use thiserror::Error;

use crate::entity::{Claim, Entity, EntityId};
use crate::feature::FeatureSet;
use crate::index::{MatchKey, Partition};
use crate::observation::{Fingerprint, Observation, ObservationId, SourceId};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Entity not found.
    #[error("Entity not found: {0}")]
    EntityNotFound(EntityId),

    /// Observation not found.
    #[error("Observation not found: {0}")]
    ObservationNotFound(ObservationId),

    /// Key already exists.
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),

    /// Serialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Durable store unreachable.
    #[error("Connection error: {0}")]
    ConnectionError(String),
}

/// Storage for resolved entities and their claims.
///
/// Every method is atomic: readers never observe a partially applied
/// attach or merge.
pub trait EntityStore: Send + Sync {
    /// Entities claiming any of the given (kind, value) keys.
    fn candidates(&self, keys: &[MatchKey]) -> Result<BTreeSet<EntityId>, StorageError>;

    /// Get an entity by id. Absorbed ids return their survivor.
    fn get(&self, id: EntityId) -> Result<Option<Entity>, StorageError>;

    /// Resolve an id to its surviving entity id.
    fn canonical_id(&self, id: EntityId) -> Result<EntityId, StorageError>;

    /// The entity currently holding claims extracted from an observation.
    fn entity_for_observation(
        &self,
        observation: ObservationId,
    ) -> Result<Option<EntityId>, StorageError>;

    /// Allocate a new entity holding `claims`.
    fn create(&self, claims: Vec<Claim>) -> Result<EntityId, StorageError>;

    /// Add claims to an entity. Returns how many were new.
    fn attach(&self, id: EntityId, claims: Vec<Claim>) -> Result<usize, StorageError>;

    /// Merge entities into the one with the lowest id and return it.
    ///
    /// # Errors
    /// - `EntityNotFound`: If any id does not exist
    /// - `BackendError`: If `ids` is empty
    fn merge(&self, ids: &[EntityId]) -> Result<EntityId, StorageError>;

    /// Live entity ids, ascending.
    fn live_ids(&self) -> Result<Vec<EntityId>, StorageError>;

    /// Number of live entities.
    fn live_count(&self) -> Result<usize, StorageError>;

    /// Observations grouped by live entity.
    fn partition(&self) -> Result<Partition, StorageError>;
}

/// Append-only observation log.
pub trait ObservationStore: Send + Sync {
    /// Append an observation unless one with the same fingerprint exists.
    ///
    /// Returns the stored id and whether it was new.
    fn append(&self, observation: Observation) -> Result<(ObservationId, bool), StorageError>;

    /// Get an observation by id.
    fn get(&self, id: ObservationId) -> Result<Option<Observation>, StorageError>;

    /// Get an observation by content fingerprint.
    fn find_by_fingerprint(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Option<Observation>, StorageError>;

    /// Observations from a source, in ingestion order.
    fn find_by_source(&self, source: &SourceId) -> Result<Vec<ObservationId>, StorageError>;

    /// Record the feature set that was resolved for an observation.
    fn record_features(&self, id: ObservationId, features: FeatureSet) -> Result<(), StorageError>;

    /// The recorded feature set of an observation.
    fn features_of(&self, id: ObservationId) -> Result<Option<FeatureSet>, StorageError>;

    /// Record the entity an observation resolved to (denormalized back-reference).
    fn record_resolution(&self, id: ObservationId, entity: EntityId) -> Result<(), StorageError>;

    /// The entity id recorded for an observation. May be an absorbed id.
    fn resolution_of(&self, id: ObservationId) -> Result<Option<EntityId>, StorageError>;

    /// All observation ids in ingestion order.
    fn ids(&self) -> Result<Vec<ObservationId>, StorageError>;

    /// Number of observations.
    fn len(&self) -> Result<usize, StorageError>;

    /// Returns true if the log is empty.
    fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }
}
