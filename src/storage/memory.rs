//! In-memory storage backend.
//!
//! Thread-safe implementations of the storage traits for embedded use, tests
//! and as a reference implementation. Nothing survives the process.

use std::collections::BTreeSet;
use std::sync::RwLock;

use chrono::Utc;

use crate::entity::{Claim, Entity, EntityId};
use crate::feature::FeatureSet;
use crate::index::{EntityIndex, MatchKey, Partition};
use crate::ledger::LedgerState;
use crate::observation::{Fingerprint, Observation, ObservationId, SourceId};
use crate::storage::traits::{EntityStore, ObservationStore, StorageError};

pub(crate) fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

/// Thread-safe in-memory entity store.
#[derive(Debug, Default)]
pub struct InMemoryEntityStore {
    state: RwLock<EntityIndex>,
}

impl InMemoryEntityStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl EntityStore for InMemoryEntityStore {
    fn candidates(&self, keys: &[MatchKey]) -> Result<BTreeSet<EntityId>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("entity.candidates"))?;
        Ok(state.candidates(keys))
    }

    fn get(&self, id: EntityId) -> Result<Option<Entity>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("entity.get"))?;
        Ok(state.get(id).cloned())
    }

    fn canonical_id(&self, id: EntityId) -> Result<EntityId, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("entity.canonical_id"))?;
        state.canonical_id(id)
    }

    fn entity_for_observation(
        &self,
        observation: ObservationId,
    ) -> Result<Option<EntityId>, StorageError> {
        let state = self
            .state
            .read()
            .map_err(|_| lock_err("entity.entity_for_observation"))?;
        Ok(state.entity_for_observation(observation))
    }

    fn create(&self, claims: Vec<Claim>) -> Result<EntityId, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("entity.create"))?;
        let entity = state.prepare(claims, Utc::now());
        state.insert_new(entity)
    }

    fn attach(&self, id: EntityId, claims: Vec<Claim>) -> Result<usize, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("entity.attach"))?;
        state.attach(id, claims, Utc::now())
    }

    fn merge(&self, ids: &[EntityId]) -> Result<EntityId, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("entity.merge"))?;
        state.merge(ids, Utc::now())
    }

    fn live_ids(&self) -> Result<Vec<EntityId>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("entity.live_ids"))?;
        Ok(state.live_ids())
    }

    fn live_count(&self) -> Result<usize, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("entity.live_count"))?;
        Ok(state.len())
    }

    fn partition(&self) -> Result<Partition, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("entity.partition"))?;
        Ok(state.partition())
    }
}

/// Thread-safe in-memory observation log.
#[derive(Debug, Default)]
pub struct InMemoryObservationStore {
    state: RwLock<LedgerState>,
}

impl InMemoryObservationStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ObservationStore for InMemoryObservationStore {
    fn append(&self, observation: Observation) -> Result<(ObservationId, bool), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("observation.append"))?;
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

/// Convenience bundle of in-memory stores.
#[derive(Debug, Default)]
pub struct InMemoryStores {
    /// Entity and claim store.
    pub entities: InMemoryEntityStore,
    /// Observation log.
    pub observations: InMemoryObservationStore,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kind::AttributeKind;

    fn claim(kind: AttributeKind, value: &str, obs: &str) -> Claim {
        Claim::new(kind, value, 0.5, Some(ObservationId::for_payload(obs)))
    }

    fn key(kind: AttributeKind, value: &str) -> MatchKey {
        let k = kind.match_key(value).unwrap();
        (kind, k)
    }

    #[test]
    fn test_entity_store_create_attach_merge() {
        let store = InMemoryEntityStore::new();
        let a = store.create(vec![claim(AttributeKind::Person, "Ada", "o1")]).unwrap();
        let b = store.create(vec![claim(AttributeKind::Email, "ada@x.io", "o2")]).unwrap();
        assert_eq!(store.attach(b, vec![claim(AttributeKind::Phone, "5550100", "o2")]).unwrap(), 1);

        let survivor = store.merge(&[b, a]).unwrap();
        assert_eq!(survivor, a);
        assert_eq!(store.live_ids().unwrap(), vec![a]);
        assert_eq!(store.live_count().unwrap(), 1);
        assert_eq!(store.canonical_id(b).unwrap(), a);
        assert_eq!(store.get(b).unwrap().unwrap().claims.len(), 3);
        assert_eq!(
            store.candidates(&[key(AttributeKind::Phone, "555 0100")]).unwrap(),
            BTreeSet::from([a])
        );
    }

    #[test]
    fn test_entity_store_missing_entity() {
        let store = InMemoryEntityStore::new();
        assert!(store.get(EntityId::from_raw(1)).unwrap().is_none());
        assert!(matches!(
            store.attach(EntityId::from_raw(1), Vec::new()),
            Err(StorageError::EntityNotFound(_))
        ));
        assert!(matches!(store.merge(&[]), Err(StorageError::BackendError(_))));
    }

    #[test]
    fn test_observation_store_append_is_insert_if_absent() {
        let store = InMemoryObservationStore::new();
        let source = SourceId::new("feed").unwrap();
        let (id, is_new) = store.append(Observation::new(source.clone(), "hello")).unwrap();
        assert!(is_new);
        let (again, is_new) = store.append(Observation::new(source.clone(), "hello")).unwrap();
        assert!(!is_new);
        assert_eq!(id, again);
        assert_eq!(store.len().unwrap(), 1);
        assert_eq!(store.find_by_source(&source).unwrap(), vec![id]);
    }
}
