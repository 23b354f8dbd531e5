//! Observation ledger: idempotent, append-only ingestion.
//!
//! Ingesting the same content twice, from any source and in any order, has no
//! effect beyond the first time. The second call reports `is_new == false`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::entity::EntityId;
use crate::error::LinkResult;
use crate::feature::FeatureSet;
use crate::observation::{Fingerprint, Observation, ObservationId, SourceId};
use crate::storage::{ObservationStore, StorageError};

/// Outcome of [`ObservationLedger::ingest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ingested {
    /// Id of the (new or existing) observation.
    pub observation_id: ObservationId,
    /// False when identical content was already in the ledger.
    pub is_new: bool,
}

/// In-memory ledger contents shared by the storage backends.
///
/// Observations are kept in ingestion order; the id lookup is rebuilt after
/// loading with [`rebuild_lookups`](Self::rebuild_lookups).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerState {
    log: Vec<Observation>,
    resolutions: BTreeMap<ObservationId, EntityId>,
    features: BTreeMap<ObservationId, FeatureSet>,
    #[serde(skip)]
    by_id: HashMap<ObservationId, usize>,
}

impl LedgerState {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if an observation with this id exists.
    #[must_use]
    pub fn contains(&self, id: ObservationId) -> bool {
        self.by_id.contains_key(&id)
    }

    /// Appends unless the fingerprint is already present.
    pub fn append(&mut self, observation: Observation) -> (ObservationId, bool) {
        let id = observation.id;
        if self.by_id.contains_key(&id) {
            return (id, false);
        }
        self.by_id.insert(id, self.log.len());
        self.log.push(observation);
        (id, true)
    }

    /// Observation by id.
    #[must_use]
    pub fn get(&self, id: ObservationId) -> Option<&Observation> {
        self.by_id.get(&id).and_then(|idx| self.log.get(*idx))
    }

    /// Observation by fingerprint.
    #[must_use]
    pub fn find_by_fingerprint(&self, fingerprint: &Fingerprint) -> Option<&Observation> {
        self.get(ObservationId::from_fingerprint(fingerprint))
            .filter(|obs| &obs.fingerprint == fingerprint)
    }

    /// Ids from a source, in ingestion order.
    #[must_use]
    pub fn find_by_source(&self, source: &SourceId) -> Vec<ObservationId> {
        self.log
            .iter()
            .filter(|obs| &obs.source_id == source)
            .map(|obs| obs.id)
            .collect()
    }

    /// Stores the resolved feature set of an observation.
    ///
    /// # Errors
    /// `ObservationNotFound` for unknown ids.
    pub fn record_features(
        &mut self,
        id: ObservationId,
        features: FeatureSet,
    ) -> Result<(), StorageError> {
        if !self.contains(id) {
            return Err(StorageError::ObservationNotFound(id));
        }
        self.features.insert(id, features);
        Ok(())
    }

    /// Recorded feature set of an observation.
    #[must_use]
    pub fn features_of(&self, id: ObservationId) -> Option<&FeatureSet> {
        self.features.get(&id)
    }

    /// Stores the back-reference to the resolved entity.
    ///
    /// # Errors
    /// `ObservationNotFound` for unknown ids.
    pub fn record_resolution(&mut self, id: ObservationId, entity: EntityId) -> Result<(), StorageError> {
        if !self.contains(id) {
            return Err(StorageError::ObservationNotFound(id));
        }
        self.resolutions.insert(id, entity);
        Ok(())
    }

    /// Recorded back-reference of an observation.
    #[must_use]
    pub fn resolution_of(&self, id: ObservationId) -> Option<EntityId> {
        self.resolutions.get(&id).copied()
    }

    /// Ids in ingestion order.
    #[must_use]
    pub fn ids(&self) -> Vec<ObservationId> {
        self.log.iter().map(|obs| obs.id).collect()
    }

    /// Number of observations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.log.len()
    }

    /// Returns true if nothing was ingested.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    /// Rebuilds the id lookup from the log.
    pub fn rebuild_lookups(&mut self) {
        self.by_id = self
            .log
            .iter()
            .enumerate()
            .map(|(idx, obs)| (obs.id, idx))
            .collect();
    }
}

/// Fingerprinting front of an [`ObservationStore`].
#[derive(Clone)]
pub struct ObservationLedger {
    store: Arc<dyn ObservationStore>,
}

impl ObservationLedger {
    /// Creates a ledger over a store.
    #[must_use]
    pub fn new(store: Arc<dyn ObservationStore>) -> Self {
        Self { store }
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn ObservationStore> {
        &self.store
    }

    /// Ingests a payload.
    ///
    /// A duplicate is not an error: it returns the existing id with
    /// `is_new == false` and writes nothing.
    ///
    /// # Errors
    /// - `Validation` for a blank source id
    /// - `Storage` if the durable store is unreachable
    pub fn ingest(&self, source_id: &str, payload: &str) -> LinkResult<Ingested> {
        let source = SourceId::new(source_id)?;
        let fingerprint = Fingerprint::of_payload(payload);

        if let Some(existing) = self.store.find_by_fingerprint(&fingerprint)? {
            tracing::debug!(
                observation = %existing.id,
                source = %source,
                "duplicate observation ignored"
            );
            return Ok(Ingested {
                observation_id: existing.id,
                is_new: false,
            });
        }

        let (observation_id, is_new) = self.store.append(Observation::new(source, payload))?;
        if is_new {
            tracing::debug!(observation = %observation_id, "observation ingested");
        }
        Ok(Ingested {
            observation_id,
            is_new,
        })
    }

    /// Observation by id.
    ///
    /// # Errors
    /// `Storage` if the store fails.
    pub fn get(&self, id: ObservationId) -> LinkResult<Option<Observation>> {
        Ok(self.store.get(id)?)
    }

    /// Observations from a source, in ingestion order.
    ///
    /// # Errors
    /// `Validation` for a blank source id, `Storage` if the store fails.
    pub fn observations_from(&self, source_id: &str) -> LinkResult<Vec<ObservationId>> {
        let source = SourceId::new(source_id)?;
        Ok(self.store.find_by_source(&source)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kind::AttributeKind;
    use crate::storage::InMemoryObservationStore;

    fn ledger() -> ObservationLedger {
        ObservationLedger::new(Arc::new(InMemoryObservationStore::new()))
    }

    #[test]
    fn test_ingest_twice_is_noop() {
        let ledger = ledger();
        let first = ledger.ingest("notes.txt", "Dinner at Starbucks NYC").unwrap();
        let second = ledger.ingest("notes.txt", "Dinner at Starbucks NYC").unwrap();

        assert!(first.is_new);
        assert!(!second.is_new);
        assert_eq!(first.observation_id, second.observation_id);
        assert_eq!(ledger.store().len().unwrap(), 1);
    }

    #[test]
    fn test_duplicate_from_other_source_keeps_first_source() {
        let ledger = ledger();
        let first = ledger.ingest("a", "Meeting with John Smith").unwrap();
        let again = ledger.ingest("b", "  Meeting with   John Smith ").unwrap();
        assert!(!again.is_new);

        let obs = ledger.get(first.observation_id).unwrap().unwrap();
        assert_eq!(obs.source_id.as_str(), "a");
        assert_eq!(ledger.observations_from("a").unwrap(), vec![first.observation_id]);
        assert!(ledger.observations_from("b").unwrap().is_empty());
    }

    #[test]
    fn test_blank_source_rejected() {
        let err = ledger().ingest(" ", "payload").unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_state_records_require_known_observation() {
        let mut state = LedgerState::new();
        let unknown = ObservationId::for_payload("nope");
        assert!(matches!(
            state.record_resolution(unknown, EntityId::from_raw(1)),
            Err(StorageError::ObservationNotFound(_))
        ));

        let obs = Observation::new(SourceId::new("s").unwrap(), "hello");
        let (id, is_new) = state.append(obs);
        assert!(is_new);
        state.record_resolution(id, EntityId::from_raw(1)).unwrap();
        state
            .record_features(id, FeatureSet::new().with(AttributeKind::Person, "Ada"))
            .unwrap();
        assert_eq!(state.resolution_of(id), Some(EntityId::from_raw(1)));
        assert_eq!(state.features_of(id).unwrap().len(), 1);
    }

    #[test]
    fn test_state_serde_roundtrip_keeps_order() {
        let mut state = LedgerState::new();
        for payload in ["one", "two", "three"] {
            state.append(Observation::new(SourceId::new("s").unwrap(), payload));
        }
        let json = serde_json::to_string(&state).unwrap();
        let mut restored: LedgerState = serde_json::from_str(&json).unwrap();
        restored.rebuild_lookups();

        assert_eq!(restored.ids(), state.ids());
        let fp = Fingerprint::of_payload("two");
        assert!(restored.find_by_fingerprint(&fp).is_some());
    }
}
