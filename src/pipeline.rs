//! Ingest → enrich → resolve, in one call.
//!
//! [`Linker`] wires the observation ledger, the enrichment registry and the
//! resolution engine together. Enrichment runs before the engine's write
//! scope is taken, so a slow provider never holds up other resolutions.

use std::sync::Arc;

use crate::config::LinkConfig;
use crate::engine::{Resolution, ResolutionEngine};
use crate::enrich::{Enricher, EnrichmentRegistry};
use crate::entity::{Claim, EntityId};
use crate::error::LinkResult;
use crate::feature::FeatureSet;
use crate::index::Partition;
use crate::kind::AttributeKind;
use crate::ledger::{Ingested, ObservationLedger};
use crate::observation::ObservationId;
use crate::storage::{EntityStore, InMemoryEntityStore, InMemoryObservationStore, ObservationStore};

#[cfg(feature = "persistent")]
use crate::storage::{open_database, PersistentStores};

/// Outcome of [`Linker::link`].
#[derive(Debug, Clone, PartialEq)]
pub struct LinkOutcome {
    /// Id of the (new or existing) observation.
    pub observation_id: ObservationId,
    /// Entity the observation belongs to. `None` only for payloads that
    /// were ingested without being linked.
    pub entity_id: Option<EntityId>,
    /// False when the payload was already in the ledger.
    pub is_new: bool,
    /// Enrichers invoked, in registration order.
    pub enrichers_applied: Vec<String>,
}

/// Ledger, enrichment and resolution behind one handle.
pub struct Linker {
    ledger: ObservationLedger,
    registry: EnrichmentRegistry,
    engine: ResolutionEngine,
    #[cfg(feature = "persistent")]
    durable: Option<PersistentStores>,
}

impl std::fmt::Debug for Linker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Linker")
            .field("registry", &self.registry)
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

impl Linker {
    /// Assembles a linker from its parts.
    #[must_use]
    pub fn new(
        ledger: ObservationLedger,
        registry: EnrichmentRegistry,
        engine: ResolutionEngine,
    ) -> Self {
        Self {
            ledger,
            registry,
            engine,
            #[cfg(feature = "persistent")]
            durable: None,
        }
    }

    /// A linker over fresh in-memory stores. `data_dir` is ignored.
    ///
    /// # Errors
    /// `Validation` for a bad threshold or weight.
    pub fn in_memory(config: &LinkConfig) -> LinkResult<Self> {
        config.validate()?;
        let entities: Arc<dyn EntityStore> = Arc::new(InMemoryEntityStore::new());
        let observations: Arc<dyn ObservationStore> = Arc::new(InMemoryObservationStore::new());
        let engine = ResolutionEngine::new(entities, config.weight_table()?, config.merge_threshold)?;
        Ok(Self::new(
            ObservationLedger::new(observations),
            EnrichmentRegistry::new(),
            engine,
        ))
    }

    /// Opens a linker as configured: durable when `data_dir` is set,
    /// in-memory otherwise.
    ///
    /// A saved weight table is loaded and the configured overrides are
    /// applied over it. The recovered index is then settled, so a merge cut
    /// short by a crash is completed.
    ///
    /// # Errors
    /// - `Validation` for a bad configuration
    /// - `Storage` if the data directory cannot be opened
    #[cfg(feature = "persistent")]
    pub fn open(config: &LinkConfig) -> LinkResult<Self> {
        config.log_summary();
        let Some(dir) = config.data_dir.as_deref() else {
            return Self::in_memory(config);
        };
        config.validate()?;
        let stores = open_database(dir, Some(config.persistent_config()))?;

        let weights = config.weights_over(stores.load_weights()?.unwrap_or_default())?;
        stores.save_weights(&weights)?;

        let entities: Arc<dyn EntityStore> = stores.entities.clone();
        let observations: Arc<dyn ObservationStore> = stores.observations.clone();
        let engine = ResolutionEngine::new(entities, weights, config.merge_threshold)?;
        engine.settle()?;
        tracing::info!(dir = %dir.display(), "linker opened");

        Ok(Self {
            ledger: ObservationLedger::new(observations),
            registry: EnrichmentRegistry::new(),
            engine,
            durable: Some(stores),
        })
    }

    /// Registers an enricher for a trigger-kind set.
    pub fn register_enricher(
        &mut self,
        triggers: impl IntoIterator<Item = AttributeKind>,
        enricher: Arc<dyn Enricher>,
    ) -> &mut Self {
        self.registry.register(triggers, enricher);
        self
    }

    /// The observation ledger.
    #[must_use]
    pub fn ledger(&self) -> &ObservationLedger {
        &self.ledger
    }

    /// The enrichment registry.
    #[must_use]
    pub fn registry(&self) -> &EnrichmentRegistry {
        &self.registry
    }

    /// The resolution engine.
    #[must_use]
    pub fn engine(&self) -> &ResolutionEngine {
        &self.engine
    }

    /// The durable stores, when opened from a data directory.
    #[cfg(feature = "persistent")]
    #[must_use]
    pub fn durable(&self) -> Option<&PersistentStores> {
        self.durable.as_ref()
    }

    /// Ingests a payload without resolving it.
    ///
    /// # Errors
    /// See [`ObservationLedger::ingest`].
    pub fn ingest(&self, source_id: &str, payload: &str) -> LinkResult<Ingested> {
        self.ledger.ingest(source_id, payload)
    }

    /// Ingests a payload, enriches its feature set and resolves it.
    ///
    /// A payload already resolved is not enriched or resolved again; the
    /// outcome reports the entity it resolved to. A payload ingested earlier
    /// whose resolution never completed is enriched and resolved now, with
    /// `is_new == false`.
    ///
    /// # Errors
    /// - `Validation` for a blank source id or an unusable feature set
    /// - `Storage` if a store fails
    pub fn link(
        &self,
        source_id: &str,
        payload: &str,
        mut features: FeatureSet,
    ) -> LinkResult<LinkOutcome> {
        let ingested = self.ledger.ingest(source_id, payload)?;
        let observation_id = ingested.observation_id;
        if !ingested.is_new {
            if let Some(entity_id) = self.entity_of(observation_id)? {
                return Ok(LinkOutcome {
                    observation_id,
                    entity_id: Some(entity_id),
                    is_new: false,
                    enrichers_applied: Vec::new(),
                });
            }
            tracing::debug!(observation = %observation_id, "resuming unresolved observation");
        }

        features.observation_id = Some(observation_id);
        let report = self.registry.apply(&mut features);
        if report.skipped > 0 {
            tracing::debug!(observation = %observation_id, skipped = report.skipped, "enrichers not triggered");
        }

        let Resolution { entity_id, .. } = self.engine.resolve_detailed(&features)?;
        let store = self.ledger.store();
        store.record_features(observation_id, features)?;
        store.record_resolution(observation_id, entity_id)?;

        Ok(LinkOutcome {
            observation_id,
            entity_id: Some(entity_id),
            is_new: ingested.is_new,
            enrichers_applied: report.invoked,
        })
    }

    /// Resolves a feature set directly, bypassing the ledger and enrichment.
    ///
    /// # Errors
    /// See [`ResolutionEngine::resolve`].
    pub fn resolve(&self, features: &FeatureSet) -> LinkResult<EntityId> {
        self.engine.resolve(features)
    }

    /// Claims of an entity.
    ///
    /// # Errors
    /// See [`ResolutionEngine::entity_claims`].
    pub fn entity_claims(&self, entity_id: EntityId) -> LinkResult<Vec<Claim>> {
        self.engine.entity_claims(entity_id)
    }

    /// Current entity of an observation, following merges.
    ///
    /// # Errors
    /// `Storage` if a store fails.
    pub fn entity_of(&self, observation: ObservationId) -> LinkResult<Option<EntityId>> {
        match self.ledger.store().resolution_of(observation)? {
            Some(id) => Ok(Some(self.engine.canonical_id(id)?)),
            None => Ok(None),
        }
    }

    /// Observations ingested from a source, in ingestion order.
    ///
    /// # Errors
    /// `Validation` for a blank source id, `Storage` if the store fails.
    pub fn observations_from(&self, source_id: &str) -> LinkResult<Vec<ObservationId>> {
        self.ledger.observations_from(source_id)
    }

    /// Observations grouped by live entity.
    ///
    /// # Errors
    /// `Storage` if the store fails.
    pub fn partition(&self) -> LinkResult<Partition> {
        self.engine.partition()
    }

    /// Changes one weight for later resolutions and saves the table when
    /// durable.
    ///
    /// # Errors
    /// `Validation` for an out-of-range weight, `Storage` if saving fails.
    pub fn set_weight(&self, kind: AttributeKind, weight: f64) -> LinkResult<()> {
        self.engine.set_weight(kind, weight)?;
        #[cfg(feature = "persistent")]
        if let Some(stores) = &self.durable {
            stores.save_weights(&self.engine.weights()?)?;
        }
        Ok(())
    }

    /// Re-resolves every recorded feature set, in ledger order, into
    /// `target`. Returns how many were resolved.
    ///
    /// # Errors
    /// The first resolution or storage error.
    pub fn reindex_into(&self, target: &ResolutionEngine) -> LinkResult<usize> {
        let store = self.ledger.store();
        let mut resolved = 0;
        for id in store.ids()? {
            if let Some(features) = store.features_of(id)? {
                target.resolve(&features)?;
                resolved += 1;
            }
        }
        tracing::info!(resolved, "ledger replayed into engine");
        Ok(resolved)
    }
}
