//! Resolution engine.
//!
//! Decides, for each feature set, whether it describes an entity already in
//! the index or a new one:
//!
//! 1. Collect candidates sharing at least one normalized value.
//! 2. Score each candidate by accumulated evidence (see [`scoring`]).
//! 3. Every candidate at or above the threshold joins one entity, the
//!    lowest id surviving. Below threshold, a new entity is created.
//! 4. The grown entity is re-scored with its full claim set and absorbs any
//!    entity it now reaches, until none is left.
//!
//! Step 4 makes the final partition of observations independent of the
//! order in which feature sets arrive.

pub mod scoring;

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::entity::{Claim, EntityId};
use crate::error::{LinkError, LinkResult, ValidationError};
use crate::feature::FeatureSet;
use crate::index::Partition;
use crate::kind::AttributeKind;
use crate::storage::{EntityStore, StorageError};
use crate::weights::WeightTable;

use scoring::{keys_of, lookup_keys, meets, score, KeyMap};

/// Default merge threshold.
pub const MERGE_THRESHOLD: f64 = 0.9;

/// What [`ResolutionEngine::resolve_detailed`] did.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// No candidate reached the threshold; a new entity was created.
    Created,
    /// Claims were attached to one existing entity.
    Attached,
    /// Two or more entities were unified.
    Merged {
        /// Ids absorbed into the survivor, ascending.
        absorbed: Vec<EntityId>,
    },
}

/// Outcome of a resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// The entity the feature set now belongs to.
    pub entity_id: EntityId,
    /// What happened.
    pub decision: Decision,
    /// Highest candidate score seen for the incoming feature set.
    pub best_score: f64,
}

/// Scores feature sets against the entity index and mutates it.
///
/// Weight table and threshold are fixed at construction (weights may be
/// changed later with [`set_weight`](Self::set_weight); past decisions are
/// never revisited).
pub struct ResolutionEngine {
    entities: Arc<dyn EntityStore>,
    weights: RwLock<WeightTable>,
    threshold: f64,
    write_scope: Mutex<()>,
}

impl std::fmt::Debug for ResolutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolutionEngine")
            .field("threshold", &self.threshold)
            .finish_non_exhaustive()
    }
}

impl ResolutionEngine {
    /// Creates an engine.
    ///
    /// # Errors
    /// `ThresholdOutOfRange` unless the threshold is finite and positive;
    /// `WeightOutOfRange` for a bad weight.
    pub fn new(
        entities: Arc<dyn EntityStore>,
        weights: WeightTable,
        threshold: f64,
    ) -> Result<Self, ValidationError> {
        if !threshold.is_finite() || threshold <= 0.0 {
            return Err(ValidationError::ThresholdOutOfRange { value: threshold });
        }
        weights.validate()?;
        Ok(Self {
            entities,
            weights: RwLock::new(weights),
            threshold,
            write_scope: Mutex::new(()),
        })
    }

    /// Creates an engine with the default weights and [`MERGE_THRESHOLD`].
    #[must_use]
    pub fn with_defaults(entities: Arc<dyn EntityStore>) -> Self {
        Self {
            entities,
            weights: RwLock::new(WeightTable::default()),
            threshold: MERGE_THRESHOLD,
            write_scope: Mutex::new(()),
        }
    }

    /// The entity store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn EntityStore> {
        &self.entities
    }

    /// The merge threshold.
    #[must_use]
    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// A copy of the current weight table.
    ///
    /// # Errors
    /// `Storage` if the weight lock is poisoned.
    pub fn weights(&self) -> LinkResult<WeightTable> {
        Ok(self
            .weights
            .read()
            .map_err(|_| StorageError::BackendError("poisoned lock: engine.weights".to_string()))?
            .clone())
    }

    /// Changes one weight. Affects later resolutions only.
    ///
    /// # Errors
    /// `Validation` for an out-of-range weight.
    pub fn set_weight(&self, kind: AttributeKind, weight: f64) -> LinkResult<()> {
        let mut weights = self
            .weights
            .write()
            .map_err(|_| StorageError::BackendError("poisoned lock: engine.weights".to_string()))?;
        weights.set(kind.clone(), weight)?;
        tracing::info!(kind = %kind, weight, "weight updated");
        Ok(())
    }

    /// Resolves a feature set and returns the entity it belongs to.
    ///
    /// # Errors
    /// - `Validation` if the feature set is empty or has no recognized kind
    /// - `Storage` if the entity store fails
    pub fn resolve(&self, features: &FeatureSet) -> LinkResult<EntityId> {
        self.resolve_detailed(features).map(|r| r.entity_id)
    }

    /// Resolves a feature set and reports the decision taken.
    ///
    /// # Errors
    /// Same as [`resolve`](Self::resolve).
    pub fn resolve_detailed(&self, features: &FeatureSet) -> LinkResult<Resolution> {
        let weights = self.weights()?;
        let wanted = validate(features, &weights)?;
        let claims: Vec<Claim> = features
            .pairs()
            .filter(|(kind, value)| kind.match_key(value).is_some())
            .map(|(kind, value)| {
                Claim::new(kind.clone(), value, weights.weight_of(kind), features.observation_id)
            })
            .collect();

        let _scope = self.write_scope.lock().unwrap_or_else(PoisonError::into_inner);

        let mut qualifying = BTreeSet::new();
        if let Some(observation) = features.observation_id {
            if let Some(owner) = self.entities.entity_for_observation(observation)? {
                tracing::debug!(observation = %observation, entity = %owner, "observation already resolved; rejoining");
                qualifying.insert(owner);
            }
        }

        let mut best_score = 0.0_f64;
        for candidate in self.entities.candidates(&lookup_keys(&wanted))? {
            let Some(entity) = self.entities.get(candidate)? else {
                continue;
            };
            let s = score(&weights, &wanted, &entity.match_keys());
            tracing::debug!(entity = %candidate, score = s, "candidate scored");
            best_score = best_score.max(s);
            if meets(s, self.threshold) {
                qualifying.insert(candidate);
            }
        }

        let Some(&lowest) = qualifying.first() else {
            let entity_id = self.entities.create(claims)?;
            tracing::info!(entity = %entity_id, best_score, "entity created");
            return Ok(Resolution {
                entity_id,
                decision: Decision::Created,
                best_score,
            });
        };

        let mut absorbed: Vec<EntityId> = qualifying.iter().copied().skip(1).collect();
        let mut survivor = lowest;
        if !absorbed.is_empty() {
            let ids: Vec<EntityId> = qualifying.iter().copied().collect();
            survivor = self.entities.merge(&ids)?;
            tracing::info!(survivor = %survivor, absorbed = ?absorbed, "entities merged");
        }
        self.entities.attach(survivor, claims)?;

        let (survivor, closure) = self.close_over(survivor, &weights)?;
        absorbed.extend(closure);
        absorbed.sort_unstable();

        let decision = if absorbed.is_empty() {
            Decision::Attached
        } else {
            Decision::Merged { absorbed }
        };
        tracing::debug!(entity = %survivor, ?decision, best_score, "feature set resolved");
        Ok(Resolution {
            entity_id: survivor,
            decision,
            best_score,
        })
    }

    /// Re-scores `survivor` with its full claim set and merges in every
    /// entity it reaches, until none is left.
    fn close_over(
        &self,
        mut survivor: EntityId,
        weights: &WeightTable,
    ) -> LinkResult<(EntityId, Vec<EntityId>)> {
        let bound = self.entities.live_count()?;
        let mut absorbed = Vec::new();

        for _ in 0..=bound {
            let Some(entity) = self.entities.get(survivor)? else {
                return Err(StorageError::EntityNotFound(survivor).into());
            };
            let held: KeyMap = entity.match_keys();

            let mut reached = Vec::new();
            for candidate in self.entities.candidates(&lookup_keys(&held))? {
                if candidate == survivor {
                    continue;
                }
                let Some(other) = self.entities.get(candidate)? else {
                    continue;
                };
                if meets(score(weights, &held, &other.match_keys()), self.threshold) {
                    reached.push(candidate);
                }
            }
            if reached.is_empty() {
                return Ok((survivor, absorbed));
            }

            let mut group = reached.clone();
            group.push(survivor);
            survivor = self.entities.merge(&group)?;
            tracing::info!(survivor = %survivor, absorbed = ?reached, "transitive merge");
            absorbed.extend(group.into_iter().filter(|id| *id != survivor));
        }

        Err(LinkError::internal(format!(
            "transitive merge did not settle within {bound} rounds"
        )))
    }

    /// Closes every live entity over the current weights, in id order.
    /// Returns how many entities were absorbed.
    ///
    /// Brings the index back to a closed partition after a restart that
    /// interrupted a transitive merge.
    ///
    /// # Errors
    /// `Storage` if the entity store fails.
    pub fn settle(&self) -> LinkResult<usize> {
        let _scope = self.write_scope.lock().unwrap_or_else(PoisonError::into_inner);
        let weights = self.weights()?;
        let mut absorbed = 0;
        for id in self.entities.live_ids()? {
            if self.entities.canonical_id(id)? != id {
                continue;
            }
            absorbed += self.close_over(id, &weights)?.1.len();
        }
        if absorbed > 0 {
            tracing::info!(absorbed, "index settled");
        }
        Ok(absorbed)
    }

    /// Score of a feature set against an entity under the current weights.
    ///
    /// # Errors
    /// `Storage` with `EntityNotFound` for unknown ids.
    pub fn score(&self, features: &FeatureSet, entity_id: EntityId) -> LinkResult<f64> {
        let weights = self.weights()?;
        let entity = self
            .entities
            .get(entity_id)?
            .ok_or(StorageError::EntityNotFound(entity_id))?;
        Ok(score(&weights, &keys_of(features), &entity.match_keys()))
    }

    /// Claims of an entity (following merges), ordered by kind, value and
    /// provenance.
    ///
    /// # Errors
    /// `Storage` with `EntityNotFound` for unknown ids.
    pub fn entity_claims(&self, entity_id: EntityId) -> LinkResult<Vec<Claim>> {
        let entity = self
            .entities
            .get(entity_id)?
            .ok_or(StorageError::EntityNotFound(entity_id))?;
        let mut claims = entity.claims;
        claims.sort_by(|a, b| {
            a.kind
                .cmp(&b.kind)
                .then_with(|| a.value.cmp(&b.value))
                .then_with(|| a.provenance.cmp(&b.provenance))
        });
        Ok(claims)
    }

    /// The surviving id for `entity_id`.
    ///
    /// # Errors
    /// `Storage` with `EntityNotFound` for unknown ids.
    pub fn canonical_id(&self, entity_id: EntityId) -> LinkResult<EntityId> {
        Ok(self.entities.canonical_id(entity_id)?)
    }

    /// Observations grouped by live entity.
    ///
    /// # Errors
    /// `Storage` if the store fails.
    pub fn partition(&self) -> LinkResult<Partition> {
        Ok(self.entities.partition()?)
    }
}

/// Rejects empty or unrecognizable feature sets and returns its key map.
fn validate(features: &FeatureSet, weights: &WeightTable) -> Result<KeyMap, ValidationError> {
    let wanted = keys_of(features);
    if wanted.is_empty() {
        return Err(ValidationError::EmptyFeatureSet);
    }
    if !wanted
        .keys()
        .any(|kind| kind.is_builtin() || weights.contains(kind))
    {
        return Err(ValidationError::UnrecognizedKinds {
            kinds: wanted.keys().map(ToString::to_string).collect(),
        });
    }
    Ok(wanted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observation::ObservationId;
    use crate::storage::InMemoryEntityStore;

    fn engine() -> ResolutionEngine {
        ResolutionEngine::with_defaults(Arc::new(InMemoryEntityStore::new()))
    }

    fn features(obs: &str, pairs: &[(AttributeKind, &str)]) -> FeatureSet {
        let mut f = FeatureSet::for_observation(ObservationId::for_payload(obs));
        for (kind, value) in pairs {
            f.insert(kind.clone(), *value);
        }
        f
    }

    #[test]
    fn test_first_feature_set_creates() {
        let engine = engine();
        let r = engine
            .resolve_detailed(&features("o1", &[(AttributeKind::Email, "ada@x.io")]))
            .unwrap();
        assert_eq!(r.decision, Decision::Created);
        assert_eq!(r.entity_id, EntityId::from_raw(1));
    }

    #[test]
    fn test_attach_at_threshold() {
        let engine = engine();
        let a = engine
            .resolve(&features("o1", &[(AttributeKind::Email, "ada@x.io")]))
            .unwrap();
        let r = engine
            .resolve_detailed(&features(
                "o2",
                &[(AttributeKind::Email, "ADA@x.io"), (AttributeKind::Phone, "555 0100")],
            ))
            .unwrap();
        assert_eq!(r.entity_id, a);
        assert_eq!(r.decision, Decision::Attached);
        assert!((r.best_score - 0.9).abs() < 1e-9);
        assert_eq!(engine.entity_claims(a).unwrap().len(), 3);
    }

    #[test]
    fn test_below_threshold_creates_new() {
        let engine = engine();
        let a = engine
            .resolve(&features("o1", &[(AttributeKind::Person, "Ada"), (AttributeKind::Location, "London")]))
            .unwrap();
        let b = engine
            .resolve(&features("o2", &[(AttributeKind::Person, "Ada"), (AttributeKind::Location, "London")]))
            .unwrap();
        assert_ne!(a, b);
        assert_eq!(engine.partition().unwrap().len(), 2);
    }

    #[test]
    fn test_incoming_bridges_two_entities() {
        let engine = engine();
        let a = engine
            .resolve(&features("o1", &[(AttributeKind::Email, "ada@x.io")]))
            .unwrap();
        let b = engine
            .resolve(&features("o2", &[(AttributeKind::Phone, "555 0100"), (AttributeKind::Organization, "Acme")]))
            .unwrap();
        assert_ne!(a, b);

        let r = engine
            .resolve_detailed(&features(
                "o3",
                &[
                    (AttributeKind::Email, "ada@x.io"),
                    (AttributeKind::Phone, "5550100"),
                    (AttributeKind::Organization, "ACME"),
                ],
            ))
            .unwrap();
        assert_eq!(r.entity_id, a);
        assert_eq!(r.decision, Decision::Merged { absorbed: vec![b] });
        assert!((r.best_score - 1.3).abs() < 1e-9);
        assert_eq!(engine.canonical_id(b).unwrap(), a);
    }

    #[test]
    fn test_grown_entity_absorbs_what_it_now_reaches() {
        let engine = engine();
        // o1 and o2 share only a name; o3 brings an email linking to o1
        // together with the organization of o2.
        let a = engine
            .resolve(&features("o1", &[(AttributeKind::Person, "Ada"), (AttributeKind::Email, "ada@x.io")]))
            .unwrap();
        let b = engine
            .resolve(&features("o2", &[(AttributeKind::Person, "Ada"), (AttributeKind::Organization, "Acme")]))
            .unwrap();
        assert_ne!(a, b);

        let r = engine
            .resolve_detailed(&features("o3", &[(AttributeKind::Email, "ada@x.io"), (AttributeKind::Organization, "Acme")]))
            .unwrap();
        assert_eq!(r.entity_id, a);
        assert_eq!(r.decision, Decision::Merged { absorbed: vec![b] });
        assert_eq!(engine.partition().unwrap().len(), 1);
    }

    #[test]
    fn test_settle_merges_entities_left_unclosed() {
        let engine = engine();
        let store = engine.store();
        let claim = |obs: &str| {
            Claim::new(AttributeKind::Email, "ada@x.io", 0.9, Some(ObservationId::for_payload(obs)))
        };
        let a = store.create(vec![claim("o1")]).unwrap();
        let b = store.create(vec![claim("o2")]).unwrap();
        store
            .create(vec![Claim::new(AttributeKind::Person, "Bob", 0.4, None)])
            .unwrap();
        assert_eq!(engine.partition().unwrap().len(), 3);

        assert_eq!(engine.settle().unwrap(), 1);
        assert_eq!(engine.canonical_id(b).unwrap(), a);
        assert_eq!(engine.partition().unwrap().len(), 2);
        assert_eq!(engine.settle().unwrap(), 0);
    }

    #[test]
    fn test_rejoins_entity_of_same_observation() {
        let engine = engine();
        let a = engine
            .resolve(&features("o1", &[(AttributeKind::Person, "Ada")]))
            .unwrap();
        let again = engine
            .resolve(&features("o1", &[(AttributeKind::Location, "Paris")]))
            .unwrap();
        assert_eq!(a, again);
    }

    #[test]
    fn test_invalid_feature_sets() {
        let engine = engine();
        let err = engine.resolve(&FeatureSet::new()).unwrap_err();
        assert!(matches!(err, LinkError::Validation(ValidationError::EmptyFeatureSet)));

        let err = engine
            .resolve(&features("o1", &[(AttributeKind::Phone, "n/a")]))
            .unwrap_err();
        assert!(err.is_invalid_feature_set());

        let err = engine
            .resolve(&features("o1", &[(AttributeKind::custom("SHOE_SIZE"), "38")]))
            .unwrap_err();
        assert!(matches!(
            err,
            LinkError::Validation(ValidationError::UnrecognizedKinds { ref kinds }) if kinds == &["SHOE_SIZE".to_string()]
        ));
        assert!(engine.partition().unwrap().is_empty());
    }

    #[test]
    fn test_custom_kind_recognized_once_weighted() {
        let engine = engine();
        engine.set_weight(AttributeKind::custom("TAX_ID"), 0.95).unwrap();
        let a = engine
            .resolve(&features("o1", &[(AttributeKind::custom("TAX_ID"), "DE-123")]))
            .unwrap();
        let b = engine
            .resolve(&features("o2", &[(AttributeKind::custom("tax_id"), "de-123")]))
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_constructor_validates_threshold() {
        let store: Arc<dyn EntityStore> = Arc::new(InMemoryEntityStore::new());
        for bad in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            assert!(ResolutionEngine::new(Arc::clone(&store), WeightTable::default(), bad).is_err());
        }
        assert!(ResolutionEngine::new(store, WeightTable::default(), 1.5).is_ok());
    }

    #[test]
    fn test_score_and_claims_of_unknown_entity() {
        let engine = engine();
        let f = features("o1", &[(AttributeKind::Email, "ada@x.io")]);
        assert!(engine.score(&f, EntityId::from_raw(42)).unwrap_err().is_storage());
        assert!(engine.entity_claims(EntityId::from_raw(42)).is_err());
    }
}
