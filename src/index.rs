//! Entity index: entity arena plus inverted (kind, value) index.
//!
//! Entities live in an arena keyed by [`EntityId`]. A secondary inverted index
//! maps each normalized (kind, value) pair to the set of entities claiming it,
//! which bounds candidate scoring to entities sharing at least one value.
//!
//! The index is plain data. Storage backends wrap it in a lock so that every
//! mutation, a multi-way merge included, is observed all-or-nothing.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::{Claim, Entity, EntityId};
use crate::kind::AttributeKind;
use crate::observation::ObservationId;
use crate::storage::StorageError;

/// Normalized (kind, value) lookup key.
pub type MatchKey = (AttributeKind, String);

/// Observations grouped by the entity they resolved to.
pub type Partition = BTreeMap<EntityId, BTreeSet<ObservationId>>;

/// Arena of live entities with lookup tables.
///
/// Only `entities`, `merged_into` and `next_id` are serialized; lookups are
/// rebuilt with [`rebuild_lookups`](Self::rebuild_lookups) after loading.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityIndex {
    entities: BTreeMap<EntityId, Entity>,
    merged_into: BTreeMap<EntityId, EntityId>,
    next_id: u64,
    #[serde(skip)]
    by_value: HashMap<MatchKey, BTreeSet<EntityId>>,
    #[serde(skip)]
    by_observation: HashMap<ObservationId, EntityId>,
}

impl EntityIndex {
    /// Creates an empty index. The first entity gets id 1.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Id the next created entity will receive.
    #[must_use]
    pub fn peek_next_id(&self) -> EntityId {
        EntityId::from_raw(self.next_id.max(1))
    }

    /// Number of live entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Returns true if no entity exists.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Live entity ids, ascending.
    #[must_use]
    pub fn live_ids(&self) -> Vec<EntityId> {
        self.entities.keys().copied().collect()
    }

    /// Follows merge lineage to the surviving id.
    ///
    /// # Errors
    /// `EntityNotFound` if the id was never allocated.
    pub fn canonical_id(&self, id: EntityId) -> Result<EntityId, StorageError> {
        let survivor = self.merged_into.get(&id).copied().unwrap_or(id);
        if self.entities.contains_key(&survivor) {
            Ok(survivor)
        } else {
            Err(StorageError::EntityNotFound(id))
        }
    }

    /// Entity for an id, following merges.
    #[must_use]
    pub fn get(&self, id: EntityId) -> Option<&Entity> {
        let survivor = self.merged_into.get(&id).copied().unwrap_or(id);
        self.entities.get(&survivor)
    }

    /// Union of entities claiming any of the keys.
    pub fn candidates<'a>(&self, keys: impl IntoIterator<Item = &'a MatchKey>) -> BTreeSet<EntityId> {
        let mut out = BTreeSet::new();
        for key in keys {
            if let Some(ids) = self.by_value.get(key) {
                out.extend(ids.iter().copied());
            }
        }
        out
    }

    /// Entity currently holding claims from the observation.
    #[must_use]
    pub fn entity_for_observation(&self, observation: ObservationId) -> Option<EntityId> {
        self.by_observation.get(&observation).copied()
    }

    /// Builds (but does not insert) a new entity with the next id.
    #[must_use]
    pub fn prepare(&self, claims: Vec<Claim>, now: DateTime<Utc>) -> Entity {
        Entity::new(self.peek_next_id(), claims, now)
    }

    /// Inserts a freshly created entity.
    ///
    /// # Errors
    /// `DuplicateKey` if the id is live or was merged away.
    pub fn insert_new(&mut self, entity: Entity) -> Result<EntityId, StorageError> {
        let id = entity.id;
        if self.entities.contains_key(&id) || self.merged_into.contains_key(&id) {
            return Err(StorageError::DuplicateKey(id.to_string()));
        }
        self.next_id = self.next_id.max(id.as_raw().saturating_add(1));
        for claim in &entity.claims {
            self.index_claim(id, claim);
        }
        self.entities.insert(id, entity);
        Ok(id)
    }

    /// Adds claims to an entity (following merges).
    ///
    /// Returns how many claims were new.
    ///
    /// # Errors
    /// `EntityNotFound` if the entity does not exist.
    pub fn attach(
        &mut self,
        id: EntityId,
        claims: Vec<Claim>,
        now: DateTime<Utc>,
    ) -> Result<usize, StorageError> {
        let id = self.canonical_id(id)?;
        let Some(entity) = self.entities.get_mut(&id) else {
            return Err(StorageError::EntityNotFound(id));
        };

        let mut added = Vec::new();
        for claim in claims {
            if entity.push_claim(claim.clone()) {
                added.push(claim);
            }
        }
        if !added.is_empty() {
            entity.touch(now);
        }
        for claim in &added {
            self.index_claim(id, claim);
        }
        Ok(added.len())
    }

    /// Merges entities into the one with the lowest id.
    ///
    /// Every index entry of an absorbed entity is repointed to the survivor
    /// before this returns. Ids already merged resolve to their survivor first.
    /// Nothing is mutated if any id is unknown.
    ///
    /// # Errors
    /// `EntityNotFound` for unknown ids, `BackendError` for an empty id list.
    pub fn merge(&mut self, ids: &[EntityId], now: DateTime<Utc>) -> Result<EntityId, StorageError> {
        let mut group = BTreeSet::new();
        for id in ids {
            group.insert(self.canonical_id(*id)?);
        }
        let mut group = group.into_iter();
        let Some(survivor) = group.next() else {
            return Err(StorageError::BackendError(
                "cannot merge an empty set of entities".to_string(),
            ));
        };
        let absorbed: Vec<EntityId> = group.collect();
        if absorbed.is_empty() {
            return Ok(survivor);
        }

        for victim_id in absorbed {
            let Some(victim) = self.entities.remove(&victim_id) else {
                return Err(StorageError::EntityNotFound(victim_id));
            };
            self.absorb(survivor, victim)?;
        }

        if let Some(entity) = self.entities.get_mut(&survivor) {
            entity.touch(now);
        }
        Ok(survivor)
    }

    fn absorb(&mut self, survivor: EntityId, victim: Entity) -> Result<(), StorageError> {
        let Some(target) = self.entities.get_mut(&survivor) else {
            return Err(StorageError::EntityNotFound(survivor));
        };

        for claim in &victim.claims {
            if let Some(key) = claim.match_key() {
                if let Some(set) = self.by_value.get_mut(&key) {
                    set.remove(&victim.id);
                }
            }
        }
        let observations = victim.observations();
        let mut moved = Vec::new();
        for claim in victim.claims {
            if target.push_claim(claim.clone()) {
                moved.push(claim);
            }
        }

        let lineage: Vec<EntityId> = victim
            .merged_from
            .iter()
            .copied()
            .chain(std::iter::once(victim.id))
            .collect();
        target.merged_from.extend(lineage.iter().copied());
        target.merged_from.sort_unstable();

        for claim in &moved {
            self.index_claim(survivor, claim);
        }
        for id in lineage {
            self.merged_into.insert(id, survivor);
        }
        for obs in observations {
            if let Some(owner) = self.by_observation.get_mut(&obs) {
                if *owner == victim.id {
                    *owner = survivor;
                }
            }
        }
        Ok(())
    }

    fn index_claim(&mut self, id: EntityId, claim: &Claim) {
        if let Some(key) = claim.match_key() {
            self.by_value.entry(key).or_default().insert(id);
        }
        if let Some(obs) = claim.provenance {
            self.by_observation.insert(obs, id);
        }
    }

    /// Rebuilds the inverted and observation lookups from the arena.
    pub fn rebuild_lookups(&mut self) {
        self.by_value.clear();
        self.by_observation.clear();
        let entries: Vec<(EntityId, Vec<Claim>)> = self
            .entities
            .iter()
            .map(|(id, e)| (*id, e.claims.clone()))
            .collect();
        for (id, claims) in entries {
            for claim in &claims {
                self.index_claim(id, claim);
            }
        }
        let max_seen = self
            .entities
            .keys()
            .chain(self.merged_into.keys())
            .map(EntityId::as_raw)
            .max()
            .unwrap_or(0);
        self.next_id = self.next_id.max(max_seen.saturating_add(1));
    }

    /// Observations grouped by live entity.
    #[must_use]
    pub fn partition(&self) -> Partition {
        self.entities
            .iter()
            .map(|(id, e)| (*id, e.observations()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claim(kind: AttributeKind, value: &str, obs: &str) -> Claim {
        Claim::new(kind, value, 0.5, Some(ObservationId::for_payload(obs)))
    }

    fn key(kind: AttributeKind, value: &str) -> MatchKey {
        let k = kind.match_key(value).unwrap();
        (kind, k)
    }

    fn create(index: &mut EntityIndex, claims: Vec<Claim>) -> EntityId {
        let entity = index.prepare(claims, Utc::now());
        index.insert_new(entity).unwrap()
    }

    #[test]
    fn test_ids_are_monotonic_from_one() {
        let mut index = EntityIndex::new();
        let a = create(&mut index, vec![claim(AttributeKind::Person, "Ada", "o1")]);
        let b = create(&mut index, vec![claim(AttributeKind::Person, "Bob", "o2")]);
        assert_eq!(a, EntityId::from_raw(1));
        assert_eq!(b, EntityId::from_raw(2));
    }

    #[test]
    fn test_candidates_union_over_keys() {
        let mut index = EntityIndex::new();
        let a = create(&mut index, vec![claim(AttributeKind::Email, "ada@x.io", "o1")]);
        let b = create(&mut index, vec![claim(AttributeKind::Phone, "555-0100", "o2")]);
        create(&mut index, vec![claim(AttributeKind::Person, "Carol", "o3")]);

        let keys = [
            key(AttributeKind::Email, "ADA@x.io"),
            key(AttributeKind::Phone, "(555) 0100"),
            key(AttributeKind::Location, "Paris"),
        ];
        let found = index.candidates(keys.iter());
        assert_eq!(found, BTreeSet::from([a, b]));
    }

    #[test]
    fn test_attach_indexes_new_claims_only() {
        let mut index = EntityIndex::new();
        let a = create(&mut index, vec![claim(AttributeKind::Person, "Ada", "o1")]);
        let added = index
            .attach(
                a,
                vec![
                    claim(AttributeKind::Person, "Ada", "o1"),
                    claim(AttributeKind::Email, "ada@x.io", "o2"),
                ],
                Utc::now(),
            )
            .unwrap();
        assert_eq!(added, 1);
        assert_eq!(index.get(a).unwrap().version, 2);
        assert_eq!(
            index.candidates([key(AttributeKind::Email, "ada@x.io")].iter()),
            BTreeSet::from([a])
        );
        assert_eq!(index.entity_for_observation(ObservationId::for_payload("o2")), Some(a));
    }

    #[test]
    fn test_merge_repoints_everything_to_lowest_id() {
        let mut index = EntityIndex::new();
        let a = create(&mut index, vec![claim(AttributeKind::Person, "Ada", "o1")]);
        let b = create(&mut index, vec![claim(AttributeKind::Email, "ada@x.io", "o2")]);
        let c = create(&mut index, vec![claim(AttributeKind::Phone, "5550100", "o3")]);

        let survivor = index.merge(&[c, b, a], Utc::now()).unwrap();
        assert_eq!(survivor, a);
        assert_eq!(index.len(), 1);
        assert_eq!(index.canonical_id(c).unwrap(), a);
        assert_eq!(index.get(b).unwrap().id, a);
        assert_eq!(
            index.candidates([key(AttributeKind::Phone, "5550100")].iter()),
            BTreeSet::from([a])
        );
        assert_eq!(index.entity_for_observation(ObservationId::for_payload("o3")), Some(a));
        assert_eq!(index.get(a).unwrap().merged_from, vec![b, c]);
    }

    #[test]
    fn test_merge_repoints_only_absorbed_observations() {
        let mut index = EntityIndex::new();
        let a = create(&mut index, vec![claim(AttributeKind::Person, "Ada", "o1")]);
        let b = create(
            &mut index,
            vec![
                claim(AttributeKind::Email, "ada@x.io", "o2"),
                claim(AttributeKind::Phone, "5550100", "o3"),
            ],
        );
        let c = create(&mut index, vec![claim(AttributeKind::Person, "Bob", "o4")]);

        index.merge(&[a, b], Utc::now()).unwrap();
        for obs in ["o1", "o2", "o3"] {
            assert_eq!(index.entity_for_observation(ObservationId::for_payload(obs)), Some(a));
        }
        assert_eq!(index.entity_for_observation(ObservationId::for_payload("o4")), Some(c));

        let d = create(&mut index, vec![claim(AttributeKind::Email, "bob@x.io", "o4")]);
        let survivor = index.merge(&[d, c], Utc::now()).unwrap();
        assert_eq!(survivor, c);
        assert_eq!(index.entity_for_observation(ObservationId::for_payload("o4")), Some(c));
    }

    #[test]
    fn test_merge_lineage_is_flattened() {
        let mut index = EntityIndex::new();
        let a = create(&mut index, vec![claim(AttributeKind::Person, "Ada", "o1")]);
        let b = create(&mut index, vec![claim(AttributeKind::Person, "Bea", "o2")]);
        let c = create(&mut index, vec![claim(AttributeKind::Person, "Cy", "o3")]);

        index.merge(&[b, c], Utc::now()).unwrap();
        index.merge(&[a, b], Utc::now()).unwrap();
        assert_eq!(index.canonical_id(c).unwrap(), a);
        assert_eq!(index.get(a).unwrap().merged_from, vec![b, c]);
    }

    #[test]
    fn test_merge_unknown_id_leaves_index_untouched() {
        let mut index = EntityIndex::new();
        let a = create(&mut index, vec![claim(AttributeKind::Person, "Ada", "o1")]);
        let b = create(&mut index, vec![claim(AttributeKind::Person, "Bea", "o2")]);
        let err = index
            .merge(&[a, b, EntityId::from_raw(99)], Utc::now())
            .unwrap_err();
        assert!(matches!(err, StorageError::EntityNotFound(_)));
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_insert_rejects_reused_id() {
        let mut index = EntityIndex::new();
        let a = create(&mut index, vec![claim(AttributeKind::Person, "Ada", "o1")]);
        let b = create(&mut index, vec![claim(AttributeKind::Person, "Bea", "o2")]);
        index.merge(&[a, b], Utc::now()).unwrap();

        let stale = Entity::new(b, Vec::new(), Utc::now());
        assert!(matches!(index.insert_new(stale), Err(StorageError::DuplicateKey(_))));
    }

    #[test]
    fn test_serde_roundtrip_rebuilds_lookups() {
        let mut index = EntityIndex::new();
        let a = create(&mut index, vec![claim(AttributeKind::Email, "ada@x.io", "o1")]);
        let b = create(&mut index, vec![claim(AttributeKind::Person, "Ada", "o2")]);
        index.merge(&[a, b], Utc::now()).unwrap();

        let json = serde_json::to_string(&index).unwrap();
        let mut restored: EntityIndex = serde_json::from_str(&json).unwrap();
        restored.rebuild_lookups();

        assert_eq!(restored.canonical_id(b).unwrap(), a);
        assert_eq!(
            restored.candidates([key(AttributeKind::Person, "ada")].iter()),
            BTreeSet::from([a])
        );
        assert_eq!(restored.peek_next_id(), EntityId::from_raw(3));
        assert_eq!(restored.partition(), index.partition());
    }
}
