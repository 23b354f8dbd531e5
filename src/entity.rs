//! Resolved entities and the claims they aggregate.
//!
//! An entity is a resolved identity: a stable id plus every (kind, value)
//! claim believed to describe the same real-world person, organization or
//! place. Entities never point back at each other; merge lineage is kept as
//! plain ids.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::kind::AttributeKind;
use crate::observation::ObservationId;

/// Stable entity identifier.
///
/// Ids are allocated in increasing order, so the lowest id of a group is the
/// oldest entity. Merges keep the lowest id.
///
/// # Examples
///
/// ```
/// use kyrolink::EntityId;
///
/// assert!(EntityId::from_raw(1) < EntityId::from_raw(2));
/// assert_eq!(EntityId::from_raw(7).to_string(), "ent-7");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(u64);

impl EntityId {
    /// Wraps a raw id.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw id.
    #[must_use]
    pub const fn as_raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ent-{}", self.0)
    }
}

/// An (attribute kind, value) pair attributed to an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    /// Attribute kind.
    pub kind: AttributeKind,
    /// Raw value as observed.
    pub value: String,
    /// Weight of the kind when the claim was attached.
    pub weight: f64,
    /// Observation the claim was extracted from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<ObservationId>,
    /// When the claim was attached.
    pub asserted_at: DateTime<Utc>,
}

impl Claim {
    /// Creates a claim stamped with the current time.
    #[must_use]
    pub fn new(
        kind: AttributeKind,
        value: impl Into<String>,
        weight: f64,
        provenance: Option<ObservationId>,
    ) -> Self {
        Self {
            kind,
            value: value.into(),
            weight,
            provenance,
            asserted_at: Utc::now(),
        }
    }

    /// Index key of this claim, `None` if the value normalizes to nothing.
    #[must_use]
    pub fn match_key(&self) -> Option<(AttributeKind, String)> {
        self.kind
            .match_key(&self.value)
            .map(|key| (self.kind.clone(), key))
    }

    /// Two claims with the same kind, normalized value and provenance are the same claim.
    #[must_use]
    pub fn same_as(&self, other: &Claim) -> bool {
        self.kind == other.kind
            && self.provenance == other.provenance
            && self.match_key() == other.match_key()
    }
}

/// A resolved identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    /// Stable id.
    pub id: EntityId,
    /// Claims, in attach order.
    pub claims: Vec<Claim>,
    /// Ids of entities absorbed into this one.
    #[serde(default)]
    pub merged_from: Vec<EntityId>,
    /// When the entity was created.
    pub created_at: DateTime<Utc>,
    /// When the entity last changed.
    pub updated_at: DateTime<Utc>,
    /// Incremented on every attach or merge.
    pub version: u64,
}

impl Entity {
    /// Creates an entity holding the given claims (duplicates collapsed).
    #[must_use]
    pub fn new(id: EntityId, claims: Vec<Claim>, now: DateTime<Utc>) -> Self {
        let mut entity = Self {
            id,
            claims: Vec::with_capacity(claims.len()),
            merged_from: Vec::new(),
            created_at: now,
            updated_at: now,
            version: 1,
        };
        for claim in claims {
            entity.push_claim(claim);
        }
        entity
    }

    /// Adds a claim unless an identical one is already held.
    ///
    /// Returns true if the claim was added.
    pub fn push_claim(&mut self, claim: Claim) -> bool {
        if claim.match_key().is_none() || self.claims.iter().any(|c| c.same_as(&claim)) {
            return false;
        }
        self.claims.push(claim);
        true
    }

    /// Bumps version and update time.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = self.updated_at.max(now);
        self.version = self.version.saturating_add(1);
    }

    /// Distinct match keys grouped by kind.
    #[must_use]
    pub fn match_keys(&self) -> BTreeMap<AttributeKind, BTreeSet<String>> {
        let mut out: BTreeMap<AttributeKind, BTreeSet<String>> = BTreeMap::new();
        for (kind, key) in self.claims.iter().filter_map(Claim::match_key) {
            out.entry(kind).or_default().insert(key);
        }
        out
    }

    /// Observations backing this entity.
    #[must_use]
    pub fn observations(&self) -> BTreeSet<ObservationId> {
        self.claims.iter().filter_map(|c| c.provenance).collect()
    }

    /// Returns true if any claim has the given kind.
    #[must_use]
    pub fn has_kind(&self, kind: &AttributeKind) -> bool {
        self.claims.iter().any(|c| &c.kind == kind)
    }
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.version == other.version
    }
}
