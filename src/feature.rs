//! Feature sets: per-observation attribute evidence.
//!
//! A feature set maps attribute kinds to one or more string values. During
//! enrichment it only ever grows; values are never replaced or removed.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::kind::AttributeKind;
use crate::observation::ObservationId;

/// Extracted attribute-kind → values evidence for one observation.
///
/// # Examples
///
/// ```
/// use kyrolink::{AttributeKind, FeatureSet};
///
/// let features = FeatureSet::new()
///     .with(AttributeKind::Organization, "Starbucks")
///     .with(AttributeKind::Location, "New York");
/// assert!(features.has_kind(&AttributeKind::Organization));
/// assert_eq!(features.len(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSet {
    /// The observation this evidence was extracted from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observation_id: Option<ObservationId>,

    attributes: BTreeMap<AttributeKind, BTreeSet<String>>,
}

impl FeatureSet {
    /// Creates an empty feature set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty feature set bound to an observation.
    #[must_use]
    pub fn for_observation(observation_id: ObservationId) -> Self {
        Self {
            observation_id: Some(observation_id),
            attributes: BTreeMap::new(),
        }
    }

    /// Builder-style [`insert`](Self::insert).
    #[must_use]
    pub fn with(mut self, kind: AttributeKind, value: impl Into<String>) -> Self {
        self.insert(kind, value);
        self
    }

    /// Adds a value. Blank values are ignored; surrounding whitespace is trimmed.
    ///
    /// Returns true if the value was not already present.
    pub fn insert(&mut self, kind: AttributeKind, value: impl Into<String>) -> bool {
        let value = value.into();
        let value = value.trim();
        if value.is_empty() {
            return false;
        }
        self.attributes
            .entry(kind)
            .or_default()
            .insert(value.to_string())
    }

    /// Merges another (partial) feature set into this one. Additive only.
    ///
    /// Returns the number of values that were new.
    pub fn absorb(&mut self, partial: &FeatureSet) -> usize {
        let mut added = 0;
        for (kind, value) in partial.pairs() {
            if self.insert(kind.clone(), value) {
                added += 1;
            }
        }
        added
    }

    /// Returns true if at least one value of `kind` is present.
    #[must_use]
    pub fn has_kind(&self, kind: &AttributeKind) -> bool {
        self.attributes.get(kind).is_some_and(|v| !v.is_empty())
    }

    /// Values for a kind, in lexical order.
    pub fn values(&self, kind: &AttributeKind) -> impl Iterator<Item = &str> {
        self.attributes
            .get(kind)
            .into_iter()
            .flat_map(|values| values.iter().map(String::as_str))
    }

    /// The first value for a kind, in lexical order.
    #[must_use]
    pub fn first(&self, kind: &AttributeKind) -> Option<&str> {
        self.values(kind).next()
    }

    /// Kinds present, in kind order.
    pub fn kinds(&self) -> impl Iterator<Item = &AttributeKind> {
        self.attributes.keys()
    }

    /// All (kind, value) pairs in deterministic order.
    pub fn pairs(&self) -> impl Iterator<Item = (&AttributeKind, &str)> {
        self.attributes
            .iter()
            .flat_map(|(kind, values)| values.iter().map(move |v| (kind, v.as_str())))
    }

    /// Number of (kind, value) pairs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.attributes.values().map(BTreeSet::len).sum()
    }

    /// Returns true if no values are present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
