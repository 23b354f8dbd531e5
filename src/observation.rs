//! Observations: immutable records of ingested payloads.
//!
//! An observation is identified by the fingerprint of its normalized payload.
//! The observation id is derived from that fingerprint, so the same content
//! always maps to the same id no matter when or from where it arrives.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

/// Namespace for deriving observation ids from fingerprints.
const OBSERVATION_NAMESPACE: Uuid = Uuid::from_u128(0x6b79_726f_6c69_6e6b_0000_0000_0000_0001);

/// Identifier of an ingested observation.
///
/// # Examples
///
/// ```
/// use kyrolink::{Fingerprint, ObservationId};
///
/// let fp = Fingerprint::of_payload("Dinner at Starbucks NYC");
/// assert_eq!(ObservationId::from_fingerprint(&fp), ObservationId::from_fingerprint(&fp));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObservationId(Uuid);

impl ObservationId {
    /// Derives the id for a fingerprint (UUID v5).
    #[must_use]
    pub fn from_fingerprint(fingerprint: &Fingerprint) -> Self {
        Self(Uuid::new_v5(&OBSERVATION_NAMESPACE, fingerprint.as_bytes()))
    }

    /// Shorthand for the id of a raw payload.
    #[must_use]
    pub fn for_payload(payload: &str) -> Self {
        Self::from_fingerprint(&Fingerprint::of_payload(payload))
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for ObservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of the source an observation came from (a file, a feed, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(String);

impl SourceId {
    /// Creates a source id.
    ///
    /// # Errors
    /// Returns [`ValidationError::EmptySourceId`] for blank ids.
    pub fn new(id: impl Into<String>) -> Result<Self, ValidationError> {
        let id = id.into();
        let trimmed = id.trim();
        if trimmed.is_empty() {
            return Err(ValidationError::EmptySourceId);
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Content fingerprint: BLAKE3 of the normalized payload, hex encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprints a raw payload after normalization.
    #[must_use]
    pub fn of_payload(payload: &str) -> Self {
        let normalized = normalize_payload(payload);
        Self(blake3::hash(normalized.as_bytes()).to_hex().to_string())
    }

    /// Hex representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Normalizes a payload before fingerprinting.
///
/// Line endings, surrounding whitespace and runs of inner whitespace do not
/// change the fingerprint. Case does.
#[must_use]
pub fn normalize_payload(payload: &str) -> String {
    payload
        .lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// An ingested observation. Never mutated once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    /// Id derived from the fingerprint.
    pub id: ObservationId,
    /// Where the payload came from (first source wins for duplicates).
    pub source_id: SourceId,
    /// The normalized payload.
    pub payload: String,
    /// Fingerprint of the normalized payload.
    pub fingerprint: Fingerprint,
    /// When the observation entered the ledger.
    pub ingested_at: DateTime<Utc>,
}

impl Observation {
    /// Builds an observation for a payload.
    #[must_use]
    pub fn new(source_id: SourceId, payload: &str) -> Self {
        let fingerprint = Fingerprint::of_payload(payload);
        Self {
            id: ObservationId::from_fingerprint(&fingerprint),
            source_id,
            payload: normalize_payload(payload),
            fingerprint,
            ingested_at: Utc::now(),
        }
    }
}
