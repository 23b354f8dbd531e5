//! Entropy weights per attribute kind.
//!
//! A weight in [0, 1] says how strongly a shared value implies shared
//! identity. Unique identifiers (email, place ids) weigh close to 1; common
//! values (city names) weigh little. Kinds without an entry weigh 0.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::kind::AttributeKind;

/// Kind token of the place identifier produced by place-lookup enrichment.
pub const PLACE_ID_KIND: &str = "MAPS_PLACE_ID";

/// Mapping from attribute kind to weight.
///
/// # Examples
///
/// ```
/// use kyrolink::{AttributeKind, WeightTable};
///
/// let table = WeightTable::default();
/// assert_eq!(table.weight_of(&AttributeKind::Email), 0.9);
/// assert_eq!(table.weight_of(&AttributeKind::custom("SHOE_SIZE")), 0.0);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WeightTable {
    weights: BTreeMap<AttributeKind, f64>,
}

impl Default for WeightTable {
    fn default() -> Self {
        let weights = BTreeMap::from([
            (AttributeKind::Person, 0.4),
            (AttributeKind::Organization, 0.5),
            (AttributeKind::Location, 0.3),
            (AttributeKind::Email, 0.9),
            (AttributeKind::Phone, 0.8),
            (AttributeKind::custom(PLACE_ID_KIND), 1.0),
        ]);
        Self { weights }
    }
}

impl WeightTable {
    /// A table with no entries: every kind weighs 0.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            weights: BTreeMap::new(),
        }
    }

    /// Weight of a kind, 0 if unknown.
    #[must_use]
    pub fn weight_of(&self, kind: &AttributeKind) -> f64 {
        self.weights.get(kind).copied().unwrap_or(0.0)
    }

    /// Returns true if the kind has an explicit entry.
    #[must_use]
    pub fn contains(&self, kind: &AttributeKind) -> bool {
        self.weights.contains_key(kind)
    }

    /// Sets a weight.
    ///
    /// # Errors
    /// Returns [`ValidationError::WeightOutOfRange`] unless `0 <= weight <= 1`.
    pub fn set(&mut self, kind: AttributeKind, weight: f64) -> Result<(), ValidationError> {
        check_weight(&kind, weight)?;
        self.weights.insert(kind, weight);
        Ok(())
    }

    /// Builder-style [`set`](Self::set).
    ///
    /// # Errors
    /// Same as [`set`](Self::set).
    pub fn with(mut self, kind: AttributeKind, weight: f64) -> Result<Self, ValidationError> {
        self.set(kind, weight)?;
        Ok(self)
    }

    /// Entries in kind order.
    pub fn iter(&self) -> impl Iterator<Item = (&AttributeKind, f64)> {
        self.weights.iter().map(|(k, w)| (k, *w))
    }

    /// Checks every entry is within [0, 1].
    ///
    /// # Errors
    /// Returns the first out-of-range entry.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.weights.iter().try_for_each(|(k, w)| check_weight(k, *w))
    }

    /// Loads a table from a JSON object of `{"KIND": weight}`.
    ///
    /// # Errors
    /// Returns [`ValidationError::InvalidConfig`] for unreadable or malformed
    /// files and range errors for bad weights.
    pub fn load(path: &Path) -> Result<Self, ValidationError> {
        let raw = fs::read_to_string(path).map_err(|e| ValidationError::InvalidConfig {
            reason: format!("cannot read weight table {}: {e}", path.display()),
        })?;
        let table: Self = serde_json::from_str(&raw).map_err(|e| ValidationError::InvalidConfig {
            reason: format!("malformed weight table {}: {e}", path.display()),
        })?;
        table.validate()?;
        Ok(table)
    }
}

fn check_weight(kind: &AttributeKind, weight: f64) -> Result<(), ValidationError> {
    if weight.is_finite() && (0.0..=1.0).contains(&weight) {
        Ok(())
    } else {
        Err(ValidationError::WeightOutOfRange {
            kind: kind.to_string(),
            weight,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let table = WeightTable::default();
        assert_eq!(table.weight_of(&AttributeKind::Person), 0.4);
        assert_eq!(table.weight_of(&AttributeKind::Organization), 0.5);
        assert_eq!(table.weight_of(&AttributeKind::Location), 0.3);
        assert_eq!(table.weight_of(&AttributeKind::Phone), 0.8);
        assert_eq!(table.weight_of(&AttributeKind::custom("maps_place_id")), 1.0);
    }

    #[test]
    fn test_unknown_kind_weighs_zero() {
        let table = WeightTable::empty();
        assert_eq!(table.weight_of(&AttributeKind::Email), 0.0);
        assert!(!table.contains(&AttributeKind::Email));
    }

    #[test]
    fn test_set_rejects_out_of_range() {
        let mut table = WeightTable::default();
        assert!(table.set(AttributeKind::Email, 1.2).is_err());
        assert!(table.set(AttributeKind::Email, -0.1).is_err());
        assert!(table.set(AttributeKind::Email, f64::NAN).is_err());
        table.set(AttributeKind::Email, 0.0).unwrap();
        assert_eq!(table.weight_of(&AttributeKind::Email), 0.0);
    }

    #[test]
    fn test_json_shape() {
        let table = WeightTable::empty().with(AttributeKind::Phone, 0.75).unwrap();
        let json = serde_json::to_string(&table).unwrap();
        assert_eq!(json, r#"{"PHONE":0.75}"#);
    }

    #[test]
    fn test_load_validates() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.json");
        fs::write(&good, r#"{"EMAIL": 0.95, "vin": 1.0}"#).unwrap();
        let table = WeightTable::load(&good).unwrap();
        assert_eq!(table.weight_of(&AttributeKind::custom("VIN")), 1.0);

        let bad = dir.path().join("bad.json");
        fs::write(&bad, r#"{"EMAIL": 3.0}"#).unwrap();
        assert!(matches!(
            WeightTable::load(&bad),
            Err(ValidationError::WeightOutOfRange { .. })
        ));

        let missing = dir.path().join("missing.json");
        assert!(matches!(
            WeightTable::load(&missing),
            Err(ValidationError::InvalidConfig { .. })
        ));
    }
}
