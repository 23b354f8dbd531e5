//! Evidence scoring.
//!
//! A score is the sum of the weights of the kinds on which two claim sets
//! share at least one normalized value. Each kind counts once, however many
//! values match, and scores are never normalized: more shared evidence can
//! only raise a score and unrelated attributes can never lower it.

use std::collections::{BTreeMap, BTreeSet};

use crate::feature::FeatureSet;
use crate::index::MatchKey;
use crate::kind::AttributeKind;
use crate::weights::WeightTable;

/// Normalized values grouped by kind.
pub type KeyMap = BTreeMap<AttributeKind, BTreeSet<String>>;

/// Tolerance for comparing a score against the threshold.
pub const SCORE_EPSILON: f64 = 1e-9;

/// Normalized, matchable values of a feature set.
pub fn keys_of(features: &FeatureSet) -> KeyMap {
    let mut wanted = KeyMap::new();
    for (kind, value) in features.pairs() {
        if let Some(key) = kind.match_key(value) {
            wanted.entry(kind.clone()).or_default().insert(key);
        }
    }
    wanted
}

/// Flattens a key map into index lookup keys.
pub fn lookup_keys(wanted: &KeyMap) -> Vec<MatchKey> {
    wanted
        .iter()
        .flat_map(|(kind, keys)| keys.iter().map(move |k| (kind.clone(), k.clone())))
        .collect()
}

/// Score of `wanted` against `claimed`. Summed in kind order.
pub fn score(weights: &WeightTable, wanted: &KeyMap, claimed: &KeyMap) -> f64 {
    wanted
        .iter()
        .filter(|(kind, values)| {
            claimed
                .get(*kind)
                .is_some_and(|held| !held.is_disjoint(values))
        })
        .map(|(kind, _)| weights.weight_of(kind))
        .sum()
}

/// Returns true if `score` reaches `threshold`.
pub fn meets(score: f64, threshold: f64) -> bool {
    score + SCORE_EPSILON >= threshold
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_map(pairs: &[(AttributeKind, &str)]) -> KeyMap {
        let mut features = FeatureSet::new();
        for (kind, value) in pairs {
            features.insert(kind.clone(), *value);
        }
        keys_of(&features)
    }

    #[test]
    fn test_each_kind_counts_once() {
        let weights = WeightTable::default();
        let a = key_map(&[
            (AttributeKind::Email, "a@x.io"),
            (AttributeKind::Email, "b@x.io"),
        ]);
        let b = key_map(&[
            (AttributeKind::Email, "A@X.io"),
            (AttributeKind::Email, "b@x.io"),
        ]);
        assert!((score(&weights, &a, &b) - 0.9).abs() < SCORE_EPSILON);
    }

    #[test]
    fn test_unknown_kinds_add_nothing() {
        let weights = WeightTable::default();
        let a = key_map(&[
            (AttributeKind::Person, "Ada"),
            (AttributeKind::custom("SHOE_SIZE"), "38"),
        ]);
        let b = key_map(&[
            (AttributeKind::Person, "ada"),
            (AttributeKind::custom("SHOE_SIZE"), "38"),
        ]);
        assert!((score(&weights, &a, &b) - 0.4).abs() < SCORE_EPSILON);
    }

    #[test]
    fn test_float_sums_meet_threshold() {
        let weights = WeightTable::default();
        let a = key_map(&[
            (AttributeKind::Person, "Ada"),
            (AttributeKind::Organization, "Acme"),
        ]);
        let s = score(&weights, &a, &a);
        assert!(meets(s, 0.9));
        assert!(!meets(0.8, 0.9));
    }

    #[test]
    fn test_lookup_keys_are_normalized() {
        let keys = lookup_keys(&key_map(&[(AttributeKind::Phone, "+1 (555) 010-0")]));
        assert_eq!(keys, vec![(AttributeKind::Phone, "+15550100".to_string())]);
    }
}
