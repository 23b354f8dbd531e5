//! Ready-made [`Enricher`] implementations.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError};

use crate::error::EnrichmentError;
use crate::feature::FeatureSet;
use crate::kind::AttributeKind;

use super::Enricher;

/// Enricher backed by a closure.
pub struct FnEnricher<F> {
    name: String,
    func: F,
}

impl<F> FnEnricher<F>
where
    F: Fn(&FeatureSet) -> Result<FeatureSet, EnrichmentError> + Send + Sync,
{
    /// Wraps `func` under `name`.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> fmt::Debug for FnEnricher<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnEnricher").field("name", &self.name).finish()
    }
}

impl<F> Enricher for FnEnricher<F>
where
    F: Fn(&FeatureSet) -> Result<FeatureSet, EnrichmentError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn enrich(&self, features: &FeatureSet) -> Result<FeatureSet, EnrichmentError> {
        (self.func)(features)
    }
}

/// Deterministic table lookup from key-kind values to an output value.
///
/// Keys are compared by their normalized match keys, so `"New York"` and
/// `"new  york"` hit the same row. With several values per key kind every
/// combination is looked up.
///
/// ```
/// use kyrolink::enrich::{Enricher, LookupEnricher};
/// use kyrolink::{AttributeKind, FeatureSet};
///
/// let places = LookupEnricher::new(
///     "places",
///     [AttributeKind::Organization, AttributeKind::Location],
///     AttributeKind::custom("MAPS_PLACE_ID"),
/// )
/// .with_entry(&["Starbucks", "New York"], "X1");
///
/// let features = FeatureSet::new()
///     .with(AttributeKind::Organization, "starbucks")
///     .with(AttributeKind::Location, "New  York");
/// let added = places.enrich(&features).unwrap();
/// assert_eq!(added.first(&AttributeKind::custom("MAPS_PLACE_ID")), Some("X1"));
/// ```
#[derive(Debug, Clone)]
pub struct LookupEnricher {
    name: String,
    key_kinds: Vec<AttributeKind>,
    output: AttributeKind,
    table: HashMap<Vec<String>, String>,
}

impl LookupEnricher {
    /// Creates an empty lookup keyed by `key_kinds`, producing `output`.
    pub fn new(
        name: impl Into<String>,
        key_kinds: impl IntoIterator<Item = AttributeKind>,
        output: AttributeKind,
    ) -> Self {
        Self {
            name: name.into(),
            key_kinds: key_kinds.into_iter().collect(),
            output,
            table: HashMap::new(),
        }
    }

    /// Key kinds, which double as the registration triggers.
    #[must_use]
    pub fn key_kinds(&self) -> &[AttributeKind] {
        &self.key_kinds
    }

    /// Adds a row. `key` holds one raw value per key kind, in order.
    ///
    /// Rows with the wrong arity or an unmatchable value are ignored.
    pub fn insert(&mut self, key: &[&str], value: impl Into<String>) -> bool {
        let Some(normalized) = self.normalize(key.iter().copied()) else {
            return false;
        };
        self.table.insert(normalized, value.into());
        true
    }

    /// Builder-style [`insert`](Self::insert).
    #[must_use]
    pub fn with_entry(mut self, key: &[&str], value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    fn normalize<'a>(&self, values: impl Iterator<Item = &'a str>) -> Option<Vec<String>> {
        let normalized: Vec<String> = self
            .key_kinds
            .iter()
            .zip(values)
            .map(|(kind, value)| kind.match_key(value))
            .collect::<Option<_>>()?;
        (normalized.len() == self.key_kinds.len()).then_some(normalized)
    }

    fn combinations(&self, features: &FeatureSet) -> Vec<Vec<String>> {
        let mut combos: Vec<Vec<String>> = vec![Vec::new()];
        for kind in &self.key_kinds {
            let values: BTreeSet<String> = features
                .values(kind)
                .filter_map(|v| kind.match_key(v))
                .collect();
            combos = combos
                .into_iter()
                .flat_map(|prefix| {
                    values.iter().map(move |v| {
                        let mut next = prefix.clone();
                        next.push(v.clone());
                        next
                    })
                })
                .collect();
        }
        combos
    }
}

impl Enricher for LookupEnricher {
    fn name(&self) -> &str {
        &self.name
    }

    fn enrich(&self, features: &FeatureSet) -> Result<FeatureSet, EnrichmentError> {
        let mut out = FeatureSet::new();
        if self.key_kinds.is_empty() {
            return Ok(out);
        }
        for key in self.combinations(features) {
            if let Some(value) = self.table.get(&key) {
                out.insert(self.output.clone(), value.clone());
            }
        }
        Ok(out)
    }
}

/// Bounds the wait on another enricher.
///
/// The inner enricher runs on a worker thread. If it does not answer within
/// the deadline the call fails with [`EnrichmentError::Timeout`], which the
/// registry treats as no enrichment. The worker is not cancelled; a late
/// answer is dropped.
pub struct DeadlineEnricher {
    inner: Arc<dyn Enricher>,
    timeout: Duration,
}

impl DeadlineEnricher {
    /// Wraps `inner` with a deadline.
    pub fn new(inner: Arc<dyn Enricher>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    /// The configured deadline.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl fmt::Debug for DeadlineEnricher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeadlineEnricher")
            .field("inner", &self.inner.name())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Enricher for DeadlineEnricher {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn enrich(&self, features: &FeatureSet) -> Result<FeatureSet, EnrichmentError> {
        let (tx, rx) = bounded(1);
        let inner = Arc::clone(&self.inner);
        let input = features.clone();

        thread::Builder::new()
            .name(format!("kyrolink-enrich-{}", self.inner.name()))
            .spawn(move || {
                let _ = tx.send(inner.enrich(&input));
            })
            .map_err(|e| EnrichmentError::failed(self.name(), format!("failed to spawn worker: {e}")))?;

        rx.recv_timeout(self.timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => EnrichmentError::Timeout {
                enricher: self.name().to_string(),
                duration_ms: self.timeout.as_millis().min(u128::from(u64::MAX)) as u64,
            },
            RecvTimeoutError::Disconnected => EnrichmentError::Panicked {
                enricher: self.name().to_string(),
            },
        })?
    }
}
