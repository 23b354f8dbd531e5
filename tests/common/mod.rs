//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};

use kyrolink::storage::InMemoryEntityStore;
use kyrolink::{
    AttributeKind, Enricher, EnrichmentError, FeatureSet, ObservationId, Partition,
    ResolutionEngine,
};

static TRACING: Once = Once::new();

/// Installs a test-writer subscriber once per binary. `RUST_LOG` overrides
/// the default `warn` filter.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

pub fn engine() -> ResolutionEngine {
    ResolutionEngine::with_defaults(Arc::new(InMemoryEntityStore::new()))
}

/// A feature set bound to the observation with payload `tag`.
pub fn features(tag: &str, pairs: &[(AttributeKind, &str)]) -> FeatureSet {
    let mut f = FeatureSet::for_observation(ObservationId::for_payload(tag));
    for (kind, value) in pairs {
        f.insert(kind.clone(), *value);
    }
    f
}

/// Groups of observations, without entity ids.
pub fn groups(partition: Partition) -> BTreeSet<BTreeSet<ObservationId>> {
    partition.into_values().collect()
}

pub fn group_of(tags: &[&str]) -> BTreeSet<ObservationId> {
    tags.iter().map(|t| ObservationId::for_payload(t)).collect()
}

/// Counts invocations and adds one fixed attribute.
pub struct CountingEnricher {
    name: String,
    calls: AtomicUsize,
    adds: (AttributeKind, String),
}

impl CountingEnricher {
    pub fn new(name: &str, kind: AttributeKind, value: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            calls: AtomicUsize::new(0),
            adds: (kind, value.to_string()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Enricher for CountingEnricher {
    fn name(&self) -> &str {
        &self.name
    }

    fn enrich(&self, _features: &FeatureSet) -> Result<FeatureSet, EnrichmentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(FeatureSet::new().with(self.adds.0.clone(), self.adds.1.clone()))
    }
}

/// Small deterministic generator for sampled permutations.
pub struct XorShift(u64);

impl XorShift {
    pub fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }

    pub fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        for i in (1..items.len()).rev() {
            let j = (self.next() % (i as u64 + 1)) as usize;
            items.swap(i, j);
        }
    }
}
