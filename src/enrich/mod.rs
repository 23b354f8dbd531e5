//! Enrichment registry.
//!
//! Enrichers turn low-confidence attributes into higher-confidence ones, for
//! example an (organization, location) pair into a place identifier. Each is
//! registered with the set of kinds it needs; the registry only calls those
//! whose whole trigger set is present, so a phone-only feature set never
//! reaches a place lookup.
//!
//! Enrichment is advisory. Errors and panics are logged and treated as "no
//! enrichment produced"; they never reach resolution.

mod adapters;

pub use adapters::{DeadlineEnricher, FnEnricher, LookupEnricher};

use std::collections::BTreeSet;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::error::EnrichmentError;
use crate::feature::FeatureSet;
use crate::kind::AttributeKind;

/// A pluggable enrichment provider.
///
/// Implementations must be idempotent. They receive the feature set by
/// shared reference and return only the attributes they add; the caller
/// merges them in.
pub trait Enricher: Send + Sync {
    /// Name used in logs and reports.
    fn name(&self) -> &str;

    /// Computes additional attributes for `features`.
    ///
    /// # Errors
    /// Any [`EnrichmentError`]; the registry absorbs it.
    fn enrich(&self, features: &FeatureSet) -> Result<FeatureSet, EnrichmentError>;
}

#[derive(Clone)]
struct Registration {
    triggers: BTreeSet<AttributeKind>,
    enricher: Arc<dyn Enricher>,
}

/// Enrichers keyed by trigger-kind sets, in registration order.
#[derive(Clone, Default)]
pub struct EnrichmentRegistry {
    entries: Vec<Registration>,
}

impl fmt::Debug for EnrichmentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|r| r.enricher.name()))
            .finish()
    }
}

/// What [`EnrichmentRegistry::apply`] did.
#[derive(Debug, Default)]
pub struct EnrichmentReport {
    /// Names of the enrichers that were invoked, in order.
    pub invoked: Vec<String>,
    /// Registered enrichers whose triggers were not all present.
    pub skipped: usize,
    /// Attribute values added across all enrichers.
    pub attributes_added: usize,
    /// Errors absorbed at the registry boundary.
    pub failures: Vec<EnrichmentError>,
}

impl EnrichmentRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an enricher for a trigger-kind set.
    ///
    /// An empty trigger set applies to every feature set.
    pub fn register(
        &mut self,
        triggers: impl IntoIterator<Item = AttributeKind>,
        enricher: Arc<dyn Enricher>,
    ) -> &mut Self {
        let triggers: BTreeSet<AttributeKind> = triggers.into_iter().collect();
        tracing::debug!(
            enricher = enricher.name(),
            triggers = ?triggers.iter().map(AttributeKind::as_str).collect::<Vec<_>>(),
            "enricher registered"
        );
        self.entries.push(Registration { triggers, enricher });
        self
    }

    /// Number of registered enrichers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Enrichers whose full trigger set is present in `features`, in
    /// registration order.
    #[must_use]
    pub fn applicable_for(&self, features: &FeatureSet) -> Vec<Arc<dyn Enricher>> {
        self.entries
            .iter()
            .filter(|r| r.triggers.iter().all(|k| features.has_kind(k)))
            .map(|r| Arc::clone(&r.enricher))
            .collect()
    }

    /// Runs the applicable enrichers and merges their output into `features`.
    ///
    /// Applicability is decided once, from the input as given. Each enricher
    /// then sees the attributes added by the ones before it.
    pub fn apply(&self, features: &mut FeatureSet) -> EnrichmentReport {
        let applicable = self.applicable_for(features);
        let mut report = EnrichmentReport {
            skipped: self.entries.len() - applicable.len(),
            ..EnrichmentReport::default()
        };

        for enricher in applicable {
            let name = enricher.name().to_string();
            report.invoked.push(name.clone());

            let snapshot: &FeatureSet = features;
            let outcome = catch_unwind(AssertUnwindSafe(|| enricher.enrich(snapshot)))
                .unwrap_or_else(|_| Err(EnrichmentError::Panicked { enricher: name.clone() }));

            match outcome {
                Ok(partial) => {
                    let added = features.absorb(&partial);
                    report.attributes_added += added;
                    tracing::debug!(enricher = %name, added, "enrichment applied");
                }
                Err(e) => {
                    tracing::warn!(enricher = %name, error = %e, "enrichment failed; continuing without it");
                    report.failures.push(e);
                }
            }
        }
        report
    }
}
