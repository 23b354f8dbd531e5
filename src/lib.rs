//! # KyroLink - Incremental Entity Resolution
//!
//! KyroLink decides, for every incoming observation about a person,
//! organization or place, whether it describes an entity it already knows
//! or a new one. Resolving the same observations in any order converges to
//! the same grouping.
//!
//! ## Core Concepts
//!
//! - **Observation**: An immutable ingested record, keyed by content fingerprint
//! - **Feature set**: Attribute-kind → value evidence extracted from one observation
//! - **Entity**: A resolved identity holding weighted claims with provenance
//! - **Weight table**: How strongly a shared value of each kind implies shared identity
//! - **Enricher**: A lookup that adds higher-confidence attributes before resolution
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use kyrolink::enrich::LookupEnricher;
//! use kyrolink::{AttributeKind, FeatureSet, LinkConfig, Linker, PLACE_ID_KIND};
//!
//! let mut linker = Linker::in_memory(&LinkConfig::default())?;
//! let places = LookupEnricher::new(
//!     "places",
//!     [AttributeKind::Organization, AttributeKind::Location],
//!     AttributeKind::custom(PLACE_ID_KIND),
//! )
//! .with_entry(&["Starbucks", "New York"], "X1")
//! .with_entry(&["S.Bucks", "NYC"], "X1");
//! linker.register_enricher(
//!     [AttributeKind::Organization, AttributeKind::Location],
//!     Arc::new(places),
//! );
//!
//! let first = linker.link(
//!     "notes.txt",
//!     "Coffee at Starbucks, New York",
//!     FeatureSet::new()
//!         .with(AttributeKind::Organization, "Starbucks")
//!         .with(AttributeKind::Location, "New York"),
//! )?;
//! let second = linker.link(
//!     "notes.txt",
//!     "S.Bucks NYC with Ada",
//!     FeatureSet::new()
//!         .with(AttributeKind::Organization, "S.Bucks")
//!         .with(AttributeKind::Location, "NYC"),
//! )?;
//! assert_eq!(first.entity_id, second.entity_id);
//! # Ok::<(), kyrolink::LinkError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Vocabulary and data
pub mod entity;
pub mod error;
pub mod feature;
pub mod kind;
pub mod observation;
pub mod weights;

// Ledger, index and storage
pub mod index;
pub mod ledger;
pub mod storage;

// Resolution
pub mod config;
pub mod engine;
pub mod enrich;
pub mod pipeline;

// Re-export primary types at crate root for convenience
pub use config::LinkConfig;
pub use engine::{Decision, Resolution, ResolutionEngine, MERGE_THRESHOLD};
pub use enrich::{Enricher, EnrichmentRegistry, EnrichmentReport};
pub use entity::{Claim, Entity, EntityId};
pub use error::{EnrichmentError, LinkError, LinkResult, ValidationError};
pub use feature::FeatureSet;
pub use index::{EntityIndex, Partition};
pub use kind::AttributeKind;
pub use ledger::{Ingested, ObservationLedger};
pub use observation::{Fingerprint, Observation, ObservationId, SourceId};
pub use pipeline::{LinkOutcome, Linker};
pub use storage::{EntityStore, ObservationStore, StorageError};
pub use weights::{WeightTable, PLACE_ID_KIND};
