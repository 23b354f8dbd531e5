//! Storage layer for KyroLink.
//!
//! Storage contracts live in `traits`. The in-memory backend is always
//! available; the durable backend is behind the `persistent` feature.

mod memory;
mod traits;

#[cfg(feature = "persistent")]
pub mod persistent;

pub use memory::{InMemoryEntityStore, InMemoryObservationStore, InMemoryStores};
pub use traits::{EntityStore, ObservationStore, StorageError};

#[cfg(feature = "persistent")]
pub use persistent::{open_database, PersistentConfig, PersistentStores};
