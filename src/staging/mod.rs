//! Staging layer.
//!
//! This module groups staging entities, the staging store, and the
//! per-ingestion relation and ledger tables.

pub mod entity;
pub mod relations;
pub mod store;

pub use entity::StagingEntity;
pub use relations::{IngestionEntry, IngestionLedger, RelationStore, StagedRelation};
pub use store::{Assignment, StagingStore};
