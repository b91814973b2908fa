//! The shared partitioned state, bundled.

use crate::staging::{IngestionLedger, RelationStore, StagingStore};
use crate::tracker::DocumentTracker;

/// Every partitioned map the resolver and the scanner share.
///
/// Cloning is cheap: each field is a handle onto the same underlying store.
#[derive(Debug, Clone)]
pub struct Stores {
    pub staging: StagingStore,
    pub tracker: DocumentTracker,
    pub relations: RelationStore,
    pub ledger: IngestionLedger,
    partition_count: usize,
}

impl Stores {
    /// Bundle existing stores. All of them must use `partition_count` partitions.
    #[must_use]
    pub fn new(
        staging: StagingStore,
        tracker: DocumentTracker,
        relations: RelationStore,
        ledger: IngestionLedger,
        partition_count: usize,
    ) -> Self {
        Self {
            staging,
            tracker,
            relations,
            ledger,
            partition_count,
        }
    }

    /// In-memory stores with `partition_count` partitions each.
    #[must_use]
    pub fn in_memory(partition_count: usize) -> Self {
        let partition_count = partition_count.max(1);
        Self::new(
            StagingStore::in_memory(partition_count),
            DocumentTracker::in_memory(partition_count),
            RelationStore::in_memory(partition_count),
            IngestionLedger::in_memory(partition_count),
            partition_count,
        )
    }

    #[must_use]
    pub const fn partition_count(&self) -> usize {
        self.partition_count
    }
}
