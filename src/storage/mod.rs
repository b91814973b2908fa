//! Partition-aware storage.
//!
//! The trait is the seam; the in-memory backend is the reference
//! implementation used embedded and in tests.

mod memory;
mod partition;
mod traits;

pub use memory::{InMemoryPartitionedStore, DEFAULT_PARTITION_COUNT};
pub use partition::{NodeId, PartitionTable};
pub use traits::{PartitionedStore, StorageError};
