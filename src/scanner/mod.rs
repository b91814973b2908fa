//! Completion scanner.
//!
//! A pass walks the documents tracked in the partitions it owns, commits the
//! ones whose entities are all indexable, commits ready staged relations, and
//! emits what it committed as one batch. [`ScanService`] runs passes
//! periodically, one thread per owned node.

mod scan;
mod service;

pub use scan::{CompletionScanner, ScanReport, RELATED_TO};
pub use service::{ScanService, ScanServiceConfig, ScanTrigger};
