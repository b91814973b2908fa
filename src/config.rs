//! Entity manager configuration.
//!
//! Defaults suit a single process. A JSON file can override any subset of
//! fields, and `ENTITY_MANAGER_*` environment variables override the file.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ManagerResult, ValidationError};
use crate::persist::PersistenceConfig;
use crate::scanner::ScanServiceConfig;
use crate::storage::{NodeId, PartitionTable, DEFAULT_PARTITION_COUNT};

/// Prefix of the environment variables read by [`EntityManagerConfig::with_env_overrides`].
pub const ENV_PREFIX: &str = "ENTITY_MANAGER_";

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityManagerConfig {
    /// Partitions per store.
    pub partition_count: usize,
    /// Nodes the partitions are spread across.
    pub node_count: usize,
    /// Node this process scans for. `None` scans every node.
    pub local_node: Option<usize>,
    /// Milliseconds between scan passes when nothing nudges the scanner.
    pub scan_interval_ms: u64,
    /// Buffered scanner nudges per scan thread.
    pub nudge_capacity: usize,
    pub persistence_workers: usize,
    pub persistence_queue_capacity: usize,
    /// Attempts per persistence job for retryable failures.
    pub persistence_attempts: usize,
    /// Keep staging records after their documents commit.
    pub retain_staging: bool,
    /// Default `tracing` filter when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for EntityManagerConfig {
    fn default() -> Self {
        Self {
            partition_count: DEFAULT_PARTITION_COUNT,
            node_count: 1,
            local_node: None,
            scan_interval_ms: 500,
            nudge_capacity: 64,
            persistence_workers: 2,
            persistence_queue_capacity: 1024,
            persistence_attempts: 3,
            retain_staging: true,
            log_level: "info".to_string(),
        }
    }
}

fn invalid(reason: impl Into<String>) -> ValidationError {
    ValidationError::InvalidConfig { reason: reason.into() }
}

impl EntityManagerConfig {
    /// Load from a JSON file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> ManagerResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| invalid(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json(&raw)
    }

    /// Parse from a JSON string.
    pub fn from_json(raw: &str) -> ManagerResult<Self> {
        let config: Self = serde_json::from_str(raw).map_err(|e| invalid(format!("bad config json: {e}")))?;
        Ok(config)
    }

    /// Apply overrides from the process environment.
    pub fn with_env_overrides(self) -> ManagerResult<Self> {
        self.with_overrides(std::env::vars())
    }

    /// Apply `ENTITY_MANAGER_*` overrides from `vars`. Unknown keys are ignored.
    pub fn with_overrides<I>(mut self, vars: I) -> ManagerResult<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let value = value.trim();
            match name {
                "PARTITION_COUNT" => self.partition_count = parse(&key, value)?,
                "NODE_COUNT" => self.node_count = parse(&key, value)?,
                "LOCAL_NODE" => {
                    self.local_node = if value.is_empty() || value.eq_ignore_ascii_case("all") {
                        None
                    } else {
                        Some(parse(&key, value)?)
                    };
                }
                "SCAN_INTERVAL_MS" => self.scan_interval_ms = parse(&key, value)?,
                "NUDGE_CAPACITY" => self.nudge_capacity = parse(&key, value)?,
                "PERSISTENCE_WORKERS" => self.persistence_workers = parse(&key, value)?,
                "PERSISTENCE_QUEUE_CAPACITY" => self.persistence_queue_capacity = parse(&key, value)?,
                "PERSISTENCE_ATTEMPTS" => self.persistence_attempts = parse(&key, value)?,
                "RETAIN_STAGING" => self.retain_staging = parse(&key, value)?,
                "LOG_LEVEL" => self.log_level = value.to_string(),
                _ => {}
            }
        }
        Ok(self)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let positive = [
            ("partition_count", self.partition_count),
            ("node_count", self.node_count),
            ("nudge_capacity", self.nudge_capacity),
            ("persistence_workers", self.persistence_workers),
            ("persistence_queue_capacity", self.persistence_queue_capacity),
            ("persistence_attempts", self.persistence_attempts),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(invalid(format!("{field} must be greater than zero")));
            }
        }
        if self.scan_interval_ms == 0 {
            return Err(invalid("scan_interval_ms must be greater than zero"));
        }
        if self.node_count > self.partition_count {
            return Err(invalid(format!(
                "node_count {} exceeds partition_count {}",
                self.node_count, self.partition_count
            )));
        }
        if let Some(node) = self.local_node {
            if node >= self.node_count {
                return Err(invalid(format!(
                    "local_node {node} out of range for {} nodes",
                    self.node_count
                )));
            }
        }
        Ok(())
    }

    #[must_use]
    pub const fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    #[must_use]
    pub fn partition_table(&self) -> PartitionTable {
        PartitionTable::new(self.partition_count, self.node_count)
    }

    /// Nodes this process runs scan threads for.
    #[must_use]
    pub fn local_nodes(&self) -> Vec<NodeId> {
        match self.local_node {
            Some(node) => vec![NodeId(node)],
            None => self.partition_table().nodes().collect(),
        }
    }

    #[must_use]
    pub fn persistence(&self) -> PersistenceConfig {
        PersistenceConfig {
            workers: self.persistence_workers,
            queue_capacity: self.persistence_queue_capacity,
            attempts: self.persistence_attempts,
        }
    }

    #[must_use]
    pub fn scan_service(&self) -> ScanServiceConfig {
        ScanServiceConfig {
            interval: self.scan_interval(),
            nudge_capacity: self.nudge_capacity,
        }
    }
}

fn parse<T>(key: &str, value: &str) -> Result<T, ValidationError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e| invalid(format!("{key}={value:?}: {e}")))
}
