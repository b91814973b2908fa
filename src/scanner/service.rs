//! Periodic scan driver: one thread per owned node.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, never, select, Receiver, Sender};
use tracing::{debug, warn};

use crate::error::{ManagerError, ManagerResult};
use crate::storage::NodeId;

use super::scan::{CompletionScanner, ScanReport};

/// Wakes scan threads early. Never blocks: a full channel already holds a
/// pending wake-up.
#[derive(Debug, Clone)]
pub struct ScanTrigger {
    senders: Vec<Sender<()>>,
}

impl ScanTrigger {
    /// A trigger with a single receiver.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, Receiver<()>) {
        let (tx, rx) = bounded(capacity.max(1));
        (Self { senders: vec![tx] }, rx)
    }

    /// A trigger that wakes `receivers` independent receivers at once.
    #[must_use]
    pub fn fan_out(receivers: usize, capacity: usize) -> (Self, Vec<Receiver<()>>) {
        let (senders, receivers) = (0..receivers).map(|_| bounded(capacity.max(1))).unzip();
        (Self { senders }, receivers)
    }

    pub fn nudge(&self) {
        for tx in &self.senders {
            let _ = tx.try_send(());
        }
    }
}

/// Scan service configuration.
#[derive(Debug, Clone)]
pub struct ScanServiceConfig {
    /// Time between passes when nothing nudges.
    pub interval: Duration,
    /// Buffered nudges per node thread.
    pub nudge_capacity: usize,
}

impl Default for ScanServiceConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            nudge_capacity: 64,
        }
    }
}

#[derive(Debug, Default)]
struct ServiceStats {
    passes: AtomicU64,
    totals: Mutex<ScanReport>,
}

/// Runs [`CompletionScanner::scan_node`] for each owned node, every
/// `interval` or when nudged.
///
/// Dropping the service stops and joins its threads. A pass in progress is
/// abandoned at the next document boundary.
pub struct ScanService {
    trigger: ScanTrigger,
    stop: Option<Sender<()>>,
    cancel: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
    stats: Arc<ServiceStats>,
}

impl std::fmt::Debug for ScanService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanService")
            .field("workers", &self.workers.len())
            .field("passes", &self.passes())
            .finish_non_exhaustive()
    }
}

impl ScanService {
    /// Start one scan thread per node in `nodes`.
    ///
    /// # Panics
    ///
    /// Panics if a scan thread cannot be spawned.
    #[must_use]
    pub fn start(scanner: Arc<CompletionScanner>, nodes: &[NodeId], config: &ScanServiceConfig) -> Self {
        let (trigger, nudges) = ScanTrigger::fan_out(nodes.len(), config.nudge_capacity);
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let cancel = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(ServiceStats::default());

        let mut workers = Vec::with_capacity(nodes.len());
        for (&node, nudge_rx) in nodes.iter().zip(nudges) {
            let scanner = Arc::clone(&scanner);
            let stop_rx = stop_rx.clone();
            let cancel = Arc::clone(&cancel);
            let stats = Arc::clone(&stats);
            let interval = config.interval;
            let handle = thread::Builder::new()
                .name(format!("entity-scan-{node}"))
                .spawn(move || scan_loop(&scanner, node, interval, &nudge_rx, &stop_rx, &cancel, &stats))
                .expect("failed to spawn scan thread");
            workers.push(handle);
        }

        Self {
            trigger,
            stop: Some(stop_tx),
            cancel,
            workers,
            stats,
        }
    }

    /// Trigger that wakes every scan thread.
    #[must_use]
    pub fn trigger(&self) -> ScanTrigger {
        self.trigger.clone()
    }

    /// Completed passes across all threads.
    #[must_use]
    pub fn passes(&self) -> u64 {
        self.stats.passes.load(Ordering::SeqCst)
    }

    /// Counters summed over every completed pass.
    pub fn totals(&self) -> ManagerResult<ScanReport> {
        self.stats
            .totals
            .lock()
            .map(|totals| *totals)
            .map_err(|_| ManagerError::internal("scan totals lock poisoned"))
    }
}

impl Drop for ScanService {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::SeqCst);
        // Closing the stop channel wakes every thread blocked in select.
        self.stop.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn scan_loop(
    scanner: &CompletionScanner,
    node: NodeId,
    interval: Duration,
    nudge_rx: &Receiver<()>,
    stop_rx: &Receiver<()>,
    cancel: &AtomicBool,
    stats: &ServiceStats,
) {
    let mut nudges = nudge_rx.clone();
    loop {
        let mut triggers_gone = false;
        select! {
            recv(stop_rx) -> _ => break,
            recv(nudges) -> msg => triggers_gone = msg.is_err(),
            default(interval) => {}
        }

        if triggers_gone {
            // Every trigger is gone; fall back to the timer.
            nudges = never();
            continue;
        }
        // Coalesce a burst into one pass.
        while nudges.try_recv().is_ok() {}

        if cancel.load(Ordering::SeqCst) {
            break;
        }
        match scanner.scan_node_until(node, cancel) {
            Ok(report) => {
                stats.passes.fetch_add(1, Ordering::SeqCst);
                if let Ok(mut totals) = stats.totals.lock() {
                    totals.merge(&report);
                }
            }
            Err(err) => warn!(node = %node, error = %err, "scan pass failed"),
        }
    }
    debug!(node = %node, "scan thread stopped");
}
