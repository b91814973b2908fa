//! Entity manager JSON-lines driver
//!
//! Reads one ingestion record per line from stdin, resolves it against
//! in-memory collaborators, and writes every resolved batch to stdout as one
//! JSON line. Logs go to stderr.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::bounded;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use entity_manager::{
    Collaborators, EntityManager, EntityManagerConfig, InMemoryGraph, InMemoryIndex, IngestionRecord, ManagerError,
    ResolvedBatch,
};

/// Attempts per record for retryable failures.
const HANDLE_ATTEMPTS: u32 = 3;

struct Args {
    config: Option<PathBuf>,
    partitions: Option<usize>,
    evict_staging: bool,
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = Args {
        config: None,
        partitions: None,
        evict_staging: false,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    parsed.config = Some(PathBuf::from(&args[i + 1]));
                    i += 2;
                } else {
                    eprintln!("error: --config requires a value");
                    std::process::exit(1);
                }
            }
            "--partitions" | "-p" => {
                if i + 1 < args.len() {
                    let n: usize = args[i + 1].parse().unwrap_or_else(|_| {
                        eprintln!("error: invalid partition count: {}", args[i + 1]);
                        std::process::exit(1);
                    });
                    parsed.partitions = Some(n);
                    i += 2;
                } else {
                    eprintln!("error: --partitions requires a value");
                    std::process::exit(1);
                }
            }
            "--evict-staging" => {
                parsed.evict_staging = true;
                i += 1;
            }
            "--help" | "-h" => {
                println!("entity-manager - entity resolution JSON-lines driver");
                println!();
                println!("USAGE:");
                println!("    entity-manager [OPTIONS] < records.jsonl > batches.jsonl");
                println!();
                println!("OPTIONS:");
                println!("    -c, --config <FILE>        JSON configuration file");
                println!("    -p, --partitions <N>       Partition count [default: 271]");
                println!("        --evict-staging        Evict staging records after commit");
                println!("    -h, --help                 Print help information");
                println!();
                println!("ENVIRONMENT:");
                println!("    ENTITY_MANAGER_*           Override any configuration field");
                println!("    RUST_LOG                   Log filter [default: config log_level]");
                std::process::exit(0);
            }
            arg => {
                eprintln!("error: unknown argument: {arg}");
                std::process::exit(1);
            }
        }
    }

    parsed
}

fn load_config(args: &Args) -> Result<EntityManagerConfig, ManagerError> {
    let mut config = match &args.config {
        Some(path) => EntityManagerConfig::load(path)?,
        None => EntityManagerConfig::default(),
    };
    config = config.with_env_overrides()?;
    if let Some(n) = args.partitions {
        config.partition_count = n;
    }
    if args.evict_staging {
        config.retain_staging = false;
    }
    config.validate()?;
    Ok(config)
}

fn handle_with_retry(manager: &EntityManager, record: &IngestionRecord) -> Result<(), ManagerError> {
    let mut attempt = 1;
    loop {
        match manager.handle(record) {
            Ok(_) => return Ok(()),
            Err(err) if err.is_retryable() && attempt < HANDLE_ATTEMPTS => {
                warn!(ingestion = %record.ingestion_id, attempt, error = %err, "retrying record");
                thread::sleep(Duration::from_millis(50 * u64::from(attempt)));
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = parse_args();
    let config = load_config(&args)?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)))
        .with_writer(io::stderr)
        .init();

    let (batch_tx, batch_rx) = bounded::<ResolvedBatch>(1024);
    let egress = thread::Builder::new().name("entity-egress".to_string()).spawn(move || -> io::Result<usize> {
        let stdout = io::stdout();
        let mut out = stdout.lock();
        let mut written = 0;
        for batch in batch_rx {
            serde_json::to_writer(&mut out, &batch)?;
            out.write_all(b"\n")?;
            out.flush()?;
            written += 1;
        }
        Ok(written)
    })?;

    let graph = Arc::new(InMemoryGraph::new());
    let manager = EntityManager::start(
        config,
        Collaborators {
            index: Arc::new(InMemoryIndex::new()),
            graph: graph.clone(),
            nodes: Some(graph.clone()),
            sink: Arc::new(batch_tx),
        },
    )?;

    let (mut accepted, mut rejected) = (0usize, 0usize);
    for (line_no, line) in io::stdin().lock().lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: IngestionRecord = match serde_json::from_str(&line) {
            Ok(record) => record,
            Err(err) => {
                warn!(line = line_no + 1, error = %err, "skipping malformed record");
                rejected += 1;
                continue;
            }
        };
        match handle_with_retry(&manager, &record) {
            Ok(()) => accepted += 1,
            Err(err) => {
                warn!(line = line_no + 1, ingestion = %record.ingestion_id, error = %err, "record rejected");
                rejected += 1;
            }
        }
    }

    if !manager.wait_idle(Duration::from_secs(30))? {
        warn!("persistence still busy at shutdown");
    }
    let last = manager.scan()?;
    let pending = manager.stores().tracker.len()?;
    drop(manager);

    let written = egress
        .join()
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "egress thread panicked"))??;

    info!(
        accepted,
        rejected,
        batches = written,
        final_committed = last.committed,
        pending,
        edges = graph.edges()?.len(),
        "done"
    );
    Ok(())
}
