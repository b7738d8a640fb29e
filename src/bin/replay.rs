//! scrapesync replay
//!
//! Replays a JSONL file of scraped records against an in-memory store and
//! prints the per-record outcomes and the reconciled entities.

use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

use scrapesync::{
    EntityStore, FileStore, InMemoryEntityStore, InPlaceFileStore, LocalFileStore, MergeEngine, PipelineConfig,
    RecordOutcome, SchemaRegistry, ScrapedRecord, Session,
};

struct Args {
    schemas: PathBuf,
    records: PathBuf,
    config: Option<PathBuf>,
    workers: Option<usize>,
    files_dir: Option<PathBuf>,
}

fn usage() -> ! {
    println!("scrapesync-replay - replay scraped records into an in-memory store");
    println!();
    println!("USAGE:");
    println!("    scrapesync-replay [OPTIONS] <schemas.json> <records.jsonl>");
    println!();
    println!("OPTIONS:");
    println!("    -c, --config <FILE>       Pipeline configuration (JSON)");
    println!("    -w, --workers <N>         Number of merge workers");
    println!("    -f, --files-dir <DIR>     Copy attached files into DIR");
    println!("    -h, --help                Print help information");
    process::exit(0);
}

fn fail(message: impl std::fmt::Display) -> ! {
    eprintln!("error: {message}");
    process::exit(1);
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut positional = Vec::new();
    let mut config = None;
    let mut workers = None;
    let mut files_dir = None;

    let mut i = 0;
    while i < args.len() {
        let value = || args.get(i + 1).cloned().unwrap_or_else(|| fail(format!("{} requires a value", args[i])));
        match args[i].as_str() {
            "--config" | "-c" => {
                config = Some(PathBuf::from(value()));
                i += 2;
            }
            "--workers" | "-w" => {
                let raw = value();
                workers = Some(raw.parse().unwrap_or_else(|_| fail(format!("invalid worker count: {raw}"))));
                i += 2;
            }
            "--files-dir" | "-f" => {
                files_dir = Some(PathBuf::from(value()));
                i += 2;
            }
            "--help" | "-h" => usage(),
            other => {
                positional.push(PathBuf::from(other));
                i += 1;
            }
        }
    }

    if positional.len() != 2 {
        fail("expected <schemas.json> <records.jsonl> (see --help)");
    }
    let records = positional.pop().unwrap_or_default();
    let schemas = positional.pop().unwrap_or_default();
    Args {
        schemas,
        records,
        config,
        workers,
        files_dir,
    }
}

fn read(path: &Path) -> String {
    fs::read_to_string(path).unwrap_or_else(|e| fail(format!("cannot read {}: {e}", path.display())))
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = parse_args();

    let registry = SchemaRegistry::from_json_str(&read(&args.schemas)).unwrap_or_else(|e| fail(e));
    let records: Vec<ScrapedRecord> = read(&args.records)
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str(line).unwrap_or_else(|e| fail(format!("{}:{}: {e}", args.records.display(), n + 1)))
        })
        .collect();

    let mut config = args
        .config
        .as_ref()
        .map(|path| PipelineConfig::from_json_str(&read(path)).unwrap_or_else(|e| fail(e)))
        .unwrap_or_default();
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    // Every record stays admitted until its dependencies arrive.
    config.queue_capacity = config.queue_capacity.max(records.len());

    let store = Arc::new(InMemoryEntityStore::new());
    let files: Arc<dyn FileStore> = match &args.files_dir {
        Some(dir) => Arc::new(LocalFileStore::new(dir)),
        None => Arc::new(InPlaceFileStore),
    };
    let registry = Arc::new(registry);
    let engine = MergeEngine::new(Arc::clone(&registry), store.clone()).with_file_store(files);
    let session = Session::new(engine, config).unwrap_or_else(|e| fail(e));

    info!(records = records.len(), schemas = registry.len(), "replaying");
    let handles: Vec<_> = records
        .into_iter()
        .map(|record| session.submit(record).unwrap_or_else(|e| fail(e)))
        .collect();
    let report = session.finish();

    let outcomes: Vec<_> = handles
        .into_iter()
        .map(|handle| {
            let label = handle.label().to_string();
            match handle.join() {
                Ok(RecordOutcome::Completed { merge, suspensions, .. }) => json!({
                    "record": label,
                    "status": "completed",
                    "entity": merge.entity.to_string(),
                    "created": merge.created,
                    "changed": merge.changed_fields,
                    "locked": merge.skipped_locked,
                    "suspensions": suspensions,
                }),
                Ok(RecordOutcome::Failed { error, .. }) => json!({
                    "record": label,
                    "status": "failed",
                    "kind": error.kind(),
                    "error": error.to_string(),
                }),
                Err(e) => json!({ "record": label, "status": "lost", "error": e.to_string() }),
            }
        })
        .collect();

    let mut schemas: Vec<&str> = registry.names().collect();
    schemas.sort_unstable();
    let mut entities = serde_json::Map::new();
    for schema in schemas {
        let listed = store.list(schema).unwrap_or_else(|e| fail(e));
        entities.insert(schema.to_string(), serde_json::to_value(listed).unwrap_or_else(|e| fail(e)));
    }

    let output = json!({
        "report": report,
        "records": outcomes,
        "entities": entities,
    });
    match serde_json::to_string_pretty(&output) {
        Ok(text) => println!("{text}"),
        Err(e) => fail(e),
    }
}
