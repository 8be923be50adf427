//! `hush queues` - inspect persisted queues without running them.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Args;
use serde::Serialize;

use hush_core::impls::FileStorage;
use hush_core::observability::QueueStats;
use hush_core::queue::{DEFAULT_NAMESPACE, QueueStore, TaskRecord};

#[derive(Args)]
pub struct QueuesArgs {
    /// Directory the queues were persisted under
    #[arg(long, env = "HUSH_STORAGE_DIR")]
    storage_dir: PathBuf,

    /// Storage key prefix
    #[arg(long, default_value = DEFAULT_NAMESPACE)]
    namespace: String,

    /// Only tasks whose method name matches this regex
    #[arg(long)]
    name: Option<String>,
}

#[derive(Serialize)]
struct Report {
    loaded: usize,
    stats: QueueStats,
    tasks: Vec<TaskRecord>,
}

pub async fn run(args: QueuesArgs) -> Result<()> {
    let store = QueueStore::new(Arc::new(FileStorage::new(args.storage_dir)), args.namespace);
    let loaded = store.load_all().await?;

    let tasks = match &args.name {
        Some(pattern) => store.filter(pattern, None)?,
        None => store
            .queue_names()
            .iter()
            .flat_map(|queue| store.snapshot(queue))
            .collect(),
    };

    let report = Report {
        loaded,
        stats: store.stats(),
        tasks,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
