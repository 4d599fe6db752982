//! Coordinator-side sink for failure reports

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::protocol::FailureOperation;
use crate::registry::ComponentRegistry;

pub struct FailureCollector {
    registry: Arc<ComponentRegistry>,
    failure_file: Option<PathBuf>,
    reports: RwLock<Vec<FailureOperation>>,
    failure_count: AtomicU64,
    finished_count: AtomicU64,
}

impl FailureCollector {
    pub fn new(registry: Arc<ComponentRegistry>, failure_file: Option<PathBuf>) -> Self {
        Self {
            registry,
            failure_file,
            reports: RwLock::new(Vec::new()),
            failure_count: AtomicU64::new(0),
            finished_count: AtomicU64::new(0),
        }
    }

    /// Record one report: count it, log it, drop the worker if it is gone
    pub async fn notify(&self, failure: FailureOperation) {
        if failure.kind.is_poison_pill() {
            self.finished_count.fetch_add(1, Ordering::SeqCst);
            info!("Worker finished: {}", failure.summary());
        } else {
            let count = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
            error!("Failure #{}: {}", count, failure.summary());
        }

        if failure.kind.is_worker_terminal() {
            if let Some(worker) = &failure.worker_address {
                if self.registry.remove_worker(worker).is_some() {
                    info!("Removed worker {} from the registry", worker);
                }
            }
        }

        if let Some(path) = &self.failure_file {
            let line = format!("{} {}", failure.timestamp.to_rfc3339(), failure.summary());
            if let Err(e) = append_line(path, &line).await {
                warn!("Could not write failure to {}: {}", path.display(), e);
            }
        }
        self.reports.write().await.push(failure);
    }

    /// Genuine failures; poison pills are not counted
    pub fn failure_count(&self) -> u64 {
        self.failure_count.load(Ordering::SeqCst)
    }

    pub fn finished_count(&self) -> u64 {
        self.finished_count.load(Ordering::SeqCst)
    }

    pub fn has_failures(&self) -> bool {
        self.failure_count() > 0
    }

    pub async fn reports(&self) -> Vec<FailureOperation> {
        self.reports.read().await.clone()
    }
}

async fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.write_all(b"\n").await?;
    file.flush().await
}
