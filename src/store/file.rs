use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::{SnapshotLock, SnapshotStore};
use crate::error::PipelineError;
use crate::models::snapshot::{Snapshot, SnapshotRow};

const SNAPSHOT_FILE: &str = "snapshot.json";
const LAST_RUN_FILE: &str = "last_run.json";
const LOCK_FILE: &str = ".lock";

#[derive(Debug, Serialize, Deserialize)]
struct LastRunMarker {
    last_run_at: DateTime<Utc>,
}

/// Snapshot kept as JSON files in one directory.
pub struct FileSnapshotStore {
    dir: PathBuf,
    /// A lock file older than this is left over from a crashed run.
    stale_lock_after: Duration,
}

impl FileSnapshotStore {
    pub fn new(dir: impl Into<PathBuf>, stale_lock_after: Duration) -> Self {
        Self {
            dir: dir.into(),
            stale_lock_after,
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    async fn acquire_lock(&self) -> Result<FileLock, PipelineError> {
        fs::create_dir_all(&self.dir).await?;
        let path = self.path(LOCK_FILE);

        let created = match create_lock_file(&path).await {
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                if !self.lock_is_stale(&path).await {
                    return Err(PipelineError::SnapshotBusy);
                }
                tracing::warn!(path = %path.display(), "Removing stale snapshot lock");
                fs::remove_file(&path).await?;
                create_lock_file(&path).await
            }
            other => other,
        };
        match created {
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Err(PipelineError::SnapshotBusy),
            other => other?,
        }

        Ok(FileLock {
            dir: self.dir.clone(),
            path: Some(path),
        })
    }

    async fn lock_is_stale(&self, path: &Path) -> bool {
        let Ok(meta) = fs::metadata(path).await else {
            return false;
        };
        meta.modified()
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .is_some_and(|age| age > self.stale_lock_after)
    }
}

async fn create_lock_file(path: &Path) -> std::io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;
    let owner = format!("pid={} at={}\n", std::process::id(), Utc::now().to_rfc3339());
    file.write_all(owner.as_bytes()).await?;
    file.flush().await
}

async fn read_snapshot(dir: &Path) -> Result<Snapshot, PipelineError> {
    let rows: Vec<SnapshotRow> = match fs::read(dir.join(SNAPSHOT_FILE)).await {
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
            PipelineError::SnapshotCorruption(format!("{SNAPSHOT_FILE}: {e}"))
        })?,
        Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(e.into()),
    };

    let last_run_at = match fs::read(dir.join(LAST_RUN_FILE)).await {
        Ok(bytes) => {
            let marker: LastRunMarker = serde_json::from_slice(&bytes).map_err(|e| {
                PipelineError::SnapshotCorruption(format!("{LAST_RUN_FILE}: {e}"))
            })?;
            Some(marker.last_run_at)
        }
        Err(e) if e.kind() == ErrorKind::NotFound => None,
        Err(e) => return Err(e.into()),
    };

    Snapshot::from_rows(rows, last_run_at)
}

/// Write next to the target, then rename over it.
async fn replace_file(target: &Path, bytes: &[u8]) -> Result<(), PipelineError> {
    let tmp = target.with_extension("json.tmp");
    let mut file = fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(&tmp, target).await?;
    Ok(())
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn open(&self) -> Result<(Box<dyn SnapshotLock>, Snapshot), PipelineError> {
        let lock = self.acquire_lock().await?;
        // On error the lock guard drops and removes the lock file.
        let prior = read_snapshot(&self.dir).await?;
        Ok((Box::new(lock), prior))
    }

    async fn read(&self) -> Result<Snapshot, PipelineError> {
        read_snapshot(&self.dir).await
    }
}

struct FileLock {
    dir: PathBuf,
    path: Option<PathBuf>,
}

impl FileLock {
    async fn unlock(mut self) -> Result<(), PipelineError> {
        if let Some(path) = self.path.take() {
            fs::remove_file(path).await?;
        }
        Ok(())
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Some(path) = self.path.take()
            && let Err(e) = std::fs::remove_file(&path)
        {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove snapshot lock");
        }
    }
}

#[async_trait]
impl SnapshotLock for FileLock {
    async fn write(self: Box<Self>, snapshot: &Snapshot) -> Result<(), PipelineError> {
        let rows = serde_json::to_vec_pretty(&snapshot.rows())
            .map_err(|e| PipelineError::InvalidInput(format!("cannot encode snapshot: {e}")))?;
        replace_file(&self.dir.join(SNAPSHOT_FILE), &rows).await?;

        if let Some(last_run_at) = snapshot.last_run_at {
            let marker = serde_json::to_vec(&LastRunMarker { last_run_at })
                .map_err(|e| PipelineError::InvalidInput(format!("cannot encode marker: {e}")))?;
            replace_file(&self.dir.join(LAST_RUN_FILE), &marker).await?;
        }

        self.unlock().await
    }

    async fn release(self: Box<Self>) -> Result<(), PipelineError> {
        self.unlock().await
    }
}
