// Snapshot persistence. A run opens a session (single-writer lock plus the
// prior snapshot), computes the diff, and writes only when keys changed.

pub mod file;
pub mod postgres;

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::PipelineError;
use crate::models::listing::{DedupKey, JobListing, KeyedListing};
use crate::models::run::ChangeCounts;
use crate::models::snapshot::Snapshot;

/// Storage backend for the snapshot.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Take the backend's writer lock and load the prior snapshot. Fails
    /// with `SnapshotBusy` when another writer holds the lock.
    async fn open(&self) -> Result<(Box<dyn SnapshotLock>, Snapshot), PipelineError>;

    /// Read the current snapshot without taking the writer lock.
    async fn read(&self) -> Result<Snapshot, PipelineError>;
}

/// Writer lock held for the duration of a run. Dropping it releases the
/// lock without writing.
#[async_trait]
pub trait SnapshotLock: Send {
    async fn write(self: Box<Self>, snapshot: &Snapshot) -> Result<(), PipelineError>;

    async fn release(self: Box<Self>) -> Result<(), PipelineError>;
}

/// Key-level difference between two snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotDiff {
    pub added: Vec<DedupKey>,
    pub removed: Vec<DedupKey>,
    pub unchanged: Vec<DedupKey>,
}

impl SnapshotDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    pub fn counts(&self) -> ChangeCounts {
        ChangeCounts {
            added: self.added.len(),
            removed: self.removed.len(),
            unchanged: self.unchanged.len(),
        }
    }
}

pub fn diff(prior: &Snapshot, current: &Snapshot) -> SnapshotDiff {
    let before: BTreeSet<&DedupKey> = prior.listings.keys().collect();
    let after: BTreeSet<&DedupKey> = current.listings.keys().collect();
    SnapshotDiff {
        added: after.difference(&before).map(|k| (*k).clone()).collect(),
        removed: before.difference(&after).map(|k| (*k).clone()).collect(),
        unchanged: after.intersection(&before).map(|k| (*k).clone()).collect(),
    }
}

#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub listings: Vec<JobListing>,
    pub diff: SnapshotDiff,
    pub persisted: bool,
}

/// Front of the snapshot backend. Clones share one in-process writer
/// mutex, so concurrent runs in the same process queue up.
#[derive(Clone)]
pub struct MergeStore {
    backend: Arc<dyn SnapshotStore>,
    writer: Arc<Mutex<()>>,
}

impl MergeStore {
    pub fn new(backend: Arc<dyn SnapshotStore>) -> Self {
        Self {
            backend,
            writer: Arc::new(Mutex::new(())),
        }
    }

    /// Start a merge: waits for any other run in this process, then takes
    /// the backend lock and loads the prior snapshot. Corruption surfaces
    /// here, before anything is written.
    pub async fn begin(&self) -> Result<MergeSession, PipelineError> {
        let guard = self.writer.clone().lock_owned().await;
        let (lock, prior) = self.backend.open().await?;
        tracing::info!(
            listings = prior.listings.len(),
            last_run_at = ?prior.last_run_at,
            "Loaded prior snapshot"
        );
        Ok(MergeSession {
            _guard: guard,
            lock,
            prior,
        })
    }

    pub async fn load(&self) -> Result<Snapshot, PipelineError> {
        self.backend.read().await
    }
}

pub struct MergeSession {
    _guard: OwnedMutexGuard<()>,
    lock: Box<dyn SnapshotLock>,
    prior: Snapshot,
}

impl MergeSession {
    pub fn prior(&self) -> &Snapshot {
        &self.prior
    }

    /// Diff `current` against the prior snapshot and persist it only if a
    /// key was added or removed.
    pub async fn commit<L: Into<KeyedListing>>(
        self,
        current: Vec<L>,
        run_at: DateTime<Utc>,
    ) -> Result<MergeOutcome, PipelineError> {
        let next = Snapshot::from_listings(current, run_at);
        let diff = diff(&self.prior, &next);

        let persisted = if diff.is_empty() {
            self.lock.release().await?;
            false
        } else {
            self.lock.write(&next).await?;
            true
        };

        tracing::info!(
            added = diff.added.len(),
            removed = diff.removed.len(),
            unchanged = diff.unchanged.len(),
            persisted,
            "Snapshot merged"
        );

        Ok(MergeOutcome {
            listings: next.sorted_listings(),
            diff,
            persisted,
        })
    }
}


#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::testing::MemoryStore;
    use super::*;
    use crate::models::listing::SourceSite;

    fn listing(title: &str) -> JobListing {
        JobListing {
            title: title.to_string(),
            company: "Acme".to_string(),
            location: "Singapore".to_string(),
            posted_at: None,
            description_snippet: String::new(),
            url: format!("https://jobs.example/{title}"),
            source_site: SourceSite::Indeed,
            fetched_at: Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap(),
        }
    }

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, day, 0, 0, 0).unwrap()
    }

    #[test]
    fn diff_splits_keys() {
        let prior = Snapshot::from_listings(vec![listing("a"), listing("b")], at(1));
        let current = Snapshot::from_listings(vec![listing("b"), listing("c")], at(2));
        let d = diff(&prior, &current);
        assert_eq!(d.added, vec![listing("c").dedup_key()]);
        assert_eq!(d.removed, vec![listing("a").dedup_key()]);
        assert_eq!(d.unchanged, vec![listing("b").dedup_key()]);
        assert!(!d.is_empty());
    }

    #[tokio::test]
    async fn unchanged_keys_are_not_written() {
        let backend = Arc::new(MemoryStore::default());
        let store = MergeStore::new(Arc::new(backend.clone()));

        let first = store.begin().await.unwrap();
        assert!(first.prior().listings.is_empty());
        let outcome = first.commit(vec![listing("a")], at(1)).await.unwrap();
        assert!(outcome.persisted);
        assert_eq!(outcome.diff.counts().added, 1);

        let second = store.begin().await.unwrap();
        let outcome = second.commit(vec![listing("a")], at(2)).await.unwrap();
        assert!(!outcome.persisted);
        assert_eq!(outcome.diff.counts(), ChangeCounts { added: 0, removed: 0, unchanged: 1 });
        assert_eq!(*backend.writes.lock().unwrap(), 1);
        // last_run_at moves only with a write
        assert_eq!(store.load().await.unwrap().last_run_at, Some(at(1)));
    }

    #[tokio::test]
    async fn corrupt_snapshot_aborts_before_any_write() {
        let backend = Arc::new(MemoryStore {
            corrupt: true,
            ..Default::default()
        });
        let store = MergeStore::new(Arc::new(backend.clone()));
        assert!(matches!(
            store.begin().await,
            Err(PipelineError::SnapshotCorruption(_))
        ));
        assert_eq!(*backend.writes.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn second_session_in_process_waits_for_the_first() {
        let store = MergeStore::new(Arc::new(Arc::new(MemoryStore::default())));
        let first = store.begin().await.unwrap();

        let waiting = tokio::spawn({
            let store = store.clone();
            async move { store.begin().await.map(|s| s.prior().listings.len()) }
        });
        tokio::task::yield_now().await;
        assert!(!waiting.is_finished());

        first.commit(vec![listing("a")], at(1)).await.unwrap();
        assert_eq!(waiting.await.unwrap().unwrap(), 1);
    }

    #[tokio::test]
    async fn keyed_listings_are_stored_under_their_group_key() {
        let store = MergeStore::new(Arc::new(Arc::new(MemoryStore::default())));
        let key = listing("a").dedup_key();

        let first = store.begin().await.unwrap();
        first
            .commit(vec![KeyedListing { key: key.clone(), listing: listing("a") }], at(1))
            .await
            .unwrap();

        // Same group, different representative.
        let second = store.begin().await.unwrap();
        let outcome = second
            .commit(vec![KeyedListing { key: key.clone(), listing: listing("b") }], at(2))
            .await
            .unwrap();
        assert!(!outcome.persisted);
        assert_eq!(outcome.diff.unchanged, vec![key]);
    }
}
