use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::collectors::SourceFailure;
use crate::models::listing::{JobListing, SourceSite};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Succeeded,
    Partial,
    Failed,
}

/// Outcome of one adapter invocation (one source, one query, one location).
#[derive(Debug, Clone, Serialize)]
pub struct SourceReport {
    pub source: String,
    pub site: SourceSite,
    pub query: String,
    pub location: String,
    pub records: usize,
    pub status: SourceStatus,
    pub failure: Option<SourceFailure>,
}

impl SourceReport {
    pub fn new(
        source: &str,
        site: SourceSite,
        query: &str,
        location: &str,
        records: usize,
        failure: Option<SourceFailure>,
    ) -> Self {
        let status = match (&failure, records) {
            (None, _) => SourceStatus::Succeeded,
            (Some(_), 0) => SourceStatus::Failed,
            (Some(_), _) => SourceStatus::Partial,
        };
        Self {
            source: source.to_string(),
            site,
            query: query.to_string(),
            location: location.to_string(),
            records,
            status,
            failure,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChangeCounts {
    pub added: usize,
    pub removed: usize,
    pub unchanged: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub succeeded: usize,
    pub partial: usize,
    pub failed: usize,
    pub raw_records: usize,
    pub normalized: usize,
    pub classified: usize,
    pub deduplicated: usize,
}

/// Everything the rendering side needs from a completed run.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutput {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub listings: Vec<JobListing>,
    pub changes: ChangeCounts,
    pub snapshot_changed: bool,
    pub sources: Vec<SourceReport>,
    pub summary: RunSummary,
}
