use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::models::listing::{DedupKey, JobListing, KeyedListing, sort_for_display};

/// Result of the previous successful run, keyed by dedup key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub last_run_at: Option<DateTime<Utc>>,
    pub listings: BTreeMap<DedupKey, JobListing>,
}

impl Snapshot {
    /// Plain listings are stored under their own key.
    pub fn from_listings<L: Into<KeyedListing>>(
        listings: impl IntoIterator<Item = L>,
        last_run_at: DateTime<Utc>,
    ) -> Self {
        Self {
            last_run_at: Some(last_run_at),
            listings: listings
                .into_iter()
                .map(|l| {
                    let KeyedListing { key, listing } = l.into();
                    (key, listing)
                })
                .collect(),
        }
    }

    /// Rebuild from persisted rows. Any bad row means the whole snapshot is
    /// untrustworthy.
    pub fn from_rows(
        rows: Vec<SnapshotRow>,
        last_run_at: Option<DateTime<Utc>>,
    ) -> Result<Self, PipelineError> {
        let mut listings = BTreeMap::new();
        for row in rows {
            let (key, listing) = row.into_entry()?;
            if listings.insert(key.clone(), listing).is_some() {
                return Err(PipelineError::SnapshotCorruption(format!(
                    "duplicate dedup key {key}"
                )));
            }
        }
        Ok(Self {
            last_run_at,
            listings,
        })
    }

    pub fn rows(&self) -> Vec<SnapshotRow> {
        self.listings
            .iter()
            .map(|(key, listing)| SnapshotRow::new(key, listing))
            .collect()
    }

    pub fn sorted_listings(&self) -> Vec<JobListing> {
        let mut listings: Vec<JobListing> = self.listings.values().cloned().collect();
        sort_for_display(&mut listings);
        listings
    }
}

/// Flat persisted row: the dedup key plus every listing field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct SnapshotRow {
    pub dedup_key: String,
    pub title: String,
    pub company: String,
    pub location: String,
    pub posted_at: Option<DateTime<Utc>>,
    pub description_snippet: String,
    pub url: String,
    pub source_site: String,
    pub fetched_at: DateTime<Utc>,
}

impl SnapshotRow {
    pub fn new(key: &DedupKey, listing: &JobListing) -> Self {
        Self {
            dedup_key: key.to_string(),
            title: listing.title.clone(),
            company: listing.company.clone(),
            location: listing.location.clone(),
            posted_at: listing.posted_at,
            description_snippet: listing.description_snippet.clone(),
            url: listing.url.clone(),
            source_site: listing.source_site.to_string(),
            fetched_at: listing.fetched_at,
        }
    }

    fn into_entry(self) -> Result<(DedupKey, JobListing), PipelineError> {
        let corrupt = |what: String| PipelineError::SnapshotCorruption(what);

        let key = DedupKey::parse(&self.dedup_key)
            .ok_or_else(|| corrupt(format!("invalid dedup key '{}'", self.dedup_key)))?;
        let source_site = self
            .source_site
            .parse()
            .map_err(|e: String| corrupt(format!("row {key}: {e}")))?;
        if self.url.trim().is_empty() {
            return Err(corrupt(format!("row {key}: empty url")));
        }

        Ok((
            key,
            JobListing {
                title: self.title,
                company: self.company,
                location: self.location,
                posted_at: self.posted_at,
                description_snippet: self.description_snippet,
                url: self.url,
                source_site,
                fetched_at: self.fetched_at,
            },
        ))
    }
}
