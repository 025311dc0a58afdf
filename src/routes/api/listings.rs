use axum::Json;
use axum::extract::{Query, State};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::models::listing::{JobListing, SourceSite};
use crate::store::MergeStore;

#[derive(Debug, Default, Deserialize)]
pub struct ListingFilters {
    pub site: Option<SourceSite>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct ListingsResponse {
    pub last_run_at: Option<DateTime<Utc>>,
    pub count: usize,
    pub listings: Vec<JobListing>,
}

/// Current snapshot in display order. Reads never take the writer lock.
pub async fn list(
    State(store): State<MergeStore>,
    Query(filters): Query<ListingFilters>,
) -> Result<Json<ListingsResponse>, ApiError> {
    let snapshot = store.load().await?;
    let mut listings: Vec<JobListing> = snapshot
        .sorted_listings()
        .into_iter()
        .filter(|l| filters.site.is_none_or(|site| l.source_site == site))
        .collect();
    if let Some(limit) = filters.limit {
        listings.truncate(limit);
    }

    Ok(Json(ListingsResponse {
        last_run_at: snapshot.last_run_at,
        count: listings.len(),
        listings,
    }))
}
