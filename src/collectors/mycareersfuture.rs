use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::collectors::{
    FailureReason, FetchOutcome, LocationRule, RecordSchema, SearchQuery, SourceAdapter,
    SourceFailure, location_is,
};
use crate::models::listing::{RawRecord, SourceSite};

pub const DEFAULT_API_URL: &str = "https://api.mycareersfuture.gov.sg/v2/jobs";
const PAGE_SIZE: usize = 20;
/// Hard stop on paging regardless of `results_wanted`.
const MAX_PAGES: usize = 10;

const SCHEMA: RecordSchema = RecordSchema {
    title: &["title"],
    company: &["postedCompany.name", "hiringCompany.name"],
    location: LocationRule::Join(&["address.building", "address.street", "address.postalCode"]),
    default_location: "Singapore",
    posted_at: &[
        "metadata.newPostingDate",
        "metadata.originalPostingDate",
        "metadata.createdAt",
    ],
    description: &["description"],
    url: &["metadata.jobDetailsUrl"],
    id: &["uuid"],
    url_template: Some("https://www.mycareersfuture.gov.sg/job/{id}"),
};

/// Singapore's government job portal, read through its public JSON API.
pub struct MyCareersFuture {
    api_url: String,
    page_delay: Duration,
}

impl MyCareersFuture {
    pub fn new(api_url: impl Into<String>, page_delay: Duration) -> Self {
        Self {
            api_url: api_url.into(),
            page_delay,
        }
    }

    async fn fetch_page(
        &self,
        client: &reqwest::Client,
        term: &str,
        page: usize,
    ) -> Result<Vec<RawRecord>, SourceFailure> {
        let page = page.to_string();
        let limit = PAGE_SIZE.to_string();
        let resp = client
            .get(&self.api_url)
            .query(&[
                ("search", term),
                ("page", page.as_str()),
                ("limit", limit.as_str()),
            ])
            .header("Accept", "application/json")
            .header("Accept-Language", "en-SG,en;q=0.9")
            .header("Origin", "https://www.mycareersfuture.gov.sg")
            .header("Referer", "https://www.mycareersfuture.gov.sg/")
            .send()
            .await
            .map_err(|e| SourceFailure::from_request(&e))?;

        if !resp.status().is_success() {
            return Err(SourceFailure::from_status(resp.status()));
        }

        let data: Value = resp
            .json()
            .await
            .map_err(|e| SourceFailure::new(FailureReason::ParseError, e.to_string()))?;

        parse_page(data)
    }
}

#[async_trait]
impl SourceAdapter for MyCareersFuture {
    fn name(&self) -> &str {
        "mycareersfuture"
    }

    fn site(&self) -> SourceSite {
        SourceSite::MyCareersFuture
    }

    fn schema(&self) -> &RecordSchema {
        &SCHEMA
    }

    fn supports_location(&self, location: &str) -> bool {
        location_is(location, "singapore")
    }

    fn accepts_boolean_queries(&self) -> bool {
        false
    }

    async fn fetch(&self, query: &SearchQuery) -> FetchOutcome {
        let client = match reqwest::Client::builder()
            .user_agent("Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36")
            .timeout(Duration::from_secs(30))
            .build()
        {
            Ok(client) => client,
            Err(e) => {
                return FetchOutcome::failed(
                    Vec::new(),
                    SourceFailure::new(
                        FailureReason::Unavailable,
                        format!("Failed to build HTTP client: {e}"),
                    ),
                );
            }
        };

        let mut records = Vec::new();
        for page in 0..MAX_PAGES {
            if page > 0 {
                tokio::time::sleep(self.page_delay).await;
            }

            match self.fetch_page(&client, &query.term, page).await {
                Ok(batch) => {
                    let short = batch.len() < PAGE_SIZE;
                    records.extend(batch);
                    if short || records.len() >= query.results_wanted {
                        break;
                    }
                }
                Err(failure) => {
                    tracing::warn!(
                        site = "mycareersfuture",
                        query = %query.term,
                        page,
                        gathered = records.len(),
                        "Page fetch failed: {failure}"
                    );
                    records.truncate(query.results_wanted);
                    return FetchOutcome::failed(records, failure);
                }
            }
        }

        records.truncate(query.results_wanted);
        tracing::info!(
            site = "mycareersfuture",
            query = %query.term,
            records = records.len(),
            "Fetched"
        );
        FetchOutcome::complete(records)
    }
}

fn parse_page(data: Value) -> Result<Vec<RawRecord>, SourceFailure> {
    let results = match data {
        Value::Object(mut obj) => obj.remove("results"),
        _ => None,
    };
    match results {
        Some(Value::Array(items)) => Ok(items.into_iter().filter_map(RawRecord::from_value).collect()),
        _ => Err(SourceFailure::new(
            FailureReason::ParseError,
            "response has no results list",
        )),
    }
}
