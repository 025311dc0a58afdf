use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::actors::ActorGateway;
use crate::collectors::{
    FetchOutcome, LocationRule, RecordSchema, SearchQuery, SourceAdapter, location_is,
};
use crate::models::listing::SourceSite;

const JOBSTREET_SG: RecordSchema = RecordSchema {
    title: &["title", "jobTitle"],
    company: &["company", "companyName", "advertiser.description"],
    location: LocationRule::First(&["location", "area", "suburb"]),
    default_location: "Singapore",
    posted_at: &["postedDate", "datePosted", "listingDate", "posted"],
    description: &["description", "jobDescription", "teaser"],
    url: &["url", "jobUrl", "link"],
    id: &["id", "jobId"],
    url_template: Some("https://www.jobstreet.com.sg/job/{id}"),
};

const JOBSDB_HK: RecordSchema = RecordSchema {
    title: &["title", "jobTitle"],
    company: &["company", "companyName", "advertiser.description"],
    location: LocationRule::First(&["location", "area", "suburb"]),
    default_location: "Hong Kong",
    posted_at: &["postedDate", "datePosted", "listingDate", "posted"],
    description: &["description", "jobDescription", "teaser"],
    url: &["url", "jobUrl", "link"],
    id: &["id", "jobId"],
    url_template: Some("https://hk.jobsdb.com/job/{id}"),
};

/// A job board scraped through a hosted actor. The board's quirks live in
/// the actor; this side only knows its input shape and output schema.
pub struct ActorSource {
    name: &'static str,
    site: SourceSite,
    actor_id: &'static str,
    region: &'static str,
    /// Most results the actor accepts per run.
    results_cap: usize,
    schema: &'static RecordSchema,
    build_input: fn(&SearchQuery, usize) -> Value,
    gateway: Arc<ActorGateway>,
}

impl ActorSource {
    pub fn jobstreet_sg(gateway: Arc<ActorGateway>) -> Self {
        Self {
            name: "jobstreet_sg",
            site: SourceSite::JobStreetSg,
            actor_id: "websift/seek-job-scraper",
            region: "singapore",
            results_cap: 550,
            schema: &JOBSTREET_SG,
            build_input: |query, max_results| {
                json!({
                    "searchTerm": query.term,
                    "maxResults": max_results,
                    "suburbOrCity": "Singapore",
                })
            },
            gateway,
        }
    }

    pub fn jobsdb_hk(gateway: Arc<ActorGateway>) -> Self {
        Self {
            name: "jobsdb_hk",
            site: SourceSite::JobsDbHk,
            actor_id: "shahidirfan/jobsdb-scraper",
            region: "hong kong",
            results_cap: 1000,
            schema: &JOBSDB_HK,
            build_input: |query, max_results| {
                json!({
                    "searchQuery": query.term,
                    "location": "Hong Kong",
                    "maxResults": max_results,
                })
            },
            gateway,
        }
    }

    fn max_results(&self, query: &SearchQuery) -> usize {
        query
            .results_wanted
            .min(self.results_cap)
            .min(self.gateway.config().max_results)
            .max(1)
    }
}

#[async_trait]
impl SourceAdapter for ActorSource {
    fn name(&self) -> &str {
        self.name
    }

    fn site(&self) -> SourceSite {
        self.site
    }

    fn schema(&self) -> &RecordSchema {
        self.schema
    }

    fn supports_location(&self, location: &str) -> bool {
        location_is(location, self.region)
    }

    fn accepts_boolean_queries(&self) -> bool {
        false
    }

    async fn fetch(&self, query: &SearchQuery) -> FetchOutcome {
        let input = (self.build_input)(query, self.max_results(query));
        tracing::info!(site = %self.site, actor = self.actor_id, query = %query.term, "Starting actor run");

        match self.gateway.run_to_completion(self.actor_id, &input).await {
            Ok(records) => {
                tracing::info!(site = %self.site, query = %query.term, records = records.len(), "Fetched");
                FetchOutcome::complete(records)
            }
            Err(e) => {
                tracing::warn!(site = %self.site, query = %query.term, "Actor run failed: {e}");
                FetchOutcome::failed(Vec::new(), e.into())
            }
        }
    }
}
