use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use uuid::Uuid;

use crate::collectors::{
    FailureReason, FetchOutcome, SearchQuery, SourceAdapter, SourceFailure, simplify_query,
};
use crate::error::PipelineError;
use crate::models::rule::RuleSet;
use crate::models::run::{RunOutput, RunSummary, SourceReport, SourceStatus};
use crate::pipeline::classify::Classifier;
use crate::pipeline::dedup::deduplicate;
use crate::pipeline::normalize::{Normalizer, within_window};
use crate::store::MergeStore;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub queries: Vec<String>,
    pub locations: Vec<String>,
    pub max_age_hours: u32,
    pub results_wanted: usize,
    pub max_concurrent_sources: usize,
    /// Wall-clock budget for the whole fetch phase.
    pub run_timeout: Duration,
    pub snippet_chars: usize,
}

/// One adapter invocation.
#[derive(Debug, Clone)]
struct FetchTask {
    adapter: usize,
    query: SearchQuery,
}

struct Fetched {
    outcome: FetchOutcome,
    fetched_at: DateTime<Utc>,
}

/// Runs every source, then normalizes, classifies, deduplicates and merges
/// what came back.
pub struct Pipeline {
    adapters: Vec<Arc<dyn SourceAdapter>>,
    tasks: Vec<FetchTask>,
    classifier: Classifier,
    normalizer: Normalizer,
    store: MergeStore,
    config: PipelineConfig,
}

impl Pipeline {
    /// Rule and query problems are reported here, before anything is
    /// fetched.
    pub fn new(
        adapters: Vec<Arc<dyn SourceAdapter>>,
        rules: &RuleSet,
        store: MergeStore,
        config: PipelineConfig,
    ) -> Result<Self, PipelineError> {
        let classifier = Classifier::compile(rules)?;
        let tasks = plan(&adapters, &config)?;
        Ok(Self {
            adapters,
            tasks,
            classifier,
            normalizer: Normalizer::new(config.snippet_chars),
            store,
            config,
        })
    }

    pub async fn run(&self) -> Result<RunOutput, PipelineError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        let session = self.store.begin().await?;
        tracing::info!(
            %run_id,
            tasks = self.tasks.len(),
            prior_listings = session.prior().listings.len(),
            "Run started"
        );

        let fetched = self.fetch_all().await;

        let mut summary = RunSummary::default();
        let mut sources = Vec::with_capacity(fetched.len());
        let mut normalized = Vec::new();

        for (task, Fetched { outcome, fetched_at }) in self.tasks.iter().zip(fetched) {
            let adapter = &self.adapters[task.adapter];
            let report = SourceReport::new(
                adapter.name(),
                adapter.site(),
                &task.query.term,
                &task.query.location,
                outcome.records.len(),
                outcome.failure,
            );
            match report.status {
                SourceStatus::Succeeded => summary.succeeded += 1,
                SourceStatus::Partial => summary.partial += 1,
                SourceStatus::Failed => summary.failed += 1,
            }
            if let Some(failure) = &report.failure {
                tracing::warn!(
                    %run_id,
                    site = %report.site,
                    query = %report.query,
                    location = %report.location,
                    reason = %failure.reason,
                    records = report.records,
                    "Source failed: {}",
                    failure.message
                );
            }
            sources.push(report);

            summary.raw_records += outcome.records.len();
            normalized.extend(
                self.normalizer
                    .normalize_all(adapter.site(), adapter.schema(), outcome.records, fetched_at)
                    .into_iter()
                    .filter(|listing| within_window(listing, self.config.max_age_hours)),
            );
        }
        summary.normalized = normalized.len();

        let classified = self.classifier.retain(normalized);
        summary.classified = classified.len();

        let deduplicated = deduplicate(classified);
        summary.deduplicated = deduplicated.len();

        let merged = session.commit(deduplicated, started_at).await?;
        let finished_at = Utc::now();

        tracing::info!(
            %run_id,
            succeeded = summary.succeeded,
            partial = summary.partial,
            failed = summary.failed,
            listings = merged.listings.len(),
            snapshot_changed = merged.persisted,
            "Run finished"
        );

        Ok(RunOutput {
            run_id,
            started_at,
            finished_at,
            listings: merged.listings,
            changes: merged.diff.counts(),
            snapshot_changed: merged.persisted,
            sources,
            summary,
        })
    }

    /// Fetch every task concurrently under the run deadline. Results line up
    /// with `self.tasks`; tasks cut off by the deadline come back as
    /// `Timeout` failures.
    async fn fetch_all(&self) -> Vec<Fetched> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_sources.max(1)));
        let mut set = JoinSet::new();
        let mut index_of = HashMap::new();

        for (i, task) in self.tasks.iter().enumerate() {
            let adapter = self.adapters[task.adapter].clone();
            let query = task.query.clone();
            let semaphore = semaphore.clone();
            let handle = set.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let outcome = adapter.fetch(&query).await;
                Fetched {
                    outcome,
                    fetched_at: Utc::now(),
                }
            });
            index_of.insert(handle.id(), i);
        }

        let mut results: Vec<Option<Fetched>> = self.tasks.iter().map(|_| None).collect();
        let deadline = Instant::now() + self.config.run_timeout;

        loop {
            match tokio::time::timeout_at(deadline, set.join_next_with_id()).await {
                Ok(Some(Ok((id, fetched)))) => {
                    if let Some(&i) = index_of.get(&id) {
                        results[i] = Some(fetched);
                    }
                }
                Ok(Some(Err(e))) => {
                    tracing::error!("Fetch task failed: {e}");
                    if let Some(&i) = index_of.get(&e.id()) {
                        results[i] = Some(Fetched {
                            outcome: FetchOutcome::failed(
                                Vec::new(),
                                SourceFailure::new(
                                    FailureReason::Unavailable,
                                    format!("fetch task failed: {e}"),
                                ),
                            ),
                            fetched_at: Utc::now(),
                        });
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(pending = set.len(), "Run deadline reached, aborting fetches");
                    set.shutdown().await;
                    break;
                }
            }
        }

        results
            .into_iter()
            .map(|fetched| {
                fetched.unwrap_or_else(|| Fetched {
                    outcome: FetchOutcome::failed(
                        Vec::new(),
                        SourceFailure::new(
                            FailureReason::Timeout,
                            "run deadline reached before the source finished",
                        ),
                    ),
                    fetched_at: Utc::now(),
                })
            })
            .collect()
    }
}

/// Expand adapters x locations x queries into fetch tasks. Region-bound
/// sources skip other locations, sources without boolean search get a
/// simplified term, and identical invocations are planned once.
fn plan(
    adapters: &[Arc<dyn SourceAdapter>],
    config: &PipelineConfig,
) -> Result<Vec<FetchTask>, PipelineError> {
    let (Some(first_query), Some(first_location)) =
        (config.queries.first(), config.locations.first())
    else {
        return Err(PipelineError::InvalidInput(
            "at least one query and one location are required".to_string(),
        ));
    };

    let mut tasks = Vec::new();
    let mut seen = HashSet::new();

    for (i, adapter) in adapters.iter().enumerate() {
        if adapter.is_static() {
            let query = SearchQuery::new(
                first_query,
                first_location,
                config.max_age_hours,
                config.results_wanted,
            )?;
            tasks.push(FetchTask { adapter: i, query });
            continue;
        }

        for location in &config.locations {
            if !adapter.supports_location(location) {
                tracing::debug!(source = adapter.name(), location = %location, "Location not served");
                continue;
            }
            for term in &config.queries {
                let mut query =
                    SearchQuery::new(term, location, config.max_age_hours, config.results_wanted)?;
                if !adapter.accepts_boolean_queries() {
                    query = query.with_term(simplify_query(&query.term));
                }
                if seen.insert((i, query.term.to_lowercase(), query.location.to_lowercase())) {
                    tasks.push(FetchTask { adapter: i, query });
                }
            }
        }
    }

    Ok(tasks)
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::{Value, json};

    use super::*;
    use crate::collectors::{LocationRule, RecordSchema};
    use crate::models::listing::SourceSite;
    use crate::models::rule::{ClassificationRule, KeywordGroup, Scope};
    use crate::store::testing::MemoryStore;

    const SCHEMA: RecordSchema = RecordSchema {
        title: &["title"],
        company: &["company"],
        location: LocationRule::First(&["location"]),
        default_location: "Singapore",
        posted_at: &["posted"],
        description: &["description"],
        url: &["url"],
        id: &[],
        url_template: None,
    };

    /// Scripted source returning fixed records, optionally failing or
    /// hanging.
    struct ScriptedSource {
        name: &'static str,
        site: SourceSite,
        records: Vec<Value>,
        failure: Option<FailureReason>,
        delay: Duration,
        region: Option<&'static str>,
        boolean: bool,
    }

    impl ScriptedSource {
        fn new(name: &'static str, site: SourceSite, records: Vec<Value>) -> Self {
            Self {
                name,
                site,
                records,
                failure: None,
                delay: Duration::ZERO,
                region: None,
                boolean: true,
            }
        }

        fn failing(name: &'static str, site: SourceSite, reason: FailureReason) -> Self {
            Self {
                failure: Some(reason),
                ..Self::new(name, site, vec![])
            }
        }
    }

    #[async_trait]
    impl SourceAdapter for ScriptedSource {
        fn name(&self) -> &str {
            self.name
        }

        fn site(&self) -> SourceSite {
            self.site
        }

        fn schema(&self) -> &RecordSchema {
            &SCHEMA
        }

        fn supports_location(&self, location: &str) -> bool {
            self.region
                .is_none_or(|region| crate::collectors::location_is(location, region))
        }

        fn accepts_boolean_queries(&self) -> bool {
            self.boolean
        }

        async fn fetch(&self, _query: &SearchQuery) -> FetchOutcome {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let records = self
                .records
                .iter()
                .cloned()
                .filter_map(crate::models::listing::RawRecord::from_value)
                .collect();
            match self.failure {
                Some(reason) => FetchOutcome::failed(records, SourceFailure::new(reason, "scripted")),
                None => FetchOutcome::complete(records),
            }
        }
    }

    fn rules() -> RuleSet {
        RuleSet {
            rules: vec![
                ClassificationRule {
                    name: "sustainability".to_string(),
                    include_groups: vec![KeywordGroup {
                        terms: vec!["sustainability".to_string(), "manager".to_string()],
                        scope: Scope::TitleOrDescription,
                    }],
                    exclude_terms: vec!["insurance".to_string()],
                    exclude_scope: Scope::TitleOrDescription,
                    exclude_companies: vec![],
                },
                ClassificationRule {
                    name: "esg".to_string(),
                    include_groups: vec![KeywordGroup {
                        terms: vec!["esg".to_string()],
                        scope: Scope::Title,
                    }],
                    exclude_terms: vec![],
                    exclude_scope: Scope::Title,
                    exclude_companies: vec![],
                },
            ],
        }
    }

    fn config() -> PipelineConfig {
        PipelineConfig {
            queries: vec!["esg".to_string()],
            locations: vec!["Singapore".to_string()],
            max_age_hours: 168,
            results_wanted: 30,
            max_concurrent_sources: 2,
            run_timeout: Duration::from_secs(60),
            snippet_chars: 500,
        }
    }

    fn memory_store() -> (Arc<MemoryStore>, MergeStore) {
        let backend = Arc::new(MemoryStore::default());
        (backend.clone(), MergeStore::new(Arc::new(backend)))
    }

    fn job(title: &str, company: &str, url: &str, posted: Option<&str>) -> Value {
        let mut record = json!({ "title": title, "company": company, "url": url });
        if let Some(posted) = posted {
            record["posted"] = json!(posted);
        }
        record
    }

    fn pipeline(sources: Vec<ScriptedSource>, store: MergeStore, config: PipelineConfig) -> Pipeline {
        let adapters = sources
            .into_iter()
            .map(|s| Arc::new(s) as Arc<dyn SourceAdapter>)
            .collect();
        Pipeline::new(adapters, &rules(), store, config).unwrap()
    }

    #[tokio::test]
    async fn classification_and_dedup_scenario() {
        let (_, store) = memory_store();
        let a = ScriptedSource::new(
            "a",
            SourceSite::JobStreetSg,
            vec![
                job("ESG Analyst", "Acme Corp", "https://a.example/u1", None),
                job("Sustainability Manager, Insurance Division", "Beta", "https://a.example/3", None),
                job("Sustainability Manager", "Gamma", "https://a.example/4", Some("2 days ago")),
            ],
        );
        let b = ScriptedSource::new(
            "b",
            SourceSite::Indeed,
            vec![job("ESG Analyst", "Acme Corp", "https://b.example/u2", Some("1 day ago"))],
        );

        let output = pipeline(vec![a, b], store, config()).run().await.unwrap();

        let titles: Vec<&str> = output.listings.iter().map(|l| l.title.as_str()).collect();
        assert_eq!(titles, vec!["ESG Analyst", "Sustainability Manager"]);
        assert_eq!(output.listings[0].url, "https://b.example/u2");
        assert!(output.listings[0].posted_at.is_some());
        assert_eq!(output.summary.raw_records, 4);
        assert_eq!(output.summary.classified, 3);
        assert_eq!(output.summary.deduplicated, 2);
    }

    #[tokio::test]
    async fn second_identical_run_changes_nothing() {
        let (backend, store) = memory_store();
        let sources = || {
            vec![ScriptedSource::new(
                "a",
                SourceSite::Indeed,
                vec![
                    job("ESG Lead", "Acme", "https://a.example/1", None),
                    job("ESG Analyst", "Beta", "https://a.example/2", None),
                ],
            )]
        };

        let first = pipeline(sources(), store.clone(), config()).run().await.unwrap();
        assert!(first.snapshot_changed);
        assert_eq!(first.changes.added, 2);

        let second = pipeline(sources(), store, config()).run().await.unwrap();
        assert!(!second.snapshot_changed);
        assert_eq!(second.changes.added, 0);
        assert_eq!(second.changes.removed, 0);
        assert_eq!(second.changes.unchanged, 2);
        assert_eq!(*backend.writes.lock().unwrap(), 1);

        let urls = |o: &RunOutput| o.listings.iter().map(|l| l.url.clone()).collect::<Vec<_>>();
        assert_eq!(urls(&first), urls(&second));
    }

    #[tokio::test]
    async fn failing_sources_do_not_fail_the_run() {
        let (_, store) = memory_store();
        let sources = vec![
            ScriptedSource::new("ok-1", SourceSite::Indeed, vec![job("ESG Lead", "Acme", "https://a/1", None)]),
            ScriptedSource::failing("blocked", SourceSite::LinkedIn, FailureReason::Blocked),
            ScriptedSource::new("ok-2", SourceSite::JobsDbHk, vec![job("ESG Analyst", "Beta", "https://b/1", None)]),
            ScriptedSource::failing("limited", SourceSite::CtGoodJobs, FailureReason::RateLimited),
        ];

        let output = pipeline(sources, store, config()).run().await.unwrap();
        assert_eq!(output.listings.len(), 2);
        assert_eq!(output.summary.succeeded, 2);
        assert_eq!(output.summary.failed, 2);
        let failed: Vec<FailureReason> = output
            .sources
            .iter()
            .filter_map(|s| s.failure.as_ref().map(|f| f.reason))
            .collect();
        assert_eq!(failed, vec![FailureReason::Blocked, FailureReason::RateLimited]);
    }

    #[tokio::test]
    async fn records_before_a_failure_still_count() {
        let (_, store) = memory_store();
        let mut partial = ScriptedSource::new(
            "partial",
            SourceSite::MyCareersFuture,
            vec![job("ESG Lead", "Acme", "https://a/1", None)],
        );
        partial.failure = Some(FailureReason::Timeout);

        let output = pipeline(vec![partial], store, config()).run().await.unwrap();
        assert_eq!(output.summary.partial, 1);
        assert_eq!(output.sources[0].status, SourceStatus::Partial);
        assert_eq!(output.listings.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_sources_are_cut_off_at_the_deadline() {
        let (_, store) = memory_store();
        let mut slow = ScriptedSource::new(
            "slow",
            SourceSite::LinkedIn,
            vec![job("ESG Director", "Slowco", "https://slow/1", None)],
        );
        slow.delay = Duration::from_secs(3600);
        let fast = ScriptedSource::new("fast", SourceSite::Indeed, vec![job("ESG Lead", "Acme", "https://a/1", None)]);

        let output = pipeline(vec![slow, fast], store, config()).run().await.unwrap();
        assert_eq!(output.listings.len(), 1);
        assert_eq!(output.listings[0].title, "ESG Lead");
        let slow_report = &output.sources[0];
        assert_eq!(slow_report.status, SourceStatus::Failed);
        assert_eq!(slow_report.failure.as_ref().unwrap().reason, FailureReason::Timeout);
    }

    #[tokio::test]
    async fn output_order_does_not_depend_on_source_order() {
        let records_a = vec![
            job("ESG Lead", "Acme", "https://a/1", Some("3 days ago")),
            job("ESG Analyst", "Beta", "https://a/2", None),
        ];
        let records_b = vec![
            job("ESG Officer", "Gamma", "https://b/1", Some("1 day ago")),
            job("ESG Lead", "Acme", "https://b/2", Some("3 days ago")),
        ];

        let (_, store) = memory_store();
        let forwards = pipeline(
            vec![
                ScriptedSource::new("a", SourceSite::Indeed, records_a.clone()),
                ScriptedSource::new("b", SourceSite::LinkedIn, records_b.clone()),
            ],
            store,
            config(),
        )
        .run()
        .await
        .unwrap();

        let (_, store) = memory_store();
        let backwards = pipeline(
            vec![
                ScriptedSource::new("b", SourceSite::LinkedIn, records_b),
                ScriptedSource::new("a", SourceSite::Indeed, records_a),
            ],
            store,
            config(),
        )
        .run()
        .await
        .unwrap();

        let titles = |o: &RunOutput| o.listings.iter().map(|l| (l.title.clone(), l.url.clone())).collect::<Vec<_>>();
        assert_eq!(titles(&forwards), titles(&backwards));
        assert_eq!(
            titles(&forwards),
            vec![
                ("ESG Officer".to_string(), "https://b/1".to_string()),
                ("ESG Lead".to_string(), "https://b/2".to_string()),
                ("ESG Analyst".to_string(), "https://a/2".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn stale_postings_are_dropped() {
        let (_, store) = memory_store();
        let source = ScriptedSource::new(
            "a",
            SourceSite::Indeed,
            vec![
                job("ESG Lead", "Acme", "https://a/1", Some("30 days ago")),
                job("ESG Analyst", "Beta", "https://a/2", Some("2 days ago")),
            ],
        );
        let output = pipeline(vec![source], store, config()).run().await.unwrap();
        assert_eq!(output.listings.len(), 1);
        assert_eq!(output.listings[0].title, "ESG Analyst");
    }

    #[test]
    fn plan_respects_regions_and_query_support() {
        let mut sg_only = ScriptedSource::new("sg", SourceSite::MyCareersFuture, vec![]);
        sg_only.region = Some("singapore");
        sg_only.boolean = false;
        let anywhere = ScriptedSource::new("any", SourceSite::Indeed, vec![]);
        let adapters: Vec<Arc<dyn SourceAdapter>> = vec![Arc::new(sg_only), Arc::new(anywhere)];

        let config = PipelineConfig {
            queries: vec![
                r#""impact manager" OR "impact analyst""#.to_string(),
                r#""impact manager" OR "impact officer""#.to_string(),
            ],
            locations: vec!["Singapore".to_string(), "Hong Kong".to_string()],
            ..config()
        };
        let tasks = plan(&adapters, &config).unwrap();

        let sg: Vec<&FetchTask> = tasks.iter().filter(|t| t.adapter == 0).collect();
        assert_eq!(sg.len(), 1);
        assert_eq!(sg[0].query.term, "impact manager");
        assert_eq!(sg[0].query.location, "Singapore");
        assert_eq!(tasks.iter().filter(|t| t.adapter == 1).count(), 4);
    }

    #[test]
    fn bad_rules_or_queries_fail_before_fetching() {
        let (_, store) = memory_store();
        let err = Pipeline::new(vec![], &RuleSet { rules: vec![] }, store.clone(), config())
            .err()
            .unwrap();
        assert!(matches!(err, PipelineError::ClassificationConfig(_)));

        let config = PipelineConfig {
            queries: vec!["  ".to_string()],
            ..config()
        };
        let adapters: Vec<Arc<dyn SourceAdapter>> =
            vec![Arc::new(ScriptedSource::new("a", SourceSite::Indeed, vec![]))];
        let err = Pipeline::new(adapters, &rules(), store, config).err().unwrap();
        assert!(matches!(err, PipelineError::InvalidInput(_)));
    }
}
