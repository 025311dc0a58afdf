use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;

use crate::collectors::{
    FailureReason, FetchOutcome, LocationRule, RecordSchema, SearchQuery, SourceAdapter,
    SourceFailure,
};
use crate::models::listing::{RawRecord, SourceSite};

/// Covers the field names of common scraper exports (camelCase actor
/// output and snake_case job-board dumps).
const EXPORT_SCHEMA: RecordSchema = RecordSchema {
    title: &["title", "jobTitle", "job_title"],
    company: &["company", "companyName", "company_name", "company.name"],
    location: LocationRule::First(&["location", "city", "area"]),
    default_location: "",
    posted_at: &["date_posted", "postedDate", "datePosted", "posted_at", "posted"],
    description: &["description", "jobDescription", "snippet"],
    url: &["job_url", "url", "jobUrl", "link"],
    id: &["id"],
    url_template: None,
};

/// Records exported by an external scraper into a JSON file, tagged with
/// the site they came from.
pub struct FileSource {
    name: String,
    site: SourceSite,
    path: PathBuf,
}

impl FileSource {
    pub fn new(site: SourceSite, path: impl Into<PathBuf>) -> Self {
        Self {
            name: format!("file:{site}"),
            site,
            path: path.into(),
        }
    }
}

#[async_trait]
impl SourceAdapter for FileSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn site(&self) -> SourceSite {
        self.site
    }

    fn schema(&self) -> &RecordSchema {
        &EXPORT_SCHEMA
    }

    fn is_static(&self) -> bool {
        true
    }

    async fn fetch(&self, _query: &SearchQuery) -> FetchOutcome {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                let reason = if e.kind() == ErrorKind::PermissionDenied {
                    FailureReason::Blocked
                } else {
                    FailureReason::Unavailable
                };
                return FetchOutcome::failed(
                    Vec::new(),
                    SourceFailure::new(reason, format!("{}: {e}", self.path.display())),
                );
            }
        };

        match parse_export(&bytes) {
            Ok(records) => {
                tracing::info!(site = %self.site, path = %self.path.display(), records = records.len(), "Loaded export");
                FetchOutcome::complete(records)
            }
            Err(failure) => FetchOutcome::failed(Vec::new(), failure),
        }
    }
}

/// A bare array of records, or an object wrapping one under `jobs`.
fn parse_export(bytes: &[u8]) -> Result<Vec<RawRecord>, SourceFailure> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|e| SourceFailure::new(FailureReason::ParseError, e.to_string()))?;

    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut obj) => match obj.remove("jobs") {
            Some(Value::Array(items)) => items,
            _ => {
                return Err(SourceFailure::new(
                    FailureReason::ParseError,
                    "expected an array or an object with a 'jobs' array",
                ));
            }
        },
        _ => {
            return Err(SourceFailure::new(
                FailureReason::ParseError,
                "expected an array of records",
            ));
        }
    };

    Ok(items.into_iter().filter_map(RawRecord::from_value).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query() -> SearchQuery {
        SearchQuery::new("esg", "Singapore", 168, 30).unwrap()
    }

    #[tokio::test]
    async fn reads_array_and_wrapped_exports() {
        let dir = tempfile::tempdir().unwrap();
        let bare = dir.path().join("bare.json");
        let wrapped = dir.path().join("wrapped.json");
        std::fs::write(&bare, r#"[{"title":"A","job_url":"https://x/1"},{"title":"B"}]"#).unwrap();
        std::fs::write(&wrapped, r#"{"jobs":[{"title":"C","url":"https://x/3"}]}"#).unwrap();

        let outcome = FileSource::new(SourceSite::Indeed, &bare).fetch(&query()).await;
        assert!(outcome.failure.is_none());
        assert_eq!(outcome.records.len(), 2);

        let outcome = FileSource::new(SourceSite::LinkedIn, &wrapped).fetch(&query()).await;
        assert_eq!(outcome.records.len(), 1);
    }

    #[tokio::test]
    async fn missing_file_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let source = FileSource::new(SourceSite::Indeed, dir.path().join("absent.json"));
        let outcome = source.fetch(&query()).await;
        assert_eq!(outcome.failure.unwrap().reason, FailureReason::Unavailable);
    }

    #[tokio::test]
    async fn invalid_json_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "[{").unwrap();
        let outcome = FileSource::new(SourceSite::Indeed, &path).fetch(&query()).await;
        assert_eq!(outcome.failure.unwrap().reason, FailureReason::ParseError);

        std::fs::write(&path, r#"{"results": []}"#).unwrap();
        let outcome = FileSource::new(SourceSite::Indeed, &path).fetch(&query()).await;
        assert_eq!(outcome.failure.unwrap().reason, FailureReason::ParseError);
    }
}
