// Source adapters: one per job source, each hiding that source's fetch
// strategy and record shape behind `SourceAdapter`.

pub mod actor_source;
pub mod file;
pub mod mycareersfuture;
pub mod runner;

use std::fmt;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;

use crate::error::PipelineError;
use crate::models::listing::{RawRecord, SourceSite};

/// Inbound search parameters for one adapter invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub term: String,
    pub location: String,
    pub max_age_hours: u32,
    pub results_wanted: usize,
}

impl SearchQuery {
    pub fn new(
        term: &str,
        location: &str,
        max_age_hours: u32,
        results_wanted: usize,
    ) -> Result<Self, PipelineError> {
        if term.trim().is_empty() {
            return Err(PipelineError::InvalidInput("empty search term".to_string()));
        }
        if location.trim().is_empty() {
            return Err(PipelineError::InvalidInput("empty location".to_string()));
        }
        Ok(Self {
            term: term.trim().to_string(),
            location: location.trim().to_string(),
            max_age_hours,
            results_wanted,
        })
    }

    /// Same query with a different term, used when a source needs a
    /// simplified search string.
    pub fn with_term(&self, term: String) -> Self {
        Self {
            term,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Blocked,
    Timeout,
    ParseError,
    RateLimited,
    Unavailable,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureReason::Blocked => "blocked",
            FailureReason::Timeout => "timeout",
            FailureReason::ParseError => "parse error",
            FailureReason::RateLimited => "rate limited",
            FailureReason::Unavailable => "unavailable",
        };
        f.write_str(s)
    }
}

/// A source-local failure. Logged and reported, never fatal to a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("{reason}: {message}")]
pub struct SourceFailure {
    pub reason: FailureReason,
    pub message: String,
}

impl SourceFailure {
    pub fn new(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }

    pub fn from_status(status: reqwest::StatusCode) -> Self {
        let reason = match status.as_u16() {
            401 | 403 => FailureReason::Blocked,
            429 => FailureReason::RateLimited,
            408 | 504 => FailureReason::Timeout,
            _ => FailureReason::Unavailable,
        };
        Self::new(reason, format!("HTTP {status}"))
    }

    pub fn from_request(err: &reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Self::from_status(status);
        }
        let reason = if err.is_timeout() {
            FailureReason::Timeout
        } else if err.is_decode() {
            FailureReason::ParseError
        } else {
            FailureReason::Unavailable
        };
        Self::new(reason, err.to_string())
    }
}

/// Records gathered by one fetch plus the failure that cut it short, if any.
#[derive(Debug, Clone, Default)]
pub struct FetchOutcome {
    pub records: Vec<RawRecord>,
    pub failure: Option<SourceFailure>,
}

impl FetchOutcome {
    pub fn complete(records: Vec<RawRecord>) -> Self {
        Self {
            records,
            failure: None,
        }
    }

    pub fn failed(records: Vec<RawRecord>, failure: SourceFailure) -> Self {
        Self {
            records,
            failure: Some(failure),
        }
    }
}

/// How a location is read out of a raw record.
#[derive(Debug, Clone, Copy)]
pub enum LocationRule {
    /// First present path wins.
    First(&'static [&'static str]),
    /// Present parts joined with ", ".
    Join(&'static [&'static str]),
}

/// Where each canonical field lives in a source's raw records. Paths are
/// tried in order and may be dotted.
#[derive(Debug, Clone, Copy)]
pub struct RecordSchema {
    pub title: &'static [&'static str],
    pub company: &'static [&'static str],
    pub location: LocationRule,
    pub default_location: &'static str,
    pub posted_at: &'static [&'static str],
    pub description: &'static [&'static str],
    pub url: &'static [&'static str],
    pub id: &'static [&'static str],
    /// Detail page URL built from the record id, `{id}` is substituted.
    pub url_template: Option<&'static str>,
}

/// Trait that all job sources implement.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Human-readable name used in logs and reports.
    fn name(&self) -> &str;

    fn site(&self) -> SourceSite;

    fn schema(&self) -> &RecordSchema;

    /// Region-restricted sources opt out of other locations.
    fn supports_location(&self, _location: &str) -> bool {
        true
    }

    /// Whether the source understands `"a" OR "b"` style queries.
    fn accepts_boolean_queries(&self) -> bool {
        true
    }

    /// Static sources return the same records whatever the query and are
    /// fetched once per run.
    fn is_static(&self) -> bool {
        false
    }

    /// Fetch raw records. Errors are caught and reported in the outcome
    /// together with whatever was gathered before the failure.
    async fn fetch(&self, query: &SearchQuery) -> FetchOutcome;
}

static LEADING_PHRASE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\w+(?:\s+\w+)?)\s+OR\b").expect("leading phrase pattern is valid")
});

const STOP_WORDS: &[&str] = &["or", "and", "the", "a", "an"];

/// Reduce a boolean query to a single phrase for sources that do not
/// support `OR`: the phrase before the first `OR`, else the first
/// significant word.
pub fn simplify_query(query: &str) -> String {
    let unquoted: String = query.chars().filter(|c| *c != '"' && *c != '\'').collect();

    if let Some(caps) = LEADING_PHRASE.captures(&unquoted) {
        return caps[1].to_string();
    }

    let words: Vec<&str> = unquoted.split_whitespace().collect();
    words
        .iter()
        .find(|w| w.len() > 2 && !STOP_WORDS.contains(&w.to_lowercase().as_str()))
        .or_else(|| words.first())
        .map(|w| (*w).to_string())
        .unwrap_or_else(|| query.trim().to_string())
}

/// Case-insensitive region check for location-restricted sources.
pub fn location_is(location: &str, region: &str) -> bool {
    location.to_lowercase().contains(&region.to_lowercase())
}
