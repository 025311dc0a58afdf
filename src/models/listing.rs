use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Known job sources. Declaration order is the source priority used to
/// break deduplication ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SourceSite {
    #[serde(rename = "mycareersfuture")]
    MyCareersFuture,
    #[serde(rename = "linkedin")]
    LinkedIn,
    #[serde(rename = "indeed")]
    Indeed,
    #[serde(rename = "jobstreet_sg")]
    JobStreetSg,
    #[serde(rename = "jobsdb_hk")]
    JobsDbHk,
    #[serde(rename = "ctgoodjobs")]
    CtGoodJobs,
}

impl SourceSite {
    pub const ALL: [SourceSite; 6] = [
        SourceSite::MyCareersFuture,
        SourceSite::LinkedIn,
        SourceSite::Indeed,
        SourceSite::JobStreetSg,
        SourceSite::JobsDbHk,
        SourceSite::CtGoodJobs,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceSite::MyCareersFuture => "mycareersfuture",
            SourceSite::LinkedIn => "linkedin",
            SourceSite::Indeed => "indeed",
            SourceSite::JobStreetSg => "jobstreet_sg",
            SourceSite::JobsDbHk => "jobsdb_hk",
            SourceSite::CtGoodJobs => "ctgoodjobs",
        }
    }
}

impl fmt::Display for SourceSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceSite {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        SourceSite::ALL
            .into_iter()
            .find(|site| site.as_str() == wanted)
            .ok_or_else(|| format!("unknown source site '{s}'"))
    }
}

/// An untyped record as a source returned it, before normalization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawRecord(Map<String, Value>);

impl RawRecord {
    /// Wrap a JSON value; anything but an object is not a record.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(fields) => Some(Self(fields)),
            _ => None,
        }
    }

    /// Look up a dotted path such as `postedCompany.name`.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let mut current = self.0.get(parts.next()?)?;
        for part in parts {
            current = current.get(part)?;
        }
        Some(current)
    }

    /// Text at a path, with numbers and booleans stringified. Blank strings
    /// count as missing.
    pub fn text(&self, path: &str) -> Option<String> {
        let text = match self.get_path(path)? {
            Value::String(s) => s.trim().to_string(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            _ => return None,
        };
        (!text.is_empty()).then_some(text)
    }
}

/// Fingerprint identifying "the same posting" across sources and runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DedupKey(String);

impl DedupKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let valid = (raw.starts_with("f:") || raw.starts_with("u:")) && raw.len() == 66;
        valid.then(|| Self(raw.to_string()))
    }

    fn digest(prefix: &str, parts: &[&str]) -> Self {
        let mut hasher = Sha256::new();
        for (i, part) in parts.iter().enumerate() {
            if i > 0 {
                hasher.update([0x1f_u8]);
            }
            hasher.update(part.as_bytes());
        }
        Self(format!("{prefix}{}", hex::encode(hasher.finalize())))
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonical job posting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobListing {
    pub title: String,
    pub company: String,
    pub location: String,
    pub posted_at: Option<DateTime<Utc>>,
    pub description_snippet: String,
    pub url: String,
    pub source_site: SourceSite,
    pub fetched_at: DateTime<Utc>,
}

impl JobListing {
    /// Fingerprint of (title, company, location). Only defined when title and
    /// company are both known; otherwise unrelated postings with a generic
    /// title would collapse together.
    pub fn field_fingerprint(&self) -> Option<DedupKey> {
        let title = fold(&self.title);
        let company = fold(&self.company);
        if title.is_empty() || company.is_empty() {
            return None;
        }
        Some(DedupKey::digest("f:", &[&title, &company, &fold(&self.location)]))
    }

    pub fn url_fingerprint(&self) -> DedupKey {
        DedupKey::digest("u:", &[&self.url])
    }

    pub fn dedup_key(&self) -> DedupKey {
        self.field_fingerprint()
            .unwrap_or_else(|| self.url_fingerprint())
    }

    /// Presentation order: newest first (undated last), then source
    /// priority, then title and url.
    pub fn display_cmp(&self, other: &Self) -> Ordering {
        match (self.posted_at, other.posted_at) {
            (Some(a), Some(b)) => b.cmp(&a),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
        .then_with(|| self.source_site.cmp(&other.source_site))
        .then_with(|| self.title.cmp(&other.title))
        .then_with(|| self.url.cmp(&other.url))
    }
}

/// A listing together with the key it is stored under.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyedListing {
    pub key: DedupKey,
    pub listing: JobListing,
}

impl From<JobListing> for KeyedListing {
    fn from(listing: JobListing) -> Self {
        Self {
            key: listing.dedup_key(),
            listing,
        }
    }
}

pub fn sort_for_display(listings: &mut [JobListing]) {
    listings.sort_by(JobListing::display_cmp);
}

/// Lowercase and collapse whitespace.
fn fold(text: &str) -> String {
    text.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}
