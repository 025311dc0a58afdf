use std::sync::LazyLock;

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use url::Url;

use crate::collectors::{LocationRule, RecordSchema};
use crate::models::listing::{JobListing, RawRecord, SourceSite};

/// Turns raw source records into canonical listings.
#[derive(Debug, Clone)]
pub struct Normalizer {
    snippet_chars: usize,
}

impl Normalizer {
    pub fn new(snippet_chars: usize) -> Self {
        Self { snippet_chars }
    }

    pub fn normalize_all(
        &self,
        site: SourceSite,
        schema: &RecordSchema,
        records: Vec<RawRecord>,
        fetched_at: DateTime<Utc>,
    ) -> Vec<JobListing> {
        records
            .iter()
            .filter_map(|record| self.normalize(site, schema, record, fetched_at))
            .collect()
    }

    /// `None` only for records that cannot be identified: no usable url
    /// (directly or via the id template).
    pub fn normalize(
        &self,
        site: SourceSite,
        schema: &RecordSchema,
        record: &RawRecord,
        fetched_at: DateTime<Utc>,
    ) -> Option<JobListing> {
        let title = first_text(record, schema.title).unwrap_or_default();

        let url = first_text(record, schema.url)
            .or_else(|| {
                let id = first_text(record, schema.id)?;
                Some(schema.url_template?.replace("{id}", &id))
            })
            .and_then(|raw| canonical_url(&raw));

        let Some(url) = url else {
            if title.is_empty() {
                tracing::debug!(site = %site, "Dropping unidentifiable record");
            } else {
                tracing::debug!(site = %site, title = %title, "Dropping record without url");
            }
            return None;
        };

        let company = first_text(record, schema.company).unwrap_or_default();
        let location = match schema.location {
            LocationRule::First(paths) => first_text(record, paths),
            LocationRule::Join(paths) => {
                let parts: Vec<String> = paths.iter().filter_map(|p| record.text(p)).collect();
                (!parts.is_empty()).then(|| parts.join(", "))
            }
        }
        .unwrap_or_else(|| schema.default_location.to_string());

        let posted_at = first_text(record, schema.posted_at)
            .and_then(|raw| parse_posted_at(&raw, fetched_at))
            .map(|posted| posted.min(fetched_at));

        let description_snippet = first_text(record, schema.description)
            .map(|raw| snippet(&raw, &company, self.snippet_chars))
            .unwrap_or_default();

        Some(JobListing {
            title,
            company,
            location,
            posted_at,
            description_snippet,
            url,
            source_site: site,
            fetched_at,
        })
    }
}

/// Listings without a posting date are kept: their age is unknown, not
/// known to be too old.
pub fn within_window(listing: &JobListing, max_age_hours: u32) -> bool {
    match listing.posted_at {
        Some(posted) => listing.fetched_at - posted <= Duration::hours(i64::from(max_age_hours)),
        None => true,
    }
}

fn first_text(record: &RawRecord, paths: &[&str]) -> Option<String> {
    paths.iter().find_map(|p| record.text(p))
}

static RELATIVE_AGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(\d+)\+?\s*(minutes?|mins?|hours?|hrs?|h|days?|d|weeks?|w|months?|mo)\s+ago",
    )
    .expect("relative age pattern is valid")
});

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%d %b %Y",
    "%d-%b-%Y",
    "%d %B %Y",
    "%B %d, %Y",
    "%b %d, %Y",
    "%d/%m/%Y",
];

/// Parse a posting date, absolute or relative to `reference`.
pub fn parse_posted_at(raw: &str, reference: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let text = raw.trim();
    let lower = text.to_lowercase();

    if lower.contains("just now") || lower.contains("today") {
        return Some(reference);
    }
    if lower.contains("yesterday") {
        return reference.checked_sub_signed(Duration::days(1));
    }

    if let Some(caps) = RELATIVE_AGE.captures(&lower) {
        // Ages too large for a timestamp are noise, not a date.
        let amount: i64 = caps[1].parse().ok()?;
        let unit = &caps[2];
        let age = if unit.starts_with("mi") {
            Duration::try_minutes(amount)
        } else if unit.starts_with('h') {
            Duration::try_hours(amount)
        } else if unit.starts_with('d') {
            Duration::try_days(amount)
        } else if unit.starts_with('w') {
            Duration::try_weeks(amount)
        } else {
            amount.checked_mul(30).and_then(Duration::try_days)
        }?;
        return reference.checked_sub_signed(age);
    }

    if !text.is_empty() && text.chars().all(|c| c.is_ascii_digit()) {
        return match text.len() {
            8 => NaiveDate::parse_from_str(text, "%Y%m%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|naive| naive.and_utc()),
            // Epoch seconds since 1973 have at least nine digits.
            9..=12 => Utc.timestamp_opt(text.parse().ok()?, 0).single(),
            13.. => Utc.timestamp_millis_opt(text.parse().ok()?).single(),
            _ => None,
        };
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(naive.and_utc());
    }

    const POSTED_ON: &str = "posted on";
    let date_text = if lower.starts_with(POSTED_ON) {
        text.get(POSTED_ON.len()..).map(str::trim).unwrap_or(text)
    } else {
        text
    };
    DATE_FORMATS.iter().find_map(|fmt| {
        NaiveDate::parse_from_str(date_text, fmt)
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|naive| naive.and_utc())
    })
}

/// Query parameters that only track where a click came from.
fn is_tracking_param(name: &str) -> bool {
    const EXACT: &[&str] = &[
        "ref", "refid", "referrer", "src", "trk", "trkinfo", "trackingid", "fbclid", "gclid",
    ];
    let name = name.to_ascii_lowercase();
    name.starts_with("utm_") || EXACT.contains(&name.as_str())
}

/// Canonical form of a posting URL. Unparseable but non-empty input is kept
/// verbatim so the record stays identifiable.
pub fn canonical_url(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let Ok(mut url) = Url::parse(raw) else {
        return Some(raw.to_string());
    };

    url.set_fragment(None);

    let mut kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !is_tracking_param(k))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    kept.sort();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }

    let trimmed = url.path().trim_end_matches('/').to_string();
    if !trimmed.is_empty() && trimmed != url.path() {
        url.set_path(&trimmed);
    }

    Some(url.to_string())
}

/// Phrases after which a description usually stops describing the role and
/// starts describing the employer.
const BOILERPLATE_MARKERS: &[&str] = &[
    "about us",
    "about our company",
    "company overview",
    "company description",
    "who we are",
    "our mission",
    "our values",
    "equal opportunity employer",
];

fn snippet(description: &str, company: &str, max_chars: usize) -> String {
    let text = strip_html(description);
    let lower = text.to_lowercase();

    let mut cut = text.len();
    if lower.len() == text.len() {
        let about_company = format!("about {}", company.trim().to_lowercase());
        let company_marker = (!company.trim().is_empty()).then_some(about_company.as_str());
        for marker in BOILERPLATE_MARKERS.iter().copied().chain(company_marker) {
            if let Some(pos) = lower.find(marker)
                && pos > 0
                && pos < cut
                && text.is_char_boundary(pos)
            {
                cut = pos;
            }
        }
    }

    let role = text[..cut].trim_end();
    let truncated: String = role.chars().take(max_chars).collect();
    truncated.trim_end().to_string()
}

/// Drop tags, decode the common entities, collapse whitespace.
fn strip_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut in_tag = false;
    for c in raw.chars() {
        match c {
            '<' => {
                in_tag = true;
                out.push(' ');
            }
            '>' if in_tag => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }

    let decoded = out
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");
    decoded.split_whitespace().collect::<Vec<_>>().join(" ")
}
