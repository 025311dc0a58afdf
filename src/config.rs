use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::actors::GatewayConfig;
use crate::actors::poll::PollPolicy;
use crate::collectors::runner::PipelineConfig;
use crate::models::listing::SourceSite;

/// Impact-role searches used when QUERIES is unset.
const DEFAULT_QUERIES: [&str; 11] = [
    r#""impact manager" OR "impact analyst" OR "impact officer" OR "impact specialist""#,
    r#""ESG manager" OR "ESG analyst" OR "ESG officer" OR "ESG specialist" OR "ESG consultant""#,
    r#""sustainability manager" OR "sustainability director" OR "sustainability officer" OR "sustainability specialist""#,
    r#""CSR manager" OR "CSR director" OR "corporate social responsibility""#,
    r#""climate analyst" OR "climate risk" OR "climate manager" OR "climate change""#,
    r#""impact investing" OR "impact fund" OR "impact investor""#,
    r#""social impact manager" OR "social impact analyst" OR "social impact officer""#,
    r#""sustainable finance" OR "green finance" OR "responsible investment""#,
    r#""climate change" OR "environmental health" OR "e-sustainability""#,
    r#""sustainability office" OR "sustainability team""#,
    r#""environmental & social" OR "environmental and social""#,
];

#[derive(Parser, Debug, Clone)]
#[command(name = "impact-jobs", about = "Impact job listing aggregator")]
pub struct Config {
    /// Database connection URL. Without it the snapshot lives in SNAPSHOT_DIR.
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// Run database migrations on startup
    #[arg(long, env = "RUN_MIGRATIONS", default_value = "true")]
    pub run_migrations: bool,

    #[arg(long, env = "SNAPSHOT_DIR", default_value = "data")]
    pub snapshot_dir: PathBuf,

    /// A snapshot lock file older than this is treated as abandoned
    #[arg(long, env = "STALE_LOCK_SECS", default_value = "21600")]
    pub stale_lock_secs: u64,

    #[command(flatten)]
    pub run: RunSettings,

    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Everything a pipeline run needs.
#[derive(clap::Args, Debug, Clone)]
pub struct RunSettings {
    /// Apify token; actor-backed sources are disabled without it
    #[arg(long, env = "APIFY_API_TOKEN", hide_env_values = true)]
    pub apify_token: Option<String>,

    #[arg(long, env = "APIFY_BASE_URL", default_value = crate::actors::apify::DEFAULT_BASE_URL)]
    pub apify_base_url: String,

    /// JSON rule set replacing the built-in impact rules
    #[arg(long, env = "RULES_FILE")]
    pub rules_file: Option<PathBuf>,

    #[arg(long, env = "QUERIES", value_delimiter = ';', default_values = DEFAULT_QUERIES)]
    pub queries: Vec<String>,

    #[arg(long, env = "LOCATIONS", value_delimiter = ',', default_values = ["Singapore", "Hong Kong"])]
    pub locations: Vec<String>,

    #[arg(long, env = "MAX_AGE_HOURS", default_value = "168")]
    pub max_age_hours: u32,

    #[arg(long, env = "RESULTS_WANTED", default_value = "30")]
    pub results_wanted: usize,

    #[arg(long, env = "MAX_CONCURRENT_SOURCES", default_value = "4")]
    pub max_concurrent_sources: usize,

    #[arg(long, env = "RUN_TIMEOUT_SECS", default_value = "900")]
    pub run_timeout_secs: u64,

    #[arg(long, env = "SNIPPET_CHARS", default_value = "500")]
    pub snippet_chars: usize,

    #[arg(long, env = "MAX_ACTOR_RUNS", default_value = "2")]
    pub max_actor_runs: usize,

    #[arg(long, env = "ACTOR_MAX_WAIT_SECS", default_value = "300")]
    pub actor_max_wait_secs: u64,

    #[arg(long, env = "ACTOR_POLL_INITIAL_SECS", default_value = "5")]
    pub actor_poll_initial_secs: u64,

    #[arg(long, env = "ACTOR_POLL_MAX_SECS", default_value = "60")]
    pub actor_poll_max_secs: u64,

    #[arg(long, env = "ACTOR_MAX_RESULTS", default_value = "30")]
    pub actor_max_results: usize,

    #[arg(long, env = "ACTOR_RETENTION_HOURS", default_value = "168")]
    pub actor_retention_hours: u64,

    /// Delay between result pages on paged sources
    #[arg(long, env = "PAGE_DELAY_MS", default_value = "2000")]
    pub page_delay_ms: u64,

    /// Exported records to ingest, as `site=path` pairs
    #[arg(long, env = "FIXTURE_FILES", value_delimiter = ',', value_parser = parse_fixture)]
    pub fixture_files: Vec<FixtureFile>,

    #[arg(
        long,
        env = "MYCAREERSFUTURE_API_URL",
        default_value = crate::collectors::mycareersfuture::DEFAULT_API_URL
    )]
    pub mycareersfuture_api_url: String,

    /// Skip the MyCareersFuture API
    #[arg(long, env = "DISABLE_MYCAREERSFUTURE", default_value = "false")]
    pub disable_mycareersfuture: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixtureFile {
    pub site: SourceSite,
    pub path: PathBuf,
}

fn parse_fixture(raw: &str) -> Result<FixtureFile, String> {
    let (site, path) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected site=path, got '{raw}'"))?;
    if path.trim().is_empty() {
        return Err(format!("missing path in '{raw}'"));
    }
    Ok(FixtureFile {
        site: site.parse()?,
        path: PathBuf::from(path.trim()),
    })
}

#[derive(clap::Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the pipeline once (default when no subcommand given)
    Run {
        /// Write the run output JSON here instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Serve the current snapshot over HTTP
    Serve {
        /// Listen address
        #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8080")]
        listen_addr: String,
    },
}

impl Config {
    /// Resolve the command, defaulting to a single run.
    pub fn resolved_command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Run { output: None })
    }

    pub fn stale_lock_after(&self) -> Duration {
        Duration::from_secs(self.stale_lock_secs)
    }
}

impl RunSettings {
    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            queries: self.queries.clone(),
            locations: self.locations.clone(),
            max_age_hours: self.max_age_hours,
            results_wanted: self.results_wanted,
            max_concurrent_sources: self.max_concurrent_sources,
            run_timeout: Duration::from_secs(self.run_timeout_secs),
            snippet_chars: self.snippet_chars,
        }
    }

    pub fn gateway(&self) -> GatewayConfig {
        GatewayConfig {
            max_running: self.max_actor_runs.max(1),
            poll: PollPolicy {
                initial_interval: Duration::from_secs(self.actor_poll_initial_secs),
                max_interval: Duration::from_secs(self.actor_poll_max_secs),
                max_wait: Duration::from_secs(self.actor_max_wait_secs),
                ..PollPolicy::default()
            },
            max_results: self.actor_max_results,
            retention: Duration::from_secs(self.actor_retention_hours * 3600),
            ..GatewayConfig::default()
        }
    }

    pub fn page_delay(&self) -> Duration {
        Duration::from_millis(self.page_delay_ms)
    }
}
