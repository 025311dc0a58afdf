mod actors;
mod collectors;
mod config;
mod db;
mod error;
mod models;
mod pipeline;
mod routes;
mod store;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::actors::apify::ApifyClient;
use crate::actors::ActorGateway;
use crate::collectors::actor_source::ActorSource;
use crate::collectors::file::FileSource;
use crate::collectors::mycareersfuture::MyCareersFuture;
use crate::collectors::runner::Pipeline;
use crate::collectors::SourceAdapter;
use crate::config::{Command, Config, RunSettings};
use crate::models::rule::RuleSet;
use crate::store::file::FileSnapshotStore;
use crate::store::postgres::PgSnapshotStore;
use crate::store::{MergeStore, SnapshotStore};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("impact_jobs=info,tower_http=info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn open_store(config: &Config) -> anyhow::Result<MergeStore> {
    let backend: Arc<dyn SnapshotStore> = match &config.database_url {
        Some(url) => {
            tracing::info!("Connecting to database...");
            let pool = db::create_pool(url).await?;
            if config.run_migrations {
                tracing::info!("Running database migrations...");
                db::run_migrations(&pool).await?;
                tracing::info!("Migrations complete");
            }
            Arc::new(PgSnapshotStore::new(pool))
        }
        None => {
            tracing::info!(dir = %config.snapshot_dir.display(), "Using file snapshot store");
            Arc::new(FileSnapshotStore::new(
                &config.snapshot_dir,
                config.stale_lock_after(),
            ))
        }
    };
    Ok(MergeStore::new(backend))
}

fn build_adapters(settings: &RunSettings) -> anyhow::Result<Vec<Arc<dyn SourceAdapter>>> {
    let mut adapters: Vec<Arc<dyn SourceAdapter>> = Vec::new();

    if !settings.disable_mycareersfuture {
        adapters.push(Arc::new(MyCareersFuture::new(
            &settings.mycareersfuture_api_url,
            settings.page_delay(),
        )));
    }

    match &settings.apify_token {
        Some(token) if !token.trim().is_empty() => {
            let client = ApifyClient::new(token.clone(), &settings.apify_base_url)?;
            let gateway = Arc::new(ActorGateway::new(Arc::new(client), settings.gateway()));
            adapters.push(Arc::new(ActorSource::jobstreet_sg(gateway.clone())));
            adapters.push(Arc::new(ActorSource::jobsdb_hk(gateway)));
        }
        _ => tracing::warn!("APIFY_API_TOKEN not set, actor-backed sources disabled"),
    }

    for fixture in &settings.fixture_files {
        adapters.push(Arc::new(FileSource::new(fixture.site, &fixture.path)));
    }

    if adapters.is_empty() {
        anyhow::bail!("No sources enabled");
    }
    Ok(adapters)
}

async fn run_once(
    store: MergeStore,
    settings: &RunSettings,
    output: Option<std::path::PathBuf>,
) -> anyhow::Result<()> {
    let rules = match &settings.rules_file {
        Some(path) => RuleSet::from_file(path)?,
        None => RuleSet::impact_default(),
    };
    let pipeline = Pipeline::new(build_adapters(settings)?, &rules, store, settings.pipeline())?;

    let result = tokio::select! {
        biased;
        _ = tokio::signal::ctrl_c() => {
            anyhow::bail!("Interrupted, snapshot left unchanged");
        }
        result = pipeline.run() => result,
    };
    let output_doc = match result {
        Ok(doc) => doc,
        Err(e) => {
            tracing::error!("Run failed: {e}");
            return Err(e.into());
        }
    };

    let json = serde_json::to_string_pretty(&output_doc)?;
    match output {
        Some(path) => {
            tokio::fs::write(&path, json)
                .await
                .with_context(|| format!("writing {}", path.display()))?;
            tracing::info!(path = %path.display(), "Run output written");
        }
        None => println!("{json}"),
    }
    Ok(())
}

async fn serve(store: MergeStore, listen_addr: &str) -> anyhow::Result<()> {
    let app = routes::router(store);
    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    tracing::info!("Listening on {listen_addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Config::parse();
    let store = open_store(&config).await?;

    match config.resolved_command() {
        Command::Run { output } => run_once(store, &config.run, output).await,
        Command::Serve { listen_addr } => serve(store, &listen_addr).await,
    }
}
