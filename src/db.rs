use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::error::PipelineError;

pub async fn create_pool(database_url: &str) -> Result<PgPool, PipelineError> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await?;
    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), PipelineError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
