use sqlx::{PgPool, postgres::PgPoolOptions};
use std::time::Duration;

pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    // One row per submission; logs accumulate through the batched flusher
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS builds (
            id UUID PRIMARY KEY,
            run_id VARCHAR(64) NOT NULL,
            status VARCHAR(20) NOT NULL,
            logs TEXT NOT NULL DEFAULT '',
            error TEXT,
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // One row per run id, replaced on every transition
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS deployments (
            id VARCHAR(64) PRIMARY KEY,
            build_id UUID NOT NULL,
            owner VARCHAR(255) NOT NULL,
            repo VARCHAR(255) NOT NULL,
            branch VARCHAR(255) NOT NULL,
            status VARCHAR(20) NOT NULL,
            host_port INTEGER,
            workload JSONB,
            error TEXT,
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_builds_run_id ON builds(run_id)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_deployments_status ON deployments(status)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_deployments_repo ON deployments(owner, repo, branch)",
    )
    .execute(pool)
    .await?;

    tracing::info!("Database migrations completed successfully");
    Ok(())
}
