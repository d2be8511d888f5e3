use sqlx::{PgPool, postgres::PgPoolOptions};

use crate::config::Config;

pub async fn create_pool(config: &Config) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .connect(&config.database_url)
        .await
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    // Pipelines are written by the surrounding service; soft-deleted rows stay
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pipelines (
            id UUID PRIMARY KEY,
            name VARCHAR(255) NOT NULL,
            display_name VARCHAR(255) NOT NULL DEFAULT '',
            content TEXT NOT NULL DEFAULT '',
            clone_url TEXT NOT NULL DEFAULT '',
            username VARCHAR(255) NOT NULL DEFAULT '',
            access_token TEXT NOT NULL DEFAULT '',
            deleted BOOLEAN NOT NULL DEFAULT FALSE,
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pipeline_versions (
            id UUID PRIMARY KEY,
            pipeline_id UUID NOT NULL REFERENCES pipelines(id),
            number BIGINT NOT NULL,
            event VARCHAR(20) NOT NULL,
            sha VARCHAR(255) NOT NULL,
            pipeline_name VARCHAR(255) NOT NULL,
            pipeline_display_name VARCHAR(255) NOT NULL,
            clone_url TEXT NOT NULL,
            content TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL,
            UNIQUE (pipeline_id, number)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS builds (
            id UUID PRIMARY KEY,
            pipeline_id UUID NOT NULL REFERENCES pipelines(id),
            version_id UUID NOT NULL REFERENCES pipeline_versions(id),
            status VARCHAR(50) NOT NULL,
            created_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // "order" is reserved, positions live in `sort`
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS stages (
            id UUID PRIMARY KEY,
            build_id UUID NOT NULL REFERENCES builds(id),
            version_id UUID NOT NULL REFERENCES pipeline_versions(id),
            name VARCHAR(255) NOT NULL,
            display_name VARCHAR(255) NOT NULL,
            kind VARCHAR(255) NOT NULL,
            sort INTEGER NOT NULL,
            status VARCHAR(50) NOT NULL,
            created_at TIMESTAMPTZ NOT NULL,
            UNIQUE (build_id, sort)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS steps (
            id UUID PRIMARY KEY,
            build_id UUID NOT NULL REFERENCES builds(id),
            stage_id UUID NOT NULL REFERENCES stages(id),
            version_id UUID NOT NULL REFERENCES pipeline_versions(id),
            name VARCHAR(255) NOT NULL,
            display_name VARCHAR(255) NOT NULL,
            kind VARCHAR(255) NOT NULL,
            commands JSONB NOT NULL DEFAULT '[]',
            waits JSONB NOT NULL DEFAULT '[]',
            env JSONB NOT NULL DEFAULT '{}',
            sort INTEGER NOT NULL,
            status VARCHAR(50) NOT NULL,
            created_at TIMESTAMPTZ NOT NULL,
            UNIQUE (stage_id, sort)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_builds_pipeline_id ON builds(pipeline_id)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_builds_status ON builds(status)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_steps_build_id ON steps(build_id)")
        .execute(pool)
        .await?;

    tracing::info!("Database migrations completed successfully");
    Ok(())
}
