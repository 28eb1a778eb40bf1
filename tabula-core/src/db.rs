use crate::config::DatabaseConfig;
use sqlx::{postgres::PgPoolOptions, PgPool};

pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.url)
        .await
}

pub async fn health_check(pool: &PgPool) -> Result<String, sqlx::Error> {
    let row: (String,) = sqlx::query_as("SELECT version()").fetch_one(pool).await?;
    Ok(row.0)
}

/// Bootstraps the sessions/messages schema. Safe to run at every startup.
pub async fn init_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sessions (
            id VARCHAR(64) PRIMARY KEY,
            title VARCHAR(255) NOT NULL,
            owner VARCHAR(128) NOT NULL,
            created_at BIGINT NOT NULL,
            updated_at BIGINT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_sessions_owner_updated ON sessions (owner, updated_at)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            id VARCHAR(64) PRIMARY KEY,
            session_id VARCHAR(64) NOT NULL
                REFERENCES sessions(id) ON DELETE CASCADE,
            role VARCHAR(16) NOT NULL,
            text TEXT NOT NULL,
            time BIGINT NOT NULL,
            table_summary JSONB NULL,
            table_data JSONB NULL,
            created_at BIGINT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_messages_session_time ON messages (session_id, time)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
