use std::{str::FromStr, time::Duration};

use sqlx::{sqlite::{SqliteConnectOptions, SqlitePoolOptions}, SqlitePool};

use crate::AppResult;

/// Open the pool with bounded timeouts so a wedged database surfaces an
/// error instead of stalling connection tasks.
pub async fn connect(database_url: &str) -> AppResult<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)
        .map_err(sqlx::Error::from)?
        .create_if_missing(true)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(16)
        .acquire_timeout(Duration::from_secs(5))
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Initialize the schema.
///
/// The partial unique index on interactions is load-bearing: it is what
/// guarantees at most one active (pending|matched) interaction per unordered
/// participant pair, even when two requests race past the pre-insert check.
pub async fn init(pool: &SqlitePool) -> AppResult<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            username TEXT NOT NULL UNIQUE,
            avatar_url TEXT,
            bio TEXT
        );

        CREATE TABLE IF NOT EXISTS user_skills (
            user_id TEXT NOT NULL,
            skill_id TEXT NOT NULL,
            kind TEXT NOT NULL CHECK (kind IN ('possessed', 'seeking')),
            PRIMARY KEY (user_id, skill_id, kind)
        );

        CREATE TABLE IF NOT EXISTS auth_tokens (
            token TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            expires_at TEXT
        );

        CREATE TABLE IF NOT EXISTS interactions (
            id TEXT PRIMARY KEY,
            pair_lo TEXT NOT NULL,
            pair_hi TEXT NOT NULL,
            initiated_by TEXT NOT NULL,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL,
            last_message_at TEXT NOT NULL
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_interactions_active_pair
            ON interactions(pair_lo, pair_hi)
            WHERE status IN ('pending', 'matched');

        CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            interaction_id TEXT NOT NULL,
            sender_id TEXT NOT NULL,
            content TEXT NOT NULL,
            timestamp TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_messages_interaction_timestamp
            ON messages(interaction_id, timestamp);

        CREATE TABLE IF NOT EXISTS ratings (
            id TEXT PRIMARY KEY,
            interaction_id TEXT NOT NULL,
            rating_user_id TEXT NOT NULL,
            rated_user_id TEXT NOT NULL,
            helpfulness INTEGER NOT NULL,
            politeness INTEGER NOT NULL,
            comment TEXT,
            created_at TEXT NOT NULL,
            UNIQUE (interaction_id, rating_user_id)
        );
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

#[cfg(test)]
pub(crate) async fn memory_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    init(&pool).await.unwrap();
    pool
}
