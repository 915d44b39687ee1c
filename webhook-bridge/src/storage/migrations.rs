//! Versioned schema migrations for the execution store.
//!
//! Migrations are a fixed, append-only list. Shipped versions are never
//! edited or reordered; schema changes land as new versions at the end of
//! [`MIGRATIONS`]. Each pending migration runs in its own transaction that
//! both executes the script and records the version in
//! `schema_migrations`, so a crash mid-upgrade leaves the store at a
//! well-defined version.

use super::StorageError;
use sqlx::sqlite::SqlitePool;

/// One schema migration.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub version: i64,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, ordered by version.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "create executions and execution_attempts",
        sql: r#"
CREATE TABLE IF NOT EXISTS executions (
    id            TEXT PRIMARY KEY,
    plugin_name   TEXT NOT NULL,
    http_method   TEXT NOT NULL,
    start_time    TEXT NOT NULL,
    end_time      TEXT,
    status        TEXT NOT NULL,
    input         TEXT,
    output        TEXT,
    error         TEXT,
    error_type    TEXT,
    duration_ms   INTEGER,
    attempts      INTEGER NOT NULL DEFAULT 1,
    retry_count   INTEGER NOT NULL DEFAULT 0,
    trace_id      TEXT,
    user_agent    TEXT,
    remote_ip     TEXT,
    tags          TEXT NOT NULL DEFAULT '{}',
    metadata      TEXT NOT NULL DEFAULT '{}',
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS execution_attempts (
    execution_id   TEXT NOT NULL REFERENCES executions(id) ON DELETE CASCADE,
    attempt_number INTEGER NOT NULL,
    start_time     TEXT NOT NULL,
    end_time       TEXT,
    status         TEXT NOT NULL,
    error          TEXT,
    duration_ms    INTEGER,
    PRIMARY KEY (execution_id, attempt_number)
);
"#,
    },
    Migration {
        version: 2,
        description: "index executions by plugin_name, status, start_time, created_at",
        sql: r#"
CREATE INDEX IF NOT EXISTS idx_executions_plugin_name ON executions(plugin_name);
CREATE INDEX IF NOT EXISTS idx_executions_status      ON executions(status);
CREATE INDEX IF NOT EXISTS idx_executions_start_time  ON executions(start_time);
CREATE INDEX IF NOT EXISTS idx_executions_created_at  ON executions(created_at);
"#,
    },
    Migration {
        version: 3,
        description: "create daily_stats aggregates",
        sql: r#"
CREATE TABLE IF NOT EXISTS daily_stats (
    date              TEXT NOT NULL,
    plugin_name       TEXT NOT NULL,
    total             INTEGER NOT NULL DEFAULT 0,
    completed         INTEGER NOT NULL DEFAULT 0,
    failed            INTEGER NOT NULL DEFAULT 0,
    timeout           INTEGER NOT NULL DEFAULT 0,
    total_duration_ms INTEGER NOT NULL DEFAULT 0,
    min_duration_ms   INTEGER,
    max_duration_ms   INTEGER,
    PRIMARY KEY (date, plugin_name)
);

CREATE INDEX IF NOT EXISTS idx_daily_stats_date   ON daily_stats(date);
CREATE INDEX IF NOT EXISTS idx_daily_stats_plugin ON daily_stats(plugin_name);
"#,
    },
];

/// Apply every migration newer than the recorded schema version.
///
/// Safe to call repeatedly: a second run over the same database is a
/// no-op. Returns the schema version after migration.
pub async fn migrate(pool: &SqlitePool) -> Result<i64, StorageError> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version    INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    let current: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM schema_migrations")
        .fetch_one(pool)
        .await?;
    let mut current = current.unwrap_or(0);

    let pending: Vec<_> = MIGRATIONS.iter().filter(|m| m.version > current).collect();
    for migration in pending {
        let mut tx = pool.begin().await?;

        // sqlx's sqlite driver executes one statement per query; split the
        // script on the statement separator.
        for statement in migration
            .sql
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            sqlx::query(statement).execute(&mut *tx).await.map_err(|e| {
                StorageError::Migration {
                    version: migration.version,
                    message: e.to_string(),
                }
            })?;
        }

        sqlx::query(
            "INSERT INTO schema_migrations (version, description, applied_at) VALUES (?, ?, ?)",
        )
        .bind(migration.version)
        .bind(migration.description)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        tracing::info!(
            version = migration.version,
            description = migration.description,
            "applied schema migration"
        );
        current = migration.version;
    }

    Ok(current)
}

/// Highest version recorded in `schema_migrations`, 0 when unmigrated.
pub async fn schema_version(pool: &SqlitePool) -> Result<i64, StorageError> {
    let version: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM schema_migrations")
        .fetch_one(pool)
        .await?;
    Ok(version.unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
    use std::str::FromStr;

    async fn memory_pool() -> SqlitePool {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")
            .unwrap()
            .foreign_keys(true);
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await
            .unwrap()
    }

    #[test]
    fn migrations_are_ordered_and_unique() {
        let mut seen = 0;
        for migration in MIGRATIONS {
            assert!(migration.version > seen, "versions must strictly increase");
            seen = migration.version;
        }
    }

    #[tokio::test]
    async fn migrate_from_empty_applies_all() {
        let pool = memory_pool().await;
        let version = migrate(&pool).await.unwrap();
        assert_eq!(version, MIGRATIONS.last().unwrap().version);

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM schema_migrations")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, MIGRATIONS.len() as i64);
    }

    #[tokio::test]
    async fn migrate_twice_is_idempotent() {
        let pool = memory_pool().await;
        migrate(&pool).await.unwrap();

        let before: Vec<(i64, String)> =
            sqlx::query_as("SELECT version, applied_at FROM schema_migrations ORDER BY version")
                .fetch_all(&pool)
                .await
                .unwrap();

        let version = migrate(&pool).await.unwrap();
        assert_eq!(version, MIGRATIONS.last().unwrap().version);

        let after: Vec<(i64, String)> =
            sqlx::query_as("SELECT version, applied_at FROM schema_migrations ORDER BY version")
                .fetch_all(&pool)
                .await
                .unwrap();
        // No re-application: rows unchanged, timestamps included.
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn schema_version_reports_zero_before_migrating() {
        let pool = memory_pool().await;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                description TEXT NOT NULL,
                applied_at TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await
        .unwrap();
        assert_eq!(schema_version(&pool).await.unwrap(), 0);
    }
}
