use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Row, Sqlite};

use crate::dead_letter::{DeadLetterEntry, DeadLetterSink};
use crate::error::EngineError;
use crate::storage::StateStore;

/// Key/value state store on a SQLite table.
#[derive(Clone)]
pub struct SqliteStateStore {
    pub pool: Pool<Sqlite>,
}

impl SqliteStateStore {
    pub async fn new(database_url: &str) -> Result<Self, EngineError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn with_pool(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn init(&self) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, EngineError> {
        let row = sqlx::query("SELECT value FROM kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| row.get(0)))
    }

    async fn put(&self, key: &str, value: String) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            INSERT INTO kv (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: String,
    ) -> Result<bool, EngineError> {
        let result = match expected {
            None => {
                sqlx::query("INSERT OR IGNORE INTO kv (key, value) VALUES (?, ?)")
                    .bind(key)
                    .bind(new)
                    .execute(&self.pool)
                    .await?
            }
            Some(expected) => {
                sqlx::query(
                    r#"
                    UPDATE kv
                    SET value = ?, updated_at = CURRENT_TIMESTAMP
                    WHERE key = ? AND value = ?
                    "#,
                )
                .bind(new)
                .bind(key)
                .bind(expected)
                .execute(&self.pool)
                .await?
            }
        };
        Ok(result.rows_affected() == 1)
    }
}

/// Append-only dead-letter table. The idempotency key is the primary key, so
/// a second write for the same task is ignored.
#[derive(Clone)]
pub struct SqliteDeadLetterSink {
    pool: Pool<Sqlite>,
}

impl SqliteDeadLetterSink {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    pub async fn init(&self) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS dead_letters (
                idempotency_key TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                enqueued_at INTEGER NOT NULL,
                entry TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS dead_letters_kind_time ON dead_letters (kind, enqueued_at)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl DeadLetterSink for SqliteDeadLetterSink {
    async fn write(&self, entry: DeadLetterEntry) -> Result<(), EngineError> {
        let document = serde_json::to_string(&entry)?;
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO dead_letters (idempotency_key, kind, enqueued_at, entry)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&entry.idempotency_key)
        .bind(&entry.spec.kind)
        .bind(entry.enqueued_at.timestamp_millis())
        .bind(document)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn query(
        &self,
        kind: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DeadLetterEntry>, EngineError> {
        let rows = sqlx::query(
            r#"
            SELECT entry
            FROM dead_letters
            WHERE kind = ? AND enqueued_at BETWEEN ? AND ?
            ORDER BY enqueued_at
            "#,
        )
        .bind(kind)
        .bind(from.timestamp_millis())
        .bind(to.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let document: String = row.get(0);
                Ok(serde_json::from_str(&document)?)
            })
            .collect()
    }
}
