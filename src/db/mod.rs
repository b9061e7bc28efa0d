//! Download-intent queue storage
//!
//! Discovered payload locations are appended to a SQLite table and picked up
//! by an external downloader. Sessions never wait on the database: they push
//! through [`DownloadQueue`], which the write buffer implements.

mod schema;
pub mod write_buffer;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Pool, Sqlite, SqlitePool};
use thiserror::Error;

use crate::config::QueueConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Url,
    IpPath,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Url => "url",
            ResourceKind::IpPath => "ip_path",
        }
    }
}

/// A resource found in attacker input, waiting to be downloaded
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub resource: String,
    pub kind: ResourceKind,
    pub source_ip: String,
    pub session_id: String,
    pub discovered_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("download queue writer has shut down")]
    Closed,
}

/// Fire-and-forget sink for discovered resources.
pub trait DownloadQueue: Send + Sync {
    fn push(&self, entry: QueueEntry) -> Result<(), QueueError>;
}

#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
    channel: String,
}

impl Database {
    pub async fn new(config: &QueueConfig) -> Result<Self> {
        let pool = if config.url == ":memory:" {
            // Every connection would get its own empty in-memory database
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect("sqlite::memory:")
                .await?
        } else {
            SqlitePool::connect(&format!("sqlite:{}?mode=rwc", config.url)).await?
        };
        Ok(Self {
            pool,
            channel: config.channel.clone(),
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub async fn run_migrations(&self) -> Result<()> {
        // Enable WAL mode so the downloader can read while we write
        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&self.pool)
            .await?;
        sqlx::query("PRAGMA synchronous=NORMAL")
            .execute(&self.pool)
            .await?;

        sqlx::query(schema::CREATE_QUEUE_TABLE)
            .execute(&self.pool)
            .await?;
        sqlx::query(schema::CREATE_INDEX_CHANNEL_TS)
            .execute(&self.pool)
            .await?;
        sqlx::query(schema::CREATE_INDEX_SOURCE_IP)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Insert a batch in one transaction
    pub async fn batch_insert_entries(&self, entries: &[QueueEntry]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for entry in entries {
            sqlx::query(
                r#"
                INSERT INTO download_queue (channel, resource, kind, source_ip, session_id, discovered_at)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&self.channel)
            .bind(&entry.resource)
            .bind(entry.kind.as_str())
            .bind(&entry.source_ip)
            .bind(&entry.session_id)
            .bind(entry.discovered_at.timestamp_millis())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn pending_count(&self) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM download_queue WHERE channel = ?")
            .bind(&self.channel)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }
}

#[cfg(test)]
pub(crate) async fn memory_database(channel: &str) -> Database {
    let config = QueueConfig {
        url: ":memory:".to_string(),
        channel: channel.to_string(),
    };
    let db = Database::new(&config).await.unwrap();
    db.run_migrations().await.unwrap();
    db
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(resource: &str, kind: ResourceKind) -> QueueEntry {
        QueueEntry {
            resource: resource.to_string(),
            kind,
            source_ip: "192.0.2.1".to_string(),
            session_id: "s-1".to_string(),
            discovered_at: Utc::now(),
        }
    }

    /// (resource, kind, session_id) rows in insertion order
    async fn stored_rows(db: &Database) -> Vec<(String, String, String)> {
        sqlx::query_as(
            "SELECT resource, kind, session_id FROM download_queue WHERE channel = ? ORDER BY id",
        )
        .bind(&db.channel)
        .fetch_all(&db.pool)
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let db = memory_database("download_queue").await;
        db.run_migrations().await.unwrap();
        assert_eq!(db.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn batch_insert_keeps_fields_and_order() {
        let db = memory_database("download_queue").await;
        db.batch_insert_entries(&[
            entry("http://example.com/a.sh", ResourceKind::Url),
            entry("203.0.113.5/update.sh", ResourceKind::IpPath),
        ])
        .await
        .unwrap();

        assert_eq!(db.pending_count().await.unwrap(), 2);
        assert_eq!(
            stored_rows(&db).await,
            vec![
                (
                    "http://example.com/a.sh".to_string(),
                    "url".to_string(),
                    "s-1".to_string()
                ),
                (
                    "203.0.113.5/update.sh".to_string(),
                    "ip_path".to_string(),
                    "s-1".to_string()
                ),
            ]
        );
    }

    #[tokio::test]
    async fn empty_batch_is_a_no_op() {
        let db = memory_database("download_queue").await;
        db.batch_insert_entries(&[]).await.unwrap();
        assert_eq!(db.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn entries_are_scoped_to_the_channel() {
        let db = memory_database("download_queue").await;
        db.batch_insert_entries(&[entry("http://example.com/a.sh", ResourceKind::Url)])
            .await
            .unwrap();

        let other = Database {
            pool: db.pool.clone(),
            channel: "other".to_string(),
        };
        assert_eq!(other.pending_count().await.unwrap(), 0);
        assert!(stored_rows(&other).await.is_empty());
        assert_eq!(db.pending_count().await.unwrap(), 1);
    }
}
