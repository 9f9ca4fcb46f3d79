//! Durable tier (L3)
//!
//! SQLite via sqlx. This is the authoritative copy of every entry. Writes
//! are single upsert statements guarded by the stored write sequence, so a
//! stale write never lands even without holding a transaction open across
//! a read. Batches run inside one transaction.

use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite, SqliteConnection};
use tracing::{debug, info};

use super::{EvictionHint, EvictionPolicy, TierDescriptor, TierStats, TierStore};
use crate::error::{MemoryError, Result};
use crate::memory::types::{Durability, EntryKey, MemoryEntry, Metadata, TierId, TierMask};

const UPSERT_SQL: &str = r#"
    INSERT INTO memory_entries (
        namespace, key, value, embedding, metadata, created_at, last_accessed_at,
        access_count, expires_at, write_sequence, durability
    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT(namespace, key) DO UPDATE SET
        value = excluded.value,
        embedding = excluded.embedding,
        metadata = excluded.metadata,
        last_accessed_at = MAX(memory_entries.last_accessed_at, excluded.last_accessed_at),
        access_count = MAX(memory_entries.access_count, excluded.access_count),
        expires_at = excluded.expires_at,
        write_sequence = excluded.write_sequence,
        durability = excluded.durability
    WHERE excluded.write_sequence >= memory_entries.write_sequence
"#;

pub struct DurableTier {
    pool: Pool<Sqlite>,
    descriptor: TierDescriptor,
    evictions: AtomicU64,
}

impl DurableTier {
    /// Connect using a sqlx SQLite url such as `sqlite://data/tiermem.db`
    pub async fn connect(url: &str, descriptor: TierDescriptor, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| MemoryError::Config(format!("Invalid database url {url}: {e}")))?;
        Self::with_options(options, descriptor, max_connections).await
    }

    /// Open (or create) a database file
    pub async fn open(path: &Path, descriptor: TierDescriptor) -> Result<Self> {
        let options = SqliteConnectOptions::new().filename(path);
        Self::with_options(options, descriptor, 5).await
    }

    async fn with_options(
        options: SqliteConnectOptions,
        descriptor: TierDescriptor,
        max_connections: u32,
    ) -> Result<Self> {
        let options = options
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(descriptor.timeout.max(Duration::from_millis(100)))
            .connect_with(options)
            .await
            .map_err(|e| MemoryError::Storage(format!("Failed to open durable store: {e}")))?;

        let tier = Self {
            pool,
            descriptor,
            evictions: AtomicU64::new(0),
        };
        tier.initialize_schema().await?;
        Ok(tier)
    }

    async fn initialize_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS memory_entries (
                namespace TEXT NOT NULL,
                key TEXT NOT NULL,
                value BLOB NOT NULL,
                embedding TEXT,
                metadata TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                last_accessed_at INTEGER NOT NULL,
                access_count INTEGER NOT NULL DEFAULT 0,
                expires_at INTEGER,
                write_sequence INTEGER NOT NULL,
                durability TEXT NOT NULL,
                PRIMARY KEY (namespace, key)
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx("Failed to create memory_entries table", e))?;

        let indexes = [
            "CREATE INDEX IF NOT EXISTS idx_entries_expires ON memory_entries(expires_at) WHERE expires_at IS NOT NULL;",
            "CREATE INDEX IF NOT EXISTS idx_entries_accessed ON memory_entries(last_accessed_at);",
        ];
        for index_sql in indexes {
            sqlx::query(index_sql)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx("Failed to create index", e))?;
        }

        info!("Durable tier schema initialized");
        Ok(())
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn stored_sequence(conn: &mut SqliteConnection, key: &EntryKey) -> Result<Option<u64>> {
        let seq: Option<i64> = sqlx::query_scalar(
            "SELECT write_sequence FROM memory_entries WHERE namespace = ? AND key = ?",
        )
        .bind(&key.namespace)
        .bind(&key.key)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| map_sqlx("Failed to read write sequence", e))?;
        Ok(seq.map(from_i64))
    }

    async fn upsert(conn: &mut SqliteConnection, entry: &MemoryEntry) -> Result<()> {
        let embedding = entry
            .embedding
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let metadata = serde_json::to_string(&entry.metadata)?;

        let result = sqlx::query(UPSERT_SQL)
            .bind(&entry.key.namespace)
            .bind(&entry.key.key)
            .bind(entry.value.as_ref())
            .bind(embedding)
            .bind(metadata)
            .bind(entry.created_at.timestamp_micros())
            .bind(entry.last_accessed_at.timestamp_micros())
            .bind(to_i64(entry.access_count)?)
            .bind(entry.ttl.map(|t| t.timestamp_micros()))
            .bind(to_i64(entry.sequence)?)
            .bind(entry.durability.as_str())
            .execute(&mut *conn)
            .await
            .map_err(|e| map_sqlx("Failed to write entry", e))?;

        if result.rows_affected() == 0 {
            let stored = Self::stored_sequence(conn, &entry.key).await?.unwrap_or_default();
            return Err(MemoryError::StaleWriteRejected {
                key: entry.key.to_string(),
                stored,
                attempted: entry.sequence,
            });
        }
        Ok(())
    }

    fn touch_in_background(&self, key: &EntryKey) {
        let pool = self.pool.clone();
        let key = key.clone();
        tokio::spawn(async move {
            let now = Utc::now().timestamp_micros();
            let result = sqlx::query(
                "UPDATE memory_entries SET last_accessed_at = MAX(last_accessed_at, ?), access_count = access_count + 1 WHERE namespace = ? AND key = ?",
            )
            .bind(now)
            .bind(&key.namespace)
            .bind(&key.key)
            .execute(&pool)
            .await;
            if let Err(e) = result {
                debug!(key = %key, "Failed to update access time: {e}");
            }
        });
    }
}

#[async_trait]
impl TierStore for DurableTier {
    fn descriptor(&self) -> &TierDescriptor {
        &self.descriptor
    }

    async fn get(&self, key: &EntryKey) -> Result<Option<MemoryEntry>> {
        let row = sqlx::query("SELECT * FROM memory_entries WHERE namespace = ? AND key = ?")
            .bind(&key.namespace)
            .bind(&key.key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx("Failed to read entry", e))?;

        match row {
            Some(row) => {
                let entry = row_to_entry(&row)?;
                self.touch_in_background(key);
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    async fn set(&self, entry: &MemoryEntry) -> Result<()> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx("Failed to acquire connection", e))?;
        Self::upsert(&mut *conn, entry).await
    }

    async fn set_many(&self, entries: &[MemoryEntry]) -> Vec<Result<()>> {
        let mut tx = match self.pool.begin().await {
            Ok(tx) => tx,
            Err(e) => {
                let message = e.to_string();
                return entries
                    .iter()
                    .map(|_| Err(map_message("Failed to begin transaction", &message)))
                    .collect();
            }
        };

        let mut results = Vec::with_capacity(entries.len());
        for entry in entries {
            results.push(Self::upsert(&mut *tx, entry).await);
        }

        if let Err(e) = tx.commit().await {
            let message = e.to_string();
            return entries
                .iter()
                .map(|_| Err(map_message("Failed to commit batch", &message)))
                .collect();
        }
        results
    }

    async fn delete(&self, key: &EntryKey) -> Result<bool> {
        let result = sqlx::query("DELETE FROM memory_entries WHERE namespace = ? AND key = ?")
            .bind(&key.namespace)
            .bind(&key.key)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx("Failed to delete entry", e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn exists(&self, key: &EntryKey) -> Result<bool> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM memory_entries WHERE namespace = ? AND key = ?")
                .bind(&key.namespace)
                .bind(&key.key)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| map_sqlx("Failed to check entry", e))?;
        Ok(found.is_some())
    }

    async fn approximate_size(&self) -> Result<TierStats> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS entries, COALESCE(SUM(LENGTH(value)), 0) AS bytes FROM memory_entries",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx("Failed to count entries", e))?;

        let entries: i64 = row.try_get("entries").map_err(|e| map_sqlx("entries", e))?;
        let bytes: i64 = row.try_get("bytes").map_err(|e| map_sqlx("bytes", e))?;
        Ok(TierStats {
            entries: from_i64(entries),
            bytes: from_i64(bytes),
            evictions: self.evictions.load(Ordering::Relaxed),
        })
    }

    /// Only ephemeral entries are ever evicted from the durable tier
    async fn evict(&self, hint: EvictionHint) -> Result<Vec<EntryKey>> {
        let order = match hint.policy {
            EvictionPolicy::Lru => "last_accessed_at ASC",
            EvictionPolicy::Lfu => "access_count ASC, last_accessed_at ASC",
            EvictionPolicy::None => return Ok(Vec::new()),
        };
        let limit = i64::try_from(hint.max_keys).unwrap_or(i64::MAX);

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx("Failed to begin eviction", e))?;
        let rows = sqlx::query(&format!(
            "SELECT namespace, key FROM memory_entries WHERE durability = ? ORDER BY {order} LIMIT ?"
        ))
        .bind(Durability::Ephemeral.as_str())
        .bind(limit)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx("Failed to select eviction candidates", e))?;

        let mut evicted = Vec::with_capacity(rows.len());
        for row in rows {
            let key = row_to_key(&row)?;
            sqlx::query("DELETE FROM memory_entries WHERE namespace = ? AND key = ? AND durability = ?")
                .bind(&key.namespace)
                .bind(&key.key)
                .bind(Durability::Ephemeral.as_str())
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx("Failed to evict entry", e))?;
            evicted.push(key);
        }
        tx.commit()
            .await
            .map_err(|e| map_sqlx("Failed to commit eviction", e))?;

        self.evictions.fetch_add(evicted.len() as u64, Ordering::Relaxed);
        Ok(evicted)
    }

    async fn purge_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<EntryKey>> {
        let now = now.timestamp_micros();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx("Failed to begin purge", e))?;
        let rows = sqlx::query(
            "SELECT namespace, key FROM memory_entries WHERE expires_at IS NOT NULL AND expires_at <= ? LIMIT ?",
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx("Failed to select expired entries", e))?;

        let mut purged = Vec::with_capacity(rows.len());
        for row in rows {
            let key = row_to_key(&row)?;
            sqlx::query(
                "DELETE FROM memory_entries WHERE namespace = ? AND key = ? AND expires_at <= ?",
            )
            .bind(&key.namespace)
            .bind(&key.key)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx("Failed to purge entry", e))?;
            purged.push(key);
        }
        tx.commit()
            .await
            .map_err(|e| map_sqlx("Failed to commit purge", e))?;
        Ok(purged)
    }
}

fn row_to_key(row: &SqliteRow) -> Result<EntryKey> {
    let namespace: String = row.try_get("namespace").map_err(|e| map_sqlx("namespace", e))?;
    let key: String = row.try_get("key").map_err(|e| map_sqlx("key", e))?;
    Ok(EntryKey::new(namespace, key))
}

fn row_to_entry(row: &SqliteRow) -> Result<MemoryEntry> {
    let key = row_to_key(row)?;
    let value: Vec<u8> = row.try_get("value").map_err(|e| map_sqlx("value", e))?;
    let embedding: Option<String> = row.try_get("embedding").map_err(|e| map_sqlx("embedding", e))?;
    let metadata: String = row.try_get("metadata").map_err(|e| map_sqlx("metadata", e))?;
    let created_at: i64 = row.try_get("created_at").map_err(|e| map_sqlx("created_at", e))?;
    let last_accessed_at: i64 = row
        .try_get("last_accessed_at")
        .map_err(|e| map_sqlx("last_accessed_at", e))?;
    let access_count: i64 = row.try_get("access_count").map_err(|e| map_sqlx("access_count", e))?;
    let expires_at: Option<i64> = row.try_get("expires_at").map_err(|e| map_sqlx("expires_at", e))?;
    let sequence: i64 = row
        .try_get("write_sequence")
        .map_err(|e| map_sqlx("write_sequence", e))?;
    let durability: String = row.try_get("durability").map_err(|e| map_sqlx("durability", e))?;

    let embedding: Option<Vec<f32>> = embedding.map(|e| serde_json::from_str(&e)).transpose()?;
    let metadata: Metadata = serde_json::from_str(&metadata)?;

    Ok(MemoryEntry {
        key,
        value: Bytes::from(value),
        embedding,
        metadata,
        created_at: from_micros(created_at)?,
        last_accessed_at: from_micros(last_accessed_at)?,
        access_count: from_i64(access_count),
        ttl: expires_at.map(from_micros).transpose()?,
        sequence: from_i64(sequence),
        durability: Durability::parse(&durability).ok_or_else(|| {
            MemoryError::Serialization(format!("Unknown durability class: {durability}"))
        })?,
        tier_mask: TierMask::empty().with(TierId::L3),
    })
}

fn from_micros(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| MemoryError::Serialization(format!("Invalid timestamp: {micros}")))
}

fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value)
        .map_err(|_| MemoryError::InvalidInput(format!("Value {value} exceeds durable range")))
}

fn from_i64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or_default()
}

/// Pool exhaustion and I/O failures mean the store is unreachable
fn map_sqlx(context: &str, e: sqlx::Error) -> MemoryError {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            MemoryError::unavailable(TierId::L3, format!("{context}: {e}"))
        }
        other => MemoryError::Storage(format!("{context}: {other}")),
    }
}

fn map_message(context: &str, message: &str) -> MemoryError {
    MemoryError::Storage(format!("{context}: {message}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open_tier() -> (TempDir, DurableTier) {
        let dir = tempfile::tempdir().unwrap();
        let tier = DurableTier::open(&dir.path().join("test.db"), TierDescriptor::new(TierId::L3))
            .await
            .unwrap();
        (dir, tier)
    }

    #[tokio::test]
    async fn test_conditional_upsert_keeps_created_at() {
        let (_dir, tier) = open_tier().await;
        let created = Utc::now() - chrono::Duration::hours(1);
        let first = MemoryEntry::new(EntryKey::from("a"), "one", 1, created);
        tier.set(&first).await.unwrap();

        let second = MemoryEntry::new(EntryKey::from("a"), "two", 2, Utc::now());
        tier.set(&second).await.unwrap();

        let stored = tier.get(&EntryKey::from("a")).await.unwrap().unwrap();
        assert_eq!(stored.value, Bytes::from_static(b"two"));
        assert_eq!(stored.sequence, 2);
        assert_eq!(stored.created_at.timestamp_micros(), created.timestamp_micros());
        assert!(stored.tier_mask.contains(TierId::L3));
    }

    #[tokio::test]
    async fn test_micro_conversions() {
        assert!(from_micros(0).is_ok());
        assert_eq!(from_i64(-1), 0);
        assert!(to_i64(u64::MAX).is_err());
    }
}
