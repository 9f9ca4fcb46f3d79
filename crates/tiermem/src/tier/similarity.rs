//! Similarity tier (L4)
//!
//! LanceDB table keyed by `(namespace, key)` with a fixed-size embedding
//! column. It is populated only with entries that carry an embedding and are
//! tagged searchable, and sits outside the plain-key promotion chain.

use std::path::Path;
use std::sync::Arc;

use arrow_array::{
    Array, BinaryArray, FixedSizeListArray, Float32Array, Int64Array, RecordBatch,
    RecordBatchIterator, StringArray, TimestampMicrosecondArray,
};
use arrow_schema::{DataType, Field, Schema, TimeUnit};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use lancedb::Table;
use lancedb::connection::Connection;
use lancedb::query::{ExecutableQuery, QueryBase};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::filter::{SearchFilter, escape_sql};
use super::{
    EvictionHint, EvictionPolicy, ScoredEntry, SimilarityStore, TierDescriptor, TierStats,
    TierStore, check_sequence,
};
use crate::error::{MemoryError, Result};
use crate::memory::types::{Durability, EntryKey, MemoryEntry, Metadata, TierId, TierMask};

pub const DEFAULT_TABLE: &str = "memory_vectors";
pub const DEFAULT_DIMENSION: usize = 384;

pub struct SimilarityTier {
    connection: Connection,
    table: Table,
    descriptor: TierDescriptor,
    dimension: usize,
    overfetch: usize,
    /// Upserts are delete-then-add; serialize them
    write_lock: Mutex<()>,
}

impl SimilarityTier {
    /// Open the table at `path`, creating it when missing
    pub async fn open(
        path: &Path,
        table_name: &str,
        descriptor: TierDescriptor,
        dimension: usize,
        overfetch: usize,
    ) -> Result<Self> {
        if dimension == 0 {
            return Err(MemoryError::Config(
                "Embedding dimension must be positive".to_string(),
            ));
        }
        let uri = path
            .to_str()
            .ok_or_else(|| MemoryError::Storage("Invalid path encoding".to_string()))?;

        let connection = lancedb::connect(uri)
            .execute()
            .await
            .map_err(|e| MemoryError::Storage(format!("Failed to connect to LanceDB: {e}")))?;

        let names = connection
            .table_names()
            .execute()
            .await
            .map_err(|e| MemoryError::Storage(format!("Failed to list tables: {e}")))?;

        let table = if names.iter().any(|n| n == table_name) {
            debug!("Opening existing {table_name} table");
            connection
                .open_table(table_name)
                .execute()
                .await
                .map_err(|e| MemoryError::Storage(format!("Failed to open {table_name}: {e}")))?
        } else {
            info!("Creating {table_name} table (dimension {dimension})");
            let schema = Self::schema(dimension)?;
            let batch = Self::entries_to_batch(&[], schema.clone(), dimension)?;
            let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);
            connection
                .create_table(table_name, Box::new(batches))
                .execute()
                .await
                .map_err(|e| MemoryError::Storage(format!("Failed to create {table_name}: {e}")))?
        };

        Ok(Self {
            connection,
            table,
            descriptor,
            dimension,
            overfetch: overfetch.max(1),
            write_lock: Mutex::new(()),
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    fn schema(dimension: usize) -> Result<Arc<Schema>> {
        let dim = i32::try_from(dimension)
            .map_err(|_| MemoryError::Config(format!("Embedding dimension {dimension} too large")))?;
        Ok(Arc::new(Schema::new(vec![
            Field::new("namespace", DataType::Utf8, false),
            Field::new("key", DataType::Utf8, false),
            Field::new("value", DataType::Binary, false),
            Field::new("metadata", DataType::Utf8, false),
            Field::new(
                "embedding",
                DataType::FixedSizeList(Arc::new(Field::new("item", DataType::Float32, true)), dim),
                false,
            ),
            Field::new(
                "created_at",
                DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
                false,
            ),
            Field::new(
                "last_accessed_at",
                DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
                false,
            ),
            Field::new("access_count", DataType::Int64, false),
            Field::new("expires_at", DataType::Int64, true),
            Field::new("write_sequence", DataType::Int64, false),
            Field::new("durability", DataType::Utf8, false),
        ])))
    }

    fn check_embedding(&self, embedding: &[f32]) -> Result<()> {
        if embedding.len() != self.dimension {
            return Err(MemoryError::InvalidInput(format!(
                "Embedding has {} dimensions, expected {}",
                embedding.len(),
                self.dimension
            )));
        }
        Ok(())
    }

    fn entries_to_batch(
        entries: &[MemoryEntry],
        schema: Arc<Schema>,
        dimension: usize,
    ) -> Result<RecordBatch> {
        let dim = i32::try_from(dimension)
            .map_err(|_| MemoryError::Config(format!("Embedding dimension {dimension} too large")))?;

        let namespaces: Vec<&str> = entries.iter().map(|e| e.key.namespace.as_str()).collect();
        let keys: Vec<&str> = entries.iter().map(|e| e.key.key.as_str()).collect();
        let values: Vec<&[u8]> = entries.iter().map(|e| e.value.as_ref()).collect();
        let metadata: Vec<String> = entries
            .iter()
            .map(|e| serde_json::to_string(&e.metadata))
            .collect::<std::result::Result<_, _>>()?;
        let metadata_refs: Vec<&str> = metadata.iter().map(String::as_str).collect();

        let embeddings: Vec<Option<Vec<Option<f32>>>> = entries
            .iter()
            .map(|e| {
                e.embedding
                    .as_ref()
                    .map(|v| v.iter().map(|&x| Some(x)).collect())
            })
            .collect();

        let created_at: Vec<i64> = entries.iter().map(|e| e.created_at.timestamp_micros()).collect();
        let last_accessed: Vec<i64> = entries
            .iter()
            .map(|e| e.last_accessed_at.timestamp_micros())
            .collect();
        let access_counts: Vec<i64> = entries
            .iter()
            .map(|e| i64::try_from(e.access_count).unwrap_or(i64::MAX))
            .collect();
        let expires_at: Vec<Option<i64>> = entries
            .iter()
            .map(|e| e.ttl.map(|t| t.timestamp_micros()))
            .collect();
        let sequences: Vec<i64> = entries
            .iter()
            .map(|e| {
                i64::try_from(e.sequence).map_err(|_| {
                    MemoryError::InvalidInput(format!("Sequence {} out of range", e.sequence))
                })
            })
            .collect::<Result<_>>()?;
        let durability: Vec<&str> = entries.iter().map(|e| e.durability.as_str()).collect();

        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(namespaces)),
                Arc::new(StringArray::from(keys)),
                Arc::new(BinaryArray::from(values)),
                Arc::new(StringArray::from(metadata_refs)),
                Arc::new(FixedSizeListArray::from_iter_primitive::<
                    arrow_array::types::Float32Type,
                    _,
                    _,
                >(embeddings, dim)),
                Arc::new(TimestampMicrosecondArray::from(created_at).with_timezone("UTC")),
                Arc::new(TimestampMicrosecondArray::from(last_accessed).with_timezone("UTC")),
                Arc::new(Int64Array::from(access_counts)),
                Arc::new(Int64Array::from(expires_at)),
                Arc::new(Int64Array::from(sequences)),
                Arc::new(StringArray::from(durability)),
            ],
        )
        .map_err(|e| MemoryError::Storage(format!("Failed to create RecordBatch: {e}")))
    }

    fn batch_to_entry(batch: &RecordBatch, row: usize) -> Result<MemoryEntry> {
        let namespace = column::<StringArray>(batch, "namespace")?.value(row);
        let key = column::<StringArray>(batch, "key")?.value(row);
        let value = column::<BinaryArray>(batch, "value")?.value(row);
        let metadata: Metadata =
            serde_json::from_str(column::<StringArray>(batch, "metadata")?.value(row))?;

        let embedding_list = column::<FixedSizeListArray>(batch, "embedding")?.value(row);
        let embedding = embedding_list
            .as_any()
            .downcast_ref::<Float32Array>()
            .ok_or_else(|| MemoryError::Storage("Failed to read embedding values".to_string()))?
            .values()
            .to_vec();

        let created_at = column::<TimestampMicrosecondArray>(batch, "created_at")?.value(row);
        let last_accessed =
            column::<TimestampMicrosecondArray>(batch, "last_accessed_at")?.value(row);
        let access_count = column::<Int64Array>(batch, "access_count")?.value(row);
        let expires = column::<Int64Array>(batch, "expires_at")?;
        let expires_at = (!expires.is_null(row)).then(|| expires.value(row));
        let sequence = column::<Int64Array>(batch, "write_sequence")?.value(row);
        let durability = column::<StringArray>(batch, "durability")?.value(row);

        Ok(MemoryEntry {
            key: EntryKey::new(namespace, key),
            value: Bytes::copy_from_slice(value),
            embedding: Some(embedding),
            metadata,
            created_at: from_micros(created_at)?,
            last_accessed_at: from_micros(last_accessed)?,
            access_count: u64::try_from(access_count).unwrap_or_default(),
            ttl: expires_at.map(from_micros).transpose()?,
            sequence: u64::try_from(sequence).unwrap_or_default(),
            durability: Durability::parse(durability).unwrap_or_default(),
            tier_mask: TierMask::empty().with(TierId::L4),
        })
    }

    async fn collect_entries(&self, predicate: String, limit: Option<usize>) -> Result<Vec<MemoryEntry>> {
        let mut query = self.table.query().only_if(predicate);
        if let Some(limit) = limit {
            query = query.limit(limit);
        }
        let stream = query
            .execute()
            .await
            .map_err(|e| MemoryError::Storage(format!("Failed to query vectors: {e}")))?;
        let batches: Vec<RecordBatch> = stream
            .try_collect()
            .await
            .map_err(|e| MemoryError::Storage(format!("Failed to collect query results: {e}")))?;

        let mut entries = Vec::new();
        for batch in &batches {
            for row in 0..batch.num_rows() {
                entries.push(Self::batch_to_entry(batch, row)?);
            }
        }
        Ok(entries)
    }

    async fn delete_where(&self, predicate: &str) -> Result<()> {
        self.table
            .delete(predicate)
            .await
            .map_err(|e| MemoryError::Storage(format!("Failed to delete vectors: {e}")))?;
        Ok(())
    }
}

fn key_predicate(key: &EntryKey) -> String {
    format!(
        "namespace = '{}' AND key = '{}'",
        escape_sql(&key.namespace),
        escape_sql(&key.key)
    )
}

fn column<'a, T: 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<T>())
        .ok_or_else(|| MemoryError::Storage(format!("Failed to get {name} column")))
}

fn from_micros(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| MemoryError::Serialization(format!("Invalid timestamp: {micros}")))
}

#[async_trait]
impl TierStore for SimilarityTier {
    fn descriptor(&self) -> &TierDescriptor {
        &self.descriptor
    }

    async fn get(&self, key: &EntryKey) -> Result<Option<MemoryEntry>> {
        let mut entries = self.collect_entries(key_predicate(key), Some(1)).await?;
        Ok(entries.pop())
    }

    async fn set(&self, entry: &MemoryEntry) -> Result<()> {
        let embedding = entry.embedding.as_deref().ok_or_else(|| {
            MemoryError::InvalidInput(format!("{} has no embedding", entry.key))
        })?;
        self.check_embedding(embedding)?;

        let _guard = self.write_lock.lock().await;
        let predicate = key_predicate(&entry.key);
        let stored = self
            .collect_entries(predicate.clone(), Some(1))
            .await?
            .first()
            .map(|e| e.sequence);
        check_sequence(&entry.key, stored, entry.sequence)?;

        let schema = Self::schema(self.dimension)?;
        let batch = Self::entries_to_batch(std::slice::from_ref(entry), schema.clone(), self.dimension)?;
        let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);

        if stored.is_some() {
            self.delete_where(&predicate).await?;
        }
        self.table
            .add(Box::new(batches))
            .execute()
            .await
            .map_err(|e| MemoryError::Storage(format!("Failed to insert vector: {e}")))?;
        Ok(())
    }

    async fn delete(&self, key: &EntryKey) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let predicate = key_predicate(key);
        let exists = self
            .table
            .count_rows(Some(predicate.clone()))
            .await
            .map_err(|e| MemoryError::Storage(format!("Failed to count vectors: {e}")))?
            > 0;
        if exists {
            self.delete_where(&predicate).await?;
        }
        Ok(exists)
    }

    async fn exists(&self, key: &EntryKey) -> Result<bool> {
        let count = self
            .table
            .count_rows(Some(key_predicate(key)))
            .await
            .map_err(|e| MemoryError::Storage(format!("Failed to count vectors: {e}")))?;
        Ok(count > 0)
    }

    async fn approximate_size(&self) -> Result<TierStats> {
        let count = self
            .table
            .count_rows(None)
            .await
            .map_err(|e| MemoryError::Storage(format!("Failed to count vectors: {e}")))?;
        Ok(TierStats {
            entries: count as u64,
            bytes: (count * self.dimension * 4) as u64,
            evictions: 0,
        })
    }

    /// Drops ephemeral vectors, oldest access first
    async fn evict(&self, hint: EvictionHint) -> Result<Vec<EntryKey>> {
        if hint.policy == EvictionPolicy::None || hint.max_keys == 0 {
            return Ok(Vec::new());
        }
        let _guard = self.write_lock.lock().await;
        let mut candidates = self
            .collect_entries(
                format!("durability = '{}'", Durability::Ephemeral.as_str()),
                None,
            )
            .await?;
        match hint.policy {
            EvictionPolicy::Lfu => {
                candidates.sort_by_key(|e| (e.access_count, e.last_accessed_at));
            }
            _ => candidates.sort_by_key(|e| e.last_accessed_at),
        }

        let mut evicted = Vec::new();
        for entry in candidates.into_iter().take(hint.max_keys) {
            self.delete_where(&key_predicate(&entry.key)).await?;
            evicted.push(entry.key);
        }
        Ok(evicted)
    }

    async fn purge_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<EntryKey>> {
        let now = now.timestamp_micros();
        let _guard = self.write_lock.lock().await;
        let expired = self
            .collect_entries(
                format!("expires_at IS NOT NULL AND expires_at <= {now}"),
                Some(limit),
            )
            .await?;

        let mut purged = Vec::with_capacity(expired.len());
        for entry in expired {
            self.delete_where(&format!(
                "{} AND expires_at <= {now}",
                key_predicate(&entry.key)
            ))
            .await?;
            purged.push(entry.key);
        }
        Ok(purged)
    }
}

#[async_trait]
impl SimilarityStore for SimilarityTier {
    async fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<ScoredEntry>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        self.check_embedding(query)?;

        let fetch = k.saturating_mul(self.overfetch);
        let mut vector_query = self
            .table
            .query()
            .nearest_to(query)
            .map_err(|e| MemoryError::Storage(format!("Failed to create vector query: {e}")))?
            .limit(fetch);

        if let Some(sql_filter) = filter.to_sql_clause() {
            vector_query = vector_query.only_if(sql_filter);
        }

        let stream = vector_query
            .execute()
            .await
            .map_err(|e| MemoryError::Storage(format!("Failed to execute search: {e}")))?;
        let batches: Vec<RecordBatch> = stream
            .try_collect()
            .await
            .map_err(|e| MemoryError::Storage(format!("Failed to collect search results: {e}")))?;

        let mut hits = Vec::new();
        for batch in &batches {
            let distances = column::<Float32Array>(batch, "_distance")?;
            for row in 0..batch.num_rows() {
                let entry = Self::batch_to_entry(batch, row)?;
                let distance = distances.value(row);
                if filter.matches(&entry, distance) {
                    hits.push(ScoredEntry { entry, distance });
                }
            }
        }

        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        hits.truncate(k);
        Ok(hits)
    }
}
