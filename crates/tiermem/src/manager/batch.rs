//! Batch operations
//!
//! A batch runs as a sequence of groups. Consecutive operations of the same
//! kind on distinct keys share a group, so sets reach the durable tier in one
//! round trip while operations on the same key keep their relative order.

use std::collections::HashSet;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::memory::types::{Durability, EntryKey, MemoryEntry, Metadata};

/// Options for a write
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SetOptions {
    #[serde(default)]
    pub metadata: Metadata,
    /// Absolute expiry instant
    #[serde(default)]
    pub ttl: Option<DateTime<Utc>>,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub durability: Durability,
    /// Explicit write sequence; assigned by the manager when absent
    #[serde(default)]
    pub sequence: Option<u64>,
}

impl SetOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_ttl(mut self, ttl: DateTime<Utc>) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn with_durability(mut self, durability: Durability) -> Self {
        self.durability = durability;
        self
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }
}

/// Acknowledgement of a write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteAck {
    pub sequence: u64,
    /// False when acknowledged from the write-behind buffer
    pub durable: bool,
}

#[derive(Debug, Clone)]
pub enum Operation {
    Get {
        key: EntryKey,
    },
    Set {
        key: EntryKey,
        value: Bytes,
        options: SetOptions,
    },
    Delete {
        key: EntryKey,
    },
}

impl Operation {
    pub fn get(key: impl Into<EntryKey>) -> Self {
        Self::Get { key: key.into() }
    }

    pub fn set(key: impl Into<EntryKey>, value: impl Into<Bytes>) -> Self {
        Self::Set {
            key: key.into(),
            value: value.into(),
            options: SetOptions::default(),
        }
    }

    pub fn set_with(key: impl Into<EntryKey>, value: impl Into<Bytes>, options: SetOptions) -> Self {
        Self::Set {
            key: key.into(),
            value: value.into(),
            options,
        }
    }

    pub fn delete(key: impl Into<EntryKey>) -> Self {
        Self::Delete { key: key.into() }
    }

    pub fn key(&self) -> &EntryKey {
        match self {
            Self::Get { key } | Self::Set { key, .. } | Self::Delete { key } => key,
        }
    }

    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Get { .. } => OperationKind::Get,
            Self::Set { .. } => OperationKind::Set,
            Self::Delete { .. } => OperationKind::Delete,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Get,
    Set,
    Delete,
}

/// Per-operation result of a batch
#[derive(Debug, Clone)]
pub enum OpOutcome {
    Value(Option<MemoryEntry>),
    Written(WriteAck),
    Deleted(bool),
}

/// Indices of operations executed together
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub kind: OperationKind,
    pub indices: Vec<usize>,
}

pub fn plan_groups(ops: &[Operation]) -> Vec<Group> {
    let mut groups: Vec<Group> = Vec::new();
    let mut keys: HashSet<&EntryKey> = HashSet::new();

    for (index, op) in ops.iter().enumerate() {
        let joins = groups
            .last()
            .is_some_and(|g| g.kind == op.kind() && !keys.contains(op.key()));
        if joins {
            if let Some(group) = groups.last_mut() {
                group.indices.push(index);
            }
        } else {
            keys.clear();
            groups.push(Group {
                kind: op.kind(),
                indices: vec![index],
            });
        }
        keys.insert(op.key());
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_groups_consecutive_same_kind() {
        let ops = vec![
            Operation::set("a", "1"),
            Operation::set("b", "2"),
            Operation::get("a"),
            Operation::get("c"),
            Operation::delete("b"),
        ];
        let groups = plan_groups(&ops);
        assert_eq!(
            groups,
            vec![
                Group { kind: OperationKind::Set, indices: vec![0, 1] },
                Group { kind: OperationKind::Get, indices: vec![2, 3] },
                Group { kind: OperationKind::Delete, indices: vec![4] },
            ]
        );
    }

    #[test]
    fn test_repeated_key_splits_group() {
        let ops = vec![
            Operation::set("a", "1"),
            Operation::set("a", "2"),
            Operation::set("b", "3"),
        ];
        let groups = plan_groups(&ops);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].indices, vec![0]);
        assert_eq!(groups[1].indices, vec![1, 2]);
    }

    #[test]
    fn test_empty_batch() {
        assert!(plan_groups(&[]).is_empty());
    }

    #[test]
    fn test_set_options_builder() {
        let options = SetOptions::new()
            .with_tag("importance", "high")
            .with_sequence(7)
            .with_durability(Durability::Ephemeral);
        assert_eq!(options.sequence, Some(7));
        assert_eq!(options.metadata.get("importance").map(String::as_str), Some("high"));
        assert_eq!(options.durability, Durability::Ephemeral);
    }
}
