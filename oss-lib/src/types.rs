use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub type GroupId = u16;

/// Health classification of a single chunk server replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkServerStatus {
    ReadWrite,
    ReadOnly,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GlobalStatus {
    Normal,
    Migrating,
}

impl Default for GlobalStatus {
    fn default() -> Self {
        GlobalStatus::Normal
    }
}

/// One replica process as reported by the chunkmaster route table.
/// Identity is (host, port); every other field is dynamic and changes
/// between polls without counting as topology churn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkServer {
    pub host: String,
    pub port: u16,
    pub group_id: GroupId,
    pub status: ChunkServerStatus,
    #[serde(default)]
    pub global_status: GlobalStatus,
    pub max_free_space: i64,
    #[serde(default)]
    pub pending_writes: i64,
    #[serde(default)]
    pub writing_count: i64,
}

impl ChunkServer {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn is_read_write(&self) -> bool {
        self.status == ChunkServerStatus::ReadWrite
    }
}

/// group id -> replica set, rebuilt from scratch on every route poll and
/// swapped in atomically. Never mutated in place while shared.
pub type ChunkServerGroups = HashMap<GroupId, Vec<ChunkServer>>;
