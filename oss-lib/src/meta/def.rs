use crate::GroupId;
use serde::{Deserialize, Serialize};

/// Placement record of one fragment: where in the file it sits and which
/// group/fid holds the bytes. Written once after all replicas acknowledge;
/// re-writing the same (path, index, range) key produces a new version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaInfoValue {
    pub index: u64,
    pub start: u64,
    pub end: u64,
    pub is_last: bool,
    pub fid: u64,
    pub group_id: GroupId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaInfo {
    pub path: String,
    pub value: MetaInfoValue,
}
