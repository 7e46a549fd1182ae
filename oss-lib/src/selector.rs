use crate::{
    ChunkServer, ChunkServerGroups, ChunkServerStatus, GlobalStatus, GroupId, OssError, OssResult,
};
use rand::Rng;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

/// Group-level fitness, folded from the member scan: capacity is bounded by
/// the weakest replica, load by the busiest one. Greater = fitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct GroupFitness {
    group_id: GroupId,
    min_free_space: i64,
    max_pending_writes: i64,
    max_writing_count: i64,
}

impl Ord for GroupFitness {
    fn cmp(&self, other: &Self) -> Ordering {
        self.min_free_space
            .cmp(&other.min_free_space)
            .then_with(|| other.max_pending_writes.cmp(&self.max_pending_writes))
            .then_with(|| other.max_writing_count.cmp(&self.max_writing_count))
            .then_with(|| self.group_id.cmp(&other.group_id))
    }
}

impl PartialOrd for GroupFitness {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

fn scan_group(group_id: GroupId, members: &[ChunkServer]) -> Option<(GroupFitness, usize)> {
    if members.is_empty() {
        return None;
    }
    let mut fitness = GroupFitness {
        group_id,
        min_free_space: i64::MAX,
        max_pending_writes: 0,
        max_writing_count: 0,
    };
    let mut rw_count = 0;
    for member in members {
        if member.global_status != GlobalStatus::Normal {
            return None;
        }
        match member.status {
            ChunkServerStatus::ReadWrite => rw_count += 1,
            ChunkServerStatus::Error => {}
            // a member in any other state puts the group in an unknown
            // condition, the whole group is skipped
            _ => return None,
        }
        fitness.min_free_space = fitness.min_free_space.min(member.max_free_space);
        fitness.max_pending_writes = fitness.max_pending_writes.max(member.pending_writes);
        fitness.max_writing_count = fitness.max_writing_count.max(member.writing_count);
    }
    Some((fitness, rw_count))
}

/// Pick a replication group for a write of `size` bytes. Qualifying groups
/// are ranked in a bounded min-heap (capacity `total/10 + 3`) by free space
/// then load, and one of the retained top-k is chosen uniformly at random
/// to spread concurrent writers across comparably fit groups.
pub fn select_group(
    groups: &ChunkServerGroups,
    size: i64,
    limit_num: usize,
) -> OssResult<Vec<ChunkServer>> {
    if size <= 0 {
        return Err(OssError::InvalidParam(format!(
            "invalid write size: {}",
            size
        )));
    }
    let top_k = groups.len() / 10 + 3;
    let mut heap: BinaryHeap<Reverse<GroupFitness>> = BinaryHeap::with_capacity(top_k + 1);
    for (group_id, members) in groups {
        let (fitness, rw_count) = match scan_group(*group_id, members) {
            Some(scanned) => scanned,
            None => continue,
        };
        if fitness.min_free_space <= size {
            continue;
        }
        if rw_count < limit_num {
            continue;
        }
        heap.push(Reverse(fitness));
        if heap.len() > top_k {
            // evict the least fit of the retained candidates
            heap.pop();
        }
    }
    if heap.is_empty() {
        return Err(OssError::NoAvailableGroup(format!(
            "no chunk server group fits a {} byte write",
            size
        )));
    }
    let candidates: Vec<GroupId> = heap.into_iter().map(|entry| entry.0.group_id).collect();
    let picked = candidates[rand::thread_rng().gen_range(0..candidates.len())];
    groups
        .get(&picked)
        .cloned()
        .ok_or_else(|| OssError::Internal(format!("group {} vanished during select", picked)))
}
