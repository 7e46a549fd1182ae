use crate::{
    ChunkMaster, ChunkServer, ChunkServerGroups, ConnPoolSet, FidAllocator, OssError, OssResult,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RouteConfig {
    /// Minimum ReadWrite replicas a group needs to take writes.
    pub limit_num: usize,
    /// Connection-pool capacity per chunk server.
    pub conn_pool_capacity: usize,
    /// Deadline on every transport dial/read/write.
    pub io_timeout: Duration,
    pub topology_interval: Duration,
    pub fid_interval: Duration,
    /// Background top-up kicks in below this many unused fids.
    pub fid_low_water: u64,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            limit_num: 2,
            conn_pool_capacity: 8,
            io_timeout: Duration::from_secs(10),
            topology_interval: Duration::from_secs(2),
            fid_interval: Duration::from_secs(2),
            fid_low_water: 1024,
        }
    }
}

/// One immutable topology + pool snapshot. Readers grab the Arc and work
/// against it; reconciliation publishes a whole new one.
pub struct RouteState {
    pub groups: ChunkServerGroups,
    pub pools: ConnPoolSet,
}

impl RouteState {
    fn empty() -> Self {
        Self {
            groups: ChunkServerGroups::new(),
            pools: ConnPoolSet::new(),
        }
    }
}

/// Owns the live routing state: topology snapshot, connection-pool set and
/// the fid allocator. Shared by request handlers and the background loops.
pub struct Coordinator {
    master: Arc<dyn ChunkMaster>,
    fid: FidAllocator,
    state: RwLock<Arc<RouteState>>,
    config: RouteConfig,
}

impl Coordinator {
    pub fn new(master: Arc<dyn ChunkMaster>, config: RouteConfig) -> Self {
        let fid = FidAllocator::new(config.fid_low_water, config.io_timeout);
        Self {
            master,
            fid,
            state: RwLock::new(Arc::new(RouteState::empty())),
            config,
        }
    }

    pub fn config(&self) -> &RouteConfig {
        &self.config
    }

    pub fn snapshot(&self) -> Arc<RouteState> {
        self.state.read().unwrap().clone()
    }

    pub async fn get_fid(&self) -> OssResult<u64> {
        self.fid.get_fid(self.master.as_ref()).await
    }

    /// Proactive fid top-up, shared with the 2s background loop.
    pub async fn refill_fid(&self) -> OssResult<bool> {
        self.fid.refill(self.master.as_ref(), true).await
    }

    /// Poll the master once and apply the route table.
    pub async fn refresh_route(&self) -> OssResult<()> {
        let groups = self.master.fetch_route().await?;
        self.reconcile(groups);
        Ok(())
    }

    /// Diff the incoming topology against the current one by host:port
    /// identity, build the next pool set reusing untouched pools, publish
    /// the new state atomically, and only then close removed pools.
    pub fn reconcile(&self, new_groups: ChunkServerGroups) {
        let current = self.snapshot();
        let mut new_addrs: HashSet<String> = HashSet::new();
        for members in new_groups.values() {
            for server in members {
                new_addrs.insert(server.addr());
            }
        }
        let old_addrs = current.pools.keys();
        let added: Vec<&String> = new_addrs.difference(&old_addrs).collect();
        let removed: Vec<&String> = old_addrs.difference(&new_addrs).collect();

        if added.is_empty() && removed.is_empty() {
            // membership unchanged: swap the snapshot, keep every pool
            let next = RouteState {
                groups: new_groups,
                pools: current.pools.clone(),
            };
            *self.state.write().unwrap() = Arc::new(next);
            return;
        }

        info!(
            "Coordinator: topology changed, {} added, {} removed",
            added.len(),
            removed.len()
        );
        let mut pools = ConnPoolSet::new();
        for addr in &new_addrs {
            match current.pools.get(addr) {
                Some(pool) => pools.add_exist_pool(addr.clone(), pool),
                None => pools.add_pool(addr, self.config.conn_pool_capacity, self.config.io_timeout),
            }
        }
        let closing: Vec<_> = removed
            .iter()
            .filter_map(|addr| current.pools.get(addr))
            .collect();
        {
            let next = RouteState {
                groups: new_groups,
                pools,
            };
            *self.state.write().unwrap() = Arc::new(next);
        }
        // close after publication so no reader sees a topology entry whose
        // pool is already gone
        for pool in closing {
            pool.close();
        }
    }

    pub async fn run_topology_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.topology_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = self.refresh_route().await {
                warn!("Coordinator: route refresh failed! {}", e.to_string());
            }
        }
    }

    pub async fn run_fid_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.fid_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = self.refill_fid().await {
                warn!("Coordinator: fid top-up failed! {}", e.to_string());
            }
        }
    }
}
