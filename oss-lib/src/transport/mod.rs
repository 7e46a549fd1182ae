use crate::{
    select_group, ChunkServer, ConnPool, Coordinator, FragmentKey, MetaInfoValue, OssError,
    OssResult,
};
use rand::Rng;
use std::sync::Arc;

impl Coordinator {
    /// Write one fragment: pick a group, lease a fid, fan the bytes out
    /// concurrently to every ReadWrite member. All replicas must succeed or
    /// the write is reported failed (already-written replicas are left for
    /// background reconciliation). Returns the placement for the caller to
    /// persist.
    pub async fn write_fragment(
        &self,
        path: &str,
        index: u64,
        start: u64,
        end: u64,
        is_last: bool,
        data: Vec<u8>,
    ) -> OssResult<MetaInfoValue> {
        if end <= start {
            return Err(OssError::InvalidParam(format!(
                "empty byte range {}-{}",
                start, end
            )));
        }
        let declared = (end - start) as usize;
        if data.len() != declared {
            return Err(OssError::InvalidParam(format!(
                "body is {} bytes, declared range {}-{} is {}",
                data.len(),
                start,
                end,
                declared
            )));
        }

        let snapshot = self.snapshot();
        let replicas = select_group(&snapshot.groups, declared as i64, self.config().limit_num)?;
        let group_id = replicas[0].group_id;
        let fid = self.get_fid().await?;

        let key = Arc::new(FragmentKey {
            path: path.to_string(),
            index,
            start,
            end,
            is_last,
        });
        let data = Arc::new(data);
        let targets: Vec<ChunkServer> =
            replicas.into_iter().filter(|r| r.is_read_write()).collect();
        if targets.is_empty() {
            return Err(OssError::NoAvailableGroup(format!(
                "group {} has no read-write replica",
                group_id
            )));
        }
        // one result string per RW member; empty = success
        let (tx, mut rx) = tokio::sync::mpsc::channel::<String>(targets.len());
        for server in &targets {
            let addr = server.addr();
            let pool = snapshot.pools.get(&addr);
            let tx = tx.clone();
            let key = key.clone();
            let data = data.clone();
            tokio::spawn(async move {
                let result = match pool {
                    None => format!("{}: no connection pool", addr),
                    Some(pool) => match put_to_replica(&pool, &key, fid, &data).await {
                        Ok(()) => String::new(),
                        Err(e) => format!("{}: {}", addr, e),
                    },
                };
                let _ = tx.send(result).await;
            });
        }
        drop(tx);

        let mut failures = Vec::new();
        for _ in 0..targets.len() {
            match rx.recv().await {
                Some(result) if result.is_empty() => {}
                Some(result) => failures.push(result),
                None => {
                    failures.push("fan-out worker vanished".to_string());
                    break;
                }
            }
        }
        if !failures.is_empty() {
            warn!(
                "write_fragment: fan-out for {} index {} failed: {}",
                path,
                index,
                failures.join("; ")
            );
            return Err(OssError::PartialWrite(failures.join("; ")));
        }
        Ok(MetaInfoValue {
            index,
            start,
            end,
            is_last,
            fid,
            group_id,
        })
    }

    /// Read one fragment from its group: random member, linear probe to the
    /// first ReadWrite one. No cross-replica retry here; a connection-level
    /// EOF discards the pooled connection and surfaces the error.
    pub async fn read_fragment(&self, path: &str, value: &MetaInfoValue) -> OssResult<Vec<u8>> {
        let snapshot = self.snapshot();
        let members = snapshot.groups.get(&value.group_id).ok_or_else(|| {
            OssError::NotFound(format!("group {} not in topology", value.group_id))
        })?;
        if members.is_empty() {
            return Err(OssError::NotFound(format!(
                "group {} has no members",
                value.group_id
            )));
        }
        let mut idx = rand::thread_rng().gen_range(0..members.len());
        let mut target = None;
        for _ in 0..members.len() {
            if members[idx].is_read_write() {
                target = Some(&members[idx]);
                break;
            }
            idx = (idx + 1) % members.len();
        }
        let server = target.ok_or_else(|| {
            OssError::NoAvailableGroup(format!(
                "group {} has no read-write replica",
                value.group_id
            ))
        })?;
        let addr = server.addr();
        let pool = snapshot
            .pools
            .get(&addr)
            .ok_or_else(|| OssError::ConnError(format!("{}: no connection pool", addr)))?;
        let key = FragmentKey {
            path: path.to_string(),
            index: value.index,
            start: value.start,
            end: value.end,
            is_last: value.is_last,
        };
        let mut pooled = pool.get_conn().await?;
        match pooled.conn_mut().get_fragment(&key, value.fid).await {
            Ok(bytes) => {
                pooled.release();
                Ok(bytes)
            }
            Err(e) => {
                // suspect connection, let the pool dial a fresh one next time
                pooled.discard();
                Err(e)
            }
        }
    }
}

async fn put_to_replica(
    pool: &Arc<ConnPool>,
    key: &FragmentKey,
    fid: u64,
    data: &[u8],
) -> OssResult<()> {
    let mut pooled = pool.get_conn().await?;
    match pooled.conn_mut().put_fragment(key, fid, data).await {
        Ok(()) => {
            pooled.release();
            Ok(())
        }
        Err(e) => {
            pooled.discard();
            Err(e)
        }
    }
}

#[cfg(test)]
mod test_transport;
