use crate::{FragmentConn, OssError, OssResult};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Reusable-connection pool for one chunk server. Checkout is bounded by
/// capacity (semaphore backpressure); connections are dialed lazily.
pub struct ConnPool {
    addr: String,
    io_timeout: Duration,
    idle: Mutex<VecDeque<FragmentConn>>,
    slots: Arc<Semaphore>,
    closed: AtomicBool,
}

impl ConnPool {
    pub fn new(addr: String, capacity: usize, io_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            addr,
            io_timeout,
            idle: Mutex::new(VecDeque::with_capacity(capacity)),
            slots: Arc::new(Semaphore::new(capacity.max(1))),
            closed: AtomicBool::new(false),
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().unwrap().len()
    }

    /// Check out a connection, reusing an idle one when available.
    pub async fn get_conn(self: &Arc<Self>) -> OssResult<PooledConn> {
        if self.is_closed() {
            return Err(OssError::ConnError(format!("pool {} is closed", self.addr)));
        }
        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| OssError::ConnError(format!("pool {} is closed", self.addr)))?;
        if self.is_closed() {
            return Err(OssError::ConnError(format!("pool {} is closed", self.addr)));
        }
        let reused = self.idle.lock().unwrap().pop_front();
        let conn = match reused {
            Some(conn) => conn,
            None => FragmentConn::connect(&self.addr, self.io_timeout).await?,
        };
        Ok(PooledConn {
            conn: Some(conn),
            pool: self.clone(),
            _permit: permit,
        })
    }

    /// Close the pool: no new checkouts, idle connections dropped, late
    /// releases discarded. In-flight operations fail visibly instead of
    /// hanging on a half-closed pool.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.slots.close();
        let mut idle = self.idle.lock().unwrap();
        let dropped = idle.len();
        idle.clear();
        if dropped > 0 {
            debug!("ConnPool: closed {} idle conns to {}", dropped, self.addr);
        }
    }

    fn put_back(&self, conn: FragmentConn) {
        // closed is checked under the idle lock: close() clears the deque
        // under the same lock, so a racing late release cannot strand a
        // connection in a closed pool
        let mut idle = self.idle.lock().unwrap();
        if self.is_closed() {
            return;
        }
        idle.push_back(conn);
    }
}

/// A checked-out connection. Dropping it without `release` discards the
/// connection (the capacity slot is always returned).
pub struct PooledConn {
    conn: Option<FragmentConn>,
    pool: Arc<ConnPool>,
    _permit: OwnedSemaphorePermit,
}

impl PooledConn {
    pub fn conn_mut(&mut self) -> &mut FragmentConn {
        self.conn.as_mut().unwrap()
    }

    /// Return a healthy connection for reuse.
    pub fn release(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.put_back(conn);
        }
    }

    /// Drop a suspect connection (observed EOF or protocol error) so the
    /// pool hands out a fresh one next time.
    pub fn discard(mut self) {
        self.conn.take();
    }
}

/// The per-server pool map, rebuilt copy-on-write on each topology change.
/// Unchanged servers keep their pool object so a refresh causes no
/// connection churn.
#[derive(Clone, Default)]
pub struct ConnPoolSet {
    pools: HashMap<String, Arc<ConnPool>>,
}

impl ConnPoolSet {
    pub fn new() -> Self {
        Self {
            pools: HashMap::new(),
        }
    }

    pub fn add_pool(&mut self, addr: &str, capacity: usize, io_timeout: Duration) {
        self.pools
            .insert(addr.to_string(), ConnPool::new(addr.to_string(), capacity, io_timeout));
    }

    /// Carry an untouched pool over from the previous set.
    pub fn add_exist_pool(&mut self, key: String, pool: Arc<ConnPool>) {
        self.pools.insert(key, pool);
    }

    pub fn get(&self, key: &str) -> Option<Arc<ConnPool>> {
        self.pools.get(key).cloned()
    }

    pub fn keys(&self) -> HashSet<String> {
        self.pools.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    pub fn close_all(&self) {
        for pool in self.pools.values() {
            pool.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Accepts and parks sockets so dialed connections stay open.
    async fn spawn_sink_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, _)) => {
                        tokio::spawn(async move {
                            let _socket = socket;
                            tokio::time::sleep(Duration::from_secs(30)).await;
                        });
                    }
                    Err(_) => break,
                }
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_release_returns_conn_for_reuse() {
        let addr = spawn_sink_server().await;
        let pool = ConnPool::new(addr, 4, Duration::from_secs(1));
        let pooled = pool.get_conn().await.unwrap();
        assert_eq!(pool.idle_count(), 0);
        pooled.release();
        assert_eq!(pool.idle_count(), 1);
        let pooled = pool.get_conn().await.unwrap();
        assert_eq!(pool.idle_count(), 0);
        pooled.discard();
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn test_release_into_closed_pool_drops_the_conn() {
        let addr = spawn_sink_server().await;
        let pool = ConnPool::new(addr, 4, Duration::from_secs(1));
        let pooled = pool.get_conn().await.unwrap();
        pool.close();
        // a release racing close must not strand the connection
        pooled.release();
        assert_eq!(pool.idle_count(), 0);
        assert!(pool.get_conn().await.is_err());
    }
}
