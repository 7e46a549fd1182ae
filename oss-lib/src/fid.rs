use crate::{ChunkMaster, OssError, OssResult};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy)]
struct FidRange {
    start: u64,
    end: u64,
}

impl FidRange {
    fn remaining(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }
}

/// Leases contiguous fid ranges from the chunkmaster and hands out single
/// ids. Exactly one caller performs a network refill at a time; the rest
/// wait for the refill to land and retry.
pub struct FidAllocator {
    range: Mutex<FidRange>,
    refilling: AtomicBool,
    refill_done: Notify,
    // takers currently inside take_next, not callers parked on refill_done
    pending_takers: AtomicUsize,
    takers_drained: Notify,
    low_water: u64,
    wait_timeout: Duration,
}

impl FidAllocator {
    pub fn new(low_water: u64, wait_timeout: Duration) -> Self {
        Self::with_range(0, 0, low_water, wait_timeout)
    }

    pub fn with_range(start: u64, end: u64, low_water: u64, wait_timeout: Duration) -> Self {
        Self {
            range: Mutex::new(FidRange { start, end }),
            refilling: AtomicBool::new(false),
            refill_done: Notify::new(),
            pending_takers: AtomicUsize::new(0),
            takers_drained: Notify::new(),
            low_water,
            wait_timeout,
        }
    }

    pub fn remaining(&self) -> u64 {
        self.range.lock().unwrap().remaining()
    }

    fn take_next(&self) -> Option<u64> {
        self.pending_takers.fetch_add(1, Ordering::AcqRel);
        let fid = {
            let mut range = self.range.lock().unwrap();
            if range.start < range.end {
                let fid = range.start;
                range.start += 1;
                Some(fid)
            } else {
                None
            }
        };
        if self.pending_takers.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.takers_drained.notify_waiters();
        }
        fid
    }

    /// Next unused fid. On an empty range exactly one caller refills from
    /// the master (single network attempt, errors propagate); concurrent
    /// callers wait for that refill and retry. Losing a refilled range to
    /// other takers is not an error: a caller gives up only when the master
    /// keeps leasing empty ranges.
    pub async fn get_fid(&self, master: &dyn ChunkMaster) -> OssResult<u64> {
        let mut own_refills = 0;
        loop {
            if let Some(fid) = self.take_next() {
                return Ok(fid);
            }
            if own_refills >= 3 {
                return Err(OssError::FidExhausted(
                    "fid range still empty after refill".to_string(),
                ));
            }
            if self
                .refilling
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                // another caller may have refilled between our empty take
                // and winning the flag
                if let Some(fid) = self.take_next() {
                    self.refilling.store(false, Ordering::Release);
                    self.refill_done.notify_waiters();
                    return Ok(fid);
                }
                let leased = master.acquire_fid_range().await;
                let merged = match leased {
                    Ok((start, end)) => {
                        if start >= end {
                            own_refills += 1;
                        } else {
                            own_refills = 0;
                        }
                        self.merge(start, end, false).await
                    }
                    Err(e) => {
                        warn!("FidAllocator: refill from master failed! {}", e.to_string());
                        Err(e)
                    }
                };
                self.refilling.store(false, Ordering::Release);
                self.refill_done.notify_waiters();
                merged?;
            } else {
                self.wait_refill().await?;
            }
        }
    }

    /// Park until the in-flight refill clears the single-flight flag.
    pub async fn wait_refill(&self) -> OssResult<()> {
        let notified = self.refill_done.notified();
        if !self.refilling.load(Ordering::Acquire) {
            return Ok(());
        }
        tokio::time::timeout(self.wait_timeout, notified)
            .await
            .map_err(|_| OssError::Timeout("fid refill wait timed out".to_string()))?;
        Ok(())
    }

    /// Replace or extend the range with a freshly leased one. With
    /// `wait_for_pending`, defer until in-flight `get_fid` takers drain so
    /// a background top-up never races an exhaustion refill's readers.
    pub async fn merge(&self, start: u64, end: u64, wait_for_pending: bool) -> OssResult<()> {
        if start > end {
            return Err(OssError::InvalidParam(format!(
                "inverted fid range {}-{}",
                start, end
            )));
        }
        if wait_for_pending {
            self.wait_takers_drained().await?;
        }
        let mut range = self.range.lock().unwrap();
        if end <= range.end {
            // stale or duplicate lease, never move end backwards
            debug!(
                "FidAllocator: ignore lease {}-{}, current range {}-{}",
                start, end, range.start, range.end
            );
            return Ok(());
        }
        if range.start >= range.end || start <= range.end {
            // empty, or contiguous/overlapping: keep unconsumed ids
            if range.start >= range.end {
                range.start = start;
            }
            range.end = end;
        } else {
            // disjoint fresh lease supersedes the leftovers
            *range = FidRange { start, end };
        }
        Ok(())
    }

    async fn wait_takers_drained(&self) -> OssResult<()> {
        let drained = async {
            loop {
                if self.pending_takers.load(Ordering::Acquire) == 0 {
                    return;
                }
                let notified = self.takers_drained.notified();
                if self.pending_takers.load(Ordering::Acquire) == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(self.wait_timeout, drained)
            .await
            .map_err(|_| OssError::Timeout("fid takers did not drain".to_string()))
    }

    /// Background top-up path. Skips the tick when an exhaustion refill is
    /// already in flight, and only fetches when the range runs short.
    /// Returns whether a lease was merged.
    pub async fn refill(&self, master: &dyn ChunkMaster, wait_for_pending: bool) -> OssResult<bool> {
        if self
            .refilling
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(false);
        }
        let result = async {
            if self.remaining() >= self.low_water {
                return Ok(false);
            }
            let (start, end) = master.acquire_fid_range().await?;
            self.merge(start, end, wait_for_pending).await?;
            Ok(true)
        }
        .await;
        self.refilling.store(false, Ordering::Release);
        self.refill_done.notify_waiters();
        result
    }
}
