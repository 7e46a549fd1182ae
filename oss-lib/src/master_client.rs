use crate::{ChunkServerGroups, OssError, OssResult};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct FidRangeResponse {
    pub start: u64,
    pub end: u64,
}

/// Control-plane surface of the chunkmaster. Polled, never pushed.
#[async_trait]
pub trait ChunkMaster: Send + Sync {
    /// Lease a fresh contiguous fid range `[start, end)`.
    async fn acquire_fid_range(&self) -> OssResult<(u64, u64)>;
    /// Fetch the current group id -> replica list table.
    async fn fetch_route(&self) -> OssResult<ChunkServerGroups>;
}

pub struct HttpChunkMaster {
    base_url: String,
    client: reqwest::Client,
}

impl HttpChunkMaster {
    pub fn new(host: &str, port: u16, timeout: Duration) -> OssResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| OssError::Internal(format!("Failed to create client: {}", e)))?;
        Ok(Self {
            base_url: format!("http://{}:{}", host, port),
            client,
        })
    }
}

#[async_trait]
impl ChunkMaster for HttpChunkMaster {
    async fn acquire_fid_range(&self) -> OssResult<(u64, u64)> {
        let url = format!("{}/cm/v1/chunkmaster/fid", self.base_url);
        let res = self.client.get(&url).send().await.map_err(|e| {
            OssError::MasterError(format!("fid request ({}) failed: {}", url, e))
        })?;
        if !res.status().is_success() {
            return Err(OssError::from_http_status(res.status().as_u16(), url));
        }
        let range: FidRangeResponse = res.json().await.map_err(|e| {
            warn!("HttpChunkMaster: decode fid range failed! {}", e.to_string());
            OssError::MasterError(format!("decode fid range failed: {}", e))
        })?;
        if range.start > range.end {
            return Err(OssError::MasterError(format!(
                "chunkmaster returned inverted fid range {}-{}",
                range.start, range.end
            )));
        }
        debug!(
            "HttpChunkMaster: leased fid range {}-{}",
            range.start, range.end
        );
        Ok((range.start, range.end))
    }

    async fn fetch_route(&self) -> OssResult<ChunkServerGroups> {
        let url = format!("{}/cm/v1/chunkmaster/route", self.base_url);
        let res = self.client.get(&url).send().await.map_err(|e| {
            OssError::MasterError(format!("route request ({}) failed: {}", url, e))
        })?;
        if !res.status().is_success() {
            return Err(OssError::from_http_status(res.status().as_u16(), url));
        }
        let groups: ChunkServerGroups = res.json().await.map_err(|e| {
            warn!("HttpChunkMaster: decode route table failed! {}", e.to_string());
            OssError::MasterError(format!("decode route table failed: {}", e))
        })?;
        Ok(groups)
    }
}
