use crate::{OssError, OssResult};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;

// header names are kept lowercase, hyper normalizes them anyway
pub const HEADER_PATH: &str = "path";
pub const HEADER_FRAGMENT_INDEX: &str = "fragment-index";
pub const HEADER_BYTES_RANGE: &str = "bytes-range";
pub const HEADER_IS_LAST: &str = "is-last";
pub const HEADER_FILE_ID: &str = "file-id";
pub const HEADER_REGISTRY_VERSION: &str = "registry-version";
pub const REGISTRY_VERSION: &str = "v1";

const FRAGMENT_TARGET: &str = "/v1/fragment";
const MAX_HEADER_LINES: usize = 64;

/// Placement key of one fragment, carried in request headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentKey {
    pub path: String,
    pub index: u64,
    pub start: u64,
    pub end: u64,
    pub is_last: bool,
}

impl FragmentKey {
    pub fn declared_len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }
}

pub fn format_bytes_range(start: u64, end: u64) -> String {
    format!("{}-{}", start, end)
}

pub fn parse_bytes_range(value: &str) -> OssResult<(u64, u64)> {
    let (start, end) = value
        .split_once('-')
        .ok_or_else(|| OssError::InvalidParam(format!("bad Bytes-Range: {}", value)))?;
    let start: u64 = start
        .trim()
        .parse()
        .map_err(|_| OssError::InvalidParam(format!("bad Bytes-Range: {}", value)))?;
    let end: u64 = end
        .trim()
        .parse()
        .map_err(|_| OssError::InvalidParam(format!("bad Bytes-Range: {}", value)))?;
    if start >= end {
        return Err(OssError::InvalidParam(format!(
            "empty Bytes-Range: {}",
            value
        )));
    }
    Ok((start, end))
}

async fn with_deadline<T, F>(deadline: Duration, label: &str, fut: F) -> OssResult<T>
where
    F: Future<Output = OssResult<T>>,
{
    tokio::time::timeout(deadline, fut)
        .await
        .map_err(|_| OssError::Timeout(format!("{} timed out", label)))?
}

async fn read_header_block<S>(stream: &mut BufStream<S>) -> OssResult<HashMap<String, String>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut headers = HashMap::new();
    for _ in 0..MAX_HEADER_LINES {
        let mut line = String::new();
        let n = stream.read_line(&mut line).await?;
        if n == 0 {
            return Err(OssError::ConnEof("peer closed during headers".to_string()));
        }
        let line = line.trim_end();
        if line.is_empty() {
            return Ok(headers);
        }
        let (name, value) = line.split_once(':').ok_or_else(|| {
            OssError::RemoteError(format!("malformed header line: {}", line))
        })?;
        headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
    }
    Err(OssError::RemoteError("too many header lines".to_string()))
}

fn required_header<'a>(
    headers: &'a HashMap<String, String>,
    name: &str,
) -> OssResult<&'a String> {
    headers
        .get(&name.to_ascii_lowercase())
        .ok_or_else(|| OssError::InvalidParam(format!("missing header: {}", name)))
}

fn content_length(headers: &HashMap<String, String>) -> OssResult<usize> {
    match headers.get("content-length") {
        None => Ok(0),
        Some(v) => v
            .parse()
            .map_err(|_| OssError::RemoteError(format!("bad Content-Length: {}", v))),
    }
}

/// One live transport connection to a chunk server, speaking the
/// header-based fragment protocol with keep-alive.
pub struct FragmentConn {
    stream: BufStream<TcpStream>,
    peer: String,
    io_timeout: Duration,
}

impl FragmentConn {
    pub async fn connect(addr: &str, io_timeout: Duration) -> OssResult<Self> {
        let stream = tokio::time::timeout(io_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| OssError::Timeout(format!("connect to {} timed out", addr)))?
            .map_err(|e| OssError::ConnError(format!("connect to {} failed: {}", addr, e)))?;
        Ok(Self {
            stream: BufStream::new(stream),
            peer: addr.to_string(),
            io_timeout,
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    async fn send_request(
        &mut self,
        method: &str,
        key: &FragmentKey,
        fid: u64,
        body: &[u8],
    ) -> OssResult<()> {
        let head = format!(
            "{} {} HTTP/1.1\r\n\
             Host: {}\r\n\
             {}: {}\r\n\
             {}: {}\r\n\
             {}: {}\r\n\
             {}: {}\r\n\
             {}: {}\r\n\
             {}: {}\r\n\
             Content-Length: {}\r\n\
             Connection: keep-alive\r\n\r\n",
            method,
            FRAGMENT_TARGET,
            self.peer,
            HEADER_PATH,
            key.path,
            HEADER_FRAGMENT_INDEX,
            key.index,
            HEADER_BYTES_RANGE,
            format_bytes_range(key.start, key.end),
            HEADER_IS_LAST,
            key.is_last,
            HEADER_FILE_ID,
            fid,
            HEADER_REGISTRY_VERSION,
            REGISTRY_VERSION,
            body.len(),
        );
        self.stream.write_all(head.as_bytes()).await?;
        if !body.is_empty() {
            self.stream.write_all(body).await?;
        }
        self.stream.flush().await?;
        Ok(())
    }

    async fn read_response(&mut self) -> OssResult<(u16, Vec<u8>)> {
        let mut status_line = String::new();
        let n = self.stream.read_line(&mut status_line).await?;
        if n == 0 {
            return Err(OssError::ConnEof(format!(
                "{} closed the connection",
                self.peer
            )));
        }
        let code: u16 = status_line
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| {
                OssError::RemoteError(format!("malformed status line: {}", status_line.trim()))
            })?;
        let headers = read_header_block(&mut self.stream).await?;
        let len = content_length(&headers)?;
        let mut body = vec![0u8; len];
        if len > 0 {
            self.stream.read_exact(&mut body).await?;
        }
        Ok((code, body))
    }

    /// Upload one fragment. Body length is the declared byte range.
    pub async fn put_fragment(
        &mut self,
        key: &FragmentKey,
        fid: u64,
        data: &[u8],
    ) -> OssResult<()> {
        let deadline = self.io_timeout;
        let peer = self.peer.clone();
        with_deadline(deadline, "fragment upload", async {
            self.send_request("POST", key, fid, data).await?;
            let (code, body) = self.read_response().await?;
            if code != 200 {
                return Err(OssError::from_http_status(
                    code,
                    format!("{} ({})", peer, String::from_utf8_lossy(&body)),
                ));
            }
            Ok(())
        })
        .await
    }

    /// Download one fragment; the response body must match the declared
    /// byte range exactly.
    pub async fn get_fragment(&mut self, key: &FragmentKey, fid: u64) -> OssResult<Vec<u8>> {
        let deadline = self.io_timeout;
        let peer = self.peer.clone();
        let declared = key.declared_len() as usize;
        with_deadline(deadline, "fragment download", async {
            self.send_request("GET", key, fid, &[]).await?;
            let (code, body) = self.read_response().await?;
            if code != 200 {
                return Err(OssError::from_http_status(
                    code,
                    format!("{} ({})", peer, String::from_utf8_lossy(&body)),
                ));
            }
            if body.len() != declared {
                return Err(OssError::RemoteError(format!(
                    "{} returned {} bytes, declared range is {}",
                    peer,
                    body.len(),
                    declared
                )));
            }
            Ok(body)
        })
        .await
    }
}

/// Server half of the fragment exchange, as spoken by the chunk-server
/// fleet (and by the mock servers in this crate's tests).
#[derive(Debug, Clone)]
pub struct FragmentRequest {
    pub method: String,
    pub key: FragmentKey,
    pub fid: u64,
    pub body: Vec<u8>,
}

/// Read one request off a keep-alive connection. `Ok(None)` means the peer
/// closed cleanly between requests.
pub async fn read_fragment_request<S>(
    stream: &mut BufStream<S>,
) -> OssResult<Option<FragmentRequest>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut request_line = String::new();
    let n = stream.read_line(&mut request_line).await?;
    if n == 0 {
        return Ok(None);
    }
    let method = request_line
        .split_whitespace()
        .next()
        .ok_or_else(|| {
            OssError::RemoteError(format!("malformed request line: {}", request_line.trim()))
        })?
        .to_string();
    let headers = read_header_block(stream).await?;
    let (start, end) = parse_bytes_range(required_header(&headers, HEADER_BYTES_RANGE)?)?;
    let key = FragmentKey {
        path: required_header(&headers, HEADER_PATH)?.clone(),
        index: required_header(&headers, HEADER_FRAGMENT_INDEX)?
            .parse()
            .map_err(|_| OssError::InvalidParam("bad Fragment-Index".to_string()))?,
        start,
        end,
        is_last: required_header(&headers, HEADER_IS_LAST)?
            .parse()
            .map_err(|_| OssError::InvalidParam("bad Is-Last".to_string()))?,
    };
    let fid: u64 = required_header(&headers, HEADER_FILE_ID)?
        .parse()
        .map_err(|_| OssError::InvalidParam("bad File-Id".to_string()))?;
    let len = content_length(&headers)?;
    let mut body = vec![0u8; len];
    if len > 0 {
        stream.read_exact(&mut body).await?;
    }
    Ok(Some(FragmentRequest {
        method,
        key,
        fid,
        body,
    }))
}

pub async fn write_fragment_response<S>(
    stream: &mut BufStream<S>,
    code: u16,
    body: &[u8],
) -> OssResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let reason = match code {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        _ => "Internal Server Error",
    };
    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: keep-alive\r\n\r\n",
        code,
        reason,
        body.len()
    );
    stream.write_all(head.as_bytes()).await?;
    if !body.is_empty() {
        stream.write_all(body).await?;
    }
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bytes_range() {
        assert_eq!(parse_bytes_range("0-1024").unwrap(), (0, 1024));
        assert_eq!(parse_bytes_range(" 512 - 768 ").unwrap(), (512, 768));
        assert!(parse_bytes_range("1024").is_err());
        assert!(parse_bytes_range("abc-def").is_err());
        assert!(parse_bytes_range("100-100").is_err());
        assert!(parse_bytes_range("200-100").is_err());
    }
}
