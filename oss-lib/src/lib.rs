#![allow(unused, dead_code)]

mod conn_pool;
mod coordinator;
mod fid;
mod fragment;
mod master_client;
mod meta;
mod selector;
mod transport;
mod types;

pub use conn_pool::*;
pub use coordinator::*;
pub use fid::*;
pub use fragment::*;
pub use master_client::*;
pub use meta::*;
pub use selector::*;
pub use types::*;

use thiserror::Error;

#[macro_use]
extern crate log;

#[derive(Error, Debug)]
pub enum OssError {
    #[error("internal error: {0}")]
    Internal(String),
    #[error("invalid param: {0}")]
    InvalidParam(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("no chunk server group available: {0}")]
    NoAvailableGroup(String),
    #[error("fid range exhausted: {0}")]
    FidExhausted(String),
    #[error("chunkmaster error: {0}")]
    MasterError(String),
    #[error("connection error: {0}")]
    ConnError(String),
    #[error("connection closed by peer: {0}")]
    ConnEof(String),
    #[error("remote error: {0}")]
    RemoteError(String),
    #[error("partial write: {0}")]
    PartialWrite(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("db error: {0}")]
    DbError(String),
}

impl OssError {
    pub fn from_http_status(code: u16, info: String) -> Self {
        match code {
            404 => OssError::NotFound(info),
            500 => OssError::Internal(info),
            _ => OssError::RemoteError(format!("HTTP error: {} for {}", code, info)),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, OssError::NotFound(_))
    }
}

pub type OssResult<T> = std::result::Result<T, OssError>;

impl From<std::io::Error> for OssError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            return OssError::ConnEof(err.to_string());
        }
        OssError::IoError(err.to_string())
    }
}
