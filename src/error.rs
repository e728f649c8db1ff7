use std::time::Duration;
use thiserror::Error;

use crate::models::JobStatus;

/// 單次請求的傳輸錯誤
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Rate limited: {message}")]
    RateLimited {
        retry_after: Option<Duration>,
        message: String,
    },

    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl TransportError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, TransportError::RateLimited { .. })
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            TransportError::InvalidResponse(err.to_string())
        } else {
            TransportError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        TransportError::InvalidResponse(format!("JSON parse error: {}", err))
    }
}

/// 分析客戶端回報給呼叫者的錯誤
#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("{operation} failed: still rate limited after {attempts} attempts")]
    RateLimitExceeded {
        operation: &'static str,
        attempts: u32,
    },

    #[error("{operation} failed: {source}")]
    Operation {
        operation: &'static str,
        #[source]
        source: TransportError,
    },

    #[error("analysis queue is closed")]
    QueueClosed,
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(String),

    #[error("value at {key} is not an integer")]
    NotAnInteger { key: String },

    #[error("value at {key} would overflow")]
    Overflow { key: String },
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        CacheError::Backend(err.to_string())
    }
}

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("repository {0} has not been processed yet")]
    NotProcessed(String),

    /// id 會被拼進檔名，不能含路徑分隔或 `..`
    #[error("invalid repository id: {0:?}")]
    InvalidId(String),

    #[error("failed to read ingestion artifact: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid ingestion metadata: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("ingestion tool exited with {status}: {stderr}")]
    Subprocess { status: String, stderr: String },
}

#[derive(Error, Debug)]
pub enum JobError {
    #[error("invalid job transition from {from} to {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },
}
