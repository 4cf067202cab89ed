use http::StatusCode;
use thiserror::Error;

use crate::config::ConfigError;
use crate::store::StoreError;

#[derive(Error, Debug, Clone)]
pub enum PageMonitorError {
    #[error("Invalid shard key: {0}")]
    InvalidKey(String),

    #[error("Invalid update document: {0}")]
    InvalidUpdate(String),

    #[error("Invalid date '{0}': expected YYYY-MM-DD")]
    InvalidDate(String),

    #[error("Invalid date range: start {start} is after end {end}")]
    InvalidDateRange { start: String, end: String },

    #[error("Unknown statistics type: {0}")]
    UnknownStatType(String),

    #[error("Batch processor is not running")]
    NotRunning,

    #[error("Batch queue full, rejected update for {0}")]
    QueueFull(String),

    #[error("Report scan exceeded {0:?}")]
    ScanTimeout(std::time::Duration),

    #[error("Store error: {0}")]
    Store(String),

    #[error("JSON error: {0}")]
    Json(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, PageMonitorError>;

impl From<serde_json::Error> for PageMonitorError {
    fn from(e: serde_json::Error) -> Self {
        PageMonitorError::Json(e.to_string())
    }
}

impl From<StoreError> for PageMonitorError {
    fn from(e: StoreError) -> Self {
        PageMonitorError::Store(e.to_string())
    }
}

impl From<ConfigError> for PageMonitorError {
    fn from(e: ConfigError) -> Self {
        PageMonitorError::Config(e.to_string())
    }
}

impl PageMonitorError {
    /// Status the surrounding request layer should answer with.
    pub fn status_code(&self) -> StatusCode {
        match self {
            PageMonitorError::InvalidKey(_) => StatusCode::BAD_REQUEST,
            PageMonitorError::InvalidUpdate(_) => StatusCode::BAD_REQUEST,
            PageMonitorError::InvalidDate(_) => StatusCode::BAD_REQUEST,
            PageMonitorError::InvalidDateRange { .. } => StatusCode::BAD_REQUEST,
            PageMonitorError::UnknownStatType(_) => StatusCode::BAD_REQUEST,
            PageMonitorError::NotRunning => StatusCode::SERVICE_UNAVAILABLE,
            PageMonitorError::QueueFull(_) => StatusCode::SERVICE_UNAVAILABLE,
            PageMonitorError::ScanTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            PageMonitorError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            PageMonitorError::Json(_) => StatusCode::BAD_REQUEST,
            PageMonitorError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
