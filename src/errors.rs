//! Error types for the AirCloud client

use serde::Deserialize;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Vendor error payload returned with HTTP 429 responses.
#[derive(Debug, Clone, Deserialize)]
pub struct VendorError {
    #[serde(rename = "type")]
    pub error_type: String,
    #[serde(rename = "desc")]
    pub description: String,
    #[serde(rename = "code", default)]
    pub code: Option<String>,
    #[serde(rename = "strackTrace", default)]
    pub stack_trace: Option<String>,
}

/// Main error type for the AirCloud client
#[derive(Error, Debug)]
pub enum Error {
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("too many requests: {}", .0.description)]
    TooManyRequests(VendorError),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("hostname resolution failed: {0}")]
    HostnameResolutionFailed(String),

    #[error("connection timed out: {0}")]
    ConnectionTimeout(String),

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("interior unit {0} not found")]
    DeviceNotFound(i64),

    #[error("interior unit {0} is offline")]
    DeviceOffline(i64),

    #[error("command failed: {0}")]
    CommandFailed(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("unexpected response (status={status}): {body}")]
    UnexpectedResponse { status: u16, body: String },

    #[error("token error: {0}")]
    Token(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl Error {
    /// Map a reqwest failure onto the transport-level taxonomy.
    pub(crate) fn from_transport(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return Error::ConnectionTimeout(err.to_string());
        }
        if err.is_connect() {
            // reqwest hides the DNS failure behind its source chain
            let mut source = std::error::Error::source(&err);
            while let Some(inner) = source {
                if inner.to_string().to_lowercase().contains("dns") {
                    return Error::HostnameResolutionFailed(err.to_string());
                }
                source = inner.source();
            }
            return Error::ConnectionFailed(err.to_string());
        }
        Error::ConnectionFailed(err.to_string())
    }
}
