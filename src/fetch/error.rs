//! Error types for the fetch layer.

use serde::Serialize;
use thiserror::Error;

/// Failure of a single transport call (before any classification).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("invalid proxy {proxy}: {reason}")]
    Proxy { proxy: String, reason: String },

    #[error("failed to read response body: {0}")]
    Body(String),

    #[error("{0}")]
    Other(String),
}

impl TransportError {
    pub fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TransportError::Timeout
        } else if e.is_connect() {
            TransportError::Connect(e.to_string())
        } else if e.is_body() || e.is_decode() {
            TransportError::Body(e.to_string())
        } else {
            TransportError::Other(e.to_string())
        }
    }
}

/// Coarse kind of a terminal fetch failure, recorded on failed chapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchErrorKind {
    Network,
    Blocked,
    ProxyExhausted,
    Cancelled,
}

/// Terminal outcome of [FetchClient::fetch](crate::fetch::FetchClient::fetch) when no
/// usable content was obtained.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Network error: could not fetch {url} after {attempts} attempt(s): {last}")]
    Network {
        url: String,
        attempts: u32,
        last: String,
    },

    #[error("Access blocked at {url} after {attempts} attempt(s).")]
    Blocked { url: String, attempts: u32 },

    #[error("No healthy proxy remains and direct connections are disabled (while fetching {url}).")]
    ProxyExhausted { url: String },

    #[error("Cancelled while fetching {url}.")]
    Cancelled { url: String },
}

impl FetchError {
    pub fn kind(&self) -> FetchErrorKind {
        match self {
            FetchError::Network { .. } => FetchErrorKind::Network,
            FetchError::Blocked { .. } => FetchErrorKind::Blocked,
            FetchError::ProxyExhausted { .. } => FetchErrorKind::ProxyExhausted,
            FetchError::Cancelled { .. } => FetchErrorKind::Cancelled,
        }
    }
}

/// Returned by [ProxyPool::acquire](crate::fetch::ProxyPool::acquire) when nothing can
/// serve the request.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("proxy pool exhausted")]
pub struct ProxyExhausted;
