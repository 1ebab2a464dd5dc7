//! Gitea API error types.
//!
//! Reads and writes fail differently:
//!
//! - **Reads** ([`ApiError`]) are retried by the client. Non-success statuses
//!   and transport failures are transient; a body that does not decode is
//!   permanent, since asking again returns the same body.
//! - **Writes** ([`ProtectionFailure`]) are never retried here. The failure
//!   carries the status and response body back to whoever scheduled the write.

use std::fmt;
use thiserror::Error;

/// The kind of read error, categorized for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorKind {
    /// Non-success status, timeout, or connection failure. Safe to retry.
    Transient,
    /// The response could not be understood.
    Permanent,
}

impl ApiErrorKind {
    pub fn is_retriable(&self) -> bool {
        matches!(self, ApiErrorKind::Transient)
    }
}

/// A failed read against the Gitea API.
#[derive(Debug, Error)]
pub struct ApiError {
    pub kind: ApiErrorKind,

    /// The HTTP status code, if a response was received.
    pub status_code: Option<u16>,

    pub message: String,

    #[source]
    pub source: Option<reqwest::Error>,
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status_code {
            Some(code) => write!(f, "Gitea API error (HTTP {}): {}", code, self.message),
            None => write!(f, "Gitea API error: {}", self.message),
        }
    }
}

impl ApiError {
    /// A response arrived with a non-success status.
    pub fn status(status_code: u16, body: impl Into<String>) -> Self {
        Self {
            kind: ApiErrorKind::Transient,
            status_code: Some(status_code),
            message: body.into(),
            source: None,
        }
    }

    /// The request never produced a response.
    pub fn transport(source: reqwest::Error) -> Self {
        Self {
            kind: ApiErrorKind::Transient,
            status_code: source.status().map(|s| s.as_u16()),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// The response body was not the expected JSON.
    pub fn decode(source: reqwest::Error) -> Self {
        Self {
            kind: ApiErrorKind::Permanent,
            status_code: None,
            message: format!("unexpected response body: {source}"),
            source: Some(source),
        }
    }

    #[cfg(test)]
    pub fn permanent_without_source(message: impl Into<String>) -> Self {
        Self {
            kind: ApiErrorKind::Permanent,
            status_code: None,
            message: message.into(),
            source: None,
        }
    }
}

/// A protection write the server did not accept.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct ProtectionFailure {
    /// The HTTP status, or `None` when the call never completed.
    pub status: Option<u16>,

    /// The response body, or the transport error.
    pub message: String,
}

impl fmt::Display for ProtectionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(code) => write!(f, "protection rejected (HTTP {}): {}", code, self.message),
            None => write!(f, "protection call failed: {}", self.message),
        }
    }
}

impl ProtectionFailure {
    pub fn rejected(status: u16, body: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: body.into(),
        }
    }
}

impl From<reqwest::Error> for ProtectionFailure {
    fn from(err: reqwest::Error) -> Self {
        ProtectionFailure {
            status: err.status().map(|s| s.as_u16()),
            message: err.to_string(),
        }
    }
}
