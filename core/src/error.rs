//! Error types for the request engine.
//!
//! # Design
//! Two families, split by who sees them. `FetchError` is produced on the
//! worker thread, travels through the result queue and reaches consumers via
//! `on_error` or `UrlRequest::error`. `RequestError` is returned synchronously
//! from lifecycle calls that are used incorrectly (starting twice, binding
//! after start).
//!
//! HTTP status codes are never errors here: 3xx/4xx/5xx are successful
//! transport outcomes that get classified by the controller.

use std::io;

use thiserror::Error;

/// Failure of a single fetch, surfaced through the `Error` event.
#[derive(Error, Debug)]
pub enum FetchError {
    /// The URL could not be parsed or has no host.
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    /// The URL scheme has no connection type (only http and https do).
    #[error("no connection for scheme {0}")]
    UnsupportedScheme(String),

    /// DNS resolution or TCP connect failed.
    #[error("connection failed: {0}")]
    Connect(String),

    /// TLS context construction or handshake failed.
    #[error("TLS error: {0}")]
    Tls(String),

    /// The proxy refused or broke the CONNECT tunnel.
    #[error("proxy error: {0}")]
    Proxy(String),

    /// A blocking operation exceeded the request timeout.
    #[error("request timed out: {0}")]
    Timeout(String),

    /// The server sent something that is not valid HTTP/1.x.
    #[error("malformed response: {0}")]
    Protocol(String),

    /// The pooled client backend reported a failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Reading the body or writing the file sink failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The worker panicked before producing an outcome.
    #[error("worker panicked: {0}")]
    WorkerPanicked(String),
}

/// Coarse classification of a `FetchError` for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Request,
    Connection,
    Timeout,
    Response,
    Io,
    Internal,
}

impl FetchError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            FetchError::InvalidUrl(_) | FetchError::UnsupportedScheme(_) => ErrorCategory::Request,
            FetchError::Connect(_) | FetchError::Tls(_) | FetchError::Proxy(_) => {
                ErrorCategory::Connection
            }
            FetchError::Timeout(_) => ErrorCategory::Timeout,
            FetchError::Protocol(_) | FetchError::Transport(_) => ErrorCategory::Response,
            FetchError::Io(e) if is_timeout(e) => ErrorCategory::Timeout,
            FetchError::Io(_) => ErrorCategory::Io,
            FetchError::WorkerPanicked(_) => ErrorCategory::Internal,
        }
    }

    /// Map an I/O error raised while connecting, keeping timeouts distinct.
    pub(crate) fn connect(err: io::Error, target: &str) -> Self {
        if is_timeout(&err) {
            FetchError::Timeout(format!("connecting to {target}: {err}"))
        } else {
            FetchError::Connect(format!("{target}: {err}"))
        }
    }
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
}

impl From<url::ParseError> for FetchError {
    fn from(err: url::ParseError) -> Self {
        FetchError::InvalidUrl(err.to_string())
    }
}

/// Misuse of the request lifecycle, rejected immediately on the caller's
/// thread.
#[derive(Error, Debug)]
pub enum RequestError {
    #[error("request has already been started")]
    AlreadyStarted,

    #[error("callbacks cannot be bound after the request has started")]
    BindAfterStart,

    #[error("failed to spawn worker thread: {0}")]
    WorkerSpawn(#[source] io::Error),
}
