//! The immutable description of a fetch.
//!
//! A `Request` is assembled by `RequestBuilder` on the consumer thread. The
//! worker gets its own copy when the request starts; neither side mutates it
//! afterwards.

use std::path::PathBuf;
use std::time::Duration;

use base64::Engine as _;

use crate::http::{Headers, HttpMethod};

pub const DEFAULT_CHUNK_SIZE: usize = 8192;

/// Port used for a proxy when only the host was given.
pub const DEFAULT_PROXY_PORT: u16 = 8080;

/// Basic-auth credential, sent as an `Authorization: Basic` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

impl BasicAuth {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn header_value(&self) -> String {
        basic_auth_value(&self.username, &self.password)
    }
}

pub(crate) fn basic_auth_value(username: &str, password: &str) -> String {
    let token = base64::engine::general_purpose::STANDARD.encode(format!("{username}:{password}"));
    format!("Basic {token}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsOptions {
    /// PEM bundle to validate server certificates against.
    pub ca_file: Option<PathBuf>,
    /// When false, any certificate and host name is accepted.
    pub verify: bool,
}

impl Default for TlsOptions {
    fn default() -> Self {
        Self {
            ca_file: None,
            verify: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub host: String,
    pub port: Option<u16>,
    /// Sent with the `CONNECT` request when tunnelling.
    pub headers: Headers,
}

impl ProxyConfig {
    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PROXY_PORT)
    }
}

/// Everything the worker needs to perform one fetch.
#[derive(Debug, Clone)]
pub struct Request {
    pub url: String,
    /// Explicit method; `None` means GET, or POST when a body is present.
    pub method: Option<HttpMethod>,
    pub body: Option<Vec<u8>>,
    pub headers: Headers,
    pub chunk_size: usize,
    pub timeout: Option<Duration>,
    pub decode: bool,
    pub file_path: Option<PathBuf>,
    pub tls: TlsOptions,
    pub proxy: Option<ProxyConfig>,
    pub user_agent: Option<String>,
    pub auth: Option<BasicAuth>,
    pub cookies: Option<String>,
}

impl Request {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: None,
            body: None,
            headers: Headers::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            timeout: None,
            decode: true,
            file_path: None,
            tls: TlsOptions::default(),
            proxy: None,
            user_agent: None,
            auth: None,
            cookies: None,
        }
    }

    /// The method that goes on the wire.
    pub fn effective_method(&self) -> HttpMethod {
        match (&self.method, &self.body) {
            (Some(m), _) => m.clone(),
            (None, Some(_)) => HttpMethod::Post,
            (None, None) => HttpMethod::Get,
        }
    }

    /// Headers with the user agent and cookie defaults applied.
    ///
    /// An explicit `User-Agent` header wins over the per-request option, which
    /// wins over `default_user_agent` (the configured one). `cookies` only
    /// fills in a missing `Cookie` header.
    pub fn prepared_headers(&self, default_user_agent: Option<&str>) -> Headers {
        let mut headers = self.headers.clone();
        if let Some(ua) = self.user_agent.as_deref().or(default_user_agent) {
            headers.insert_default("User-Agent", ua);
        }
        if let Some(cookies) = self.cookies.as_deref().filter(|c| !c.is_empty()) {
            headers.insert_default("Cookie", cookies);
        }
        headers
    }

    /// Progress reporting and file sinks both need the chunked read path.
    pub(crate) fn needs_streaming(&self, progress_subscribed: bool) -> bool {
        progress_subscribed || self.file_path.is_some()
    }
}
