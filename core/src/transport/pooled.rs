//! Transport backed by `ureq`, which owns TLS, proxies and a connection pool.
//!
//! Agents are cached per distinct (timeout, TLS, proxy) combination so that
//! requests sharing those settings reuse pooled connections. Redirects are
//! never followed and error statuses come back as ordinary responses; the
//! controller classifies them.

use std::collections::HashMap;
use std::io::Read;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tracing::debug;
use ureq::http;
use ureq::tls::{PemItem, RootCerts, TlsConfig};
use ureq::{Agent, Proxy};

use super::{read_some, Connection, Outgoing, Transport};
use crate::error::FetchError;
use crate::http::ResponseMeta;
use crate::request::Request;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct AgentKey {
    timeout: Option<Duration>,
    verify: bool,
    ca_file: Option<PathBuf>,
    proxy: Option<String>,
}

impl AgentKey {
    fn for_request(request: &Request) -> Self {
        Self {
            timeout: request.timeout,
            verify: request.tls.verify,
            ca_file: request.tls.ca_file.clone(),
            proxy: request
                .proxy
                .as_ref()
                .map(|p| format!("http://{}:{}", p.host, p.port_or_default())),
        }
    }
}

#[derive(Default)]
pub struct PooledTransport {
    agents: Mutex<HashMap<AgentKey, Agent>>,
}

impl PooledTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn agent(&self, key: AgentKey) -> Result<Agent, FetchError> {
        let mut agents = self.agents.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(agent) = agents.get(&key) {
            return Ok(agent.clone());
        }
        let agent = build_agent(&key)?;
        agents.insert(key, agent.clone());
        Ok(agent)
    }

    /// Number of distinct agents built so far.
    pub fn agent_count(&self) -> usize {
        self.agents.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

fn build_agent(key: &AgentKey) -> Result<Agent, FetchError> {
    debug!(?key, "building pooled agent");
    let mut tls = TlsConfig::builder().disable_verification(!key.verify);
    if let Some(path) = &key.ca_file {
        let pem = std::fs::read(path)
            .map_err(|e| FetchError::Tls(format!("reading {}: {e}", path.display())))?;
        let mut certs = Vec::new();
        for item in ureq::tls::parse_pem(&pem) {
            match item {
                Ok(PemItem::Certificate(cert)) => certs.push(cert.to_owned()),
                Ok(_) => {}
                Err(e) => return Err(FetchError::Tls(format!("parsing {}: {e}", path.display()))),
            }
        }
        if certs.is_empty() {
            return Err(FetchError::Tls(format!(
                "no certificates found in {}",
                path.display()
            )));
        }
        tls = tls.root_certs(RootCerts::new_with_certs(&certs));
    }

    let proxy = match &key.proxy {
        Some(uri) => Some(Proxy::new(uri).map_err(|e| FetchError::Proxy(e.to_string()))?),
        None => None,
    };

    let config = Agent::config_builder()
        .http_status_as_error(false)
        .max_redirects(0)
        .max_redirects_will_error(false)
        .timeout_global(key.timeout)
        .proxy(proxy)
        .tls_config(tls.build())
        .build();
    Ok(config.new_agent())
}

fn map_ureq_error(err: ureq::Error) -> FetchError {
    let msg = err.to_string();
    match err {
        ureq::Error::Timeout(_) => FetchError::Timeout(msg),
        ureq::Error::Io(io) => FetchError::Io(io),
        ureq::Error::HostNotFound | ureq::Error::ConnectionFailed => FetchError::Connect(msg),
        ureq::Error::BadUri(_) => FetchError::InvalidUrl(msg),
        _ => FetchError::Transport(msg),
    }
}

/// The body reader reports ureq errors wrapped in `io::Error`; unwrap them so
/// a deadline hit mid-body is still a timeout.
fn unwrap_body_error(err: FetchError) -> FetchError {
    match err {
        FetchError::Io(io) => map_ureq_error(ureq::Error::from(io)),
        other => other,
    }
}

impl Transport for PooledTransport {
    fn name(&self) -> &'static str {
        "pooled"
    }

    fn open(&self, request: &Request) -> Result<Box<dyn Connection>, FetchError> {
        let url = url::Url::parse(&request.url)?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(FetchError::UnsupportedScheme(url.scheme().to_string()));
        }
        let agent = self.agent(AgentKey::for_request(request))?;
        Ok(Box::new(PooledConnection {
            agent,
            url: request.url.clone(),
            auth: request.auth.as_ref().map(|a| a.header_value()),
            body: None,
        }))
    }
}

struct PooledConnection {
    agent: Agent,
    url: String,
    auth: Option<String>,
    body: Option<Box<dyn Read>>,
}

impl PooledConnection {
    fn build<B>(&self, out: &Outgoing<'_>, body: B) -> Result<http::Request<B>, FetchError> {
        let mut builder = http::Request::builder()
            .method(out.method.as_str())
            .uri(self.url.as_str());
        let mut has_auth = false;
        let mut has_encoding = false;
        for (name, value) in out.headers.iter() {
            has_auth |= name.eq_ignore_ascii_case("authorization");
            has_encoding |= name.eq_ignore_ascii_case("accept-encoding");
            builder = builder.header(name, value);
        }
        if let (Some(auth), false) = (&self.auth, has_auth) {
            builder = builder.header("Authorization", auth.as_str());
        }
        // Keep Content-Length meaningful for progress reporting.
        if !has_encoding {
            builder = builder.header("Accept-Encoding", "identity");
        }
        builder
            .body(body)
            .map_err(|e| FetchError::InvalidUrl(format!("{}: {e}", self.url)))
    }
}

impl Connection for PooledConnection {
    fn send(&mut self, out: &Outgoing<'_>) -> Result<ResponseMeta, FetchError> {
        let response = match out.body {
            Some(body) => self.agent.run(self.build(out, body.to_vec())?),
            None => self.agent.run(self.build(out, ())?),
        }
        .map_err(map_ureq_error)?;

        let meta = ResponseMeta::from_raw(
            response.status().as_u16(),
            response
                .headers()
                .iter()
                .map(|(k, v)| (k.as_str(), String::from_utf8_lossy(v.as_bytes()).into_owned())),
        );
        self.body = Some(Box::new(response.into_body().into_reader()));
        Ok(meta)
    }

    fn read_chunk(&mut self, max: usize) -> Result<Vec<u8>, FetchError> {
        match &mut self.body {
            Some(body) => read_some(body.as_mut(), max).map_err(unwrap_body_error),
            None => Ok(Vec::new()),
        }
    }

    fn close(&mut self) {
        // Dropping the reader returns the connection to the agent's pool.
        self.body = None;
    }
}
