//! Entry point: an `Engine` binds a transport, a scheduler and the resolved
//! configuration, and hands out `RequestBuilder`s.

use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use crate::callbacks::Callback;
use crate::config::EngineConfig;
use crate::controller::UrlRequest;
use crate::error::{FetchError, RequestError};
use crate::http::{Body, Headers, HttpMethod};
use crate::request::{BasicAuth, ProxyConfig, Request};
use crate::scheduler::Scheduler;
use crate::transport::{self, Transport};

/// Factory for requests that share a transport and a consumer context.
///
/// Cloning is cheap. The engine is tied to the thread its scheduler runs on.
#[derive(Clone)]
pub struct Engine {
    transport: Arc<dyn Transport>,
    scheduler: Rc<dyn Scheduler>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(
        transport: Arc<dyn Transport>,
        scheduler: impl Scheduler + 'static,
        config: EngineConfig,
    ) -> Self {
        Self {
            transport,
            scheduler: Rc::new(scheduler),
            config,
        }
    }

    /// Pick the transport named by `config.implementation`.
    pub fn from_config(config: EngineConfig, scheduler: impl Scheduler + 'static) -> Self {
        let transport = transport::for_kind(config.implementation);
        tracing::debug!(transport = transport.name(), "engine created");
        Self::new(transport, scheduler, config)
    }

    pub fn request(&self, url: impl Into<String>) -> RequestBuilder {
        RequestBuilder::new(self.clone(), url.into())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn transport_name(&self) -> &'static str {
        self.transport.name()
    }

    pub(crate) fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.transport)
    }

    pub(crate) fn scheduler(&self) -> &dyn Scheduler {
        self.scheduler.as_ref()
    }
}

/// Collects request options and callbacks before the request exists.
#[must_use = "a request is only created by `build` or `send`"]
pub struct RequestBuilder {
    engine: Engine,
    request: Request,
    proxy_host: Option<String>,
    proxy_port: Option<u16>,
    proxy_headers: Headers,
    owned: Vec<Callback>,
    weak: Vec<Callback>,
    auto_start: bool,
}

impl RequestBuilder {
    fn new(engine: Engine, url: String) -> Self {
        Self {
            engine,
            request: Request::new(url),
            proxy_host: None,
            proxy_port: None,
            proxy_headers: Headers::new(),
            owned: Vec::new(),
            weak: Vec::new(),
            auto_start: true,
        }
    }

    /// Request body. Without an explicit method this makes the request a POST.
    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.request.body = Some(body.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.request.headers.insert(name, value);
        self
    }

    pub fn headers<I, K, V>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (name, value) in headers {
            self.request.headers.insert(name, value);
        }
        self
    }

    pub fn chunk_size(mut self, size: usize) -> Self {
        self.request.chunk_size = size.max(1);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.request.timeout = Some(timeout);
        self
    }

    pub fn method(mut self, method: HttpMethod) -> Self {
        self.request.method = Some(method);
        self
    }

    /// Decode `application/json` responses. On by default.
    pub fn decode(mut self, decode: bool) -> Self {
        self.request.decode = decode;
        self
    }

    /// Stream the body into `path` (created or truncated) instead of memory.
    pub fn file_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.request.file_path = Some(path.into());
        self
    }

    pub fn ca_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.request.tls.ca_file = Some(path.into());
        self
    }

    pub fn verify(mut self, verify: bool) -> Self {
        self.request.tls.verify = verify;
        self
    }

    pub fn proxy_host(mut self, host: impl Into<String>) -> Self {
        self.proxy_host = Some(host.into());
        self
    }

    pub fn proxy_port(mut self, port: u16) -> Self {
        self.proxy_port = Some(port);
        self
    }

    pub fn proxy_headers<I, K, V>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (name, value) in headers {
            self.proxy_headers.insert(name, value);
        }
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.request.user_agent = Some(user_agent.into());
        self
    }

    pub fn cookies(mut self, cookies: impl Into<String>) -> Self {
        self.request.cookies = Some(cookies.into());
        self
    }

    pub fn auth(mut self, auth: BasicAuth) -> Self {
        self.request.auth = Some(auth);
        self
    }

    /// Whether `send` starts the request. On by default.
    pub fn auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    pub fn on_start(self, f: impl Fn(&UrlRequest) + 'static) -> Self {
        self.own(Callback::on_start(f))
    }

    pub fn on_progress(self, f: impl Fn(&UrlRequest, u64, Option<u64>) + 'static) -> Self {
        self.own(Callback::on_progress(f))
    }

    pub fn on_success(self, f: impl Fn(&UrlRequest, &Body) + 'static) -> Self {
        self.own(Callback::on_success(f))
    }

    pub fn on_redirect(self, f: impl Fn(&UrlRequest, &Body) + 'static) -> Self {
        self.own(Callback::on_redirect(f))
    }

    pub fn on_failure(self, f: impl Fn(&UrlRequest, &Body) + 'static) -> Self {
        self.own(Callback::on_failure(f))
    }

    pub fn on_error(self, f: impl Fn(&UrlRequest, &FetchError) + 'static) -> Self {
        self.own(Callback::on_error(f))
    }

    pub fn on_cancel(self, f: impl Fn(&UrlRequest) + 'static) -> Self {
        self.own(Callback::on_cancel(f))
    }

    pub fn on_finish(self, f: impl Fn(&UrlRequest) + 'static) -> Self {
        self.own(Callback::on_finish(f))
    }

    /// Subscribe a caller-owned callback. Only a weak reference is kept.
    pub fn bind(mut self, callback: &Callback) -> Self {
        self.weak.push(callback.clone());
        self
    }

    fn own(mut self, callback: Callback) -> Self {
        self.owned.push(callback);
        self
    }

    /// Create the request without starting it.
    pub fn build(self) -> UrlRequest {
        let mut request = self.request;
        request.proxy = self.proxy_host.map(|host| ProxyConfig {
            host,
            port: self.proxy_port,
            headers: self.proxy_headers,
        });
        // Only weak handles go into the registry; the builder's strong clones
        // of `weak` callbacks are dropped here.
        UrlRequest::new(self.engine, request, self.owned, &self.weak)
    }

    /// Create the request and, unless `auto_start(false)` was set, start it.
    pub fn send(self) -> Result<UrlRequest, RequestError> {
        let auto_start = self.auto_start;
        let request = self.build();
        if auto_start {
            request.start()?;
        }
        Ok(request)
    }
}
