//! Asynchronous URL requests delivered to a single consumer thread.
//!
//! # Overview
//! Each request runs on its own worker thread and reports back through an
//! ordered event queue. The consumer (usually an application main loop)
//! drains that queue when the request's trigger fires, updates the request
//! state and runs the bound callbacks: start, progress, success, redirect,
//! failure, error, cancel and finish.
//!
//! # Design
//! - `Engine` resolves the transport and the default user agent once and
//!   builds requests through `RequestBuilder`.
//! - `UrlRequest` and everything it dispatches to are `!Send`; only the
//!   queue, the cancel flag and the trigger cross threads.
//! - Callbacks are held weakly. Started requests are kept alive by a
//!   thread-local registry until their outcome was delivered.
//! - Transports sit behind the `Transport`/`Connection` traits: a
//!   hand-written HTTP/1.1 client over `std::net` and a pooled `ureq` client.
//! - HTTP status codes are outcomes, not errors. Redirects are reported and
//!   never followed.

pub mod callbacks;
pub mod config;
pub mod controller;
mod decode;
pub mod engine;
pub mod error;
pub mod http;
pub mod queue;
pub mod registry;
pub mod request;
pub mod scheduler;
pub mod transport;
mod worker;

pub use callbacks::{Callback, CallbackRegistry, EventKind};
pub use config::{ConfigSource, EngineConfig, EnvConfig, MapConfig, TransportKind};
pub use controller::{CancelHandle, RequestPhase, RequestState, UrlRequest};
pub use engine::{Engine, RequestBuilder};
pub use error::{ErrorCategory, FetchError, RequestError};
pub use http::{Body, Headers, HttpMethod, ResponseMeta};
pub use registry::{live_request_count, RequestId};
pub use request::{BasicAuth, ProxyConfig, Request, TlsOptions};
pub use scheduler::{MainLoop, Scheduler, Trigger};
