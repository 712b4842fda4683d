//! The network capability the worker drives.
//!
//! # Design
//! A `Transport` turns a `Request` into an open `Connection`; the connection
//! sends the request once, hands back the response head, and then yields the
//! body in caller-sized chunks. The worker only ever talks to these two
//! traits, so backends can be swapped without touching the request
//! lifecycle. Which backend an engine uses is decided once, from
//! `TransportKind`, when the engine is built.

pub mod pooled;
pub mod socket;
mod tls;
mod wire;

use std::io::{self, Read};
use std::sync::Arc;

use crate::config::TransportKind;
use crate::error::FetchError;
use crate::http::{Headers, HttpMethod, ResponseMeta};
use crate::request::Request;

pub use pooled::PooledTransport;
pub use socket::SocketTransport;

/// What goes on the wire, after header defaults were merged.
#[derive(Debug, Clone, Copy)]
pub struct Outgoing<'a> {
    pub method: &'a HttpMethod,
    pub body: Option<&'a [u8]>,
    pub headers: &'a Headers,
}

/// Factory for connections. Shared by every worker of an engine.
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Establish whatever is needed to send `request` (TCP, proxy tunnel,
    /// TLS). Nothing is sent yet.
    fn open(&self, request: &Request) -> Result<Box<dyn Connection>, FetchError>;
}

/// One request/response exchange, owned by a single worker.
pub trait Connection {
    /// Send the request and read the response head.
    fn send(&mut self, out: &Outgoing<'_>) -> Result<ResponseMeta, FetchError>;

    /// Read at most `max` body bytes. An empty vector means end of body.
    fn read_chunk(&mut self, max: usize) -> Result<Vec<u8>, FetchError>;

    /// Read the remaining body in one call.
    fn read_all(&mut self) -> Result<Vec<u8>, FetchError> {
        let mut body = Vec::new();
        loop {
            let chunk = self.read_chunk(64 * 1024)?;
            if chunk.is_empty() {
                return Ok(body);
            }
            body.extend_from_slice(&chunk);
        }
    }

    /// Release the connection. Safe to call more than once.
    fn close(&mut self);
}

/// Build the transport for `kind`.
pub fn for_kind(kind: TransportKind) -> Arc<dyn Transport> {
    match kind {
        TransportKind::Socket => Arc::new(SocketTransport::new()),
        TransportKind::Pooled => Arc::new(PooledTransport::new()),
    }
}

/// Single `read` of up to `max` bytes, retrying on `Interrupted`.
pub(crate) fn read_some<R: Read + ?Sized>(
    reader: &mut R,
    max: usize,
) -> Result<Vec<u8>, FetchError> {
    let mut buf = vec![0u8; max.max(1)];
    loop {
        match reader.read(&mut buf) {
            Ok(n) => {
                buf.truncate(n);
                return Ok(buf);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}
