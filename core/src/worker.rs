//! The background half of a request.
//!
//! # Design
//! A `FetchWorker` owns a snapshot of the request and runs it to exactly one
//! terminal event on its own OS thread. Everything it shares with the
//! consumer lives in `Shared`: the result queue, the cancel flag, the
//! worker-done flag and the trigger that schedules a drain on the consumer
//! context. The trigger is fired after every push.
//!
//! Once the terminal event is queued the worker keeps nudging the consumer
//! every 100 ms until the queue has been drained, then flags itself done and
//! fires one last time so the live registry can let go of the request.

use std::any::Any;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, debug_span, trace};

use crate::decode;
use crate::error::FetchError;
use crate::http::{Body, Headers, HttpMethod, ResponseMeta};
use crate::queue::{Event, ResultQueue};
use crate::registry::RequestId;
use crate::request::Request;
use crate::scheduler::Trigger;
use crate::transport::{Connection, Outgoing, Transport};

pub(crate) const THREAD_NAME: &str = "urlfetch-worker";
const SETTLE_INTERVAL: Duration = Duration::from_millis(100);

/// State crossing from the consumer thread to the worker thread.
pub(crate) struct Shared {
    pub queue: ResultQueue,
    pub cancel: Arc<AtomicBool>,
    pub worker_done: AtomicBool,
    pub trigger: Arc<dyn Trigger>,
}

impl Shared {
    pub fn new(cancel: Arc<AtomicBool>, trigger: Arc<dyn Trigger>) -> Self {
        Self {
            queue: ResultQueue::new(),
            cancel,
            worker_done: AtomicBool::new(false),
            trigger,
        }
    }

    fn emit(&self, event: Event) {
        self.queue.push(event);
        self.trigger.fire();
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    pub fn is_worker_done(&self) -> bool {
        self.worker_done.load(Ordering::Acquire)
    }
}

enum Outcome {
    Done { meta: ResponseMeta, body: Body },
    Cancelled,
}

pub(crate) struct FetchWorker {
    id: RequestId,
    request: Request,
    transport: Arc<dyn Transport>,
    default_user_agent: Option<String>,
    /// A progress subscriber existed when the request was started.
    progress: bool,
    shared: Arc<Shared>,
}

impl FetchWorker {
    pub fn new(
        id: RequestId,
        request: Request,
        transport: Arc<dyn Transport>,
        default_user_agent: Option<String>,
        progress: bool,
        shared: Arc<Shared>,
    ) -> Self {
        Self {
            id,
            request,
            transport,
            default_user_agent,
            progress,
            shared,
        }
    }

    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || self.run())
    }

    fn run(self) {
        let span = debug_span!("fetch", id = %self.id);
        let _guard = span.enter();
        self.execute();
        self.settle();
    }

    /// Produce the full event sequence up to and including the terminal
    /// event.
    fn execute(&self) {
        self.shared.emit(Event::Started);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.fetch()));
        let terminal = match outcome {
            Ok(Ok(Outcome::Done { meta, body })) => Event::Success { meta, body },
            Ok(Ok(Outcome::Cancelled)) => Event::Cancelled,
            Ok(Err(cause)) => Event::Error { cause },
            Err(payload) => Event::Error {
                cause: FetchError::WorkerPanicked(panic_message(payload.as_ref())),
            },
        };
        match &terminal {
            Event::Success { meta, .. } => debug!(status = meta.status, "fetch completed"),
            Event::Error { cause } => debug!(%cause, "fetch failed"),
            other => debug!(event = other.name(), "fetch ended"),
        }
        self.shared.emit(terminal);
    }

    /// Keep the consumer awake until it drained everything, then mark the
    /// worker finished.
    fn settle(&self) {
        // A strong count of one means the consumer side is gone and nobody
        // will ever drain.
        while !self.shared.queue.is_empty() && Arc::strong_count(&self.shared) > 1 {
            thread::sleep(SETTLE_INTERVAL);
            self.shared.trigger.fire();
        }
        self.shared.worker_done.store(true, Ordering::Release);
        self.shared.trigger.fire();
    }

    fn fetch(&self) -> Result<Outcome, FetchError> {
        if self.shared.is_cancelled() {
            return Ok(Outcome::Cancelled);
        }
        let method = self.request.effective_method();
        let headers = self
            .request
            .prepared_headers(self.default_user_agent.as_deref());
        debug!(
            url = %self.request.url,
            %method,
            headers = headers.len(),
            transport = self.transport.name(),
            "fetch started"
        );

        let mut conn = self.transport.open(&self.request)?;
        let exchanged = self.exchange(conn.as_mut(), &method, &headers);
        conn.close();
        let (meta, body) = exchanged?;

        if self.shared.is_cancelled() {
            return Ok(Outcome::Cancelled);
        }
        let body = if self.request.decode {
            decode::decode_body(&meta, body)
        } else {
            body
        };
        Ok(Outcome::Done { meta, body })
    }

    fn exchange(
        &self,
        conn: &mut dyn Connection,
        method: &HttpMethod,
        headers: &Headers,
    ) -> Result<(ResponseMeta, Body), FetchError> {
        let out = Outgoing {
            method,
            body: self.request.body.as_deref(),
            headers,
        };
        let meta = conn.send(&out)?;
        debug!(
            status = meta.status,
            content_length = ?meta.content_length,
            "response head received"
        );
        let body = if self.request.needs_streaming(self.progress) {
            self.stream(conn, &meta)?
        } else {
            decode::text_or_bytes(conn.read_all()?)
        };
        Ok((meta, body))
    }

    fn stream(&self, conn: &mut dyn Connection, meta: &ResponseMeta) -> Result<Body, FetchError> {
        let total_size = meta.total_size();
        let mut sink = match &self.request.file_path {
            Some(path) => Some((path, BufWriter::new(File::create(path)?))),
            None => None,
        };
        let mut buffer = Vec::new();
        let mut bytes_so_far = 0u64;

        self.report(0, total_size);
        loop {
            let chunk = conn.read_chunk(self.request.chunk_size)?;
            if chunk.is_empty() {
                break;
            }
            match &mut sink {
                Some((_, file)) => file.write_all(&chunk)?,
                None => buffer.extend_from_slice(&chunk),
            }
            bytes_so_far += chunk.len() as u64;
            self.report(bytes_so_far, total_size);
            if self.shared.is_cancelled() {
                debug!(bytes_so_far, "cancelled mid-transfer");
                break;
            }
        }
        self.report(bytes_so_far, total_size);

        match sink {
            Some((path, mut file)) => {
                file.flush()?;
                Ok(Body::File {
                    path: path.clone(),
                    bytes_written: bytes_so_far,
                })
            }
            None => Ok(Body::Bytes(buffer)),
        }
    }

    fn report(&self, bytes_so_far: u64, total_size: Option<u64>) {
        if self.progress {
            trace!(bytes_so_far, ?total_size, "progress");
            self.shared.emit(Event::Progress {
                bytes_so_far,
                total_size,
            });
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
