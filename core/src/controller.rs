//! Consumer-side handle of a request.
//!
//! # Design
//! `UrlRequest` is a cheap `Rc` handle and never leaves the thread that
//! created it. Starting it registers it in the thread-local live registry,
//! creates a trigger on the engine's scheduler whose callback drains the
//! result queue, and spawns the worker. Only the drain routine mutates
//! `RequestState`, and it releases every `RefCell` borrow before user
//! callbacks run, so callbacks may freely query the request.
//!
//! Status codes are classified here, not in the worker: 1xx/2xx go to
//! `on_success`, 3xx to `on_redirect`, everything else to `on_failure`.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::callbacks::{Callback, CallbackRegistry, EventKind};
use crate::engine::Engine;
use crate::error::{FetchError, RequestError};
use crate::http::{Body, Headers, ResponseMeta};
use crate::queue::Event;
use crate::registry::{self, RequestId};
use crate::request::Request;
use crate::worker::{FetchWorker, Shared};

/// Where a request is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RequestPhase {
    Idle,
    Running,
    Succeeded,
    Redirected,
    Failed,
    Errored,
    Cancelled,
}

impl RequestPhase {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RequestPhase::Idle | RequestPhase::Running)
    }
}

/// Outcome data written by the drain routine.
#[derive(Debug, Default)]
pub struct RequestState {
    pub finished: bool,
    pub result: Option<Rc<Body>>,
    pub error: Option<Rc<FetchError>>,
    pub response_status: Option<u16>,
    pub response_headers: Option<Headers>,
    pub cancelled: bool,
}

/// Cancels a request from any thread.
#[derive(Debug, Clone)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

struct Inner {
    id: RequestId,
    request: Request,
    engine: Engine,
    callbacks: RefCell<CallbackRegistry>,
    /// Callbacks bound through the builder; the request keeps them alive.
    owned: Vec<Callback>,
    state: RefCell<RequestState>,
    phase: Cell<RequestPhase>,
    cancel: Arc<AtomicBool>,
    shared: RefCell<Option<Arc<Shared>>>,
}

/// Handle to one asynchronous fetch.
#[derive(Clone)]
pub struct UrlRequest {
    inner: Rc<Inner>,
}

impl UrlRequest {
    pub(crate) fn new(engine: Engine, request: Request, owned: Vec<Callback>, weak: &[Callback]) -> Self {
        let mut callbacks = CallbackRegistry::new();
        for cb in owned.iter().chain(weak) {
            callbacks.add(cb);
        }
        Self {
            inner: Rc::new(Inner {
                id: RequestId::new(),
                request,
                engine,
                callbacks: RefCell::new(callbacks),
                owned,
                state: RefCell::new(RequestState::default()),
                phase: Cell::new(RequestPhase::Idle),
                cancel: Arc::new(AtomicBool::new(false)),
                shared: RefCell::new(None),
            }),
        }
    }

    /// Subscribe `callback`. Only a weak reference is kept: the caller owns
    /// the callback and dropping it unsubscribes.
    pub fn bind(&self, callback: &Callback) -> Result<(), RequestError> {
        if self.phase() != RequestPhase::Idle {
            return Err(RequestError::BindAfterStart);
        }
        self.inner.callbacks.borrow_mut().add(callback);
        Ok(())
    }

    /// Dispatch `on_start` and launch the worker thread.
    pub fn start(&self) -> Result<(), RequestError> {
        if self.phase() != RequestPhase::Idle {
            return Err(RequestError::AlreadyStarted);
        }
        self.inner.phase.set(RequestPhase::Running);
        let id = self.inner.id;

        let weak = Rc::downgrade(&self.inner);
        let trigger = self.inner.engine.scheduler().create_trigger(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                UrlRequest { inner }.drain();
            }
        }));
        let shared = Arc::new(Shared::new(Arc::clone(&self.inner.cancel), trigger));
        *self.inner.shared.borrow_mut() = Some(Arc::clone(&shared));

        debug!(%id, url = %self.inner.request.url, "starting request");
        self.dispatch_notify(EventKind::Start);

        let progress = self.inner.callbacks.borrow().has_live(EventKind::Progress);
        let worker = FetchWorker::new(
            id,
            self.inner.request.clone(),
            self.inner.engine.transport(),
            self.inner.engine.config().user_agent.clone(),
            progress,
            shared,
        );
        registry::register(self);
        if let Err(err) = worker.spawn() {
            warn!(%id, %err, "could not spawn worker");
            registry::release(id);
            self.inner.phase.set(RequestPhase::Errored);
            self.inner.state.borrow_mut().finished = true;
            return Err(RequestError::WorkerSpawn(err));
        }
        Ok(())
    }

    /// Ask the worker to stop. Takes effect after the current read returns
    /// and has no effect once an outcome was queued.
    pub fn cancel(&self) {
        debug!(id = %self.inner.id, "cancel requested");
        self.inner.cancel.store(true, Ordering::Release);
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(Arc::clone(&self.inner.cancel))
    }

    /// Block the calling thread, draining events in place, until the outcome
    /// was delivered. Returns immediately for a request that never started.
    pub fn wait(&self, poll_interval: Duration) {
        if self.phase() == RequestPhase::Idle {
            return;
        }
        loop {
            self.drain();
            if self.is_finished() {
                return;
            }
            thread::sleep(poll_interval);
        }
    }

    /// Deliver every queued event. Runs on the consumer thread only.
    ///
    /// Events are popped one at a time, so a callback that drains again
    /// (directly or by pumping the loop) continues in queue order.
    pub(crate) fn drain(&self) {
        let Some(shared) = self.inner.shared.borrow().clone() else {
            return;
        };
        while let Some(event) = shared.queue.pop() {
            self.handle(event);
        }
        if shared.is_worker_done() && shared.queue.is_empty() && registry::release(self.inner.id) {
            trace!(id = %self.inner.id, "released from live registry");
        }
    }

    fn handle(&self, event: Event) {
        let id = self.inner.id;
        if self.is_finished() {
            warn!(%id, event = event.name(), "ignoring event after the outcome");
            return;
        }
        match event {
            Event::Started => trace!(%id, "worker running"),
            Event::Progress {
                bytes_so_far,
                total_size,
            } => {
                for cb in self.live(EventKind::Progress) {
                    cb.progress(self, bytes_so_far, total_size);
                }
            }
            Event::Success { meta, body } => self.complete(meta, body),
            Event::Error { cause } => {
                debug!(%id, %cause, "request errored");
                let cause = Rc::new(cause);
                {
                    let mut state = self.inner.state.borrow_mut();
                    state.finished = true;
                    state.error = Some(Rc::clone(&cause));
                }
                self.inner.phase.set(RequestPhase::Errored);
                for cb in self.live(EventKind::Error) {
                    cb.error(self, &cause);
                }
                self.dispatch_notify(EventKind::Finish);
            }
            Event::Cancelled => {
                debug!(%id, "request cancelled");
                {
                    let mut state = self.inner.state.borrow_mut();
                    state.finished = true;
                    state.cancelled = true;
                }
                self.inner.phase.set(RequestPhase::Cancelled);
                self.dispatch_notify(EventKind::Cancel);
                self.dispatch_notify(EventKind::Finish);
            }
        }
    }

    fn complete(&self, meta: ResponseMeta, body: Body) {
        let (kind, phase) = classify(meta.status);
        debug!(id = %self.inner.id, status = meta.status, ?phase, "request completed");
        let body = Rc::new(body);
        {
            let mut state = self.inner.state.borrow_mut();
            state.finished = true;
            state.response_status = Some(meta.status);
            state.response_headers = Some(meta.headers);
            state.result = Some(Rc::clone(&body));
        }
        self.inner.phase.set(phase);
        for cb in self.live(kind) {
            cb.body(self, &body);
        }
        self.dispatch_notify(EventKind::Finish);
    }

    fn live(&self, kind: EventKind) -> Vec<Callback> {
        self.inner.callbacks.borrow().live(kind)
    }

    fn dispatch_notify(&self, kind: EventKind) {
        for cb in self.live(kind) {
            cb.notify(self);
        }
    }

    pub fn id(&self) -> RequestId {
        self.inner.id
    }

    pub fn url(&self) -> &str {
        &self.inner.request.url
    }

    pub fn chunk_size(&self) -> usize {
        self.inner.request.chunk_size
    }

    /// The request as it was (or will be) sent.
    pub fn request(&self) -> &Request {
        &self.inner.request
    }

    pub fn phase(&self) -> RequestPhase {
        self.inner.phase.get()
    }

    pub fn is_finished(&self) -> bool {
        self.inner.state.borrow().finished
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.state.borrow().cancelled
    }

    pub fn result(&self) -> Option<Rc<Body>> {
        self.inner.state.borrow().result.clone()
    }

    pub fn error(&self) -> Option<Rc<FetchError>> {
        self.inner.state.borrow().error.clone()
    }

    pub fn response_status(&self) -> Option<u16> {
        self.inner.state.borrow().response_status
    }

    pub fn response_headers(&self) -> Option<Headers> {
        self.inner.state.borrow().response_headers.clone()
    }

    /// Case-insensitive lookup in the response headers.
    pub fn response_header(&self, name: &str) -> Option<String> {
        self.inner
            .state
            .borrow()
            .response_headers
            .as_ref()
            .and_then(|h| h.get(name))
            .map(str::to_string)
    }

    /// Number of callbacks the request itself keeps alive.
    pub fn owned_callback_count(&self) -> usize {
        self.inner.owned.len()
    }
}

impl fmt::Debug for UrlRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UrlRequest")
            .field("id", &self.inner.id)
            .field("url", &self.inner.request.url)
            .field("phase", &self.phase())
            .finish()
    }
}

fn classify(status: u16) -> (EventKind, RequestPhase) {
    match status / 100 {
        1 | 2 => (EventKind::Success, RequestPhase::Succeeded),
        3 => (EventKind::Redirect, RequestPhase::Redirected),
        _ => (EventKind::Failure, RequestPhase::Failed),
    }
}
