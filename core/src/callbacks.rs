//! Per-event subscriber lists with non-owning storage.
//!
//! # Design
//! Callers keep their callbacks alive by holding the `Callback` value (an
//! `Rc`); the registry only stores `Weak` handles. A pending request therefore
//! never extends the lifetime of whatever the callback closes over, and a
//! callback whose owner is gone is skipped silently at dispatch time.
//!
//! The registry hands out strong clones of the live subscribers so the
//! controller can release its `RefCell` borrow before running user code.

use std::fmt;
use std::rc::{Rc, Weak};

use crate::controller::UrlRequest;
use crate::error::FetchError;
use crate::http::Body;

/// Event channels a callback can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Start,
    Progress,
    Success,
    Redirect,
    Failure,
    Error,
    Cancel,
    Finish,
}

pub type NotifyFn = dyn Fn(&UrlRequest);
/// Receives `(request, bytes_so_far, total_size)`.
pub type ProgressFn = dyn Fn(&UrlRequest, u64, Option<u64>);
pub type BodyFn = dyn Fn(&UrlRequest, &Body);
pub type ErrorFn = dyn Fn(&UrlRequest, &FetchError);

/// A subscriber together with the channel it listens on.
///
/// Dropping every clone of a `Callback` unsubscribes it.
#[derive(Clone)]
pub enum Callback {
    Start(Rc<NotifyFn>),
    Progress(Rc<ProgressFn>),
    Success(Rc<BodyFn>),
    Redirect(Rc<BodyFn>),
    Failure(Rc<BodyFn>),
    Error(Rc<ErrorFn>),
    Cancel(Rc<NotifyFn>),
    Finish(Rc<NotifyFn>),
}

impl Callback {
    pub fn on_start(f: impl Fn(&UrlRequest) + 'static) -> Self {
        Callback::Start(Rc::new(f))
    }

    pub fn on_progress(f: impl Fn(&UrlRequest, u64, Option<u64>) + 'static) -> Self {
        Callback::Progress(Rc::new(f))
    }

    pub fn on_success(f: impl Fn(&UrlRequest, &Body) + 'static) -> Self {
        Callback::Success(Rc::new(f))
    }

    pub fn on_redirect(f: impl Fn(&UrlRequest, &Body) + 'static) -> Self {
        Callback::Redirect(Rc::new(f))
    }

    pub fn on_failure(f: impl Fn(&UrlRequest, &Body) + 'static) -> Self {
        Callback::Failure(Rc::new(f))
    }

    pub fn on_error(f: impl Fn(&UrlRequest, &FetchError) + 'static) -> Self {
        Callback::Error(Rc::new(f))
    }

    pub fn on_cancel(f: impl Fn(&UrlRequest) + 'static) -> Self {
        Callback::Cancel(Rc::new(f))
    }

    pub fn on_finish(f: impl Fn(&UrlRequest) + 'static) -> Self {
        Callback::Finish(Rc::new(f))
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Callback::Start(_) => EventKind::Start,
            Callback::Progress(_) => EventKind::Progress,
            Callback::Success(_) => EventKind::Success,
            Callback::Redirect(_) => EventKind::Redirect,
            Callback::Failure(_) => EventKind::Failure,
            Callback::Error(_) => EventKind::Error,
            Callback::Cancel(_) => EventKind::Cancel,
            Callback::Finish(_) => EventKind::Finish,
        }
    }

    fn downgrade(&self) -> WeakCallback {
        match self {
            Callback::Start(f) => WeakCallback::Start(Rc::downgrade(f)),
            Callback::Progress(f) => WeakCallback::Progress(Rc::downgrade(f)),
            Callback::Success(f) => WeakCallback::Success(Rc::downgrade(f)),
            Callback::Redirect(f) => WeakCallback::Redirect(Rc::downgrade(f)),
            Callback::Failure(f) => WeakCallback::Failure(Rc::downgrade(f)),
            Callback::Error(f) => WeakCallback::Error(Rc::downgrade(f)),
            Callback::Cancel(f) => WeakCallback::Cancel(Rc::downgrade(f)),
            Callback::Finish(f) => WeakCallback::Finish(Rc::downgrade(f)),
        }
    }

    /// Run a notify-style callback (start, cancel, finish).
    pub(crate) fn notify(&self, req: &UrlRequest) {
        match self {
            Callback::Start(f) | Callback::Cancel(f) | Callback::Finish(f) => f(req),
            _ => {}
        }
    }

    pub(crate) fn progress(&self, req: &UrlRequest, bytes_so_far: u64, total: Option<u64>) {
        if let Callback::Progress(f) = self {
            f(req, bytes_so_far, total);
        }
    }

    pub(crate) fn body(&self, req: &UrlRequest, body: &Body) {
        match self {
            Callback::Success(f) | Callback::Redirect(f) | Callback::Failure(f) => f(req, body),
            _ => {}
        }
    }

    pub(crate) fn error(&self, req: &UrlRequest, cause: &FetchError) {
        if let Callback::Error(f) = self {
            f(req, cause);
        }
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Callback").field(&self.kind()).finish()
    }
}

enum WeakCallback {
    Start(Weak<NotifyFn>),
    Progress(Weak<ProgressFn>),
    Success(Weak<BodyFn>),
    Redirect(Weak<BodyFn>),
    Failure(Weak<BodyFn>),
    Error(Weak<ErrorFn>),
    Cancel(Weak<NotifyFn>),
    Finish(Weak<NotifyFn>),
}

impl WeakCallback {
    fn upgrade(&self) -> Option<Callback> {
        Some(match self {
            WeakCallback::Start(w) => Callback::Start(w.upgrade()?),
            WeakCallback::Progress(w) => Callback::Progress(w.upgrade()?),
            WeakCallback::Success(w) => Callback::Success(w.upgrade()?),
            WeakCallback::Redirect(w) => Callback::Redirect(w.upgrade()?),
            WeakCallback::Failure(w) => Callback::Failure(w.upgrade()?),
            WeakCallback::Error(w) => Callback::Error(w.upgrade()?),
            WeakCallback::Cancel(w) => Callback::Cancel(w.upgrade()?),
            WeakCallback::Finish(w) => Callback::Finish(w.upgrade()?),
        })
    }

    fn is_alive(&self) -> bool {
        self.upgrade().is_some()
    }
}

/// Ordered subscribers for every `EventKind`.
#[derive(Default)]
pub struct CallbackRegistry {
    entries: Vec<(EventKind, WeakCallback)>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, callback: &Callback) {
        self.entries.retain(|(_, w)| w.is_alive());
        self.entries.push((callback.kind(), callback.downgrade()));
    }

    /// Strong handles to every live subscriber of `kind`, in binding order.
    pub fn live(&self, kind: EventKind) -> Vec<Callback> {
        self.entries
            .iter()
            .filter(|(k, _)| *k == kind)
            .filter_map(|(_, w)| w.upgrade())
            .collect()
    }

    pub fn has_live(&self, kind: EventKind) -> bool {
        self.entries
            .iter()
            .any(|(k, w)| *k == kind && w.is_alive())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
