//! Strong references to every started request on this thread.
//!
//! Callbacks are weak and callers may drop their `UrlRequest` right after
//! starting it, so something has to keep a running request alive until its
//! outcome was delivered. That is this map. An entry is removed by the drain
//! routine once the worker has finished and nothing is left in the queue.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::controller::UrlRequest;

/// Unique identity of a request, also used as the tracing field `id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

thread_local! {
    static LIVE: RefCell<HashMap<RequestId, UrlRequest>> = RefCell::new(HashMap::new());
}

pub(crate) fn register(request: &UrlRequest) {
    LIVE.with(|live| {
        live.borrow_mut().insert(request.id(), request.clone());
    });
}

/// Drop the registry's handle. The handle is released outside the borrow
/// because dropping the last reference runs user destructors.
pub(crate) fn release(id: RequestId) -> bool {
    let removed = LIVE
        .try_with(|live| live.borrow_mut().remove(&id))
        .ok()
        .flatten();
    removed.is_some()
}

/// Number of started requests on the current thread that have not been
/// released yet.
pub fn live_request_count() -> usize {
    LIVE.with(|live| live.borrow().len())
}
