//! Ordered handoff of worker events to the consumer thread.
//!
//! The worker pushes one event at a time; the consumer's drain routine takes
//! everything queued so far in a single lock acquisition. Both sides hold the
//! mutex only for the push or the swap, never across callback dispatch.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::FetchError;
use crate::http::{Body, ResponseMeta};

/// One step of a fetch as seen by the consumer.
#[derive(Debug)]
pub enum Event {
    /// The worker began executing.
    Started,
    Progress {
        bytes_so_far: u64,
        total_size: Option<u64>,
    },
    /// The server answered; the status decides how it is classified.
    Success { meta: ResponseMeta, body: Body },
    Error { cause: FetchError },
    Cancelled,
}

impl Event {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Event::Success { .. } | Event::Error { .. } | Event::Cancelled
        )
    }

    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Event::Started => "started",
            Event::Progress { .. } => "progress",
            Event::Success { .. } => "success",
            Event::Error { .. } => "error",
            Event::Cancelled => "cancelled",
        }
    }
}

/// FIFO queue shared between one worker and one consumer.
#[derive(Debug, Default)]
pub struct ResultQueue {
    events: Mutex<VecDeque<Event>>,
}

impl ResultQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: Event) {
        self.lock().push_back(event);
    }

    /// Remove the oldest event.
    pub fn pop(&self) -> Option<Event> {
        self.lock().pop_front()
    }

    /// Remove and return every queued event, oldest first.
    pub fn take_all(&self) -> VecDeque<Event> {
        std::mem::take(&mut *self.lock())
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    // A panic while holding the lock cannot leave a half-written VecDeque
    // behind, so a poisoned queue is still consistent.
    fn lock(&self) -> MutexGuard<'_, VecDeque<Event>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
