//! Consumer-side scheduling: coalescing triggers and a minimal main loop.
//!
//! # Design
//! A `Trigger` is the only scheduling object the worker thread touches. It is
//! `Send + Sync` and firing it is cheap: it flips a pending flag and, on the
//! idle-to-pending edge only, wakes the loop. Any number of fires before the
//! loop runs collapse into one invocation of the registered callback.
//!
//! The callback itself is `!Send` and stays on the consumer thread inside the
//! `MainLoop` that created the trigger.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Handle that requests one (coalesced) run of a consumer-side callback.
pub trait Trigger: Send + Sync {
    fn fire(&self);
}

/// Capability to run callbacks on the consumer context.
pub trait Scheduler {
    /// Register `callback` and return the trigger that schedules it.
    fn create_trigger(&self, callback: Box<dyn Fn()>) -> Arc<dyn Trigger>;
}

type Waker = Box<dyn Fn() + Send + Sync>;

/// Cross-thread wake-up state shared by a loop and its triggers.
struct Signal {
    pending: Mutex<bool>,
    cond: Condvar,
    waker: Option<Waker>,
}

impl Signal {
    fn notify(&self) {
        *self.pending.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.cond.notify_all();
        if let Some(waker) = &self.waker {
            waker();
        }
    }

    /// Block until notified or `timeout` elapses, consuming the notification.
    fn wait(&self, timeout: Duration) {
        let guard = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut guard, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |pending| !*pending)
            .unwrap_or_else(PoisonError::into_inner);
        *guard = false;
    }
}

struct LoopTrigger {
    pending: Arc<AtomicBool>,
    signal: Arc<Signal>,
}

impl Trigger for LoopTrigger {
    fn fire(&self) {
        if !self.pending.swap(true, Ordering::AcqRel) {
            self.signal.notify();
        }
    }
}

struct Slot {
    pending: Arc<AtomicBool>,
    callback: Rc<dyn Fn()>,
}

impl Slot {
    /// Only the slot itself still references the flag: every trigger is gone.
    fn is_orphaned(&self) -> bool {
        Arc::strong_count(&self.pending) == 1 && !self.pending.load(Ordering::Acquire)
    }
}

/// Single-threaded loop that runs fired triggers on the thread that owns it.
///
/// Cloning is cheap and yields another handle to the same loop.
#[derive(Clone)]
pub struct MainLoop {
    slots: Rc<RefCell<Vec<Slot>>>,
    signal: Arc<Signal>,
}

impl Default for MainLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl MainLoop {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Like `new`, but `waker` is called (from any thread) whenever work
    /// becomes pending, so a foreign event loop can schedule `run_pending`.
    pub fn with_waker(waker: impl Fn() + Send + Sync + 'static) -> Self {
        Self::build(Some(Box::new(waker)))
    }

    fn build(waker: Option<Waker>) -> Self {
        Self {
            slots: Rc::new(RefCell::new(Vec::new())),
            signal: Arc::new(Signal {
                pending: Mutex::new(false),
                cond: Condvar::new(),
                waker,
            }),
        }
    }

    /// Run every callback whose trigger fired since its last run. Returns how
    /// many callbacks ran.
    pub fn run_pending(&self) -> usize {
        let ready: Vec<Rc<dyn Fn()>> = {
            let mut slots = self.slots.borrow_mut();
            slots.retain(|slot| !slot.is_orphaned());
            slots
                .iter()
                .filter(|slot| slot.pending.swap(false, Ordering::AcqRel))
                .map(|slot| Rc::clone(&slot.callback))
                .collect()
        };
        // Callbacks may create new triggers, so the borrow must be released.
        for callback in &ready {
            callback();
        }
        ready.len()
    }

    /// Pump the loop until `done` returns true or `timeout` elapses. Returns
    /// the final value of `done`.
    pub fn run_until(&self, mut done: impl FnMut() -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.run_pending();
            if done() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.signal.wait((deadline - now).min(Duration::from_millis(50)));
        }
    }

    /// Number of registered callbacks that still have a live trigger.
    pub fn slot_count(&self) -> usize {
        self.slots.borrow().len()
    }
}

impl Scheduler for MainLoop {
    fn create_trigger(&self, callback: Box<dyn Fn()>) -> Arc<dyn Trigger> {
        let pending = Arc::new(AtomicBool::new(false));
        self.slots.borrow_mut().push(Slot {
            pending: Arc::clone(&pending),
            callback: Rc::from(callback),
        });
        Arc::new(LoopTrigger {
            pending,
            signal: Arc::clone(&self.signal),
        })
    }
}
