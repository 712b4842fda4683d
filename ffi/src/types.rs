//! `#[repr(C)]` types for the FFI boundary.
//!
//! # Design
//! Each type mirrors a core type with C-compatible representations: borrowed
//! `*const c_char` for caller input, owned `*mut` buffers for output, and
//! enums with explicit discriminants. Conversions live here to keep `lib.rs`
//! focused on the `extern "C"` surface.

use std::ffi::{c_void, CString};
use std::os::raw::c_char;

use urlfetch_core::{
    Body, Callback, Engine, EngineConfig, EventKind, MainLoop, RequestError, TransportKind,
    UrlRequest,
};

// ---------------------------------------------------------------------------
// Status codes
// ---------------------------------------------------------------------------

/// Return code of every FFI function that does not hand back a pointer.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfiStatus {
    Ok = 0,
    NullArg = 1,
    InvalidArg = 2,
    AlreadyStarted = 3,
    BindAfterStart = 4,
    Panic = 5,
    SpawnFailed = 6,
}

impl From<RequestError> for FfiStatus {
    fn from(err: RequestError) -> Self {
        match err {
            RequestError::AlreadyStarted => FfiStatus::AlreadyStarted,
            RequestError::BindAfterStart => FfiStatus::BindAfterStart,
            RequestError::WorkerSpawn(_) => FfiStatus::SpawnFailed,
        }
    }
}

// ---------------------------------------------------------------------------
// Main loop
// ---------------------------------------------------------------------------

/// Called from worker threads when `urlfetch_loop_pump` has work to do.
pub type FfiWakeFn = extern "C" fn(user_data: *mut c_void);

/// The host's wake function and its context pointer.
pub(crate) struct WakeTarget {
    wake: FfiWakeFn,
    user_data: *mut c_void,
}

// The host promises `wake` may be called from any thread with `user_data`.
unsafe impl Send for WakeTarget {}
unsafe impl Sync for WakeTarget {}

impl WakeTarget {
    pub(crate) fn new(wake: FfiWakeFn, user_data: *mut c_void) -> Self {
        Self { wake, user_data }
    }

    pub(crate) fn fire(&self) {
        (self.wake)(self.user_data)
    }
}

/// Transport choice for one request.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfiImplementation {
    /// Whatever `URLFETCH_IMPLEMENTATION` selected.
    Default = 0,
    Socket = 1,
    Pooled = 2,
}

/// Opaque handle to a main loop and the engines that schedule on it.
pub struct FfiLoop {
    pub(crate) main_loop: MainLoop,
    socket: Engine,
    pooled: Engine,
    default_kind: TransportKind,
}

impl FfiLoop {
    pub(crate) fn new(main_loop: MainLoop, config: EngineConfig) -> Self {
        let default_kind = config.implementation;
        let socket = Engine::from_config(
            config.clone().implementation(TransportKind::Socket),
            main_loop.clone(),
        );
        let pooled = Engine::from_config(
            config.implementation(TransportKind::Pooled),
            main_loop.clone(),
        );
        Self {
            main_loop,
            socket,
            pooled,
            default_kind,
        }
    }

    pub(crate) fn engine(&self, implementation: FfiImplementation) -> &Engine {
        let kind = match implementation {
            FfiImplementation::Default => self.default_kind,
            FfiImplementation::Socket => TransportKind::Socket,
            FfiImplementation::Pooled => TransportKind::Pooled,
        };
        match kind {
            TransportKind::Socket => &self.socket,
            TransportKind::Pooled => &self.pooled,
        }
    }
}

// ---------------------------------------------------------------------------
// Request options
// ---------------------------------------------------------------------------

/// A header as two borrowed C strings.
#[repr(C)]
pub struct FfiHeader {
    pub name: *const c_char,
    pub value: *const c_char,
}

/// Per-request options. Every pointer is borrowed for the duration of
/// `urlfetch_request_new` only; null means "not set".
#[repr(C)]
pub struct FfiRequestOptions {
    /// Null picks GET, or POST when `body` is set.
    pub method: *const c_char,
    pub body: *const u8,
    pub body_len: usize,
    pub headers: *const FfiHeader,
    pub headers_len: usize,
    /// Zero keeps the default.
    pub chunk_size: usize,
    /// Zero means no timeout.
    pub timeout_ms: u64,
    pub decode: bool,
    pub file_path: *const c_char,
    pub ca_file: *const c_char,
    pub verify: bool,
    pub proxy_host: *const c_char,
    /// Zero keeps the default proxy port.
    pub proxy_port: u16,
    pub proxy_headers: *const FfiHeader,
    pub proxy_headers_len: usize,
    pub user_agent: *const c_char,
    pub cookies: *const c_char,
    pub auth_user: *const c_char,
    pub auth_password: *const c_char,
    pub implementation: FfiImplementation,
    /// Deliver `Progress` events to subscribers. Reporting progress streams
    /// the body, so text responses come back as `Bytes`.
    pub report_progress: bool,
}

impl Default for FfiRequestOptions {
    fn default() -> Self {
        Self {
            method: std::ptr::null(),
            body: std::ptr::null(),
            body_len: 0,
            headers: std::ptr::null(),
            headers_len: 0,
            chunk_size: 0,
            timeout_ms: 0,
            decode: true,
            file_path: std::ptr::null(),
            ca_file: std::ptr::null(),
            verify: true,
            proxy_host: std::ptr::null(),
            proxy_port: 0,
            proxy_headers: std::ptr::null(),
            proxy_headers_len: 0,
            user_agent: std::ptr::null(),
            cookies: std::ptr::null(),
            auth_user: std::ptr::null(),
            auth_password: std::ptr::null(),
            implementation: FfiImplementation::Default,
            report_progress: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfiEventKind {
    Start = 0,
    Progress = 1,
    Success = 2,
    Redirect = 3,
    Failure = 4,
    Error = 5,
    Cancel = 6,
    Finish = 7,
}

impl From<EventKind> for FfiEventKind {
    fn from(kind: EventKind) -> Self {
        match kind {
            EventKind::Start => FfiEventKind::Start,
            EventKind::Progress => FfiEventKind::Progress,
            EventKind::Success => FfiEventKind::Success,
            EventKind::Redirect => FfiEventKind::Redirect,
            EventKind::Failure => FfiEventKind::Failure,
            EventKind::Error => FfiEventKind::Error,
            EventKind::Cancel => FfiEventKind::Cancel,
            EventKind::Finish => FfiEventKind::Finish,
        }
    }
}

/// One callback invocation. Valid only for the duration of the call.
#[repr(C)]
pub struct FfiEvent {
    pub kind: FfiEventKind,
    pub bytes_so_far: u64,
    /// -1 when the size is unknown.
    pub total_size: i64,
    /// -1 before a response arrived.
    pub status: i32,
    /// Set for `Error` events only.
    pub error_message: *const c_char,
}

impl FfiEvent {
    fn new(kind: FfiEventKind, req: &UrlRequest) -> Self {
        Self {
            kind,
            bytes_so_far: 0,
            total_size: -1,
            status: status_code(req),
            error_message: std::ptr::null(),
        }
    }
}

/// Receives every event of a request on the thread that pumps the loop.
pub type FfiEventCallback = extern "C" fn(event: *const FfiEvent, user_data: *mut c_void);

/// Wrap one C callback as a core callback per event kind.
/// Progress is only subscribed when `progress` is set.
pub(crate) fn c_callbacks(
    cb: FfiEventCallback,
    user_data: *mut c_void,
    progress: bool,
) -> Vec<Callback> {
    let notify = move |kind: EventKind| {
        move |req: &UrlRequest| {
            let event = FfiEvent::new(kind.into(), req);
            cb(&event, user_data);
        }
    };
    let body = move |kind: EventKind| {
        move |req: &UrlRequest, _: &Body| {
            let event = FfiEvent::new(kind.into(), req);
            cb(&event, user_data);
        }
    };
    let mut callbacks = vec![
        Callback::on_start(notify(EventKind::Start)),
        Callback::on_success(body(EventKind::Success)),
        Callback::on_redirect(body(EventKind::Redirect)),
        Callback::on_failure(body(EventKind::Failure)),
        Callback::on_error(move |req, err| {
            let message = CString::new(err.to_string()).unwrap_or_default();
            let event = FfiEvent {
                error_message: message.as_ptr(),
                ..FfiEvent::new(FfiEventKind::Error, req)
            };
            cb(&event, user_data);
        }),
        Callback::on_cancel(notify(EventKind::Cancel)),
        Callback::on_finish(notify(EventKind::Finish)),
    ];
    if progress {
        callbacks.push(Callback::on_progress(move |req, n, total| {
            let event = FfiEvent {
                bytes_so_far: n,
                total_size: total.and_then(|t| i64::try_from(t).ok()).unwrap_or(-1),
                ..FfiEvent::new(FfiEventKind::Progress, req)
            };
            cb(&event, user_data);
        }));
    }
    callbacks
}

pub(crate) fn status_code(req: &UrlRequest) -> i32 {
    req.response_status().map(i32::from).unwrap_or(-1)
}

// ---------------------------------------------------------------------------
// Requests and results
// ---------------------------------------------------------------------------

/// Opaque handle to one request. Holds the C callbacks it subscribed, so
/// freeing the handle unsubscribes them; a running request still completes.
pub struct FfiRequest {
    pub(crate) inner: UrlRequest,
    pub(crate) callbacks: Vec<Callback>,
    /// From `FfiRequestOptions::report_progress`.
    pub(crate) report_progress: bool,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfiBodyTag {
    Text = 0,
    Bytes = 1,
    /// `data` holds the serialized JSON document.
    Json = 2,
    /// `data` holds the path the body was written to.
    File = 3,
}

/// An owned response body. Free with `urlfetch_free_body`.
#[repr(C)]
pub struct FfiBody {
    pub tag: FfiBodyTag,
    pub data: *mut u8,
    pub len: usize,
}

impl FfiBody {
    pub(crate) fn from_core(body: &Body) -> *mut FfiBody {
        let (tag, bytes) = match body {
            Body::Text(text) => (FfiBodyTag::Text, text.clone().into_bytes()),
            Body::Bytes(bytes) => (FfiBodyTag::Bytes, bytes.clone()),
            Body::Json(value) => (FfiBodyTag::Json, value.to_string().into_bytes()),
            Body::File { path, .. } => (
                FfiBodyTag::File,
                path.to_string_lossy().into_owned().into_bytes(),
            ),
        };
        let boxed = bytes.into_boxed_slice();
        let len = boxed.len();
        let data = Box::into_raw(boxed) as *mut u8;
        Box::into_raw(Box::new(FfiBody { tag, data, len }))
    }
}

/// Convert a Rust string into a C string owned by the caller. Returns null if
/// `s` contains an interior NUL.
pub(crate) fn to_c_string(s: String) -> *mut c_char {
    CString::new(s)
        .map(CString::into_raw)
        .unwrap_or(std::ptr::null_mut())
}
