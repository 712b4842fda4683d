//! C-ABI wrapper around `urlfetch-core`.
//!
//! # Overview
//! Lets a host whose main loop is not written in Rust issue background HTTP
//! requests and receive their events on its own thread. The host creates a
//! loop with a wake function, calls `urlfetch_loop_pump` whenever woken, and
//! gets every request event through one C callback.
//!
//! # Design
//! - Every `extern "C"` function wraps its body in `catch_unwind` so panics
//!   never cross the FFI boundary.
//! - Requests are created stopped: the host subscribes its callback, then
//!   calls `urlfetch_request_start`.
//! - Pointer-returning functions signal failure with null; everything else
//!   returns an `FfiStatus`.
//! - The caller owns all returned pointers and must call the matching
//!   `urlfetch_*_free` function to release them.
//! - Handles are bound to the thread that created their loop.

pub mod types;

use std::ffi::{c_void, CStr};
use std::os::raw::c_char;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::time::Duration;

use urlfetch_core::{BasicAuth, EngineConfig, HttpMethod, MainLoop, RequestBuilder};

use types::*;

/// Borrow a nullable C string. Invalid UTF-8 is rejected.
fn opt_str<'a>(ptr: *const c_char) -> Result<Option<&'a str>, FfiStatus> {
    if ptr.is_null() {
        return Ok(None);
    }
    unsafe { CStr::from_ptr(ptr) }
        .to_str()
        .map(Some)
        .map_err(|_| FfiStatus::InvalidArg)
}

/// Borrow `len` headers starting at `ptr`. A null array is empty.
fn header_pairs<'a>(
    ptr: *const FfiHeader,
    len: usize,
) -> Result<Vec<(&'a str, &'a str)>, FfiStatus> {
    if ptr.is_null() || len == 0 {
        return Ok(Vec::new());
    }
    let headers = unsafe { std::slice::from_raw_parts(ptr, len) };
    headers
        .iter()
        .map(|h| match (opt_str(h.name)?, opt_str(h.value)?) {
            (Some(name), Some(value)) => Ok((name, value)),
            _ => Err(FfiStatus::NullArg),
        })
        .collect()
}

fn apply_options(
    mut builder: RequestBuilder,
    opts: &FfiRequestOptions,
) -> Result<RequestBuilder, FfiStatus> {
    if let Some(method) = opt_str(opts.method)? {
        let method: HttpMethod = method.parse().unwrap_or_else(|never| match never {});
        builder = builder.method(method);
    }
    if !opts.body.is_null() {
        let body = unsafe { std::slice::from_raw_parts(opts.body, opts.body_len) };
        builder = builder.body(body.to_vec());
    }
    builder = builder.headers(header_pairs(opts.headers, opts.headers_len)?);
    if opts.chunk_size > 0 {
        builder = builder.chunk_size(opts.chunk_size);
    }
    if opts.timeout_ms > 0 {
        builder = builder.timeout(Duration::from_millis(opts.timeout_ms));
    }
    builder = builder.decode(opts.decode).verify(opts.verify);
    if let Some(path) = opt_str(opts.file_path)? {
        builder = builder.file_path(PathBuf::from(path));
    }
    if let Some(path) = opt_str(opts.ca_file)? {
        builder = builder.ca_file(PathBuf::from(path));
    }
    if let Some(host) = opt_str(opts.proxy_host)? {
        builder = builder.proxy_host(host);
        if opts.proxy_port > 0 {
            builder = builder.proxy_port(opts.proxy_port);
        }
        let proxy_headers = header_pairs(opts.proxy_headers, opts.proxy_headers_len)?;
        builder = builder.proxy_headers(proxy_headers);
    }
    if let Some(ua) = opt_str(opts.user_agent)? {
        builder = builder.user_agent(ua);
    }
    if let Some(cookies) = opt_str(opts.cookies)? {
        builder = builder.cookies(cookies);
    }
    if let Some(user) = opt_str(opts.auth_user)? {
        let password = opt_str(opts.auth_password)?.unwrap_or("");
        builder = builder.auth(BasicAuth::new(user, password));
    }
    Ok(builder)
}

// ---------------------------------------------------------------------------
// Main loop
// ---------------------------------------------------------------------------

/// Create a main loop. `wake` may be null; otherwise it is called from worker
/// threads (with `user_data`) whenever `urlfetch_loop_pump` has work.
///
/// Engine settings come from `URLFETCH_*` environment variables. Free with
/// `urlfetch_loop_free`.
#[unsafe(no_mangle)]
pub extern "C" fn urlfetch_loop_new(
    wake: Option<FfiWakeFn>,
    user_data: *mut c_void,
) -> *mut FfiLoop {
    catch_unwind(|| {
        let main_loop = match wake {
            Some(wake) => {
                let target = WakeTarget::new(wake, user_data);
                MainLoop::with_waker(move || target.fire())
            }
            None => MainLoop::new(),
        };
        Box::into_raw(Box::new(FfiLoop::new(main_loop, EngineConfig::from_env())))
    })
    .unwrap_or(std::ptr::null_mut())
}

/// Free a loop created by `urlfetch_loop_new`. Safe to call with null.
///
/// Requests created from the loop keep working but are only delivered by
/// `urlfetch_request_wait` afterwards.
#[unsafe(no_mangle)]
pub extern "C" fn urlfetch_loop_free(lp: *mut FfiLoop) {
    if !lp.is_null() {
        let _ = catch_unwind(AssertUnwindSafe(|| {
            drop(unsafe { Box::from_raw(lp) });
        }));
    }
}

/// Run every pending request callback. Returns how many drains ran; 0 for
/// null or after a panic.
#[unsafe(no_mangle)]
pub extern "C" fn urlfetch_loop_pump(lp: *const FfiLoop) -> u32 {
    catch_unwind(AssertUnwindSafe(|| {
        if lp.is_null() {
            return 0;
        }
        let lp = unsafe { &*lp };
        u32::try_from(lp.main_loop.run_pending()).unwrap_or(u32::MAX)
    }))
    .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Request lifecycle
// ---------------------------------------------------------------------------

/// Options with every field unset: GET, default chunk size, no timeout,
/// decoding and certificate verification on.
#[unsafe(no_mangle)]
pub extern "C" fn urlfetch_request_options_default() -> FfiRequestOptions {
    FfiRequestOptions::default()
}

/// Create a stopped request for `url`. `options` may be null for defaults.
///
/// Returns null if `lp` or `url` is null, if a string is not UTF-8, or if a
/// header has a null name or value. Free with `urlfetch_request_free`.
#[unsafe(no_mangle)]
pub extern "C" fn urlfetch_request_new(
    lp: *const FfiLoop,
    url: *const c_char,
    options: *const FfiRequestOptions,
) -> *mut FfiRequest {
    catch_unwind(AssertUnwindSafe(|| {
        if lp.is_null() || url.is_null() {
            return std::ptr::null_mut();
        }
        let lp = unsafe { &*lp };
        let Ok(Some(url)) = opt_str(url) else {
            return std::ptr::null_mut();
        };
        let defaults = FfiRequestOptions::default();
        let opts = if options.is_null() {
            &defaults
        } else {
            unsafe { &*options }
        };
        let builder = lp.engine(opts.implementation).request(url).auto_start(false);
        match apply_options(builder, opts) {
            Ok(builder) => Box::into_raw(Box::new(FfiRequest {
                inner: builder.build(),
                callbacks: Vec::new(),
                report_progress: opts.report_progress,
            })),
            Err(status) => {
                tracing::warn!(url, ?status, "rejected request options");
                std::ptr::null_mut()
            }
        }
    }))
    .unwrap_or(std::ptr::null_mut())
}

/// Subscribe `cb` to every event of `req`. The `FfiEvent` pointer is only
/// valid during the call. Each call adds another subscriber. `Progress`
/// events are only delivered when the request was created with
/// `report_progress`.
///
/// Returns `BindAfterStart` once the request was started.
#[unsafe(no_mangle)]
pub extern "C" fn urlfetch_request_set_callback(
    req: *mut FfiRequest,
    cb: Option<FfiEventCallback>,
    user_data: *mut c_void,
) -> FfiStatus {
    catch_unwind(AssertUnwindSafe(|| {
        if req.is_null() {
            return FfiStatus::NullArg;
        }
        let Some(cb) = cb else {
            return FfiStatus::NullArg;
        };
        let req = unsafe { &mut *req };
        let callbacks = c_callbacks(cb, user_data, req.report_progress);
        for callback in &callbacks {
            if let Err(err) = req.inner.bind(callback) {
                return err.into();
            }
        }
        req.callbacks.extend(callbacks);
        FfiStatus::Ok
    }))
    .unwrap_or(FfiStatus::Panic)
}

/// Start the request. The `Start` event is delivered before this returns.
#[unsafe(no_mangle)]
pub extern "C" fn urlfetch_request_start(req: *const FfiRequest) -> FfiStatus {
    catch_unwind(AssertUnwindSafe(|| {
        if req.is_null() {
            return FfiStatus::NullArg;
        }
        let req = unsafe { &*req };
        match req.inner.start() {
            Ok(()) => FfiStatus::Ok,
            Err(err) => err.into(),
        }
    }))
    .unwrap_or(FfiStatus::Panic)
}

/// Ask the request to stop. Takes effect between chunks.
#[unsafe(no_mangle)]
pub extern "C" fn urlfetch_request_cancel(req: *const FfiRequest) -> FfiStatus {
    catch_unwind(AssertUnwindSafe(|| {
        if req.is_null() {
            return FfiStatus::NullArg;
        }
        unsafe { &*req }.inner.cancel();
        FfiStatus::Ok
    }))
    .unwrap_or(FfiStatus::Panic)
}

/// Block, delivering this request's events in place, until it finished.
/// Returns at once for a request that was never started.
#[unsafe(no_mangle)]
pub extern "C" fn urlfetch_request_wait(req: *const FfiRequest, poll_ms: u32) -> FfiStatus {
    catch_unwind(AssertUnwindSafe(|| {
        if req.is_null() {
            return FfiStatus::NullArg;
        }
        let req = unsafe { &*req };
        req.inner.wait(Duration::from_millis(poll_ms.into()));
        FfiStatus::Ok
    }))
    .unwrap_or(FfiStatus::Panic)
}

/// Free a request handle. Safe to call with null. A running request is not
/// cancelled, but callbacks subscribed through this handle stop firing.
#[unsafe(no_mangle)]
pub extern "C" fn urlfetch_request_free(req: *mut FfiRequest) {
    if !req.is_null() {
        let _ = catch_unwind(AssertUnwindSafe(|| {
            drop(unsafe { Box::from_raw(req) });
        }));
    }
}

// ---------------------------------------------------------------------------
// Request state
// ---------------------------------------------------------------------------

#[unsafe(no_mangle)]
pub extern "C" fn urlfetch_request_is_finished(req: *const FfiRequest) -> bool {
    catch_unwind(AssertUnwindSafe(|| {
        !req.is_null() && unsafe { &*req }.inner.is_finished()
    }))
    .unwrap_or(false)
}

/// HTTP status of the response, or -1 if none arrived.
#[unsafe(no_mangle)]
pub extern "C" fn urlfetch_request_status(req: *const FfiRequest) -> i32 {
    catch_unwind(AssertUnwindSafe(|| {
        if req.is_null() {
            return -1;
        }
        status_code(&unsafe { &*req }.inner)
    }))
    .unwrap_or(-1)
}

/// The response body, or null if the request has no result.
/// Free with `urlfetch_free_body`.
#[unsafe(no_mangle)]
pub extern "C" fn urlfetch_request_result(req: *const FfiRequest) -> *mut FfiBody {
    catch_unwind(AssertUnwindSafe(|| {
        if req.is_null() {
            return std::ptr::null_mut();
        }
        match unsafe { &*req }.inner.result() {
            Some(body) => FfiBody::from_core(&body),
            None => std::ptr::null_mut(),
        }
    }))
    .unwrap_or(std::ptr::null_mut())
}

/// The error message, or null if the request did not error.
/// Free with `urlfetch_free_string`.
#[unsafe(no_mangle)]
pub extern "C" fn urlfetch_request_error(req: *const FfiRequest) -> *mut c_char {
    catch_unwind(AssertUnwindSafe(|| {
        if req.is_null() {
            return std::ptr::null_mut();
        }
        match unsafe { &*req }.inner.error() {
            Some(err) => to_c_string(err.to_string()),
            None => std::ptr::null_mut(),
        }
    }))
    .unwrap_or(std::ptr::null_mut())
}

/// A response header by case-insensitive name, or null if absent.
/// Free with `urlfetch_free_string`.
#[unsafe(no_mangle)]
pub extern "C" fn urlfetch_request_header(
    req: *const FfiRequest,
    name: *const c_char,
) -> *mut c_char {
    catch_unwind(AssertUnwindSafe(|| {
        if req.is_null() {
            return std::ptr::null_mut();
        }
        let Ok(Some(name)) = opt_str(name) else {
            return std::ptr::null_mut();
        };
        match unsafe { &*req }.inner.response_header(name) {
            Some(value) => to_c_string(value),
            None => std::ptr::null_mut(),
        }
    }))
    .unwrap_or(std::ptr::null_mut())
}

// ---------------------------------------------------------------------------
// Free functions
// ---------------------------------------------------------------------------

/// Free a body returned by `urlfetch_request_result`. Safe to call with null.
#[unsafe(no_mangle)]
pub extern "C" fn urlfetch_free_body(body: *mut FfiBody) {
    if body.is_null() {
        return;
    }
    let _ = catch_unwind(|| {
        let body = unsafe { Box::from_raw(body) };
        if !body.data.is_null() {
            drop(unsafe {
                Box::from_raw(std::ptr::slice_from_raw_parts_mut(body.data, body.len))
            });
        }
    });
}

/// Free a string returned by any `urlfetch_*` function. Safe to call with null.
#[unsafe(no_mangle)]
pub extern "C" fn urlfetch_free_string(s: *mut c_char) {
    if !s.is_null() {
        let _ = catch_unwind(|| {
            drop(unsafe { std::ffi::CString::from_raw(s) });
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::ffi::CString;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const POLL_MS: u32 = 5;

    fn spawn_server() -> SocketAddr {
        let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = std_listener.local_addr().unwrap();
        std_listener.set_nonblocking(true).unwrap();
        std::thread::spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(async {
                let listener = tokio::net::TcpListener::from_std(std_listener).unwrap();
                mock_server::run(listener).await
            })
            .unwrap();
        });
        addr
    }

    fn c(s: &str) -> CString {
        CString::new(s).unwrap()
    }

    fn take_string(s: *mut c_char) -> String {
        assert!(!s.is_null());
        let out = unsafe { CStr::from_ptr(s) }.to_str().unwrap().to_string();
        urlfetch_free_string(s);
        out
    }

    /// Everything a test callback saw, in order.
    #[derive(Default)]
    struct Seen {
        kinds: Vec<FfiEventKind>,
        statuses: Vec<i32>,
        progress: Vec<(u64, i64)>,
        errors: Vec<String>,
    }

    extern "C" fn record(event: *const FfiEvent, user_data: *mut c_void) {
        let event = unsafe { &*event };
        let seen = unsafe { &*(user_data as *const RefCell<Seen>) };
        let mut seen = seen.borrow_mut();
        seen.kinds.push(event.kind);
        seen.statuses.push(event.status);
        if event.kind == FfiEventKind::Progress {
            seen.progress.push((event.bytes_so_far, event.total_size));
        }
        if !event.error_message.is_null() {
            let msg = unsafe { CStr::from_ptr(event.error_message) };
            seen.errors.push(msg.to_string_lossy().into_owned());
        }
    }

    fn new_request(
        lp: *const FfiLoop,
        url: &str,
        opts: Option<&FfiRequestOptions>,
    ) -> *mut FfiRequest {
        let url = c(url);
        let opts = opts.map_or(std::ptr::null(), |o| o as *const FfiRequestOptions);
        let req = urlfetch_request_new(lp, url.as_ptr(), opts);
        assert!(!req.is_null());
        req
    }

    fn subscribe(req: *mut FfiRequest, seen: &RefCell<Seen>) {
        let user_data = seen as *const RefCell<Seen> as *mut c_void;
        assert_eq!(
            urlfetch_request_set_callback(req, Some(record), user_data),
            FfiStatus::Ok
        );
    }

    fn body_of(req: *const FfiRequest) -> (FfiBodyTag, Vec<u8>) {
        let body = urlfetch_request_result(req);
        assert!(!body.is_null());
        let out = {
            let b = unsafe { &*body };
            (b.tag, unsafe { std::slice::from_raw_parts(b.data, b.len) }.to_vec())
        };
        urlfetch_free_body(body);
        out
    }

    // --- null handling ---

    #[test]
    fn loop_new_and_free() {
        let lp = urlfetch_loop_new(None, std::ptr::null_mut());
        assert!(!lp.is_null());
        assert_eq!(urlfetch_loop_pump(lp), 0);
        urlfetch_loop_free(lp);
    }

    #[test]
    fn null_handles_are_rejected() {
        assert_eq!(urlfetch_loop_pump(std::ptr::null()), 0);
        assert!(
            urlfetch_request_new(std::ptr::null(), std::ptr::null(), std::ptr::null()).is_null()
        );
        assert_eq!(urlfetch_request_start(std::ptr::null()), FfiStatus::NullArg);
        assert_eq!(urlfetch_request_cancel(std::ptr::null()), FfiStatus::NullArg);
        assert_eq!(
            urlfetch_request_wait(std::ptr::null(), POLL_MS),
            FfiStatus::NullArg
        );
        let req = std::ptr::null_mut();
        assert_eq!(
            urlfetch_request_set_callback(req, Some(record), std::ptr::null_mut()),
            FfiStatus::NullArg
        );
        assert!(!urlfetch_request_is_finished(std::ptr::null()));
        assert_eq!(urlfetch_request_status(std::ptr::null()), -1);
        assert!(urlfetch_request_result(std::ptr::null()).is_null());
        assert!(urlfetch_request_error(std::ptr::null()).is_null());
    }

    #[test]
    fn free_null_is_safe() {
        urlfetch_loop_free(std::ptr::null_mut());
        urlfetch_request_free(std::ptr::null_mut());
        urlfetch_free_body(std::ptr::null_mut());
        urlfetch_free_string(std::ptr::null_mut());
    }

    #[test]
    fn options_default_leaves_everything_unset() {
        let opts = urlfetch_request_options_default();
        assert!(opts.method.is_null());
        assert!(opts.body.is_null());
        assert_eq!(opts.chunk_size, 0);
        assert_eq!(opts.timeout_ms, 0);
        assert!(opts.decode);
        assert!(opts.verify);
        assert_eq!(opts.implementation, FfiImplementation::Default);
    }

    #[test]
    fn invalid_utf8_url_returns_null() {
        let lp = urlfetch_loop_new(None, std::ptr::null_mut());
        let bad = [0xffu8, 0xfe, 0x00];
        let req = urlfetch_request_new(lp, bad.as_ptr() as *const c_char, std::ptr::null());
        assert!(req.is_null());
        urlfetch_loop_free(lp);
    }

    #[test]
    fn header_with_null_value_returns_null() {
        let lp = urlfetch_loop_new(None, std::ptr::null_mut());
        let name = c("X-Test");
        let headers = [FfiHeader {
            name: name.as_ptr(),
            value: std::ptr::null(),
        }];
        let opts = FfiRequestOptions {
            headers: headers.as_ptr(),
            headers_len: headers.len(),
            ..FfiRequestOptions::default()
        };
        let url = c("http://127.0.0.1:1/");
        assert!(urlfetch_request_new(lp, url.as_ptr(), &opts).is_null());
        urlfetch_loop_free(lp);
    }

    #[test]
    fn unstarted_request_has_no_outcome() {
        let lp = urlfetch_loop_new(None, std::ptr::null_mut());
        let req = new_request(lp, "http://127.0.0.1:1/", None);
        assert!(!urlfetch_request_is_finished(req));
        assert_eq!(urlfetch_request_status(req), -1);
        assert!(urlfetch_request_result(req).is_null());
        assert!(urlfetch_request_error(req).is_null());
        assert_eq!(urlfetch_request_wait(req, POLL_MS), FfiStatus::Ok);
        urlfetch_request_free(req);
        urlfetch_loop_free(lp);
    }

    // --- against the mock server ---

    fn with_progress() -> FfiRequestOptions {
        FfiRequestOptions {
            report_progress: true,
            ..FfiRequestOptions::default()
        }
    }

    #[test]
    fn json_request_delivers_events_in_order() {
        let addr = spawn_server();
        let lp = urlfetch_loop_new(None, std::ptr::null_mut());
        let seen = RefCell::new(Seen::default());
        let opts = with_progress();
        let req = new_request(lp, &format!("http://{addr}/json"), Some(&opts));
        subscribe(req, &seen);

        assert_eq!(urlfetch_request_start(req), FfiStatus::Ok);
        assert_eq!(seen.borrow().kinds, vec![FfiEventKind::Start]);
        assert_eq!(urlfetch_request_wait(req, POLL_MS), FfiStatus::Ok);

        assert!(urlfetch_request_is_finished(req));
        assert_eq!(urlfetch_request_status(req), 200);
        {
            let seen = seen.borrow();
            let kinds = &seen.kinds;
            assert_eq!(kinds.first(), Some(&FfiEventKind::Start));
            assert_eq!(
                kinds[kinds.len() - 2..],
                [FfiEventKind::Success, FfiEventKind::Finish]
            );
            assert!(kinds[1..kinds.len() - 2]
                .iter()
                .all(|k| *k == FfiEventKind::Progress));
            assert_eq!(seen.progress.first(), Some(&(0, 7)));
            assert_eq!(seen.progress.last(), Some(&(7, 7)));
            assert_eq!(seen.statuses.last(), Some(&200));
        }

        let (tag, data) = body_of(req);
        assert_eq!(tag, FfiBodyTag::Json);
        assert_eq!(data, br#"{"a":1}"#);
        let name = c("content-type");
        assert_eq!(
            take_string(urlfetch_request_header(req, name.as_ptr())),
            "application/json"
        );
        assert!(urlfetch_request_error(req).is_null());

        urlfetch_request_free(req);
        urlfetch_loop_free(lp);
    }

    #[test]
    fn lifecycle_misuse_is_reported() {
        let addr = spawn_server();
        let lp = urlfetch_loop_new(None, std::ptr::null_mut());
        let seen = RefCell::new(Seen::default());
        let req = new_request(lp, &format!("http://{addr}/json"), None);
        assert_eq!(
            urlfetch_request_set_callback(req, None, std::ptr::null_mut()),
            FfiStatus::NullArg
        );

        assert_eq!(urlfetch_request_start(req), FfiStatus::Ok);
        assert_eq!(urlfetch_request_start(req), FfiStatus::AlreadyStarted);
        let user_data = &seen as *const RefCell<Seen> as *mut c_void;
        assert_eq!(
            urlfetch_request_set_callback(req, Some(record), user_data),
            FfiStatus::BindAfterStart
        );
        assert_eq!(urlfetch_request_wait(req, POLL_MS), FfiStatus::Ok);
        assert!(seen.borrow().kinds.is_empty());

        urlfetch_request_free(req);
        urlfetch_loop_free(lp);
    }

    #[test]
    fn options_reach_the_wire() {
        let addr = spawn_server();
        let lp = urlfetch_loop_new(None, std::ptr::null_mut());
        let method = c("PUT");
        let body = b"payload";
        let (name, value) = (c("X-Custom"), c("yes"));
        let headers = [FfiHeader {
            name: name.as_ptr(),
            value: value.as_ptr(),
        }];
        let ua = c("ffi-test/1.0");
        let cookies = c("k=v");
        let opts = FfiRequestOptions {
            method: method.as_ptr(),
            body: body.as_ptr(),
            body_len: body.len(),
            headers: headers.as_ptr(),
            headers_len: headers.len(),
            user_agent: ua.as_ptr(),
            cookies: cookies.as_ptr(),
            implementation: FfiImplementation::Socket,
            ..urlfetch_request_options_default()
        };
        let req = new_request(lp, &format!("http://{addr}/echo"), Some(&opts));
        assert_eq!(urlfetch_request_start(req), FfiStatus::Ok);
        assert_eq!(urlfetch_request_wait(req, POLL_MS), FfiStatus::Ok);

        let (tag, data) = body_of(req);
        assert_eq!(tag, FfiBodyTag::Json);
        let echo: mock_server::Echo = serde_json::from_slice(&data).unwrap();
        assert_eq!(echo.method, "PUT");
        assert_eq!(echo.body, "payload");
        assert_eq!(echo.headers["x-custom"], "yes");
        assert_eq!(echo.headers["user-agent"], "ffi-test/1.0");
        assert_eq!(echo.headers["cookie"], "k=v");

        urlfetch_request_free(req);
        urlfetch_loop_free(lp);
    }

    #[test]
    fn basic_auth_on_the_pooled_transport() {
        let addr = spawn_server();
        let lp = urlfetch_loop_new(None, std::ptr::null_mut());
        let (user, password) = (c(mock_server::BASIC_USER), c(mock_server::BASIC_PASSWORD));
        let opts = FfiRequestOptions {
            auth_user: user.as_ptr(),
            auth_password: password.as_ptr(),
            implementation: FfiImplementation::Pooled,
            ..FfiRequestOptions::default()
        };
        let req = new_request(lp, &format!("http://{addr}/basic-auth"), Some(&opts));
        assert_eq!(urlfetch_request_start(req), FfiStatus::Ok);
        assert_eq!(urlfetch_request_wait(req, POLL_MS), FfiStatus::Ok);
        assert_eq!(urlfetch_request_status(req), 200);

        urlfetch_request_free(req);
        urlfetch_loop_free(lp);
    }

    #[test]
    fn failure_status_is_not_an_error() {
        let addr = spawn_server();
        let lp = urlfetch_loop_new(None, std::ptr::null_mut());
        let seen = RefCell::new(Seen::default());
        let req = new_request(lp, &format!("http://{addr}/status/404"), None);
        subscribe(req, &seen);
        assert_eq!(urlfetch_request_start(req), FfiStatus::Ok);
        assert_eq!(urlfetch_request_wait(req, POLL_MS), FfiStatus::Ok);

        assert_eq!(urlfetch_request_status(req), 404);
        assert!(seen.borrow().kinds.contains(&FfiEventKind::Failure));
        assert!(urlfetch_request_error(req).is_null());
        let (tag, data) = body_of(req);
        assert_eq!(tag, FfiBodyTag::Text);
        assert_eq!(data, b"status 404");

        urlfetch_request_free(req);
        urlfetch_loop_free(lp);
    }

    #[test]
    fn refused_connection_reports_an_error() {
        let addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let lp = urlfetch_loop_new(None, std::ptr::null_mut());
        let seen = RefCell::new(Seen::default());
        let req = new_request(lp, &format!("http://{addr}/"), None);
        subscribe(req, &seen);
        assert_eq!(urlfetch_request_start(req), FfiStatus::Ok);
        assert_eq!(urlfetch_request_wait(req, POLL_MS), FfiStatus::Ok);

        assert_eq!(
            seen.borrow().kinds,
            vec![FfiEventKind::Start, FfiEventKind::Error, FfiEventKind::Finish]
        );
        assert_eq!(seen.borrow().errors.len(), 1);
        assert_eq!(urlfetch_request_status(req), -1);
        assert!(urlfetch_request_result(req).is_null());
        assert!(!take_string(urlfetch_request_error(req)).is_empty());

        urlfetch_request_free(req);
        urlfetch_loop_free(lp);
    }

    #[test]
    fn progress_is_not_delivered_unless_requested() {
        let addr = spawn_server();
        let lp = urlfetch_loop_new(None, std::ptr::null_mut());
        let seen = RefCell::new(Seen::default());
        let req = new_request(lp, &format!("http://{addr}/json"), None);
        subscribe(req, &seen);
        assert_eq!(urlfetch_request_start(req), FfiStatus::Ok);
        assert_eq!(urlfetch_request_wait(req, POLL_MS), FfiStatus::Ok);

        assert_eq!(
            seen.borrow().kinds,
            vec![FfiEventKind::Start, FfiEventKind::Success, FfiEventKind::Finish]
        );
        assert!(seen.borrow().progress.is_empty());

        urlfetch_request_free(req);
        urlfetch_loop_free(lp);
    }

    #[test]
    fn reporting_progress_streams_text_as_bytes() {
        let addr = spawn_server();
        let lp = urlfetch_loop_new(None, std::ptr::null_mut());
        let seen = RefCell::new(Seen::default());
        let opts = with_progress();
        let req = new_request(lp, &format!("http://{addr}/status/404"), Some(&opts));
        subscribe(req, &seen);
        assert_eq!(urlfetch_request_start(req), FfiStatus::Ok);
        assert_eq!(urlfetch_request_wait(req, POLL_MS), FfiStatus::Ok);

        assert!(seen.borrow().kinds.contains(&FfiEventKind::Progress));
        assert_eq!(seen.borrow().progress.last(), Some(&(10, 10)));
        let (tag, data) = body_of(req);
        assert_eq!(tag, FfiBodyTag::Bytes);
        assert_eq!(data, b"status 404");

        urlfetch_request_free(req);
        urlfetch_loop_free(lp);
    }

    #[test]
    fn cancel_before_the_first_read_skips_the_transfer() {
        let addr = spawn_server();
        let lp = urlfetch_loop_new(None, std::ptr::null_mut());
        let seen = RefCell::new(Seen::default());
        let req = new_request(lp, &format!("http://{addr}/slow/50"), None);
        subscribe(req, &seen);
        assert_eq!(urlfetch_request_start(req), FfiStatus::Ok);
        assert_eq!(urlfetch_request_cancel(req), FfiStatus::Ok);
        assert_eq!(urlfetch_request_wait(req, POLL_MS), FfiStatus::Ok);

        let seen = seen.borrow();
        assert_eq!(
            seen.kinds[seen.kinds.len() - 2..],
            [FfiEventKind::Cancel, FfiEventKind::Finish]
        );
        assert!(urlfetch_request_result(req).is_null());

        urlfetch_request_free(req);
        urlfetch_loop_free(lp);
    }

    /// Context for `cancel_on_first_chunk`.
    struct Canceller {
        req: *const FfiRequest,
        seen: RefCell<Seen>,
    }

    extern "C" fn cancel_on_first_chunk(event: *const FfiEvent, user_data: *mut c_void) {
        let ctx = unsafe { &*(user_data as *const Canceller) };
        let seen_ptr = &ctx.seen as *const RefCell<Seen> as *mut c_void;
        record(event, seen_ptr);
        let event = unsafe { &*event };
        if event.kind == FfiEventKind::Progress && event.bytes_so_far > 0 {
            assert_eq!(urlfetch_request_cancel(ctx.req), FfiStatus::Ok);
        }
    }

    #[test]
    fn cancel_after_the_first_chunk_stops_a_slow_transfer() {
        let addr = spawn_server();
        let lp = urlfetch_loop_new(None, std::ptr::null_mut());
        let opts = with_progress();
        let req = new_request(lp, &format!("http://{addr}/slow/50"), Some(&opts));
        let ctx = Canceller {
            req,
            seen: RefCell::new(Seen::default()),
        };
        let user_data = &ctx as *const Canceller as *mut c_void;
        assert_eq!(
            urlfetch_request_set_callback(req, Some(cancel_on_first_chunk), user_data),
            FfiStatus::Ok
        );
        assert_eq!(urlfetch_request_start(req), FfiStatus::Ok);
        assert_eq!(urlfetch_request_wait(req, POLL_MS), FfiStatus::Ok);

        let seen = ctx.seen.borrow();
        assert_eq!(
            seen.kinds[seen.kinds.len() - 2..],
            [FfiEventKind::Cancel, FfiEventKind::Finish]
        );
        let received = seen.progress.last().map_or(0, |p| p.0);
        assert!(received > 0);
        assert!(received < 50 * mock_server::CHUNK_LEN as u64);
        assert!(urlfetch_request_result(req).is_null());

        drop(seen);
        urlfetch_request_free(req);
        urlfetch_loop_free(lp);
    }

    static WAKES: AtomicUsize = AtomicUsize::new(0);

    extern "C" fn count_wake(user_data: *mut c_void) {
        let counter = unsafe { &*(user_data as *const AtomicUsize) };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn wake_and_pump_deliver_events() {
        let addr = spawn_server();
        let user_data = &WAKES as *const AtomicUsize as *mut c_void;
        let lp = urlfetch_loop_new(Some(count_wake), user_data);
        let seen = RefCell::new(Seen::default());
        let req = new_request(lp, &format!("http://{addr}/json"), None);
        subscribe(req, &seen);
        assert_eq!(urlfetch_request_start(req), FfiStatus::Ok);

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while !urlfetch_request_is_finished(req) {
            assert!(std::time::Instant::now() < deadline, "request did not finish");
            if WAKES.load(Ordering::SeqCst) > 0 {
                urlfetch_loop_pump(lp);
            }
            std::thread::sleep(Duration::from_millis(POLL_MS.into()));
        }
        assert!(WAKES.load(Ordering::SeqCst) > 0);
        assert_eq!(seen.borrow().kinds.last(), Some(&FfiEventKind::Finish));

        urlfetch_request_free(req);
        urlfetch_loop_free(lp);
    }

    #[test]
    fn file_sink_returns_the_path() {
        let addr = spawn_server();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let c_path = c(path.to_str().unwrap());
        let lp = urlfetch_loop_new(None, std::ptr::null_mut());
        let opts = FfiRequestOptions {
            file_path: c_path.as_ptr(),
            ..FfiRequestOptions::default()
        };
        let req = new_request(lp, &format!("http://{addr}/bytes/2048"), Some(&opts));
        assert_eq!(urlfetch_request_start(req), FfiStatus::Ok);
        assert_eq!(urlfetch_request_wait(req, POLL_MS), FfiStatus::Ok);

        let (tag, data) = body_of(req);
        assert_eq!(tag, FfiBodyTag::File);
        assert_eq!(data, path.to_str().unwrap().as_bytes());
        assert_eq!(std::fs::read(&path).unwrap().len(), 2048);

        urlfetch_request_free(req);
        urlfetch_loop_free(lp);
    }
}
