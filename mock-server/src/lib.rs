//! Test server exercising every response shape the request engine handles.
//!
//! Routes:
//! - `/json`, `/json-charset`, `/text-json`, `/truncated`: content-type driven
//!   decoding
//! - `/redirect`, `/status/{code}`: status classification
//! - `/bytes/{n}`, `/stream/{n}`, `/slow/{n}`: sized, chunked and throttled
//!   bodies for progress and cancellation
//! - `/cookies`: repeated `Set-Cookie`
//! - `/binary`: a body that is not UTF-8
//! - `/echo`: reflects method, headers and body as JSON
//! - `/basic-auth`: 401 unless the expected credentials are sent

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::time::Duration;

use axum::{
    body::{Body, Bytes},
    extract::Path,
    http::{header, HeaderMap, Method, StatusCode},
    response::{AppendHeaders, IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use futures_util::stream;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

/// Size of every chunk sent by `/stream` and `/slow`.
pub const CHUNK_LEN: usize = 1024;
/// Delay between chunks of `/slow`.
pub const SLOW_CHUNK_DELAY: Duration = Duration::from_millis(100);
/// Username and password accepted by `/basic-auth`.
pub const BASIC_USER: &str = "user";
pub const BASIC_PASSWORD: &str = "pass";
// base64("user:pass")
const BASIC_HEADER: &str = "Basic dXNlcjpwYXNz";

/// What `/echo` saw.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Echo {
    pub method: String,
    /// Lower-cased header names; repeated headers joined with `, `.
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

pub fn app() -> Router {
    Router::new()
        .route("/json", get(json))
        .route("/json-charset", get(json_charset))
        .route("/text-json", get(text_json))
        .route("/truncated", get(truncated))
        .route("/redirect", get(redirect))
        .route("/status/{code}", get(status))
        .route("/bytes/{n}", get(bytes))
        .route("/stream/{n}", get(chunked))
        .route("/slow/{n}", get(slow))
        .route("/cookies", get(cookies))
        .route("/binary", get(binary))
        .route("/echo", any(echo))
        .route("/basic-auth", get(basic_auth))
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    axum::serve(listener, app()).await
}

async fn json() -> Response {
    ([(header::CONTENT_TYPE, "application/json")], r#"{"a":1}"#).into_response()
}

async fn json_charset() -> Response {
    (
        [(header::CONTENT_TYPE, "application/json; charset=utf-8")],
        r#"{"ok":true,"items":[1,2,3]}"#,
    )
        .into_response()
}

async fn text_json() -> Response {
    ([(header::CONTENT_TYPE, "text/plain")], r#"{"a":1}"#).into_response()
}

async fn truncated() -> Response {
    ([(header::CONTENT_TYPE, "application/json")], r#"{"a":"#).into_response()
}

async fn redirect() -> Response {
    (StatusCode::FOUND, [(header::LOCATION, "/json")], "moved").into_response()
}

async fn status(Path(code): Path<u16>) -> Response {
    match StatusCode::from_u16(code) {
        Ok(status) => (status, format!("status {code}")).into_response(),
        Err(_) => (StatusCode::BAD_REQUEST, "invalid status").into_response(),
    }
}

async fn bytes(Path(n): Path<usize>) -> Response {
    (
        [(header::CONTENT_TYPE, "application/octet-stream")],
        vec![b'x'; n],
    )
        .into_response()
}

fn chunk(i: usize) -> Result<Bytes, Infallible> {
    let fill = b'a' + (i % 26) as u8;
    Ok(Bytes::from(vec![fill; CHUNK_LEN]))
}

/// `n` chunks of `CHUNK_LEN` bytes with no `Content-Length`.
async fn chunked(Path(n): Path<usize>) -> Response {
    let body = Body::from_stream(stream::iter((0..n).map(chunk)));
    ([(header::CONTENT_TYPE, "application/octet-stream")], body).into_response()
}

/// Like `/stream/{n}`, with `SLOW_CHUNK_DELAY` before each chunk.
async fn slow(Path(n): Path<usize>) -> Response {
    let chunks = stream::unfold(0usize, move |i| async move {
        if i >= n {
            return None;
        }
        tokio::time::sleep(SLOW_CHUNK_DELAY).await;
        Some((chunk(i), i + 1))
    });
    (
        [(header::CONTENT_TYPE, "application/octet-stream")],
        Body::from_stream(chunks),
    )
        .into_response()
}

async fn cookies() -> Response {
    (
        AppendHeaders([(header::SET_COOKIE, "a=1"), (header::SET_COOKIE, "b=2")]),
        "cookies set",
    )
        .into_response()
}

async fn binary() -> Response {
    (
        [(header::CONTENT_TYPE, "application/octet-stream")],
        vec![0xffu8, 0xfe, 0x00, 0x80],
    )
        .into_response()
}

async fn echo(method: Method, headers: HeaderMap, body: Bytes) -> Json<Echo> {
    let mut seen = BTreeMap::<String, String>::new();
    for (name, value) in &headers {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        seen.entry(name.as_str().to_string())
            .and_modify(|v| {
                v.push_str(", ");
                v.push_str(&value);
            })
            .or_insert(value);
    }
    Json(Echo {
        method: method.to_string(),
        headers: seen,
        body: String::from_utf8_lossy(&body).into_owned(),
    })
}

async fn basic_auth(headers: HeaderMap) -> Response {
    let authorized = headers
        .get(header::AUTHORIZATION)
        .map(|v| v.as_bytes() == BASIC_HEADER.as_bytes())
        .unwrap_or(false);
    if authorized {
        Json(serde_json::json!({ "authenticated": true, "user": BASIC_USER })).into_response()
    } else {
        (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Basic realm=\"mock\"")],
            "unauthorized",
        )
            .into_response()
    }
}
