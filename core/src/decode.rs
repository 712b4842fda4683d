//! Turning raw response bytes into a `Body`.
//!
//! Nothing here fails: a body that cannot be decoded is handed on as it came,
//! and the reason is logged at `debug`.

use tracing::debug;

use crate::http::{Body, ResponseMeta};

const JSON_MIME: &str = "application/json";

/// Best-effort UTF-8 decode of a fully buffered body.
pub(crate) fn text_or_bytes(raw: Vec<u8>) -> Body {
    match String::from_utf8(raw) {
        Ok(text) => Body::Text(text),
        Err(err) => {
            debug!(error = %err.utf8_error(), "body is not UTF-8, keeping bytes");
            Body::Bytes(err.into_bytes())
        }
    }
}

/// Parse `body` as JSON when the response declares `application/json`.
///
/// On a parse failure the undecoded body is kept; bytes that happen to be
/// valid UTF-8 come back as `Text`.
pub(crate) fn decode_body(meta: &ResponseMeta, body: Body) -> Body {
    let is_json = meta
        .mime_type()
        .map(|mime| mime.eq_ignore_ascii_case(JSON_MIME))
        .unwrap_or(false);
    if !is_json {
        return body;
    }

    let parsed = match &body {
        Body::Text(text) => serde_json::from_str(text),
        Body::Bytes(bytes) => serde_json::from_slice(bytes),
        Body::Json(_) | Body::File { .. } => return body,
    };
    match parsed {
        Ok(value) => Body::Json(value),
        Err(err) => {
            debug!(%err, "response declared JSON but did not parse");
            match body {
                Body::Bytes(bytes) => text_or_bytes(bytes),
                other => other,
            }
        }
    }
}
