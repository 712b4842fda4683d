//! HTTP value types shared by transports, the worker and the controller.
//!
//! # Design
//! Headers are kept as an ordered list of owned `(name, value)` pairs with
//! case-insensitive lookup, so values can cross the worker/consumer boundary
//! and the C ABI without lifetimes. Response headers are normalised once, when
//! the transport hands back the head: every `Set-Cookie` line is folded into a
//! single `;`-joined entry and any other duplicate keeps the last value.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// HTTP method for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Head,
    Post,
    Put,
    Patch,
    Delete,
    Options,
    Other(String),
}

impl HttpMethod {
    pub fn as_str(&self) -> &str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Head => "HEAD",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Options => "OPTIONS",
            HttpMethod::Other(m) => m,
        }
    }
}

impl FromStr for HttpMethod {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        Ok(match upper.as_str() {
            "GET" => HttpMethod::Get,
            "HEAD" => HttpMethod::Head,
            "POST" => HttpMethod::Post,
            "PUT" => HttpMethod::Put,
            "PATCH" => HttpMethod::Patch,
            "DELETE" => HttpMethod::Delete,
            "OPTIONS" => HttpMethod::Options,
            _ => HttpMethod::Other(upper),
        })
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered header list with case-insensitive, unique keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Set `name`, replacing any existing entry regardless of case. The
    /// original position (and spelling) of the key is kept.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(&name)) {
            Some(entry) => entry.1 = value,
            None => self.0.push((name, value)),
        }
    }

    /// Set `name` only if it is not present yet.
    pub fn insert_default(&mut self, name: &str, value: impl Into<String>) {
        if !self.contains(name) {
            self.0.push((name.to_string(), value.into()));
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        let pos = self.0.iter().position(|(k, _)| k.eq_ignore_ascii_case(name))?;
        Some(self.0.remove(pos).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (k, v) in iter {
            headers.insert(k, v);
        }
        headers
    }
}

impl IntoIterator for Headers {
    type Item = (String, String);
    type IntoIter = std::vec::IntoIter<(String, String)>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Fold raw response header lines into a `Headers` map.
///
/// All `Set-Cookie` lines become one entry joined with `;`. Every other
/// repeated header keeps its last value.
pub fn merge_response_headers<I, K, V>(raw: I) -> Headers
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut headers = Headers::new();
    let mut cookies: Vec<String> = Vec::new();
    for (key, value) in raw {
        let (key, value) = (key.as_ref(), value.as_ref());
        if key.eq_ignore_ascii_case("set-cookie") {
            cookies.push(value.to_string());
        } else {
            headers.insert(key, value);
        }
    }
    if !cookies.is_empty() {
        headers.insert("Set-Cookie", cookies.join(";"));
    }
    headers
}

/// Status line and headers of a response, available before the body is read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseMeta {
    pub status: u16,
    pub headers: Headers,
    /// `None` when the server did not announce a length.
    pub content_length: Option<u64>,
    pub content_type: Option<String>,
}

impl ResponseMeta {
    /// Build the meta from raw header lines as read off the wire.
    pub fn from_raw<I, K, V>(status: u16, raw: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let headers = merge_response_headers(raw);
        let content_length = headers
            .get("content-length")
            .and_then(|v| v.trim().parse::<u64>().ok());
        let content_type = headers.get("content-type").map(str::to_string);
        Self {
            status,
            headers,
            content_length,
            content_type,
        }
    }

    /// Total body size for progress reporting.
    pub fn total_size(&self) -> Option<u64> {
        self.content_length
    }

    /// Content type with any `; charset=...` style parameters stripped.
    pub fn mime_type(&self) -> Option<&str> {
        self.content_type
            .as_deref()
            .map(|ct| ct.split(';').next().unwrap_or("").trim())
    }
}

/// Response payload handed to `on_success` / `on_redirect` / `on_failure`.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Text(String),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
    /// The body was streamed to a file instead of memory.
    File { path: PathBuf, bytes_written: u64 },
}

impl Body {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Body::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Body::Json(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Body::Bytes(b) => Some(b),
            Body::Text(s) => Some(s.as_bytes()),
            _ => None,
        }
    }
}
