//! HTTP/1.1 framing for the socket transport.
//!
//! Only what a client needs: serialise a request head, parse a response head
//! with `httparse`, and frame the body (chunked, length-delimited, or read to
//! EOF).

use std::io::{self, BufRead, Read, Write};

use crate::error::FetchError;
use crate::http::{Headers, HttpMethod};

/// Upper bound on a response head; anything larger is treated as garbage.
const MAX_HEAD_BYTES: usize = 64 * 1024;
const MAX_HEADERS: usize = 128;

pub(crate) fn write_request_head<W: Write>(
    w: &mut W,
    method: &HttpMethod,
    target: &str,
    headers: &Headers,
) -> io::Result<()> {
    let mut head = format!("{method} {target} HTTP/1.1\r\n");
    for (name, value) in headers.iter() {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");
    w.write_all(head.as_bytes())
}

/// Status code and raw header lines of a response.
#[derive(Debug)]
pub(crate) struct ResponseHead {
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

impl ResponseHead {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .rev()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_chunked(&self) -> bool {
        self.header("transfer-encoding")
            .map(|te| te.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false)
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length")
            .and_then(|v| v.trim().parse().ok())
    }
}

/// Read one response head, skipping interim 1xx responses other than 101.
pub(crate) fn read_response_head<R: BufRead>(r: &mut R) -> Result<ResponseHead, FetchError> {
    loop {
        let head = read_single_head(r)?;
        if (100..200).contains(&head.status) && head.status != 101 {
            continue;
        }
        return Ok(head);
    }
}

fn read_single_head<R: BufRead>(r: &mut R) -> Result<ResponseHead, FetchError> {
    let mut raw = Vec::with_capacity(1024);
    loop {
        let available = r.fill_buf()?;
        if available.is_empty() {
            return Err(FetchError::Protocol(
                "connection closed before the response head was complete".into(),
            ));
        }
        // Up to the next newline, and never past the size limit.
        let line_end = available
            .iter()
            .position(|&b| b == b'\n')
            .map_or(available.len(), |i| i + 1);
        let take = line_end.min(MAX_HEAD_BYTES + 1 - raw.len());
        raw.extend_from_slice(&available[..take]);
        r.consume(take);

        if raw.ends_with(b"\r\n\r\n") || raw.ends_with(b"\n\n") {
            break;
        }
        if raw.len() > MAX_HEAD_BYTES {
            return Err(FetchError::Protocol("response head too large".into()));
        }
    }

    let mut header_buf = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut header_buf);
    match response.parse(&raw) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(FetchError::Protocol("incomplete response head".into()))
        }
        Err(e) => return Err(FetchError::Protocol(e.to_string())),
    }
    let status = response
        .code
        .ok_or_else(|| FetchError::Protocol("missing status code".into()))?;
    let headers = response
        .headers
        .iter()
        .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).into_owned()))
        .collect();
    Ok(ResponseHead { status, headers })
}

/// How the body following a head is delimited.
pub(crate) enum BodyReader<R> {
    Empty,
    Length(io::Take<R>),
    Chunked(ChunkedReader<R>),
    UntilEof(R),
}

impl<R: BufRead> BodyReader<R> {
    pub fn new(reader: R, head: &ResponseHead, method: &HttpMethod) -> Self {
        let bodiless = *method == HttpMethod::Head
            || (100..200).contains(&head.status)
            || head.status == 204
            || head.status == 304;
        if bodiless {
            BodyReader::Empty
        } else if head.is_chunked() {
            BodyReader::Chunked(ChunkedReader::new(reader))
        } else if let Some(len) = head.content_length() {
            BodyReader::Length(reader.take(len))
        } else {
            BodyReader::UntilEof(reader)
        }
    }
}

impl<R: BufRead> Read for BodyReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            BodyReader::Empty => Ok(0),
            BodyReader::Length(r) => r.read(buf),
            BodyReader::Chunked(r) => r.read(buf),
            BodyReader::UntilEof(r) => r.read(buf),
        }
    }
}

/// Decoder for `Transfer-Encoding: chunked`.
pub(crate) struct ChunkedReader<R> {
    inner: R,
    remaining: u64,
    done: bool,
}

impl<R: BufRead> ChunkedReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            remaining: 0,
            done: false,
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    fn read_line(&mut self) -> io::Result<String> {
        let mut line = String::new();
        if self.inner.read_line(&mut line)? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed inside chunked body",
            ));
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    fn next_chunk_size(&mut self) -> io::Result<u64> {
        let line = self.read_line()?;
        let size = line.split(';').next().unwrap_or("").trim();
        u64::from_str_radix(size, 16).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidData, format!("bad chunk size {size:?}"))
        })
    }
}

impl<R: BufRead> Read for ChunkedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.done || buf.is_empty() {
            return Ok(0);
        }
        if self.remaining == 0 {
            self.remaining = self.next_chunk_size()?;
            if self.remaining == 0 {
                // trailers end with an empty line
                while !self.read_line()?.is_empty() {}
                self.done = true;
                return Ok(0);
            }
        }
        let max = buf.len().min(self.remaining as usize);
        let n = self.inner.read(&mut buf[..max])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed inside chunk",
            ));
        }
        self.remaining -= n as u64;
        if self.remaining == 0 {
            // CRLF after the chunk data
            self.read_line()?;
        }
        Ok(n)
    }
}
