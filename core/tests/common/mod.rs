//! Shared fixtures: a live mock server, a self-signed HTTPS server, a
//! CONNECT proxy and a callback recorder.

#![allow(dead_code)]

use std::cell::RefCell;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::{ServerConfig, ServerConnection, StreamOwned};

use urlfetch_core::{
    Body, Engine, EngineConfig, MainLoop, RequestBuilder, TransportKind, UrlRequest,
};

pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Start the mock server on a random port in a background runtime.
pub fn spawn_server() -> SocketAddr {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

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

pub struct Fixture {
    pub addr: SocketAddr,
    pub main_loop: MainLoop,
    pub engine: Engine,
}

impl Fixture {
    pub fn new(kind: TransportKind) -> Self {
        Self::with_config(EngineConfig::default().implementation(kind))
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let addr = spawn_server();
        let main_loop = MainLoop::new();
        let engine = Engine::from_config(config, main_loop.clone());
        Self {
            addr,
            main_loop,
            engine,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    pub fn request(&self, path: &str) -> RequestBuilder {
        self.engine.request(self.url(path))
    }

    /// Pump the loop until `req` delivered its outcome.
    pub fn finish(&self, req: &UrlRequest) {
        assert!(
            self.main_loop.run_until(|| req.is_finished(), TIMEOUT),
            "request to {} did not finish",
            req.url()
        );
    }

    /// Pump the loop until the live registry let go of every request.
    pub fn settle(&self) {
        assert!(
            self.main_loop
                .run_until(|| urlfetch_core::live_request_count() == 0, TIMEOUT),
            "requests still registered"
        );
    }
}

/// Read up to and including the blank line ending a request head. Reads one
/// byte at a time so nothing past the head is consumed.
fn read_head(r: &mut impl Read) -> io::Result<String> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if r.read(&mut byte)? == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        head.push(byte[0]);
    }
    Ok(String::from_utf8_lossy(&head).into_owned())
}

const TLS_RESPONSE: &[u8] =
    b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok";

/// HTTPS server with a fresh self-signed certificate for `127.0.0.1` and
/// `localhost`. Every request is answered with `200` and the text `ok`.
pub struct TlsServer {
    pub addr: SocketAddr,
    pub cert_pem: String,
}

impl TlsServer {
    pub fn spawn() -> Self {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["127.0.0.1".to_string(), "localhost".to_string()])
                .unwrap();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
        let config = ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![cert.der().clone()], key)
        .unwrap();
        let config = Arc::new(config);

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            for tcp in listener.incoming().flatten() {
                let config = Arc::clone(&config);
                // Handshakes the client rejects end here with an error.
                thread::spawn(move || serve_tls(config, tcp));
            }
        });
        Self {
            addr,
            cert_pem: cert.pem(),
        }
    }

    pub fn url(&self) -> String {
        format!("https://{}/", self.addr)
    }

    /// The server certificate as a PEM bundle on disk.
    pub fn ca_file(&self) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(self.cert_pem.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }
}

fn serve_tls(config: Arc<ServerConfig>, tcp: TcpStream) -> io::Result<()> {
    let conn = ServerConnection::new(config).map_err(io::Error::other)?;
    let mut tls = StreamOwned::new(conn, tcp);
    read_head(&mut tls)?;
    tls.write_all(TLS_RESPONSE)?;
    tls.conn.send_close_notify();
    tls.flush()
}

/// Proxy that accepts `CONNECT host:port` and relays bytes both ways, or
/// answers every `CONNECT` with a fixed status when built with `refusing`.
/// The head of every `CONNECT` it saw is kept for inspection.
pub struct ConnectProxy {
    pub addr: SocketAddr,
    heads: Arc<Mutex<Vec<String>>>,
}

impl ConnectProxy {
    pub fn spawn() -> Self {
        Self::start(None)
    }

    /// `status` is a status line tail such as `"403 Forbidden"`.
    pub fn refusing(status: &'static str) -> Self {
        Self::start(Some(status))
    }

    fn start(refuse: Option<&'static str>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let heads = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&heads);
        thread::spawn(move || {
            for client in listener.incoming().flatten() {
                let seen = Arc::clone(&seen);
                thread::spawn(move || relay(client, &seen, refuse));
            }
        });
        Self { addr, heads }
    }

    pub fn heads(&self) -> Vec<String> {
        self.heads.lock().unwrap().clone()
    }
}

fn relay(
    mut client: TcpStream,
    heads: &Mutex<Vec<String>>,
    refuse: Option<&'static str>,
) -> io::Result<()> {
    let head = read_head(&mut client)?;
    let target = head.split_whitespace().nth(1).unwrap_or_default().to_string();
    heads.lock().unwrap().push(head);

    if let Some(status) = refuse {
        client.write_all(format!("HTTP/1.1 {status}\r\nContent-Length: 0\r\n\r\n").as_bytes())?;
        return Ok(());
    }

    let upstream = TcpStream::connect(&target)?;
    client.write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")?;
    let (mut client_rx, mut upstream_tx) = (client.try_clone()?, upstream.try_clone()?);
    let forward = thread::spawn(move || {
        let _ = io::copy(&mut client_rx, &mut upstream_tx);
        let _ = upstream_tx.shutdown(Shutdown::Write);
    });
    let (mut upstream_rx, mut client_tx) = (upstream, client);
    let _ = io::copy(&mut upstream_rx, &mut client_tx);
    let _ = client_tx.shutdown(Shutdown::Write);
    let _ = forward.join();
    Ok(())
}

/// Records callback invocations as short strings, in order.
#[derive(Clone, Default)]
pub struct Recorder {
    pub log: Rc<RefCell<Vec<String>>>,
    pub progress: Rc<RefCell<Vec<(u64, Option<u64>)>>>,
    pub body: Rc<RefCell<Option<Body>>>,
}

impl Recorder {
    pub fn attach(&self, builder: RequestBuilder) -> RequestBuilder {
        let (log, progress, body) = (self.log.clone(), self.progress.clone(), self.body.clone());
        let on_progress = {
            let log = log.clone();
            move |_: &UrlRequest, n: u64, total: Option<u64>| {
                if log.borrow().last().map(String::as_str) != Some("progress") {
                    log.borrow_mut().push("progress".into());
                }
                progress.borrow_mut().push((n, total));
            }
        };
        let body_cb = |label: &'static str| {
            let log = log.clone();
            let body = body.clone();
            move |_: &UrlRequest, b: &Body| {
                log.borrow_mut().push(label.into());
                *body.borrow_mut() = Some(b.clone());
            }
        };
        let note = |label: &'static str| {
            let log = log.clone();
            move |_: &UrlRequest| log.borrow_mut().push(label.into())
        };
        let error_log = log.clone();
        builder
            .on_start(note("start"))
            .on_progress(on_progress)
            .on_success(body_cb("success"))
            .on_redirect(body_cb("redirect"))
            .on_failure(body_cb("failure"))
            .on_error(move |_, e| error_log.borrow_mut().push(format!("error:{:?}", e.category())))
            .on_cancel(note("cancel"))
            .on_finish(note("finish"))
    }

    /// Attach everything except the progress subscriber.
    pub fn attach_quiet(&self, builder: RequestBuilder) -> RequestBuilder {
        let log = self.log.clone();
        let body = self.body.clone();
        let body_cb = |label: &'static str| {
            let log = log.clone();
            let body = body.clone();
            move |_: &UrlRequest, b: &Body| {
                log.borrow_mut().push(label.into());
                *body.borrow_mut() = Some(b.clone());
            }
        };
        let note = |label: &'static str| {
            let log = log.clone();
            move |_: &UrlRequest| log.borrow_mut().push(label.into())
        };
        let error_log = log.clone();
        builder
            .on_start(note("start"))
            .on_success(body_cb("success"))
            .on_redirect(body_cb("redirect"))
            .on_failure(body_cb("failure"))
            .on_error(move |_, e| error_log.borrow_mut().push(format!("error:{:?}", e.category())))
            .on_cancel(note("cancel"))
            .on_finish(note("finish"))
    }

    pub fn events(&self) -> Vec<String> {
        self.log.borrow().clone()
    }

    pub fn body(&self) -> Option<Body> {
        self.body.borrow().clone()
    }

    /// How many of the mutually exclusive outcome callbacks fired.
    pub fn outcome_count(&self) -> usize {
        self.log
            .borrow()
            .iter()
            .filter(|e| {
                matches!(e.as_str(), "success" | "redirect" | "failure" | "cancel")
                    || e.starts_with("error:")
            })
            .count()
    }
}
