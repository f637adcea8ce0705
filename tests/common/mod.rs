//! Shared utilities for integration tests: server boot, scripted backends and raw HTTP.

#![allow(dead_code)]

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};

use sluice::config::{ProxyRouteConfig, ServerConfig};
use sluice::endpoint::{Endpoint, SimpleProxyRouterEndpoint};
use sluice::http::HttpServer;
use sluice::pipeline::{Pipeline, ServerComponents};

/// A running server; dropping it leaves the server running until the test ends.
pub struct TestServer {
    pub addr: SocketAddr,
    pub pipeline: Arc<Pipeline>,
    shutdown: broadcast::Sender<()>,
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(());
    }
}

/// Config with short timeouts suited to tests.
pub fn test_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.listener.bind_address = "127.0.0.1:0".into();
    config.timeouts.endpoint_ms = 2_000;
    config.timeouts.downstream_connect_ms = 1_000;
    config.timeouts.downstream_idle_ms = 2_000;
    config.timeouts.incomplete_call_ms = 1_000;
    config.workers.pool_size = 16;
    config
}

pub async fn start_server(config: ServerConfig, components: ServerComponents) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown, rx) = broadcast::channel(1);
    let server = HttpServer::new(config, components);
    let pipeline = Arc::clone(server.pipeline());
    tokio::spawn(async move {
        let _ = server.run(listener, rx).await;
    });
    TestServer { addr, pipeline, shutdown }
}

/// A proxy route forwarding `/proxy/**` to `downstream` with the prefix stripped.
pub fn proxy_endpoint(downstream: SocketAddr) -> Endpoint {
    proxy_endpoint_from(&proxy_route(downstream))
}

pub fn proxy_endpoint_from(route: &ProxyRouteConfig) -> Endpoint {
    Endpoint::proxy(SimpleProxyRouterEndpoint::from_config(route).unwrap())
}

/// Route config behind [`proxy_endpoint`], with tracing headers and a subspan on.
pub fn proxy_route(downstream: SocketAddr) -> ProxyRouteConfig {
    ProxyRouteConfig {
        name: "downstream".into(),
        path: "/proxy/**".into(),
        methods: Vec::new(),
        host: downstream.ip().to_string(),
        port: downstream.port(),
        tls: false,
        strip_prefix: Some("/proxy".into()),
        propagate_tracing_headers: true,
        subspan: true,
        relaxed_tls: false,
    }
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

/// A keep-alive HTTP/1.1 backend answering every request with `body`.
/// The counter reports how many TCP connections it accepted.
pub async fn start_keep_alive_backend(body: &'static str) -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&accepted);

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let service = hyper::service::service_fn(move |_req: Request<Incoming>| async move {
                    Ok::<_, Infallible>(Response::new(Full::new(Bytes::from_static(body.as_bytes()))))
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    (addr, accepted)
}

/// What a recording backend saw on the wire.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    /// Request line and headers, as sent.
    pub head: String,
    /// Body bytes exactly as framed on the wire.
    pub raw_body: Vec<u8>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<String> {
        self.head.lines().skip(1).find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.trim().eq_ignore_ascii_case(name).then(|| value.trim().to_string())
        })
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Read one request off a raw socket, keeping the body's wire framing.
async fn read_raw_request(stream: &mut TcpStream) -> Option<RecordedRequest> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let head_end = loop {
        if let Some(pos) = find(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let mut recorded = RecordedRequest {
        head,
        raw_body: buf[head_end..].to_vec(),
    };

    if recorded
        .header("transfer-encoding")
        .map_or(false, |v| v.eq_ignore_ascii_case("chunked"))
    {
        while !recorded.raw_body.ends_with(b"0\r\n\r\n") {
            let n = stream.read(&mut chunk).await.ok()?;
            if n == 0 {
                break;
            }
            recorded.raw_body.extend_from_slice(&chunk[..n]);
        }
    } else if let Some(len) = recorded.header("content-length").and_then(|v| v.parse::<usize>().ok()) {
        while recorded.raw_body.len() < len {
            let n = stream.read(&mut chunk).await.ok()?;
            if n == 0 {
                break;
            }
            recorded.raw_body.extend_from_slice(&chunk[..n]);
        }
    }
    Some(recorded)
}

/// Decode a chunked body into its payload bytes.
pub fn decode_chunked(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut rest = raw;
    while let Some(line_end) = find(rest, b"\r\n") {
        let size_line = String::from_utf8_lossy(&rest[..line_end]);
        let size = usize::from_str_radix(size_line.split(';').next().unwrap_or("0").trim(), 16).unwrap_or(0);
        rest = &rest[line_end + 2..];
        if size == 0 {
            break;
        }
        out.extend_from_slice(&rest[..size]);
        rest = &rest[size + 2..];
    }
    out
}

/// A backend that records each request and answers `200 ok`, closing after each.
pub async fn start_recording_backend() -> (SocketAddr, mpsc::UnboundedReceiver<RecordedRequest>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                if let Some(recorded) = read_raw_request(&mut stream).await {
                    let _ = tx.send(recorded);
                    let _ = stream
                        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok")
                        .await;
                    let _ = stream.shutdown().await;
                }
            });
        }
    });

    (addr, rx)
}

/// A backend that answers with `response` as soon as a request head arrives,
/// without waiting for the body, then drains the socket until the peer closes.
pub async fn start_scripted_backend(response: &'static [u8]) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 4096];
                while find(&buf, b"\r\n\r\n").is_none() {
                    match stream.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    }
                }
                if stream.write_all(response).await.is_err() {
                    return;
                }
                let _ = tokio::time::timeout(Duration::from_secs(5), async {
                    while let Ok(n) = stream.read(&mut chunk).await {
                        if n == 0 {
                            break;
                        }
                    }
                })
                .await;
            });
        }
    });

    addr
}

/// An address with nothing listening on it.
pub async fn unused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// One HTTP response read off a raw socket.
#[derive(Debug)]
pub struct RawResponse {
    pub status: u16,
    pub head: String,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn header(&self, name: &str) -> Option<String> {
        self.head.lines().skip(1).find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.trim().eq_ignore_ascii_case(name).then(|| value.trim().to_string())
        })
    }
}

/// Read one response; the body is read by `Content-Length`, by chunked framing,
/// or until the connection closes.
pub async fn read_response(stream: &mut TcpStream) -> RawResponse {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let head_end = loop {
        if let Some(pos) = find(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed before a response head arrived");
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let status = head
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    let mut response = RawResponse {
        status,
        head,
        body: buf[head_end..].to_vec(),
    };

    let bodiless = status == 204 || status == 304 || (100..200).contains(&status);
    if bodiless {
        return response;
    }
    if let Some(len) = response.header("content-length").and_then(|v| v.parse::<usize>().ok()) {
        while response.body.len() < len {
            let n = stream.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            response.body.extend_from_slice(&chunk[..n]);
        }
    } else if response
        .header("transfer-encoding")
        .map_or(false, |v| v.eq_ignore_ascii_case("chunked"))
    {
        while !response.body.ends_with(b"0\r\n\r\n") {
            let n = stream.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            response.body.extend_from_slice(&chunk[..n]);
        }
        response.body = decode_chunked(&response.body);
    } else {
        while let Ok(n) = stream.read(&mut chunk).await {
            if n == 0 {
                break;
            }
            response.body.extend_from_slice(&chunk[..n]);
        }
    }
    response
}

/// Everything the server writes on a connection until it closes.
pub async fn read_until_close(stream: &mut TcpStream) -> String {
    let mut out = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut out)).await;
    String::from_utf8_lossy(&out).to_string()
}
