//! End-to-end tests: a real listener, raw HTTP clients, and local origins.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use netblock_core::RuleEngine;
use netblock_proxy::{ProxyConfig, ProxyHandle, ProxyServer};

const IO_TIMEOUT: Duration = Duration::from_secs(10);

fn proxy_config() -> ProxyConfig {
    ProxyConfig::new(SocketAddr::from(([127, 0, 0, 1], 0)))
}

fn start_proxy_with(config: ProxyConfig, patterns: &[&str]) -> (ProxyHandle, Arc<RuleEngine>) {
    let engine = Arc::new(RuleEngine::new());
    engine.replace_rules(patterns.iter().copied());
    let server = ProxyServer::bind(config, engine.clone()).unwrap();
    (server.start(), engine)
}

fn start_proxy(patterns: &[&str]) -> (ProxyHandle, Arc<RuleEngine>) {
    start_proxy_with(proxy_config(), patterns)
}

/// Sends a raw request and reads until the proxy closes the connection.
async fn send(proxy: SocketAddr, request: &str) -> String {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    tokio::time::timeout(IO_TIMEOUT, stream.read_to_end(&mut response))
        .await
        .expect("proxy should close the connection")
        .unwrap();
    String::from_utf8_lossy(&response).into_owned()
}

/// Reads a response or request head, up to and including the blank line.
async fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = tokio::time::timeout(IO_TIMEOUT, stream.read(&mut byte))
            .await
            .expect("head should arrive")
            .unwrap();
        if n == 0 {
            break;
        }
        head.push(byte[0]);
    }
    String::from_utf8_lossy(&head).into_owned()
}

fn status_code(response: &str) -> u16 {
    response
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap_or(0)
}

fn body(response: &str) -> &str {
    response.split_once("\r\n\r\n").map_or("", |(_, body)| body)
}

/// Origin that answers every request with `418` and records request heads.
struct Origin {
    addr: SocketAddr,
    connections: Arc<AtomicUsize>,
    last_head: Arc<Mutex<String>>,
}

async fn spawn_origin() -> Origin {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let last_head = Arc::new(Mutex::new(String::new()));

    let counter = connections.clone();
    let heads = last_head.clone();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            let heads = heads.clone();
            tokio::spawn(async move {
                let head = read_head(&mut stream).await;
                *heads.lock() = head;
                let _ = stream
                    .write_all(
                        b"HTTP/1.1 418 I'm a teapot\r\n\
                          Content-Type: text/plain\r\n\
                          Content-Length: 5\r\n\
                          Keep-Alive: timeout=5\r\n\
                          Connection: close\r\n\
                          \r\n\
                          hello",
                    )
                    .await;
                let _ = stream.shutdown().await;
            });
        }
    });

    Origin {
        addr,
        connections,
        last_head,
    }
}

/// Echo server counting accepted connections.
async fn spawn_echo() -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));

    let counter = connections.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.into_split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });

    (addr, connections)
}

async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

async fn open_tunnel(proxy: SocketAddr, target: &str) -> (TcpStream, String) {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    let request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let head = read_head(&mut stream).await;
    (stream, head)
}

#[tokio::test]
async fn blocked_http_request_gets_block_page() {
    let (proxy, engine) = start_proxy(&["facebook.com"]);

    let response = send(
        proxy.local_addr(),
        "GET http://www.facebook.com/ HTTP/1.1\r\n\
         Host: www.facebook.com\r\n\
         Connection: close\r\n\r\n",
    )
    .await;

    assert_eq!(status_code(&response), 403);
    assert!(response
        .to_ascii_lowercase()
        .contains("content-type: text/html; charset=utf-8"));
    assert!(body(&response).contains("Access Blocked"));
    assert_eq!(engine.stats().blocked, 1);

    proxy.stop().await.unwrap();
}

#[tokio::test]
async fn allowed_http_request_is_forwarded() {
    let origin = spawn_origin().await;
    let (proxy, engine) = start_proxy(&["facebook.com"]);
    let target = origin.addr;

    let response = send(
        proxy.local_addr(),
        &format!(
            "GET http://{target}/hello?x=1 HTTP/1.1\r\n\
             Host: {target}\r\n\
             Proxy-Authorization: Basic eA==\r\n\
             Keep-Alive: timeout=5\r\n\
             X-Custom: kept\r\n\
             Connection: close\r\n\r\n"
        ),
    )
    .await;

    assert_eq!(status_code(&response), 418);
    assert_eq!(body(&response), "hello");
    assert!(!response.to_ascii_lowercase().contains("keep-alive: timeout"));
    assert_eq!(origin.connections.load(Ordering::SeqCst), 1);

    let head = origin.last_head.lock().to_ascii_lowercase();
    assert!(head.starts_with("get /hello?x=1 http/1.1"));
    assert!(head.contains("x-custom: kept"));
    assert!(!head.contains("proxy-authorization"));
    assert!(!head.contains("keep-alive: timeout"));

    assert_eq!(engine.stats().allowed, 1);
    proxy.stop().await.unwrap();
}

#[tokio::test]
async fn origin_sees_the_host_that_was_checked() {
    let origin = spawn_origin().await;
    let (proxy, engine) = start_proxy(&["blocked.test"]);
    let target = origin.addr;

    let response = send(
        proxy.local_addr(),
        &format!(
            "GET http://{target}/ HTTP/1.1\r\n\
             Host: www.blocked.test\r\n\
             Connection: close\r\n\r\n"
        ),
    )
    .await;

    assert_eq!(status_code(&response), 418);
    let head = origin.last_head.lock().to_ascii_lowercase();
    assert!(head.contains(&format!("host: {target}\r\n")), "origin saw: {head}");
    assert!(!head.contains("blocked.test"));
    assert_eq!(engine.stats().allowed, 1);

    proxy.stop().await.unwrap();
}

#[tokio::test]
async fn unreachable_origin_returns_bad_gateway() {
    let (proxy, _engine) = start_proxy(&[]);
    let port = closed_port().await;

    let response = send(
        proxy.local_addr(),
        &format!(
            "GET http://127.0.0.1:{port}/ HTTP/1.1\r\n\
             Host: 127.0.0.1:{port}\r\n\
             Connection: close\r\n\r\n"
        ),
    )
    .await;

    assert_eq!(status_code(&response), 502);
    assert!(body(&response).starts_with("Proxy error: "));
    proxy.stop().await.unwrap();
}

#[tokio::test]
async fn blocked_connect_never_dials() {
    let (echo, dialed) = spawn_echo().await;
    let (proxy, engine) = start_proxy(&["google.*", "localhost"]);

    let response = send(
        proxy.local_addr(),
        "CONNECT www.google.de:443 HTTP/1.1\r\nHost: www.google.de:443\r\n\r\n",
    )
    .await;
    assert_eq!(status_code(&response), 403);
    assert_eq!(body(&response), "Blocked\n");

    let target = format!("localhost:{}", echo.port());
    let response = send(
        proxy.local_addr(),
        &format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n"),
    )
    .await;
    assert_eq!(status_code(&response), 403);

    assert_eq!(dialed.load(Ordering::SeqCst), 0);
    assert_eq!(engine.stats().blocked, 2);
    proxy.stop().await.unwrap();
}

#[tokio::test]
async fn allowed_connect_relays_bytes() {
    let (echo, dialed) = spawn_echo().await;
    let (proxy, _engine) = start_proxy(&["google.*"]);

    let (mut tunnel, head) = open_tunnel(proxy.local_addr(), &echo.to_string()).await;
    assert_eq!(head, "HTTP/1.1 200 Connection Established\r\n\r\n");
    assert_eq!(dialed.load(Ordering::SeqCst), 1);

    for message in [&b"ping"[..], &b"\x16\x03\x01 opaque tls bytes"[..]] {
        tunnel.write_all(message).await.unwrap();
        let mut echoed = vec![0u8; message.len()];
        tokio::time::timeout(IO_TIMEOUT, tunnel.read_exact(&mut echoed))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(echoed, message);
    }

    drop(tunnel);
    proxy.stop().await.unwrap();
}

#[tokio::test]
async fn connect_dial_failure_returns_bad_gateway() {
    let (proxy, _engine) = start_proxy(&[]);
    let port = closed_port().await;

    let target = format!("127.0.0.1:{port}");
    let response = send(
        proxy.local_addr(),
        &format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n"),
    )
    .await;

    assert_eq!(status_code(&response), 502);
    assert!(body(&response).starts_with("Failed to connect: "));
    proxy.stop().await.unwrap();
}

#[tokio::test]
async fn rule_changes_apply_to_later_requests() {
    let origin = spawn_origin().await;
    let (proxy, engine) = start_proxy(&[]);
    let target = origin.addr;
    let request = format!(
        "GET http://{target}/ HTTP/1.1\r\nHost: {target}\r\nConnection: close\r\n\r\n"
    );

    assert_eq!(status_code(&send(proxy.local_addr(), &request).await), 418);

    engine.replace_rules(["127.0.0.1"]);
    assert_eq!(status_code(&send(proxy.local_addr(), &request).await), 403);
    assert_eq!(origin.connections.load(Ordering::SeqCst), 1);

    engine.replace_rules(Vec::<String>::new());
    assert_eq!(status_code(&send(proxy.local_addr(), &request).await), 418);

    proxy.stop().await.unwrap();
}

#[tokio::test]
async fn concurrent_clients_are_counted_exactly() {
    let origin = spawn_origin().await;
    let (proxy, engine) = start_proxy(&["blocked.test"]);
    let proxy_addr = proxy.local_addr();
    let target = origin.addr;

    let mut tasks = Vec::new();
    for i in 0..40 {
        let request = if i % 2 == 0 {
            "GET http://www.blocked.test/ HTTP/1.1\r\n\
             Host: www.blocked.test\r\nConnection: close\r\n\r\n"
                .to_string()
        } else {
            format!("GET http://{target}/ HTTP/1.1\r\nHost: {target}\r\nConnection: close\r\n\r\n")
        };
        tasks.push(tokio::spawn(async move {
            status_code(&send(proxy_addr, &request).await)
        }));
    }

    let mut codes = Vec::new();
    for task in tasks {
        codes.push(task.await.unwrap());
    }

    assert_eq!(codes.iter().filter(|&&c| c == 403).count(), 20);
    assert_eq!(codes.iter().filter(|&&c| c == 418).count(), 20);

    let stats = engine.stats();
    assert_eq!(stats.blocked, 20);
    assert_eq!(stats.allowed, 20);
    proxy.stop().await.unwrap();
}

#[tokio::test]
async fn stop_force_closes_open_tunnels() {
    let (echo, _dialed) = spawn_echo().await;
    let config = proxy_config().with_shutdown_grace(Duration::from_millis(200));
    let (proxy, _engine) = start_proxy_with(config, &[]);

    let (mut tunnel, head) = open_tunnel(proxy.local_addr(), &echo.to_string()).await;
    assert!(head.starts_with("HTTP/1.1 200"));

    tokio::time::timeout(Duration::from_secs(5), proxy.stop())
        .await
        .expect("stop should finish after the grace period")
        .unwrap();

    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(IO_TIMEOUT, tunnel.read(&mut buf))
        .await
        .expect("tunnel should be closed");
    assert!(matches!(read, Ok(0) | Err(_)));
}

#[tokio::test]
async fn stop_refuses_new_connections() {
    let (proxy, _engine) = start_proxy(&[]);
    let addr = proxy.local_addr();
    proxy.stop().await.unwrap();

    assert!(TcpStream::connect(addr).await.is_err());
}
