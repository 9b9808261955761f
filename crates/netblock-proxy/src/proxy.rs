//! Proxy listener.
//!
//! Accepts client connections, serves each one with hyper's HTTP/1 server on
//! its own task, and hands requests to the [`ProxyHandler`]. Shutdown stops
//! accepting, asks open connections to finish gracefully, and force-closes
//! whatever is left (including CONNECT tunnels) after the grace period.

use std::convert::Infallible;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioIo, TokioTimer};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use netblock_core::{Config, RuleEngine};

use crate::error::{ProxyError, Result};
use crate::handler::{HandlerConfig, ProxyHandler, UpstreamTimeouts};
use crate::tunnel::TunnelSet;
use crate::DEFAULT_PROXY_PORT;

/// Listen backlog.
const LISTEN_BACKLOG: i32 = 1024;

/// Pause after a failed accept so a full file table does not spin the loop.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Proxy server configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Address to bind the proxy to. Port 0 picks an ephemeral port.
    pub addr: SocketAddr,
    /// Outbound timeouts.
    pub upstream: UpstreamTimeouts,
    /// How long a client may take to send a request head.
    pub header_read_timeout: Duration,
    /// How long shutdown waits for open connections before closing them.
    pub shutdown_grace: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self::new(SocketAddr::from(([127, 0, 0, 1], DEFAULT_PROXY_PORT)))
    }
}

impl ProxyConfig {
    /// Creates a configuration listening on `addr` with default timeouts.
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            upstream: UpstreamTimeouts::default(),
            header_read_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(5),
        }
    }

    /// Creates a configuration from the `[proxy]` section of a config file.
    pub fn from_config(config: &Config) -> Result<Self> {
        let listen = config.listen_addr();
        let addr = listen
            .to_socket_addrs()
            .map_err(|_| ProxyError::InvalidAddr(listen.clone()))?
            .next()
            .ok_or(ProxyError::InvalidAddr(listen))?;
        Ok(Self::new(addr))
    }

    /// Sets the listen address.
    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    /// Sets the port (uses 127.0.0.1 as host).
    pub fn with_port(mut self, port: u16) -> Self {
        self.addr = SocketAddr::from(([127, 0, 0, 1], port));
        self
    }

    /// Sets the outbound timeouts.
    pub fn with_upstream_timeouts(mut self, upstream: UpstreamTimeouts) -> Self {
        self.upstream = upstream;
        self
    }

    /// Sets the shutdown grace period.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

/// Forwarding proxy server with blacklist enforcement.
pub struct ProxyServer {
    config: ProxyConfig,
    listener: TcpListener,
    local_addr: SocketAddr,
    handler: ProxyHandler,
    tunnels: TunnelSet,
    connections: TaskTracker,
    shutdown: CancellationToken,
    force_close: CancellationToken,
}

impl std::fmt::Debug for ProxyServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyServer")
            .field("config", &self.config)
            .field("local_addr", &self.local_addr)
            .field("connections", &self.connections.len())
            .field("tunnels", &self.tunnels.len())
            .finish()
    }
}

impl ProxyServer {
    /// Binds the listener and prepares the server.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn bind(config: ProxyConfig, engine: Arc<RuleEngine>) -> Result<Self> {
        let listener = bind_listener(config.addr)?;
        let local_addr = listener.local_addr()?;

        let force_close = CancellationToken::new();
        let tunnels = TunnelSet::new(force_close.clone());
        let handler = ProxyHandler::new(
            HandlerConfig::new(engine).with_timeouts(config.upstream),
            tunnels.clone(),
        );

        Ok(Self {
            config,
            listener,
            local_addr,
            handler,
            tunnels,
            connections: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            force_close,
        })
    }

    /// Returns the address the proxy is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns the rule engine used by this server.
    pub fn engine(&self) -> &Arc<RuleEngine> {
        self.handler.engine()
    }

    /// Returns a token that stops the server when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Serves connections until the shutdown token is cancelled, then drains.
    pub async fn run(self) -> Result<()> {
        tracing::info!("Starting proxy server on {}", self.local_addr);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.spawn_connection(stream, peer),
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
            }
        }

        drop(self.listener);
        tracing::info!("Proxy shutdown signal received");
        drain(
            &self.connections,
            &self.tunnels,
            &self.force_close,
            self.config.shutdown_grace,
        )
        .await;

        tracing::info!("Proxy server stopped");
        Ok(())
    }

    /// Starts the proxy server in the background.
    ///
    /// Returns a handle that can be used to stop the server.
    pub fn start(self) -> ProxyHandle {
        let shutdown = self.shutdown.clone();
        let addr = self.local_addr;
        let handle = tokio::spawn(self.run());

        ProxyHandle {
            shutdown,
            addr,
            handle,
        }
    }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let _ = stream.set_nodelay(true);
        let io = TokioIo::new(stream);
        let handler = self.handler.clone();
        let shutdown = self.shutdown.clone();
        let force_close = self.force_close.clone();
        let header_read_timeout = self.config.header_read_timeout;

        self.connections.spawn(async move {
            let service = service_fn(move |req: Request<Incoming>| {
                let handler = handler.clone();
                async move { Ok::<_, Infallible>(handler.handle(req).await) }
            });

            // CONNECT replies must be the bare status line; origins send their own Date.
            let conn = http1::Builder::new()
                .timer(TokioTimer::new())
                .auto_date_header(false)
                .header_read_timeout(header_read_timeout)
                .serve_connection(io, service)
                .with_upgrades();
            tokio::pin!(conn);

            let result = tokio::select! {
                result = conn.as_mut() => result,
                _ = shutdown.cancelled() => {
                    conn.as_mut().graceful_shutdown();
                    tokio::select! {
                        result = conn.as_mut() => result,
                        _ = force_close.cancelled() => Ok(()),
                    }
                }
            };

            if let Err(e) = result {
                tracing::debug!(peer = %peer, error = %e, "Connection closed with error");
            }
        });
    }
}

/// Waits for connections and tunnels, force-closing them after `grace`.
async fn drain(
    connections: &TaskTracker,
    tunnels: &TunnelSet,
    force_close: &CancellationToken,
    grace: Duration,
) {
    connections.close();
    let finished = async {
        connections.wait().await;
        tunnels.wait().await;
    };

    if tokio::time::timeout(grace, finished).await.is_err() {
        tracing::warn!(
            connections = connections.len(),
            tunnels = tunnels.len(),
            "Grace period elapsed, closing remaining connections"
        );
        force_close.cancel();
        connections.wait().await;
        tunnels.wait().await;
    }
}

/// Binds a listening socket with address reuse enabled.
fn bind_listener(addr: SocketAddr) -> Result<TcpListener> {
    let bind_err = |source| ProxyError::Bind { addr, source };

    let socket =
        Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP)).map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;
    socket.bind(&addr.into()).map_err(bind_err)?;
    socket.listen(LISTEN_BACKLOG).map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;

    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener).map_err(bind_err)
}

/// Handle for controlling a running proxy server.
#[derive(Debug)]
pub struct ProxyHandle {
    shutdown: CancellationToken,
    addr: SocketAddr,
    handle: JoinHandle<Result<()>>,
}

impl ProxyHandle {
    /// Returns the address the proxy is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signals the proxy to shut down.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Waits for the proxy to finish.
    pub async fn wait(self) -> Result<()> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) => Err(ProxyError::Io(std::io::Error::other(e))),
        }
    }

    /// Shuts down the proxy and waits for it to finish.
    pub async fn stop(self) -> Result<()> {
        self.shutdown();
        self.wait().await
    }
}
