//! CONNECT tunnel relay.
//!
//! After a successful CONNECT the proxy stops speaking HTTP on the client
//! connection and relays opaque bytes in both directions. Each direction runs
//! as its own task. When either one ends (EOF, I/O error, or forced close) it
//! shuts down its write side and cancels the tunnel token, which stops the
//! other direction as well; the tunnel finishes once both tasks are joined and
//! both streams are dropped.

use std::net::SocketAddr;

use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Relay buffer size per direction.
const RELAY_BUFFER_SIZE: usize = 32 * 1024;

/// Bytes moved through a finished tunnel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TunnelStats {
    /// Client to destination.
    pub sent: u64,
    /// Destination to client.
    pub received: u64,
}

/// Relays bytes between `client` and `destination` until the tunnel ends.
///
/// Errors in either direction are not reported; they only end the tunnel.
/// Cancelling `force_close` tears the tunnel down immediately.
pub async fn relay<C, D>(client: C, destination: D, force_close: &CancellationToken) -> TunnelStats
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    D: AsyncRead + AsyncWrite + Send + 'static,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (dest_read, dest_write) = tokio::io::split(destination);
    let done = force_close.child_token();

    let upstream = tokio::spawn(pipe(client_read, dest_write, done.clone()));
    let downstream = tokio::spawn(pipe(dest_read, client_write, done));

    let (sent, received) = tokio::join!(upstream, downstream);
    TunnelStats {
        sent: sent.unwrap_or_default(),
        received: received.unwrap_or_default(),
    }
}

/// Copies one direction of a tunnel.
async fn pipe<R, W>(mut reader: R, mut writer: W, done: CancellationToken) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = tokio::select! {
            _ = done.cancelled() => break,
            read = reader.read(&mut buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            },
        };

        let written = tokio::select! {
            _ = done.cancelled() => break,
            written = writer.write_all(&buf[..n]) => written,
        };
        if written.is_err() {
            break;
        }
        total += n as u64;
    }

    done.cancel();
    let _ = writer.shutdown().await;
    total
}

/// Tracks live tunnels so the listener can drain or force-close them.
#[derive(Debug, Clone)]
pub struct TunnelSet {
    tracker: TaskTracker,
    force_close: CancellationToken,
}

impl Default for TunnelSet {
    fn default() -> Self {
        Self::new(CancellationToken::new())
    }
}

impl TunnelSet {
    /// Creates a tunnel set that is torn down when `force_close` fires.
    pub fn new(force_close: CancellationToken) -> Self {
        Self {
            tracker: TaskTracker::new(),
            force_close,
        }
    }

    /// Number of tunnels currently running.
    pub fn len(&self) -> usize {
        self.tracker.len()
    }

    /// Returns true if no tunnel is running.
    pub fn is_empty(&self) -> bool {
        self.tracker.is_empty()
    }

    /// Starts a tunnel once the client connection has been handed over.
    ///
    /// `destination` is closed without relaying if the hand-over fails.
    pub(crate) fn spawn(&self, target: String, on_upgrade: OnUpgrade, destination: TcpStream) {
        let force_close = self.force_close.clone();
        let peer: Option<SocketAddr> = destination.peer_addr().ok();

        self.tracker.spawn(async move {
            let upgraded = tokio::select! {
                upgraded = on_upgrade => upgraded,
                _ = force_close.cancelled() => return,
            };

            match upgraded {
                Ok(upgraded) => {
                    tracing::debug!(target = %target, peer = ?peer, "Tunnel established");
                    let stats = relay(TokioIo::new(upgraded), destination, &force_close).await;
                    tracing::debug!(
                        target = %target,
                        sent = stats.sent,
                        received = stats.received,
                        "Tunnel closed"
                    );
                }
                Err(e) => {
                    tracing::warn!(target = %target, error = %e, "Connection upgrade failed");
                }
            }
        });
    }

    /// Closes the set and waits for running tunnels to finish.
    pub async fn wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}
