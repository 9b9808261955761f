//! Netblock Proxy - forwarding HTTP/HTTPS proxy with blacklist enforcement.
//!
//! Clients configure this proxy explicitly. Every request is checked against
//! the shared [`RuleEngine`](netblock_core::RuleEngine) before anything is
//! sent upstream.
//!
//! ## Request flow
//!
//! ```text
//! Client ─► ProxyServer ─► ProxyHandler ─► RuleEngine::decide(host)
//!                               │
//!              ┌────────────────┴─────────────────┐
//!              │ CONNECT                          │ other methods
//!              ▼                                  ▼
//!     Blocked: 403 "Blocked"            Blocked: 403 block page
//!     Allowed: dial, 200, tunnel        Allowed: forward, relay response
//! ```
//!
//! HTTPS traffic is never decrypted. The tunnel relays opaque bytes until
//! either side closes.
//!
//! The [`BlacklistReloader`] keeps the engine in sync with the configuration
//! file while the proxy runs.

mod error;
mod handler;
mod proxy;
pub mod reload;
pub mod tunnel;

pub use error::{ProxyError, Result};
pub use handler::{
    create_block_response, extract_host, strip_hop_by_hop, BoxError, HandlerConfig,
    ProxyBody, ProxyHandler, UpstreamTimeouts, BLOCK_PAGE_HTML, HOP_BY_HOP_HEADERS,
};
pub use proxy::{ProxyConfig, ProxyHandle, ProxyServer};
pub use reload::{BlacklistReloader, DEFAULT_RELOAD_INTERVAL};
pub use tunnel::{relay, TunnelSet, TunnelStats};

/// Default proxy port.
pub const DEFAULT_PROXY_PORT: u16 = netblock_core::config::DEFAULT_PORT;
