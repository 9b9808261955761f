//! Error types for the proxy.

use std::net::SocketAddr;

use thiserror::Error;

/// Proxy error type.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The listen address could not be bound.
    #[error("failed to bind to {addr}: {source}")]
    Bind {
        /// Address that was requested.
        addr: SocketAddr,
        /// Underlying socket error.
        #[source]
        source: std::io::Error,
    },

    /// The listen address could not be parsed or resolved.
    #[error("invalid listen address {0}")]
    InvalidAddr(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(#[from] netblock_core::ConfigError),
}

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_errors_convert() {
        let err: ProxyError = netblock_core::ConfigError::EmptyPattern.into();
        assert!(matches!(err, ProxyError::Config(_)));
        assert!(err.to_string().starts_with("config error: "));
    }
}
