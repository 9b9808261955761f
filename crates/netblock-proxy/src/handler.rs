//! Request handler with blacklist enforcement.
//!
//! Plain HTTP requests are checked against the rule engine and either
//! answered with the block page or forwarded to the origin. CONNECT requests
//! are checked the same way, dialed, and turned into a byte tunnel.

use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Body;
use hyper::ext::ReasonPhrase;
use hyper::header::{HeaderMap, HeaderValue, CONNECTION, CONTENT_TYPE, HOST};
use hyper::upgrade::OnUpgrade;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use tokio::net::TcpStream;

use netblock_core::{Decision, RuleEngine};

use crate::tunnel::TunnelSet;

/// Boxed error carried by proxied bodies.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Body type of every response the proxy produces.
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

/// Page returned for blocked plain HTTP requests.
pub const BLOCK_PAGE_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
    <title>Access Blocked</title>
    <style>
        body {
            font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif;
            display: flex;
            justify-content: center;
            align-items: center;
            min-height: 100vh;
            margin: 0;
            background: #f4f4f5;
            color: #18181b;
        }
        .container {
            text-align: center;
            padding: 2rem;
            max-width: 500px;
        }
        h1 {
            margin: 0 0 1rem 0;
            font-size: 2rem;
            color: #b91c1c;
        }
        p {
            margin: 0.5rem 0;
        }
    </style>
</head>
<body>
    <div class="container">
        <h1>Access Blocked</h1>
        <p>This website has been blocked by the network proxy.</p>
    </div>
</body>
</html>"#;

/// Headers that apply to a single connection and are never forwarded.
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Default port for CONNECT targets without one.
const DEFAULT_TUNNEL_PORT: u16 = 443;

/// Outbound timeouts used by the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpstreamTimeouts {
    /// Dial timeout for origins and tunnel destinations.
    pub connect: Duration,
    /// TCP keep-alive interval on outbound connections.
    pub keepalive: Duration,
    /// How long idle pooled connections are kept.
    pub pool_idle: Duration,
    /// How long to wait for an origin's response head.
    pub response: Duration,
}

impl Default for UpstreamTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(30),
            keepalive: Duration::from_secs(30),
            pool_idle: Duration::from_secs(90),
            response: Duration::from_secs(90),
        }
    }
}

/// Handler configuration.
#[derive(Clone)]
pub struct HandlerConfig {
    /// The rule engine consulted for every request.
    pub engine: Arc<RuleEngine>,
    /// Outbound timeouts.
    pub timeouts: UpstreamTimeouts,
}

impl std::fmt::Debug for HandlerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerConfig")
            .field("engine", &self.engine)
            .field("timeouts", &self.timeouts)
            .finish()
    }
}

impl HandlerConfig {
    /// Creates a handler configuration with default timeouts.
    pub fn new(engine: Arc<RuleEngine>) -> Self {
        Self {
            engine,
            timeouts: UpstreamTimeouts::default(),
        }
    }

    /// Sets the outbound timeouts.
    pub fn with_timeouts(mut self, timeouts: UpstreamTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }
}

/// Forwarding handler shared by all client connections.
#[derive(Clone)]
pub struct ProxyHandler {
    config: HandlerConfig,
    client: Client<HttpConnector, ProxyBody>,
    tunnels: TunnelSet,
}

impl std::fmt::Debug for ProxyHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyHandler")
            .field("config", &self.config)
            .field("tunnels", &self.tunnels.len())
            .finish()
    }
}

impl ProxyHandler {
    /// Creates a handler. CONNECT tunnels are spawned into `tunnels`.
    pub fn new(config: HandlerConfig, tunnels: TunnelSet) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(config.timeouts.connect));
        connector.set_keepalive(Some(config.timeouts.keepalive));
        connector.set_nodelay(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(config.timeouts.pool_idle)
            .pool_timer(TokioTimer::new())
            .build(connector);

        Self {
            config,
            client,
            tunnels,
        }
    }

    /// Returns the rule engine.
    pub fn engine(&self) -> &Arc<RuleEngine> {
        &self.config.engine
    }

    /// Handles one proxied request.
    pub async fn handle<B>(&self, req: Request<B>) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let ctx = RequestContext::from_request(&req);
        tracing::trace!(method = %ctx.method, host = %ctx.host, "Handling request");

        if ctx.method == Method::CONNECT {
            self.handle_connect(req, ctx).await
        } else {
            self.handle_http(req, ctx).await
        }
    }

    async fn handle_http<B>(&self, req: Request<B>, ctx: RequestContext) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        if let Decision::Blocked { .. } = self.config.engine.decide(&ctx.host) {
            return create_block_response();
        }

        let outbound = match build_outbound_request(req, &ctx.host) {
            Ok(outbound) => outbound,
            Err(e) => return proxy_error_response(&*e),
        };

        let upstream = tokio::time::timeout(
            self.config.timeouts.response,
            self.client.request(outbound),
        )
        .await;

        let response = match upstream {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                tracing::debug!(host = %ctx.host, error = %e, "Upstream request failed");
                return proxy_error_response(&e);
            }
            Err(_) => {
                tracing::debug!(host = %ctx.host, "Upstream response timed out");
                return text_response(
                    StatusCode::BAD_GATEWAY,
                    "Proxy error: upstream response timed out",
                    false,
                );
            }
        };

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        Response::from_parts(parts, body.map_err(Into::into).boxed_unsync())
    }

    async fn handle_connect<B>(&self, mut req: Request<B>, ctx: RequestContext) -> Response<ProxyBody> {
        if let Decision::Blocked { .. } = self.config.engine.decide(&ctx.host) {
            return text_response(StatusCode::FORBIDDEN, "Blocked", true);
        }

        let target = with_default_port(&ctx.host, DEFAULT_TUNNEL_PORT);
        let dialed =
            tokio::time::timeout(self.config.timeouts.connect, TcpStream::connect(&target)).await;

        let destination = match dialed {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                tracing::debug!(target = %target, error = %e, "Tunnel dial failed");
                return text_response(
                    StatusCode::BAD_GATEWAY,
                    &format!("Failed to connect: {}", e),
                    true,
                );
            }
            Err(_) => {
                tracing::debug!(target = %target, "Tunnel dial timed out");
                return text_response(
                    StatusCode::BAD_GATEWAY,
                    "Failed to connect: connection timed out",
                    true,
                );
            }
        };
        let _ = destination.set_nodelay(true);

        let Some(on_upgrade) = req.extensions_mut().remove::<OnUpgrade>() else {
            drop(destination);
            return text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Hijacking not supported",
                false,
            );
        };

        self.tunnels.spawn(target, on_upgrade, destination);

        let mut response = Response::new(empty_body());
        response
            .extensions_mut()
            .insert(ReasonPhrase::from_static(b"Connection Established"));
        response
    }
}

/// Request attributes needed for the decision.
#[derive(Debug, Clone)]
struct RequestContext {
    method: Method,
    host: String,
}

impl RequestContext {
    fn from_request<B>(req: &Request<B>) -> Self {
        Self {
            method: req.method().clone(),
            host: extract_host(req).unwrap_or_default(),
        }
    }
}

/// Extracts the destination `host[:port]` from a request.
///
/// The request target's authority wins over the `Host` header.
pub fn extract_host<B>(req: &Request<B>) -> Option<String> {
    if let Some(authority) = req.uri().authority() {
        return Some(authority.as_str().to_string());
    }

    req.headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Appends `default_port` when `target` carries no port.
fn with_default_port(target: &str, default_port: u16) -> String {
    let has_port = target
        .rsplit_once(':')
        .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());

    if has_port {
        target.to_string()
    } else {
        format!("{}:{}", target, default_port)
    }
}

/// Rewrites an inbound proxy request into an absolute outbound request.
fn build_outbound_request<B>(req: Request<B>, host: &str) -> Result<Request<ProxyBody>, BoxError>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    let (mut parts, body) = req.into_parts();

    if host.is_empty() {
        return Err("request has no destination host".into());
    }

    let scheme = parts.uri.scheme_str().unwrap_or("http").to_string();
    let path = parts
        .uri
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/")
        .to_string();

    parts.uri = Uri::builder()
        .scheme(scheme.as_str())
        .authority(host)
        .path_and_query(path.as_str())
        .build()?;
    // The origin must see the host the decision was made for.
    parts.headers.insert(HOST, HeaderValue::from_str(host)?);
    strip_hop_by_hop(&mut parts.headers);

    Ok(Request::from_parts(
        parts,
        body.map_err(Into::into).boxed_unsync(),
    ))
}

/// Removes hop-by-hop headers in place.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

/// Creates the 403 block page response.
pub fn create_block_response() -> Response<ProxyBody> {
    let mut response = Response::new(full_body(BLOCK_PAGE_HTML));
    *response.status_mut() = StatusCode::FORBIDDEN;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    response
}

fn proxy_error_response(error: &(dyn StdError + 'static)) -> Response<ProxyBody> {
    text_response(
        StatusCode::BAD_GATEWAY,
        &format!("Proxy error: {}", error_chain(error)),
        false,
    )
}

/// Formats an error with its sources, outermost first.
fn error_chain(error: &(dyn StdError + 'static)) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        let cause_text = cause.to_string();
        if !message.contains(&cause_text) {
            message.push_str(": ");
            message.push_str(&cause_text);
        }
        source = cause.source();
    }
    message
}

fn text_response(status: StatusCode, message: &str, close: bool) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(format!("{}\n", message)));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    if close {
        headers.insert(CONNECTION, HeaderValue::from_static("close"));
    }
    response
}

fn full_body<T: Into<Bytes>>(chunk: T) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}
