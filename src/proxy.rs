//! The gateway's HTTP surface: routing, identity resolution, and request
//! forwarding to per-identity worker instances.
//!
//! Everything under the routing prefix is proxied; `__diagnostic` probes
//! the resolved instance directly; `/health` reports gateway liveness.
//! Upgrade requests are handed to the tunnel module.

use crate::auth::{AuthGate, Identity};
use crate::config::ServerConfig;
use crate::error::{error_response, json_error_response, GatewayError, ProxyBody};
use crate::process::InstanceManager;
use crate::registry::InstanceRecord;
use crate::rewrite::HtmlRewriter;
use crate::tunnel;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Version information for the gateway
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Identity headers injected for the worker to trust. Inbound copies are
/// stripped: clients never get to supply these.
pub const X_USERGATE_USER: &str = "x-usergate-user";
pub const X_USERGATE_ADMIN: &str = "x-usergate-admin";
/// Prefix the worker is being served under, so it can build its own URLs
pub const X_FORWARDED_PREFIX: &str = "x-forwarded-prefix";
/// Original request URI before prefix stripping
pub const X_FORWARDED_URI: &str = "x-forwarded-uri";
const X_REQUEST_ID: &str = "x-request-id";

/// Instance probe path under the routing prefix
const DIAGNOSTIC_PATH: &str = "/__diagnostic";
const DIAGNOSTIC_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared state for request handling
pub struct GatewayContext {
    pub manager: Arc<InstanceManager>,
    pub auth: AuthGate,
    prefix: String,
    rewriter: HtmlRewriter,
    request_timeout: Duration,
    /// Pooled client for upstream requests
    client: Client<HttpConnector, Full<Bytes>>,
}

impl GatewayContext {
    pub fn new(manager: Arc<InstanceManager>, auth: AuthGate, server: &ServerConfig) -> Arc<Self> {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build(connector);

        Arc::new(Self {
            manager,
            auth,
            prefix: server.route_prefix.clone(),
            rewriter: HtmlRewriter::new(&server.route_prefix, &server.public_origin),
            request_timeout: server.request_timeout(),
            client,
        })
    }

    pub fn route_prefix(&self) -> &str {
        &self.prefix
    }
}

/// The gateway's listening server
pub struct ProxyServer {
    bind_addr: SocketAddr,
    ctx: Arc<GatewayContext>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        ctx: Arc<GatewayContext>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            ctx,
            shutdown_rx,
        }
    }

    /// Run the accept loop. Failing to bind is the one fatal startup error.
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind {}: {}", self.bind_addr, e))?;
        info!(addr = %self.bind_addr, prefix = %self.ctx.prefix, "Gateway listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let ctx = Arc::clone(&self.ctx);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, ctx).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Gateway server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    ctx: Arc<GatewayContext>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let ctx = Arc::clone(&ctx);
        async move { handle_request(req, ctx, addr).await }
    });

    // auto::Builder keeps HTTP/1.1 upgrades working while also speaking h2c
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

pub async fn handle_request(
    req: Request<Incoming>,
    ctx: Arc<GatewayContext>,
    client_addr: SocketAddr,
) -> Result<Response<ProxyBody>, hyper::Error> {
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let path = req.uri().path().to_string();
    debug!(method = %req.method(), %path, client = %client_addr, request_id, "Incoming request");

    if path == "/health" {
        return Ok(health_response());
    }

    if !tunnel::in_routed_namespace(&path, &ctx.prefix) {
        // Dashboards and static assets live elsewhere; this surface only
        // routes worker traffic
        return Ok(json_error_response(
            "NOT_FOUND",
            StatusCode::NOT_FOUND,
            "no such route",
        ));
    }

    if tunnel::is_upgrade_request(&req) {
        return handle_upgrade_request(req, ctx, request_id).await;
    }

    let identity = match authenticate(&req, &ctx.auth) {
        Ok(identity) => identity,
        Err(e) => {
            debug!(request_id, error = %e, "Request authentication failed");
            return Ok(error_response(&e));
        }
    };

    let instance = match ctx.manager.get_or_start(&identity.username).await {
        Ok(instance) => instance,
        Err(e) => {
            error!(identity = %identity.username, error = %e, "Failed to resolve instance");
            return Ok(error_response(&e));
        }
    };

    if req.method() == Method::GET
        && tunnel::strip_route_prefix(&path, &ctx.prefix) == DIAGNOSTIC_PATH
    {
        return diagnostic(&ctx, &instance, &identity).await;
    }

    forward_request(req, ctx, instance, identity, request_id).await
}

/// Resolve the caller's identity from a bearer token or the session cookie
fn authenticate<B>(req: &Request<B>, auth: &AuthGate) -> Result<Identity, GatewayError> {
    let token = req
        .headers()
        .get(hyper::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| auth.token_from_header(v))
        .or_else(|| {
            req.headers()
                .get(hyper::header::COOKIE)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| auth.token_from_cookie(v))
        });

    let token = token.ok_or_else(|| {
        GatewayError::AuthenticationFailure("no credentials presented".to_string())
    })?;
    auth.verify(&token)
}

/// Authenticate and tunnel a protocol upgrade.
///
/// The token comes from the query string or cookie. Any auth failure gets a
/// bare 401 and a closed connection — no upgrade, no bytes to a worker.
async fn handle_upgrade_request(
    req: Request<Incoming>,
    ctx: Arc<GatewayContext>,
    request_id: String,
) -> Result<Response<ProxyBody>, hyper::Error> {
    let token = req
        .uri()
        .query()
        .and_then(|q| ctx.auth.token_from_query(q))
        .or_else(|| {
            req.headers()
                .get(hyper::header::COOKIE)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| ctx.auth.token_from_cookie(v))
        });

    let Some(token) = token else {
        warn!(request_id, "Upgrade request without token, rejecting");
        return Ok(tunnel::unauthorized_upgrade_response());
    };

    let identity = match ctx.auth.verify(&token) {
        Ok(identity) => identity,
        Err(e) => {
            warn!(request_id, error = %e, "Upgrade request with invalid token, rejecting");
            return Ok(tunnel::unauthorized_upgrade_response());
        }
    };

    let instance = match ctx.manager.get_or_start(&identity.username).await {
        Ok(instance) => instance,
        Err(e) => {
            error!(identity = %identity.username, error = %e, "Failed to resolve instance for upgrade");
            return Ok(error_response(&e));
        }
    };

    tunnel::handle_upgrade(req, instance.port, identity, &ctx.prefix, request_id).await
}

/// Forward one request/response pair to the instance
async fn forward_request(
    req: Request<Incoming>,
    ctx: Arc<GatewayContext>,
    instance: InstanceRecord,
    identity: Identity,
    request_id: String,
) -> Result<Response<ProxyBody>, hyper::Error> {
    let (parts, body) = req.into_parts();

    let original_uri = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .to_string();
    let target = tunnel::strip_route_prefix(&original_uri, &ctx.prefix);
    let uri = format!("http://127.0.0.1:{}{}", instance.port, target);

    let raw_body = body.collect().await?.to_bytes();
    let content_type = parts
        .headers
        .get(hyper::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let body_bytes = reencode_body(raw_body, &content_type);

    let mut builder = Request::builder().method(parts.method.clone()).uri(&uri);
    for (name, value) in parts.headers.iter() {
        let lower = name.as_str();
        if matches!(lower, "host" | "content-length" | "authorization")
            || lower == X_USERGATE_USER
            || lower == X_USERGATE_ADMIN
        {
            continue;
        }
        builder = builder.header(name, value);
    }
    builder = builder
        .header(hyper::header::HOST, format!("127.0.0.1:{}", instance.port))
        .header(X_USERGATE_USER, identity.username.as_str())
        .header(
            X_USERGATE_ADMIN,
            if identity.is_admin { "true" } else { "false" },
        )
        .header(X_FORWARDED_PREFIX, ctx.prefix.as_str())
        .header(X_FORWARDED_URI, original_uri.as_str())
        .header(X_REQUEST_ID, request_id.as_str());

    let outbound = match builder.body(Full::new(body_bytes)) {
        Ok(outbound) => outbound,
        Err(e) => {
            error!(request_id, error = %e, "Failed to build upstream request");
            return Ok(json_error_response(
                "INTERNAL_ERROR",
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to build upstream request",
            ));
        }
    };

    debug!(
        identity = %identity.username,
        port = instance.port,
        %target,
        request_id,
        "Forwarding request"
    );

    // A timeout drops the in-flight upstream connection; it never touches
    // the instance itself
    let result = tokio::time::timeout(ctx.request_timeout, ctx.client.request(outbound)).await;

    match result {
        Ok(Ok(response)) => rewrite_response(response, &ctx).await,
        Ok(Err(e)) => {
            error!(identity = %identity.username, port = instance.port, error = %e, "Upstream request failed");
            Ok(error_response(&GatewayError::InstanceUnavailable(
                e.to_string(),
            )))
        }
        Err(_) => {
            warn!(
                identity = %identity.username,
                port = instance.port,
                timeout_secs = ctx.request_timeout.as_secs(),
                "Upstream request timed out"
            );
            Ok(error_response(&GatewayError::GatewayTimeout(
                ctx.request_timeout.as_secs(),
            )))
        }
    }
}

/// Apply response-side rewriting: buffer and prefix HTML, stream the rest
async fn rewrite_response(
    response: Response<Incoming>,
    ctx: &GatewayContext,
) -> Result<Response<ProxyBody>, hyper::Error> {
    let is_html = response
        .headers()
        .get(hyper::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("text/html"))
        .unwrap_or(false);

    let (mut parts, body) = response.into_parts();
    // Workers must stay embeddable under the gateway's pages
    parts.headers.remove("x-frame-options");

    if !is_html {
        return Ok(Response::from_parts(parts, body.boxed()));
    }

    let bytes = body.collect().await?.to_bytes();
    let rewritten = ctx.rewriter.rewrite(&String::from_utf8_lossy(&bytes));

    parts.headers.remove(hyper::header::TRANSFER_ENCODING);
    parts.headers.insert(
        hyper::header::CONTENT_LENGTH,
        HeaderValue::from(rewritten.len()),
    );

    Ok(Response::from_parts(
        parts,
        Full::new(Bytes::from(rewritten))
            .map_err(|never| match never {})
            .boxed(),
    ))
}

/// Re-encode a request body by content type: JSON is normalized, form data
/// re-serialized, everything else passes through raw
fn reencode_body(raw: Bytes, content_type: &str) -> Bytes {
    if raw.is_empty() {
        return raw;
    }

    if content_type.contains("application/json") {
        if let Ok(value) = serde_json::from_slice::<serde_json::Value>(&raw) {
            if let Ok(text) = serde_json::to_vec(&value) {
                return Bytes::from(text);
            }
        }
        return raw;
    }

    if content_type.contains("application/x-www-form-urlencoded") {
        let Ok(text) = std::str::from_utf8(&raw) else {
            return raw;
        };
        let mut pairs = Vec::new();
        for pair in text.split('&') {
            if pair.is_empty() {
                continue;
            }
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let key = urlencoding::decode(&key.replace('+', " ")).map(|k| k.into_owned());
            let value = urlencoding::decode(&value.replace('+', " ")).map(|v| v.into_owned());
            match (key, value) {
                (Ok(k), Ok(v)) => {
                    pairs.push(format!("{}={}", urlencoding::encode(&k), urlencoding::encode(&v)))
                }
                _ => return raw,
            }
        }
        return Bytes::from(pairs.join("&"));
    }

    raw
}

/// Gateway liveness report
fn health_response() -> Response<ProxyBody> {
    let body = serde_json::json!({
        "status": "healthy",
        "version": VERSION,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });
    json_value_response(StatusCode::OK, &body)
}

/// Probe the resolved instance directly and report latency and upstream
/// status, for operability
async fn diagnostic(
    ctx: &GatewayContext,
    instance: &InstanceRecord,
    identity: &Identity,
) -> Result<Response<ProxyBody>, hyper::Error> {
    let uri = format!("http://127.0.0.1:{}/", instance.port);
    let probe = Request::builder()
        .method(Method::GET)
        .uri(&uri)
        .body(Full::new(Bytes::new()))
        .expect("valid request builder");

    let start = Instant::now();
    match tokio::time::timeout(DIAGNOSTIC_TIMEOUT, ctx.client.request(probe)).await {
        Ok(Ok(response)) => {
            let elapsed_ms = start.elapsed().as_millis() as u64;
            let upstream_status = response.status().as_u16();
            let preview = match response.into_body().collect().await {
                Ok(collected) => {
                    let bytes = collected.to_bytes();
                    let text = String::from_utf8_lossy(&bytes);
                    text.chars().take(500).collect::<String>()
                }
                Err(_) => String::new(),
            };
            let body = serde_json::json!({
                "status": "ok",
                "message": "direct connection to instance successful",
                "user": identity.username,
                "port": instance.port,
                "response_time_ms": elapsed_ms,
                "upstream_status": upstream_status,
                "upstream_body_preview": preview,
            });
            Ok(json_value_response(StatusCode::OK, &body))
        }
        Ok(Err(e)) => {
            let body = serde_json::json!({
                "status": "error",
                "message": "cannot connect to instance",
                "user": identity.username,
                "port": instance.port,
                "response_time_ms": start.elapsed().as_millis() as u64,
                "error": e.to_string(),
            });
            Ok(json_value_response(StatusCode::BAD_GATEWAY, &body))
        }
        Err(_) => {
            let body = serde_json::json!({
                "status": "error",
                "message": "connection to instance timed out",
                "user": identity.username,
                "port": instance.port,
                "timeout_ms": DIAGNOSTIC_TIMEOUT.as_millis() as u64,
            });
            Ok(json_value_response(StatusCode::GATEWAY_TIMEOUT, &body))
        }
    }
}

fn json_value_response(status: StatusCode, value: &serde_json::Value) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(
            Full::new(Bytes::from(value.to_string()))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response with StatusCode enum and static headers")
}
