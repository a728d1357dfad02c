//! WebSocket tunneling to worker instances.
//!
//! An upgrade request inside the routed namespace is authenticated from its
//! query string or cookie (browser WebSocket APIs cannot set headers),
//! resolved to an instance, and then spliced: the gateway hand-assembles an
//! HTTP/1.1 upgrade request for the worker, relays the worker's handshake
//! response, and from then on copies bytes in both directions untouched.
//! Either side closing or erroring tears down the other.

use crate::auth::Identity;
use crate::error::{error_response, json_error_response, ProxyBody};
use crate::proxy::{X_FORWARDED_PREFIX, X_USERGATE_ADMIN, X_USERGATE_USER};
use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

/// Headers the gateway regenerates when assembling the worker handshake
const REGENERATED_HEADERS: [&str; 8] = [
    "host",
    "upgrade",
    "connection",
    "sec-websocket-key",
    "sec-websocket-version",
    "sec-websocket-protocol",
    "sec-websocket-extensions",
    "content-length",
];

/// Check if a request asks for a protocol upgrade
pub fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    has_upgrade_connection && req.headers().contains_key(hyper::header::UPGRADE)
}

/// Whether a path belongs to the gateway's routed namespace.
///
/// Upgrades outside it are not tunneled; the router falls through to its
/// other handlers.
pub fn in_routed_namespace(path: &str, prefix: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Strip the routing prefix from a path-and-query, leaving the path the
/// worker expects at its own origin
pub fn strip_route_prefix(path_and_query: &str, prefix: &str) -> String {
    match path_and_query.strip_prefix(prefix) {
        Some("") => "/".to_string(),
        Some(rest) if rest.starts_with('?') => format!("/{}", rest),
        Some(rest) if rest.starts_with('/') => rest.to_string(),
        _ => path_and_query.to_string(),
    }
}

/// The bare refusal an unauthenticated upgrade receives: a 401 status line
/// and a closed connection, before any byte reaches a worker
pub fn unauthorized_upgrade_response() -> Response<ProxyBody> {
    Response::builder()
        .status(StatusCode::UNAUTHORIZED)
        .header(hyper::header::CONNECTION, "close")
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid response builder")
}

/// Assemble the raw HTTP/1.1 upgrade request sent to the worker
pub fn build_upgrade_request<B>(
    req: &Request<B>,
    port: u16,
    identity: &Identity,
    prefix: &str,
) -> Vec<u8> {
    let original = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let target = strip_route_prefix(original, prefix);

    let upgrade = header_or(req, "upgrade", "websocket");
    let connection = header_or(req, "connection", "Upgrade");
    let ws_version = header_or(req, "sec-websocket-version", "13");

    let mut out = format!("{} {} HTTP/1.1\r\n", req.method(), target);
    out.push_str(&format!("Host: 127.0.0.1:{}\r\n", port));
    out.push_str(&format!("{}: {}\r\n", X_USERGATE_USER, identity.username));
    out.push_str(&format!(
        "{}: {}\r\n",
        X_USERGATE_ADMIN,
        if identity.is_admin { "true" } else { "false" }
    ));
    out.push_str(&format!("{}: {}\r\n", X_FORWARDED_PREFIX, prefix));
    out.push_str(&format!("Upgrade: {}\r\n", upgrade));
    out.push_str(&format!("Connection: {}\r\n", connection));

    if let Some(key) = req
        .headers()
        .get("sec-websocket-key")
        .and_then(|v| v.to_str().ok())
    {
        out.push_str(&format!("Sec-WebSocket-Key: {}\r\n", key));
    }
    out.push_str(&format!("Sec-WebSocket-Version: {}\r\n", ws_version));
    for optional in ["sec-websocket-protocol", "sec-websocket-extensions"] {
        if let Some(value) = req.headers().get(optional).and_then(|v| v.to_str().ok()) {
            out.push_str(&format!("{}: {}\r\n", canonical_name(optional), value));
        }
    }

    // Remaining original headers pass through, minus the regenerated ones
    // and any inbound identity headers (never a source of identity)
    for (name, value) in req.headers() {
        let lower = name.as_str().to_lowercase();
        if REGENERATED_HEADERS.contains(&lower.as_str())
            || lower == X_USERGATE_USER
            || lower == X_USERGATE_ADMIN
        {
            continue;
        }
        if let Ok(v) = value.to_str() {
            out.push_str(&format!("{}: {}\r\n", name, v));
        }
    }

    out.push_str("\r\n");
    out.into_bytes()
}

fn header_or<'a, B>(req: &'a Request<B>, name: &str, default: &'a str) -> &'a str {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(default)
}

fn canonical_name(lower: &str) -> &'static str {
    match lower {
        "sec-websocket-protocol" => "Sec-WebSocket-Protocol",
        "sec-websocket-extensions" => "Sec-WebSocket-Extensions",
        _ => unreachable!("only called for the two optional Sec-WebSocket headers"),
    }
}

/// Parse the worker's handshake response head. Returns the status, the
/// response headers, and the offset where the head ends (bytes past it are
/// early frames that must be relayed to the client).
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>, usize)> {
    let head_end = find_head_end(data)?;
    let head = std::str::from_utf8(&data[..head_end]).ok()?;
    let mut lines = head.lines();

    // Status line: HTTP/1.1 101 Switching Protocols
    let status_line = lines.next()?;
    let parts: Vec<&str> = status_line.splitn(3, ' ').collect();
    if parts.len() < 2 {
        return None;
    }
    let status = StatusCode::from_u16(parts[1].parse().ok()?).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some((status, headers, head_end))
}

fn find_head_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Tunnel an authenticated upgrade request to the given instance port.
///
/// Writes the assembled handshake to a fresh TCP connection, relays the
/// worker's response, and on a 101 splices the two streams for the rest of
/// the connection's life.
pub async fn handle_upgrade(
    req: Request<Incoming>,
    port: u16,
    identity: Identity,
    prefix: &str,
    request_id: String,
) -> Result<Response<ProxyBody>, hyper::Error> {
    let username = identity.username.clone();
    debug!(identity = %username, port, request_id, "Handling upgrade request");

    let raw_request = build_upgrade_request(&req, port, &identity, prefix);

    let backend_addr = format!("127.0.0.1:{}", port);
    let mut backend = match TcpStream::connect(&backend_addr).await {
        Ok(stream) => stream,
        Err(e) => {
            error!(identity = %username, port, error = %e, "Failed to connect to instance for upgrade");
            return Ok(error_response(&crate::error::GatewayError::InstanceUnavailable(
                format!("failed to connect to instance: {}", e),
            )));
        }
    };

    if let Err(e) = backend.write_all(&raw_request).await {
        error!(identity = %username, port, error = %e, "Failed to send upgrade request to instance");
        return Ok(error_response(&crate::error::GatewayError::InstanceUnavailable(
            format!("failed to send upgrade request: {}", e),
        )));
    }

    // Read until the response head is complete; the worker may already have
    // pushed frames behind it
    let mut buf = vec![0u8; 8192];
    let mut filled = 0;
    let parsed = loop {
        match backend.read(&mut buf[filled..]).await {
            Ok(0) => break None,
            Ok(n) => {
                filled += n;
                if let Some(parsed) = parse_upgrade_response(&buf[..filled]) {
                    break Some(parsed);
                }
                if filled == buf.len() {
                    break None;
                }
            }
            Err(e) => {
                error!(identity = %username, port, error = %e, "Failed to read upgrade response");
                break None;
            }
        }
    };

    let Some((status, response_headers, head_end)) = parsed else {
        error!(identity = %username, port, "Invalid or missing upgrade response from instance");
        return Ok(json_error_response(
            "INSTANCE_UNAVAILABLE",
            StatusCode::BAD_GATEWAY,
            "invalid upgrade response from instance",
        ));
    };

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(identity = %username, port, status = %status, "Instance rejected upgrade request");
        let mut response = Response::builder().status(status);
        for (name, value) in &response_headers {
            if let Ok(hv) = HeaderValue::from_str(value) {
                response = response.header(name.as_str(), hv);
            }
        }
        return Ok(response
            .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
            .expect("valid response builder"));
    }

    info!(identity = %username, port, request_id, "WebSocket upgrade successful");

    let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    for (name, value) in &response_headers {
        let lower = name.to_lowercase();
        // Hop-by-hop framing headers are hyper's to manage
        if lower == "content-length" || lower == "transfer-encoding" {
            continue;
        }
        if let Ok(hv) = HeaderValue::from_str(value) {
            response = response.header(name.as_str(), hv);
        }
    }
    let response = response
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid response builder");

    // Frames the worker sent behind its handshake head
    let early_frames = buf[head_end..filled].to_vec();

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let mut client_io = TokioIo::new(upgraded);
                if !early_frames.is_empty() {
                    if let Err(e) = client_io.write_all(&early_frames).await {
                        debug!(identity = %username, request_id, error = %e, "Failed to flush early frames");
                        return;
                    }
                }
                match tokio::io::copy_bidirectional(&mut client_io, &mut backend).await {
                    Ok((to_backend, to_client)) => {
                        debug!(
                            identity = %username,
                            request_id,
                            to_backend,
                            to_client,
                            "WebSocket connection closed"
                        );
                    }
                    Err(e) => {
                        debug!(identity = %username, request_id, error = %e, "WebSocket connection closed with error");
                    }
                }
            }
            Err(e) => {
                error!(identity = %username, request_id, error = %e, "Failed to upgrade client connection");
            }
        }
        // Both streams drop here, destroying whichever side is still open
    });

    Ok(response)
}
