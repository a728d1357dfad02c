//! Port allocation for worker instances

use crate::error::GatewayError;
use crate::registry::Registry;
use tracing::debug;

/// Find a free port in `[min, max]`: skip ports already claimed in the
/// registry, then verify nothing unmanaged holds the port by binding it on
/// loopback. Exhaustion fails the individual start attempt, never the
/// gateway.
pub fn allocate(registry: &Registry, min: u16, max: u16) -> Result<u16, GatewayError> {
    for port in min..=max {
        if registry.port_claimed(port) {
            continue;
        }
        if port_available(port) {
            debug!(port, "Allocated port");
            return Ok(port);
        }
    }
    Err(GatewayError::ResourceExhausted(min, max))
}

/// Check that a port can be bound on loopback
fn port_available(port: u16) -> bool {
    std::net::TcpListener::bind(("127.0.0.1", port)).is_ok()
}
