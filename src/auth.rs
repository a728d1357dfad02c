//! Auth gate: resolves a session token to a verified identity.
//!
//! Token issuance lives elsewhere; this side only verifies. The gateway
//! never trusts client-supplied identity headers — identity always comes
//! from a verified token, and the identity headers it forwards downstream
//! are injected by the proxy itself.

use crate::config::AuthSettings;
use crate::error::GatewayError;
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Claims carried by a session token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Username the token was issued to
    pub sub: String,
    /// Whether the user holds the admin role
    #[serde(default)]
    pub admin: bool,
    pub iat: i64,
    pub exp: i64,
}

/// The authenticated principal a request or upgrade is attributed to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub username: String,
    pub is_admin: bool,
}

#[derive(Clone)]
pub struct AuthGate {
    settings: Arc<AuthSettings>,
    decoding_key: DecodingKey,
}

impl AuthGate {
    pub fn new(settings: AuthSettings) -> Self {
        let decoding_key = DecodingKey::from_secret(settings.secret.as_bytes());
        Self {
            settings: Arc::new(settings),
            decoding_key,
        }
    }

    /// Verify a token and resolve the identity it names
    pub fn verify(&self, token: &str) -> Result<Identity, GatewayError> {
        let validation = Validation::default();
        let data = decode::<Claims>(token, &self.decoding_key, &validation)
            .map_err(|e| GatewayError::AuthenticationFailure(e.to_string()))?;

        if data.claims.sub.is_empty() {
            return Err(GatewayError::AuthenticationFailure(
                "token names no subject".to_string(),
            ));
        }

        Ok(Identity {
            username: data.claims.sub,
            is_admin: data.claims.admin,
        })
    }

    /// Extract a bearer token from an Authorization header value
    pub fn token_from_header(&self, auth_header: &str) -> Option<String> {
        auth_header.strip_prefix("Bearer ").map(|s| s.to_string())
    }

    /// Extract the session token from a Cookie header value
    pub fn token_from_cookie(&self, cookie_header: &str) -> Option<String> {
        let needle = format!("{}=", self.settings.cookie_name);
        for cookie in cookie_header.split(';') {
            let cookie = cookie.trim();
            if let Some(value) = cookie.strip_prefix(&needle) {
                if !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }
        None
    }

    /// Extract the session token from a request query string.
    ///
    /// Browser WebSocket APIs cannot set arbitrary headers, so upgrades may
    /// carry the token as a `token` query parameter instead.
    pub fn token_from_query(&self, query: &str) -> Option<String> {
        for pair in query.split('&') {
            if let Some(value) = pair.strip_prefix("token=") {
                if !value.is_empty() {
                    return urlencoding::decode(value).ok().map(|v| v.into_owned());
                }
            }
        }
        None
    }
}
