//! The authentication boundary: bearer-token validation plus pre-validation
//! rate limiting.
//!
//! Tokens are validated against a shared HS256 secret with issuer and
//! audience checks. The subject claim is forwarded downstream both as an
//! `x-user-id` header and as a request extension. A fixed allow-list of path
//! prefixes (health, registration, login, OAuth callbacks) bypasses
//! validation entirely. Per-source-IP limits run before validation, per
//! identity limits after.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderValue, Request, header::AUTHORIZATION},
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::Deserialize;
use tracing::debug;
use vidra_config::{AuthConfig, RateLimitConfig};

use crate::http::errors::ApiError;
use crate::http::rate_limit::{RateLimitSnapshot, RateLimiter, insert_rate_limit_headers};

/// Header carrying the verified principal downstream.
pub const HEADER_USER_ID: &str = "x-user-id";

/// Path prefixes that never require credentials.
const ALLOWLIST: &[&str] = &[
    "/health",
    "/auth/register",
    "/auth/login",
    "/auth/oauth",
];

/// The verified principal attached to authenticated requests.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    /// Subject claim of the validated token.
    pub subject: String,
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
}

/// Validation state shared by the auth middleware.
pub struct AuthGate {
    decoding: DecodingKey,
    validation: Validation,
    identity_limit: RateLimitConfig,
    ip_limit: RateLimitConfig,
    limiter: RateLimiter,
}

impl AuthGate {
    /// Build the gate from the auth configuration.
    #[must_use]
    pub fn new(config: &AuthConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&config.jwt_issuer]);
        validation.set_audience(&[&config.jwt_audience]);
        Self {
            decoding: DecodingKey::from_secret(config.jwt_secret.as_bytes()),
            validation,
            identity_limit: config.identity_rate_limit.clone(),
            ip_limit: config.ip_rate_limit.clone(),
            limiter: RateLimiter::new(),
        }
    }

    /// Whether a path bypasses credential validation.
    #[must_use]
    pub fn is_allowlisted(path: &str) -> bool {
        ALLOWLIST.iter().any(|prefix| path.starts_with(prefix))
    }

    fn validate_token(&self, token: &str) -> Result<Claims, ApiError> {
        decode::<Claims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|err| {
                debug!(error = %err, "token validation failed");
                ApiError::unauthorized("invalid or expired credential")
            })
    }

    fn check(
        &self,
        key: &str,
        config: &RateLimitConfig,
    ) -> Result<RateLimitSnapshot, ApiError> {
        self.limiter.check(key, config).map_err(|exceeded| {
            ApiError::resource_exhausted("rate limit exceeded; try again later")
                .with_rate_limit(exceeded.limit, Some(exceeded.retry_after))
        })
    }
}

/// Middleware enforcing the authentication boundary.
///
/// # Errors
///
/// 401 for missing/invalid credentials, 429 for exhausted rate budgets.
pub async fn require_bearer(
    State(gate): State<Arc<AuthGate>>,
    mut req: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    if AuthGate::is_allowlisted(req.uri().path()) {
        return Ok(next.run(req).await);
    }

    let client_ip = client_ip(&req);
    gate.check(&format!("ip:{client_ip}"), &gate.ip_limit)?;

    let token = bearer_token(&req)
        .ok_or_else(|| ApiError::unauthorized("missing bearer credential"))?;
    let claims = gate.validate_token(&token)?;
    let snapshot = gate.check(&format!("sub:{}", claims.sub), &gate.identity_limit)?;

    if let Ok(value) = HeaderValue::from_str(&claims.sub) {
        req.headers_mut().insert(HEADER_USER_ID, value);
    }
    req.extensions_mut().insert(AuthenticatedUser {
        subject: claims.sub,
    });

    let mut response = next.run(req).await;
    insert_rate_limit_headers(
        response.headers_mut(),
        snapshot.limit,
        snapshot.remaining,
        None,
    );
    Ok(response)
}

fn bearer_token(req: &Request<Body>) -> Option<String> {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
}

/// Source address used for pre-validation limits: the first entry of a
/// forwarded-for chain, falling back to the transport remote address.
fn client_ip(req: &Request<Body>) -> String {
    if let Some(forwarded) = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map_or_else(|| "unknown".to_string(), |info| info.0.ip().to_string())
}
