//! Session credential extraction and validation.
//!
//! Credentials are looked up as `Authorization: Bearer <token>`, then a bare
//! `token` header, then `?token=<token>` (browsers cannot set headers on a
//! WebSocket upgrade).

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Request, StatusCode},
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// The authenticated identity behind a credential
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub name: String,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no session credential supplied")]
    Missing,
    #[error("invalid session credential: {0}")]
    Invalid(String),
}

/// External collaborator that turns a credential into a principal.
pub trait CredentialValidator: Send + Sync {
    fn validate(&self, token: &str) -> Result<Principal, AuthError>;
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: Option<String>,
    username: Option<String>,
}

/// HS256 JWT validator. Expiry is enforced; the principal name is the
/// `username` claim, falling back to `sub`.
pub struct JwtValidator {
    key: DecodingKey,
    validation: Validation,
}

impl JwtValidator {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

impl CredentialValidator for JwtValidator {
    fn validate(&self, token: &str) -> Result<Principal, AuthError> {
        let data = decode::<Claims>(token, &self.key, &self.validation)
            .map_err(|e| AuthError::Invalid(e.to_string()))?;
        let name = data
            .claims
            .username
            .or(data.claims.sub)
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .ok_or_else(|| AuthError::Invalid("token carries no subject".into()))?;
        Ok(Principal { name })
    }
}

/// Pull the raw credential out of the upgrade request.
pub fn extract_credential(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    if let Some(value) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        if let Some(token) = value.strip_prefix("Bearer ") {
            let token = token.trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }

    if let Some(value) = headers.get("token").and_then(|v| v.to_str().ok()) {
        let token = value.trim();
        if !token.is_empty() {
            return Some(token.to_string());
        }
    }

    query?
        .split('&')
        .filter_map(|pair| pair.strip_prefix("token="))
        .find(|token| !token.is_empty())
        .map(str::to_string)
}

/// Validate the request's credential, returning the principal.
pub fn authenticate(
    validator: &dyn CredentialValidator,
    headers: &HeaderMap,
    query: Option<&str>,
) -> Result<Principal, AuthError> {
    let token = extract_credential(headers, query).ok_or(AuthError::Missing)?;
    validator.validate(&token)
}

/// Axum middleware guarding the REST API. The principal is stored as a
/// request extension for handlers.
pub async fn auth_middleware(
    State(validator): State<Arc<dyn CredentialValidator>>,
    mut req: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    match authenticate(validator.as_ref(), req.headers(), req.uri().query()) {
        Ok(principal) => {
            req.extensions_mut().insert(principal);
            Ok(next.run(req).await)
        }
        Err(e) => {
            debug!(
                component = "auth",
                event = "auth.rejected",
                path = %req.uri().path(),
                error = %e,
                "Rejected API request"
            );
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}
