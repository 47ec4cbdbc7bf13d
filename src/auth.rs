use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use thiserror::Error;
use zeroize::Zeroizing;

/// Minimum accepted key length (256 bits of base64)
pub const MIN_KEY_LENGTH: usize = 32;

#[derive(Debug, Error, PartialEq)]
pub enum AuthError {
    #[error("No API keys configured. Set API_KEYS to a comma-separated list of keys")]
    NoKeys,

    #[error("API key too short (length {length}, minimum {MIN_KEY_LENGTH}). Generate one with: openssl rand -base64 32")]
    WeakKey { length: usize },
}

/// Operator API keys accepted as Bearer tokens
pub struct ApiKeys {
    keys: Vec<Zeroizing<String>>,
}

impl ApiKeys {
    /// Parse a comma-separated key list. Refuses to build an empty or weak
    /// key set so the API never runs unauthenticated.
    pub fn parse(raw: &str) -> Result<Self, AuthError> {
        let mut keys: Vec<Zeroizing<String>> = Vec::new();

        for key in raw.split(',').map(str::trim).filter(|k| !k.is_empty()) {
            if key.len() < MIN_KEY_LENGTH {
                tracing::error!(
                    "SECURITY ERROR: API key is too weak (length: {}, minimum: {})",
                    key.len(),
                    MIN_KEY_LENGTH
                );
                return Err(AuthError::WeakKey { length: key.len() });
            }
            if !keys.iter().any(|k| k.as_str() == key) {
                keys.push(Zeroizing::new(key.to_string()));
            }
        }

        if keys.is_empty() {
            return Err(AuthError::NoKeys);
        }

        tracing::info!("✓ API authentication initialized with {} valid key(s)", keys.len());
        Ok(Self { keys })
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    fn is_valid(&self, key: &str) -> bool {
        self.keys.iter().any(|k| k.as_str() == key)
    }
}

/// Middleware to require a valid Bearer token
pub async fn require_auth(
    State(keys): State<Arc<ApiKeys>>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let auth_header = request
        .headers()
        .get("Authorization")
        .and_then(|v| v.to_str().ok());

    match auth_header.and_then(|auth| auth.strip_prefix("Bearer ")) {
        Some(key) if keys.is_valid(key) => Ok(next.run(request).await),
        Some(_) => {
            tracing::warn!(path = %request.uri().path(), "Invalid API key attempted");
            Err(StatusCode::UNAUTHORIZED)
        }
        None if auth_header.is_some() => {
            tracing::warn!("Invalid Authorization header format (expected Bearer token)");
            Err(StatusCode::UNAUTHORIZED)
        }
        None => {
            tracing::warn!(path = %request.uri().path(), "Missing Authorization header");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}
