//! Connection authentication.
//!
//! Every upgrade request must carry a bearer token, either in the
//! `Authorization` header or, for browsers that cannot set headers on a
//! WebSocket handshake, in the `token` query parameter. Tokens are checked
//! against the configured static table, then as HMAC-signed JWTs when a
//! secret is set.

use crate::config::AuthConfig;
use async_trait::async_trait;
use axum::http::{header, HeaderMap};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use roomcast_core::{Identity, UserId};
use serde::Deserialize;
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

/// Authentication errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    /// No token was supplied.
    #[error("Missing credentials")]
    MissingToken,

    /// The token is not recognized.
    #[error("Invalid credentials")]
    InvalidToken,
}

/// Turns a bearer token into a verified identity.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Verify `token`.
    async fn authenticate(&self, token: &str) -> Result<Identity, AuthError>;
}

/// Authenticator backed by a fixed token table.
#[derive(Debug, Default)]
pub struct StaticTokenAuthenticator {
    tokens: HashMap<String, UserId>,
}

impl StaticTokenAuthenticator {
    /// Create an authenticator from a token table.
    #[must_use]
    pub fn new(tokens: impl IntoIterator<Item = (String, UserId)>) -> Self {
        Self {
            tokens: tokens.into_iter().collect(),
        }
    }

    /// Create an authenticator from the `[auth]` config section.
    #[must_use]
    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(
            config
                .tokens
                .iter()
                .map(|entry| (entry.token.clone(), entry.user_id)),
        )
    }

    /// Check if no token is accepted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn authenticate(&self, token: &str) -> Result<Identity, AuthError> {
        self.tokens
            .get(token)
            .map(|user_id| Identity::new(*user_id))
            .ok_or(AuthError::InvalidToken)
    }
}

/// Claims read from a signed token.
#[derive(Debug, Deserialize)]
struct Claims {
    user_id: UserId,
}

/// Authenticator for HMAC-signed JWTs carrying a `user_id` claim.
///
/// Only HS256, HS384 and HS512 are accepted. `exp` is checked when present.
pub struct JwtAuthenticator {
    key: DecodingKey,
    validation: Validation,
}

impl JwtAuthenticator {
    /// Create an authenticator for tokens signed with `secret`.
    #[must_use]
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.algorithms = vec![Algorithm::HS256, Algorithm::HS384, Algorithm::HS512];
        validation.required_spec_claims.clear();
        Self {
            key: DecodingKey::from_secret(secret),
            validation,
        }
    }
}

#[async_trait]
impl Authenticator for JwtAuthenticator {
    async fn authenticate(&self, token: &str) -> Result<Identity, AuthError> {
        match jsonwebtoken::decode::<Claims>(token, &self.key, &self.validation) {
            Ok(data) => Ok(Identity::new(data.claims.user_id)),
            Err(e) => {
                debug!(error = %e, "Rejected signed token");
                Err(AuthError::InvalidToken)
            }
        }
    }
}

/// Tries each authenticator in order; the first success wins.
#[derive(Default)]
pub struct AuthChain {
    authenticators: Vec<Box<dyn Authenticator>>,
}

impl AuthChain {
    /// Build the chain from the `[auth]` config section: the static token
    /// table first, then JWT verification if `jwt_secret` is set.
    #[must_use]
    pub fn from_config(config: &AuthConfig) -> Self {
        let mut chain = Self::default();
        if !config.tokens.is_empty() {
            chain = chain.with(StaticTokenAuthenticator::from_config(config));
        }
        if let Some(secret) = &config.jwt_secret {
            chain = chain.with(JwtAuthenticator::new(secret.as_bytes()));
        }
        chain
    }

    /// Append an authenticator.
    #[must_use]
    pub fn with(mut self, authenticator: impl Authenticator + 'static) -> Self {
        self.authenticators.push(Box::new(authenticator));
        self
    }

    /// Check if no authenticator is configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.authenticators.is_empty()
    }
}

#[async_trait]
impl Authenticator for AuthChain {
    async fn authenticate(&self, token: &str) -> Result<Identity, AuthError> {
        for authenticator in &self.authenticators {
            if let Ok(identity) = authenticator.authenticate(token).await {
                return Ok(identity);
            }
        }
        Err(AuthError::InvalidToken)
    }
}

/// Extract the bearer token from the request, preferring the header.
pub fn extract_token<'a>(headers: &'a HeaderMap, query_token: Option<&'a str>) -> Option<&'a str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .or(query_token)
        .filter(|token| !token.is_empty())
}

/// Authenticate a request from its headers or `token` query parameter.
///
/// # Errors
///
/// Returns [`AuthError::MissingToken`] when no token is present and the
/// authenticator's error otherwise.
pub async fn authenticate_request(
    authenticator: &dyn Authenticator,
    headers: &HeaderMap,
    query_token: Option<&str>,
) -> Result<Identity, AuthError> {
    let token = extract_token(headers, query_token).ok_or(AuthError::MissingToken)?;
    authenticator.authenticate(token).await
}
