//! JWT Authentication
//!
//! Issues and validates the session tokens handed out on first login.
//! A token binds a player id to a display name, so a client can drop its
//! socket and come back as the same player.

use std::time::Duration;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation, Algorithm, TokenData};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::game::state::PlayerId;

/// Secret used when `AUTH_SECRET` is unset. Development only.
const DEV_SECRET: &str = "snake-arena-dev-secret-change-me";

/// Authentication configuration.
#[derive(Clone, Debug)]
pub struct AuthConfig {
    /// HS256 signing secret.
    pub secret: String,
    /// Issuer claim to stamp and require. If None, not checked.
    pub issuer: Option<String>,
    /// Lifetime of issued tokens.
    pub token_ttl: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: DEV_SECRET.to_string(),
            issuer: None,
            token_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl AuthConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let secret = match std::env::var("AUTH_SECRET") {
            Ok(s) if !s.is_empty() => s,
            _ => {
                warn!("AUTH_SECRET not set, using development secret");
                defaults.secret
            }
        };

        Self {
            secret,
            issuer: std::env::var("AUTH_ISSUER").ok(),
            token_ttl: std::env::var("AUTH_TOKEN_TTL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.token_ttl),
        }
    }
}

/// Claims carried by a session token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Subject - the player id.
    pub sub: String,
    /// Display name at issue time.
    #[serde(default)]
    pub username: String,
    /// Expiry timestamp (Unix seconds).
    #[serde(default)]
    pub exp: u64,
    /// Issued at timestamp.
    #[serde(default)]
    pub iat: u64,
    /// Issuer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
}

impl TokenClaims {
    /// Player id named by the subject claim.
    pub fn player_id(&self) -> Result<PlayerId, AuthError> {
        PlayerId::from_uuid_str(&self.sub).ok_or(AuthError::InvalidSubject)
    }
}

/// Authentication errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Token format is invalid.
    #[error("invalid token format")]
    InvalidFormat,
    /// Token signature verification failed.
    #[error("invalid signature")]
    InvalidSignature,
    /// Token has expired.
    #[error("token expired")]
    Expired,
    /// Issuer claim doesn't match expected value.
    #[error("invalid issuer")]
    InvalidIssuer,
    /// Required claim is missing.
    #[error("missing required claim: {0}")]
    MissingClaim(String),
    /// Subject is not a player id.
    #[error("subject is not a player id")]
    InvalidSubject,
    /// JWT decoding error.
    #[error("decode error: {0}")]
    DecodeError(String),
    /// JWT encoding error.
    #[error("encode error: {0}")]
    EncodeError(String),
}

fn now_secs() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

/// Issue a signed token for a player.
pub fn issue_token(player_id: &PlayerId, username: &str, config: &AuthConfig) -> Result<String, AuthError> {
    let iat = now_secs();
    let claims = TokenClaims {
        sub: player_id.to_uuid_string(),
        username: username.to_string(),
        exp: iat + config.token_ttl.as_secs(),
        iat,
        iss: config.issuer.clone(),
    };

    let key = EncodingKey::from_secret(config.secret.as_bytes());
    encode(&Header::new(Algorithm::HS256), &claims, &key)
        .map_err(|e| AuthError::EncodeError(e.to_string()))
}

/// Validate a JWT token and extract claims.
pub fn validate_token(token: &str, config: &AuthConfig) -> Result<TokenClaims, AuthError> {
    let mut validation = Validation::new(Algorithm::HS256);

    // Expiry is checked below without leeway
    validation.required_spec_claims = std::collections::HashSet::new();
    validation.validate_exp = false;
    validation.validate_aud = false;

    // Set expected issuer (if not set, any issuer is accepted)
    if let Some(ref issuer) = config.issuer {
        validation.set_issuer(&[issuer]);
    }

    let key = DecodingKey::from_secret(config.secret.as_bytes());
    let token_data: TokenData<TokenClaims> = decode(token, &key, &validation)
        .map_err(map_jwt_error)?;

    let claims = token_data.claims;

    if claims.sub.is_empty() {
        return Err(AuthError::MissingClaim("sub".into()));
    }
    if claims.exp == 0 {
        return Err(AuthError::MissingClaim("exp".into()));
    }
    if now_secs() >= claims.exp {
        return Err(AuthError::Expired);
    }

    Ok(claims)
}

/// Map JWT library errors to our error type.
fn map_jwt_error(err: jsonwebtoken::errors::Error) -> AuthError {
    use jsonwebtoken::errors::ErrorKind;
    match err.kind() {
        ErrorKind::ExpiredSignature => AuthError::Expired,
        ErrorKind::InvalidSignature => AuthError::InvalidSignature,
        ErrorKind::InvalidIssuer => AuthError::InvalidIssuer,
        ErrorKind::InvalidToken | ErrorKind::Base64(_) => AuthError::InvalidFormat,
        _ => AuthError::DecodeError(err.to_string()),
    }
}

// =============================================================================
// TESTS
// =============================================================================
