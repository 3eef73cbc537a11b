//! Identity verification for the connection handshake.

use crate::error::AuthError;
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use parley_protocol::UserId;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Turns a bearer token into a user id.
pub trait Verifier: Send + Sync {
    /// # Errors
    ///
    /// Returns [`AuthError::ExpiredOrInvalid`] if the token does not verify.
    fn verify(&self, token: &str) -> Result<UserId, AuthError>;
}

/// Claims carried by access tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub iat: i64,
    pub exp: i64,
}

/// HS256 JWT verifier.
#[derive(Clone)]
pub struct JwtVerifier {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    leeway_secs: u64,
}

impl JwtVerifier {
    #[must_use]
    pub fn new(secret: &str, leeway_secs: u64) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            leeway_secs,
        }
    }

    /// Sign a token for `user`, valid for `ttl`.
    ///
    /// Token issuance belongs to the account service; this exists for tests
    /// and local tooling sharing the same secret.
    ///
    /// # Errors
    ///
    /// Returns an error if signing fails.
    pub fn issue(&self, user: &UserId, ttl: Duration) -> Result<String, jsonwebtoken::errors::Error> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: user.to_string(),
            username: None,
            iat: now,
            exp: now + i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX / 2),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
    }
}

impl Verifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<UserId, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = self.leeway_secs;
        validation.set_required_spec_claims(&["exp", "sub"]);

        let data = decode::<Claims>(token, &self.decoding_key, &validation).map_err(|e| {
            debug!(error = %e, "Token rejected");
            AuthError::ExpiredOrInvalid
        })?;
        if data.claims.sub.is_empty() {
            return Err(AuthError::ExpiredOrInvalid);
        }
        Ok(UserId::new(data.claims.sub))
    }
}

/// Pull the token out of an `Authorization` header value.
///
/// # Errors
///
/// [`AuthError::MissingCredential`] without a header,
/// [`AuthError::MalformedCredential`] unless it reads `Bearer <jwt>`.
pub fn extract_bearer(header: Option<&str>) -> Result<&str, AuthError> {
    let header = header.map(str::trim).filter(|h| !h.is_empty());
    let header = header.ok_or(AuthError::MissingCredential)?;

    let mut parts = header.split_whitespace();
    let (Some(scheme), Some(token), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(AuthError::MalformedCredential);
    };
    if !scheme.eq_ignore_ascii_case("bearer") || !looks_like_jwt(token) {
        return Err(AuthError::MalformedCredential);
    }
    Ok(token)
}

fn looks_like_jwt(token: &str) -> bool {
    let segments: Vec<&str> = token.split('.').collect();
    segments.len() == 3
        && segments.iter().all(|s| {
            !s.is_empty()
                && s.bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'=')
        })
}

/// Handshake check: header to user id.
///
/// # Errors
///
/// Any [`AuthError`]; every one of them ends the connection attempt.
pub fn authenticate(verifier: &dyn Verifier, header: Option<&str>) -> Result<UserId, AuthError> {
    let token = extract_bearer(header)?;
    verifier.verify(token)
}
