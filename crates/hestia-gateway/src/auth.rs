//! Authentication seam. Token verification is delegated to an `Authenticator`;
//! the gateway itself only checks ownership and the revocation watermark.

use async_trait::async_trait;
use axum::http::{header, HeaderMap};
use chrono::{DateTime, Utc};
use hestia_core::{HestiaError, Result};
use tracing::debug;

/// What a verified token asserts.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthClaims {
    /// Address whose key signed the token
    pub signer_address: String,
    /// Address of the identity the token was issued for
    pub issuer_address: String,
    pub issued_at: DateTime<Utc>,
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Verify the request's token for access to `bucket`.
    async fn validate_bucket(&self, bucket: &str, headers: &HeaderMap) -> Result<AuthClaims>;
}

/// Extract Bearer token from Authorization header.
pub fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
        .map(str::trim)
}

/// Accepts `Bearer <address>` or `Bearer <address>:<issued-at-seconds>` without
/// any signature check. For deployments that authenticate upstream.
#[derive(Debug, Default, Clone)]
pub struct TrustingAuthenticator;

#[async_trait]
impl Authenticator for TrustingAuthenticator {
    async fn validate_bucket(&self, bucket: &str, headers: &HeaderMap) -> Result<AuthClaims> {
        let token = extract_bearer_token(headers)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| HestiaError::Auth("Authentication required".to_string()))?;

        let (address, issued_at) = match token.split_once(':') {
            Some((address, secs)) => {
                let secs: i64 = secs
                    .parse()
                    .map_err(|_| HestiaError::Auth(format!("Invalid issue time \"{}\"", secs)))?;
                let at = DateTime::from_timestamp(secs, 0)
                    .ok_or_else(|| HestiaError::Auth(format!("Invalid issue time \"{}\"", secs)))?;
                (address, at)
            }
            None => (token, Utc::now()),
        };

        debug!("Trusting token of {} for bucket {}", address, bucket);
        Ok(AuthClaims {
            signer_address: address.to_string(),
            issuer_address: address.to_string(),
            issued_at,
        })
    }
}
