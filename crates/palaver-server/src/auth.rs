//! Handshake authentication boundary.
//!
//! Token verification belongs to an external collaborator; the routing core
//! only ever sees a verified [`Identity`]. This module is the narrow seam
//! between the two: the connection handler passes the `Connect` token here
//! and registers the connection only on success.

use async_trait::async_trait;
use palaver_core::Identity;
use thiserror::Error;

/// Authentication errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    /// No token was supplied.
    #[error("Missing authentication token")]
    MissingToken,

    /// The token was rejected.
    #[error("Invalid authentication token")]
    InvalidToken,
}

/// Verifies a handshake token into an identity.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Verify `token` and produce the identity it belongs to.
    ///
    /// # Errors
    ///
    /// Returns an [`AuthError`] when the token is missing or rejected.
    async fn authenticate(&self, token: Option<&str>) -> Result<Identity, AuthError>;
}

/// Development authenticator: the token *is* the user reference.
///
/// Stands in for a real verifier (JWT service, session store) in local
/// runs and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct TrustedTokenAuthenticator;

#[async_trait]
impl Authenticator for TrustedTokenAuthenticator {
    async fn authenticate(&self, token: Option<&str>) -> Result<Identity, AuthError> {
        match token {
            Some(user) if !user.is_empty() => Ok(Identity::new(format!("user:{user}"))),
            Some(_) => Err(AuthError::InvalidToken),
            None => Err(AuthError::MissingToken),
        }
    }
}
