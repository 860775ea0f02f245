//! Session bridge: turning connection credentials into a user id
//!
//! Login and token issuing live elsewhere. The signaling server only needs to
//! know who is on the other end of a connection before it registers it.

use crate::types::UserId;
use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("No credentials presented")]
    MissingCredentials,

    #[error("Invalid or expired token")]
    InvalidToken,

    #[error("Credentials name an empty user id")]
    BlankUser,
}

/// What a connection presented when it was opened
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    /// `Authorization: Bearer` token or `token` query parameter
    pub bearer: Option<String>,
    /// User id asserted by a trusted fronting proxy
    pub asserted_user: Option<String>,
}

impl Credentials {
    pub fn bearer(token: impl Into<String>) -> Self {
        Credentials { bearer: Some(token.into()), asserted_user: None }
    }

    pub fn asserted(user: impl Into<String>) -> Self {
        Credentials { bearer: None, asserted_user: Some(user.into()) }
    }
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, credentials: &Credentials) -> Result<UserId, AuthError>;
}

/// Accepts the user id a fronting proxy asserts. Only for deployments where
/// the proxy has already authenticated the session.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrustedHeaderAuth;

#[async_trait]
impl Authenticator for TrustedHeaderAuth {
    async fn authenticate(&self, credentials: &Credentials) -> Result<UserId, AuthError> {
        let user = credentials.asserted_user.as_deref().ok_or(AuthError::MissingCredentials)?;
        let user = UserId::new(user.trim());
        if user.is_blank() {
            return Err(AuthError::BlankUser);
        }
        Ok(user)
    }
}

/// Static token table
#[derive(Debug, Clone, Default)]
pub struct TokenTableAuth {
    tokens: HashMap<String, UserId>,
}

impl TokenTableAuth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, user: UserId) -> Self {
        self.tokens.insert(token.into(), user);
        self
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl FromIterator<(String, UserId)> for TokenTableAuth {
    fn from_iter<I: IntoIterator<Item = (String, UserId)>>(iter: I) -> Self {
        TokenTableAuth { tokens: iter.into_iter().collect() }
    }
}

#[async_trait]
impl Authenticator for TokenTableAuth {
    async fn authenticate(&self, credentials: &Credentials) -> Result<UserId, AuthError> {
        let token = credentials.bearer.as_deref().ok_or(AuthError::MissingCredentials)?;
        self.tokens.get(token).cloned().ok_or(AuthError::InvalidToken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_trusted_header() {
        let auth = TrustedHeaderAuth;
        assert_eq!(auth.authenticate(&Credentials::asserted(" 42 ")).await, Ok(UserId::new("42")));
        assert_eq!(auth.authenticate(&Credentials::asserted("  ")).await, Err(AuthError::BlankUser));
        assert_eq!(
            auth.authenticate(&Credentials::default()).await,
            Err(AuthError::MissingCredentials)
        );
    }

    #[tokio::test]
    async fn test_token_table() {
        let auth = TokenTableAuth::new().with_token("s3cret", UserId::new("alice"));

        assert_eq!(auth.authenticate(&Credentials::bearer("s3cret")).await, Ok(UserId::new("alice")));
        assert_eq!(auth.authenticate(&Credentials::bearer("nope")).await, Err(AuthError::InvalidToken));
        assert_eq!(
            auth.authenticate(&Credentials::asserted("alice")).await,
            Err(AuthError::MissingCredentials)
        );
    }
}
