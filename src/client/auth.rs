//! Username/password challenge responder
//!
//! A client-mode daemon started with `--management-query-passwords` asks for
//! credentials on the management channel instead of reading them from a
//! file. This middleware answers that prompt with credentials fetched from a
//! [`CredentialsProvider`] each time it appears.

use crate::management::{CommandWriter, Middleware, MiddlewareError};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// The daemon's prompt for the `Auth` username/password pair
pub const AUTH_CHALLENGE: &str = ">PASSWORD:Need 'Auth' username/password";

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("No credentials available: {0}")]
    Unavailable(String),
    #[error("Failed to read credentials: {0}")]
    IoError(#[from] std::io::Error),
    #[error("{0} contains a line break")]
    LineBreak(&'static str),
}

/// A username/password pair, held only for one challenge response
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Both values go on a single protocol line each.
    fn validate(&self) -> Result<(), CredentialError> {
        if self.username.contains(['\n', '\r']) {
            return Err(CredentialError::LineBreak("username"));
        }
        if self.password.contains(['\n', '\r']) {
            return Err(CredentialError::LineBreak("password"));
        }
        Ok(())
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Source of the current credentials (identity signature, session id, ...)
///
/// Called synchronously on the line-handling path; a slow provider stalls
/// the whole management channel.
pub trait CredentialsProvider: Send + Sync {
    fn credentials(&self) -> Result<Credentials, CredentialError>;
}

impl<F> CredentialsProvider for F
where
    F: Fn() -> Result<Credentials, CredentialError> + Send + Sync,
{
    fn credentials(&self) -> Result<Credentials, CredentialError> {
        self()
    }
}

/// Always answers with the same pair
pub struct StaticCredentials {
    credentials: Credentials,
}

impl StaticCredentials {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }
}

impl CredentialsProvider for StaticCredentials {
    fn credentials(&self) -> Result<Credentials, CredentialError> {
        Ok(self.credentials.clone())
    }
}

/// Client-side middleware answering the `Auth` credential challenge
pub struct AuthMiddleware {
    provider: Box<dyn CredentialsProvider>,
    writer: Option<Arc<dyn CommandWriter>>,
}

impl AuthMiddleware {
    pub fn new(provider: impl CredentialsProvider + 'static) -> Self {
        Self {
            provider: Box::new(provider),
            writer: None,
        }
    }
}

#[async_trait]
impl Middleware for AuthMiddleware {
    async fn start(&mut self, writer: Arc<dyn CommandWriter>) -> Result<(), MiddlewareError> {
        info!("Starting client user-pass provider middleware");
        self.writer = Some(writer);
        Ok(())
    }

    async fn stop(&mut self, _writer: Arc<dyn CommandWriter>) -> Result<(), MiddlewareError> {
        self.writer = None;
        Ok(())
    }

    async fn consume_line(&mut self, line: &str) -> Result<bool, MiddlewareError> {
        if line != AUTH_CHALLENGE {
            return Ok(false);
        }

        let writer = self.writer.clone().ok_or(MiddlewareError::NotStarted)?;
        let credentials = self.provider.credentials()?;
        credentials.validate()?;
        info!("Authenticating user {}", credentials.username);

        writer
            .single_line_command(&format!("password 'Auth' {}", credentials.password))
            .await?;
        writer
            .single_line_command(&format!("username 'Auth' {}", credentials.username))
            .await?;

        Ok(true)
    }
}
