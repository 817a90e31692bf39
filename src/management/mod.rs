//! OpenVPN management interface plumbing
//!
//! The daemon's management interface is a line-oriented text channel. Lines
//! starting with `>` are real-time notifications pushed by the daemon; every
//! other line answers the command we last sent.
//!
//! Middlewares sit on top of the channel: the transport offers each
//! real-time line to every registered [`Middleware`], and a middleware writes
//! commands back through the [`CommandWriter`] it was started with.

pub mod connection;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

pub use connection::{Connection, ConnectionOptions};

/// Failure of a single command round-trip on the control channel
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Command rejected by daemon: {0}")]
    Rejected(String),
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
    #[error("No response within {0:?}")]
    Timeout(std::time::Duration),
    #[error("Management connection closed")]
    Closed,
}

/// Failure while a middleware handled a line it owns
///
/// Returning any of these means the line was consumed.
#[derive(Error, Debug)]
pub enum MiddlewareError {
    #[error("Malformed client event: {0}")]
    MalformedEvent(#[from] crate::server::event::EventError),
    #[error("Failed to render command: {0}")]
    Render(#[from] crate::server::filter::RenderError),
    #[error("Transport error: {0}")]
    Transport(#[from] CommandError),
    #[error("Credential fetch failed: {0}")]
    CredentialFetch(#[from] crate::client::auth::CredentialError),
    #[error("Middleware received a line before it was started")]
    NotStarted,
}

/// Sends one command and waits for the daemon's answer
#[async_trait]
pub trait CommandWriter: Send + Sync {
    /// Send `command` (newline appended when missing) and return the text
    /// following `SUCCESS:` in the response.
    async fn single_line_command(&self, command: &str) -> Result<String, CommandError>;
}

/// A consumer of real-time lines from the management interface
#[async_trait]
pub trait Middleware: Send {
    async fn start(&mut self, writer: Arc<dyn CommandWriter>) -> Result<(), MiddlewareError>;

    async fn stop(&mut self, writer: Arc<dyn CommandWriter>) -> Result<(), MiddlewareError>;

    /// Offer a raw line to this middleware.
    ///
    /// `Ok(false)` leaves the line for other middlewares. `Ok(true)` and
    /// `Err(_)` both mean the line belonged to this middleware.
    async fn consume_line(&mut self, line: &str) -> Result<bool, MiddlewareError>;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Records every command and answers from a scripted list of results
    #[derive(Default)]
    pub struct RecordingWriter {
        pub commands: Mutex<Vec<String>>,
        failures: Mutex<Vec<usize>>,
    }

    impl RecordingWriter {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Make the command with the given zero-based index fail.
        pub fn failing_at(index: usize) -> Arc<Self> {
            let writer = Self::default();
            writer.failures.lock().unwrap().push(index);
            Arc::new(writer)
        }

        pub fn sent(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommandWriter for RecordingWriter {
        async fn single_line_command(&self, command: &str) -> Result<String, CommandError> {
            let mut commands = self.commands.lock().unwrap();
            let index = commands.len();
            commands.push(command.to_string());
            if self.failures.lock().unwrap().contains(&index) {
                return Err(CommandError::Rejected("scripted failure".to_string()));
            }
            Ok("ok".to_string())
        }
    }
}
