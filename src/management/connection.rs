//! Management interface transport
//!
//! Owns the socket to the daemon. A reader task splits incoming lines into
//! real-time notifications (`>` prefix) and command responses; the first go
//! to the middleware dispatch loop, the second to whichever caller is waiting
//! in [`CommandWriter::single_line_command`].

use super::{CommandError, CommandWriter, Middleware, MiddlewareError};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, warn};

const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// How long to wait for the answer to a command
    pub command_timeout: Duration,
    /// Send `hold release` once middlewares are started
    pub hold_release: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
            hold_release: false,
        }
    }
}

struct CommandChannel {
    stream: Box<dyn AsyncWrite + Send + Unpin>,
    responses: mpsc::UnboundedReceiver<String>,
}

/// Command side of a management connection
///
/// One command is outstanding at a time; concurrent callers queue on the lock.
pub struct ManagementWriter {
    channel: Mutex<CommandChannel>,
    timeout: Duration,
}

#[async_trait]
impl CommandWriter for ManagementWriter {
    async fn single_line_command(&self, command: &str) -> Result<String, CommandError> {
        let mut channel = self.channel.lock().await;

        while let Ok(stale) = channel.responses.try_recv() {
            debug!("Discarding unsolicited response: {}", stale);
        }

        let mut data = command.to_string();
        if !data.ends_with('\n') {
            data.push('\n');
        }
        channel.stream.write_all(data.as_bytes()).await?;
        channel.stream.flush().await?;

        let response = tokio::time::timeout(self.timeout, channel.responses.recv())
            .await
            .map_err(|_| CommandError::Timeout(self.timeout))?
            .ok_or(CommandError::Closed)?;

        parse_response(&response)
    }
}

fn parse_response(response: &str) -> Result<String, CommandError> {
    if let Some(text) = response.strip_prefix("SUCCESS:") {
        Ok(text.trim().to_string())
    } else if let Some(text) = response.strip_prefix("ERROR:") {
        Err(CommandError::Rejected(text.trim().to_string()))
    } else {
        Err(CommandError::UnexpectedResponse(response.to_string()))
    }
}

/// An open management connection
pub struct Connection {
    writer: Arc<ManagementWriter>,
    events: mpsc::UnboundedReceiver<String>,
    options: ConnectionOptions,
}

impl Connection {
    /// Connect to a daemon started with `--management <ip> <port>`
    pub async fn connect(address: &str, options: ConnectionOptions) -> Result<Self, CommandError> {
        info!("Connecting to management interface at {}", address);
        let stream = TcpStream::connect(address).await?;
        stream.set_nodelay(true)?;
        Ok(Self::from_stream(stream, options))
    }

    /// Wrap an already established stream
    pub fn from_stream<S>(stream: S, options: ConnectionOptions) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (response_tx, response_rx) = mpsc::unbounded_channel();

        tokio::spawn(read_lines(reader, event_tx, response_tx));

        Self {
            writer: Arc::new(ManagementWriter {
                channel: Mutex::new(CommandChannel {
                    stream: Box::new(writer),
                    responses: response_rx,
                }),
                timeout: options.command_timeout,
            }),
            events: event_rx,
            options,
        }
    }

    pub fn writer(&self) -> Arc<dyn CommandWriter> {
        self.writer.clone()
    }

    /// Start the middlewares and feed them real-time lines until the daemon
    /// closes the connection.
    pub async fn run(self, middlewares: Vec<Box<dyn Middleware>>) -> Result<(), MiddlewareError> {
        self.run_until(middlewares, std::future::pending()).await
    }

    /// Like [`Connection::run`], but also returns once `shutdown` completes.
    /// Middlewares are stopped either way.
    pub async fn run_until<F>(
        mut self,
        mut middlewares: Vec<Box<dyn Middleware>>,
        shutdown: F,
    ) -> Result<(), MiddlewareError>
    where
        F: Future<Output = ()>,
    {
        let writer = self.writer();

        for middleware in middlewares.iter_mut() {
            middleware.start(writer.clone()).await?;
        }

        if self.options.hold_release {
            let response = writer.single_line_command("hold release").await?;
            info!("Released management hold: {}", response);
        }

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                line = self.events.recv() => match line {
                    Some(line) => {
                        dispatch_line(&mut middlewares, &line).await;
                    }
                    None => {
                        info!("Management connection closed");
                        break;
                    }
                },
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
            }
        }

        info!("Stopping middlewares");
        for middleware in middlewares.iter_mut() {
            if let Err(e) = middleware.stop(writer.clone()).await {
                warn!("Failed to stop middleware: {}", e);
            }
        }

        Ok(())
    }
}

/// Offer one line to every middleware in order
///
/// Returns whether any middleware consumed it. Middleware errors are logged
/// and do not stop delivery to the remaining middlewares.
pub async fn dispatch_line(middlewares: &mut [Box<dyn Middleware>], line: &str) -> bool {
    let mut consumed = false;
    for middleware in middlewares.iter_mut() {
        match middleware.consume_line(line).await {
            Ok(owned) => consumed |= owned,
            Err(e) => {
                error!("Failed to handle line {:?}: {}", line, e);
                consumed = true;
            }
        }
    }

    if !consumed {
        debug!("Line not consumed: {}", line);
    }
    consumed
}

async fn read_lines<R>(
    reader: R,
    events: mpsc::UnboundedSender<String>,
    responses: mpsc::UnboundedSender<String>,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim_end_matches('\r').to_string();
                if line.is_empty() {
                    continue;
                }
                let target = if line.starts_with('>') { &events } else { &responses };
                if target.send(line).is_err() {
                    break;
                }
            }
            Ok(None) => {
                debug!("Management socket reached EOF");
                break;
            }
            Err(e) => {
                warn!("Management socket read failed: {}", e);
                break;
            }
        }
    }
}
