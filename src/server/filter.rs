//! Per-client packet filter
//!
//! Restricts every connecting client to a fixed list of subnets by answering
//! each completed CONNECT/REAUTH event with a `client-pf` command:
//!
//! ```text
//! client-pf 12
//! [CLIENTS DROP]
//! [SUBNETS ACCEPT]
//! -10.0.0.0/8
//! [END]
//! END
//! ```
//!
//! Subnets are written verbatim. The management protocol is plain text, so
//! nothing is escaped.

use crate::management::{CommandWriter, Middleware, MiddlewareError};
use crate::server::event::{CLIENT_PREFIX, ClientEvent, ClientEventType, ClientLine, EventAccumulator};
use async_trait::async_trait;
use std::fmt::Write;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("formatting failed: {0}")]
    Format(#[from] std::fmt::Error),
    #[error("subnet contains a line break: {0:?}")]
    LineBreak(String),
}

/// Render the filter installation command for one client
pub fn render_filter(client_id: u64, subnets: &[String]) -> Result<String, RenderError> {
    let mut command = String::new();
    writeln!(command, "client-pf {}", client_id)?;
    command.push_str("[CLIENTS DROP]\n");
    command.push_str("[SUBNETS ACCEPT]\n");
    for subnet in subnets {
        if subnet.contains(['\n', '\r']) {
            return Err(RenderError::LineBreak(subnet.clone()));
        }
        writeln!(command, "-{}", subnet)?;
    }
    command.push_str("[END]\n");
    command.push_str("END\n");
    Ok(command)
}

/// Server-side middleware installing a subnet filter for every client
pub struct FilterMiddleware {
    writer: Option<Arc<dyn CommandWriter>>,
    accumulator: EventAccumulator,
    subnets: Vec<String>,
}

impl FilterMiddleware {
    pub fn new(subnets: Vec<String>) -> Self {
        Self {
            writer: None,
            accumulator: EventAccumulator::new(),
            subnets,
        }
    }

    pub fn subnets(&self) -> &[String] {
        &self.subnets
    }

    async fn handle_client_event(&self, event: ClientEvent) -> Result<(), MiddlewareError> {
        match event.event_type {
            ClientEventType::Connect | ClientEventType::Reauth => {
                let writer = self.writer.as_ref().ok_or(MiddlewareError::NotStarted)?;
                let command = render_filter(event.client_id, &self.subnets)?;
                writer.single_line_command(&command).await?;
                info!(
                    "Installed filter for client {} ({} subnets)",
                    event.client_id,
                    self.subnets.len()
                );
                Ok(())
            }
            other => {
                debug!("No handler for {} event of client {}", other, event.client_id);
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Middleware for FilterMiddleware {
    async fn start(&mut self, writer: Arc<dyn CommandWriter>) -> Result<(), MiddlewareError> {
        info!("Starting client filter middleware");
        self.writer = Some(writer);
        Ok(())
    }

    async fn stop(&mut self, _writer: Arc<dyn CommandWriter>) -> Result<(), MiddlewareError> {
        self.writer = None;
        Ok(())
    }

    async fn consume_line(&mut self, line: &str) -> Result<bool, MiddlewareError> {
        let Some(client_line) = line.strip_prefix(CLIENT_PREFIX) else {
            return Ok(false);
        };

        let parsed = ClientLine::parse(client_line)?;
        match &parsed {
            ClientLine::Notice { event_type, data } => {
                debug!("Ignoring {} notice: {}", event_type, data);
            }
            ClientLine::Unknown { token, data } => {
                debug!("Ignoring unknown client event {}: {}", token, data);
            }
            _ => {}
        }

        if let Some(event) = self.accumulator.accept(parsed) {
            debug!(
                "Client event {} id={} key={} env={:?}",
                event.event_type, event.client_id, event.client_key, event.env
            );
            self.handle_client_event(event).await?;
        }

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::management::testing::RecordingWriter;
    use crate::server::event::{AccumulatorState, EventError};

    fn subnets(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    async fn started(list: &[&str]) -> (FilterMiddleware, Arc<RecordingWriter>) {
        let writer = RecordingWriter::new();
        let mut middleware = FilterMiddleware::new(subnets(list));
        middleware.start(writer.clone()).await.unwrap();
        (middleware, writer)
    }

    #[test]
    fn test_render_filter() {
        let command = render_filter(12, &subnets(&["10.0.0.0/8", "192.168.1.0/24"])).unwrap();
        assert_eq!(
            command,
            "client-pf 12\n[CLIENTS DROP]\n[SUBNETS ACCEPT]\n-10.0.0.0/8\n-192.168.1.0/24\n[END]\nEND\n"
        );
    }

    #[test]
    fn test_render_filter_no_subnets() {
        let command = render_filter(12, &[]).unwrap();
        assert_eq!(
            command,
            "client-pf 12\n[CLIENTS DROP]\n[SUBNETS ACCEPT]\n[END]\nEND\n"
        );
    }

    #[test]
    fn test_render_filter_is_not_escaped() {
        let command = render_filter(1, &subnets(&["a&b<c>/d\"e'"])).unwrap();
        assert!(command.contains("\n-a&b<c>/d\"e'\n"));
    }

    #[test]
    fn test_render_filter_rejects_line_break() {
        let result = render_filter(1, &subnets(&["10.0.0.0/8\nclient-kill 1"]));
        assert!(matches!(result, Err(RenderError::LineBreak(_))));
    }

    #[tokio::test]
    async fn test_foreign_line_not_consumed() {
        let (mut middleware, writer) = started(&["10.0.0.0/8"]).await;
        middleware.consume_line(">CLIENT:CONNECT,1,1").await.unwrap();

        for line in [
            ">PASSWORD:Need 'Auth' username/password",
            ">INFO:OpenVPN Management Interface Version 3",
            "SUCCESS: pid=42",
            "CLIENT:CONNECT,2,2",
        ] {
            assert!(!middleware.consume_line(line).await.unwrap(), "{}", line);
        }

        // In-flight event untouched
        assert!(matches!(
            middleware.accumulator.state(),
            AccumulatorState::Collecting(event) if event.client_id == 1
        ));
        assert!(writer.sent().is_empty());
    }

    #[tokio::test]
    async fn test_connect_installs_filter() {
        let (mut middleware, writer) = started(&["10.0.0.0/8", "192.168.1.0/24"]).await;

        for line in [
            ">CLIENT:CONNECT,12,0",
            ">CLIENT:ENV,common_name=alice",
            ">CLIENT:ENV,END",
        ] {
            assert!(middleware.consume_line(line).await.unwrap());
        }

        assert_eq!(
            writer.sent(),
            vec!["client-pf 12\n[CLIENTS DROP]\n[SUBNETS ACCEPT]\n-10.0.0.0/8\n-192.168.1.0/24\n[END]\nEND\n"]
        );
        assert_eq!(middleware.accumulator.state(), &AccumulatorState::Idle);
    }

    #[tokio::test]
    async fn test_reauth_installs_filter() {
        let (mut middleware, writer) = started(&[]).await;

        middleware.consume_line(">CLIENT:REAUTH,3,1").await.unwrap();
        middleware.consume_line(">CLIENT:ENV,end").await.unwrap();

        assert_eq!(writer.sent().len(), 1);
        assert!(writer.sent()[0].starts_with("client-pf 3\n"));
    }

    #[tokio::test]
    async fn test_unhandled_events_send_nothing() {
        let (mut middleware, writer) = started(&["10.0.0.0/8"]).await;

        for line in [
            ">CLIENT:ESTABLISHED,4",
            ">CLIENT:ENV,common_name=bob",
            ">CLIENT:ENV,END",
            ">CLIENT:ADDRESS,4,10.8.0.6,1",
            ">CLIENT:DISCONNECT,4",
            ">CLIENT:ENV,END",
        ] {
            assert!(middleware.consume_line(line).await.unwrap());
        }

        assert!(writer.sent().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_event_type_consumed_quietly() {
        let (mut middleware, writer) = started(&["10.0.0.0/8"]).await;

        middleware.consume_line(">CLIENT:CONNECT,9,0").await.unwrap();
        assert!(
            middleware
                .consume_line(">CLIENT:CR_RESPONSE,1,0,dGVzdA==")
                .await
                .unwrap()
        );
        middleware.consume_line(">CLIENT:ENV,END").await.unwrap();

        assert_eq!(writer.sent().len(), 1);
        assert!(writer.sent()[0].starts_with("client-pf 9\n"));
    }

    #[tokio::test]
    async fn test_malformed_header_is_repeatable() {
        let (mut middleware, writer) = started(&["10.0.0.0/8"]).await;
        middleware.consume_line(">CLIENT:CONNECT,5,0").await.unwrap();

        for _ in 0..2 {
            let err = middleware
                .consume_line(">CLIENT:CONNECT,x,0")
                .await
                .unwrap_err();
            assert!(matches!(
                err,
                MiddlewareError::MalformedEvent(EventError::InvalidNumber { .. })
            ));
        }

        // The earlier event is still collecting and completes normally
        middleware.consume_line(">CLIENT:ENV,END").await.unwrap();
        assert_eq!(writer.sent().len(), 1);
        assert!(writer.sent()[0].starts_with("client-pf 5\n"));
    }

    #[tokio::test]
    async fn test_transport_failure_reported_and_state_reset() {
        let writer = RecordingWriter::failing_at(0);
        let mut middleware = FilterMiddleware::new(subnets(&["10.0.0.0/8"]));
        middleware.start(writer.clone()).await.unwrap();

        middleware.consume_line(">CLIENT:CONNECT,1,0").await.unwrap();
        let err = middleware.consume_line(">CLIENT:ENV,END").await.unwrap_err();

        assert!(matches!(err, MiddlewareError::Transport(_)));
        assert_eq!(writer.sent().len(), 1);
        assert_eq!(middleware.accumulator.state(), &AccumulatorState::Idle);
    }

    #[tokio::test]
    async fn test_render_failure_reported() {
        let (mut middleware, writer) = started(&["bad\nsubnet"]).await;

        middleware.consume_line(">CLIENT:CONNECT,1,0").await.unwrap();
        let err = middleware.consume_line(">CLIENT:ENV,END").await.unwrap_err();

        assert!(matches!(err, MiddlewareError::Render(RenderError::LineBreak(_))));
        assert!(writer.sent().is_empty());
    }

    #[tokio::test]
    async fn test_event_before_start() {
        let mut middleware = FilterMiddleware::new(subnets(&["10.0.0.0/8"]));

        middleware.consume_line(">CLIENT:CONNECT,1,0").await.unwrap();
        let err = middleware.consume_line(">CLIENT:ENV,END").await.unwrap_err();

        assert!(matches!(err, MiddlewareError::NotStarted));
    }
}
