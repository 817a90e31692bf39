//! Client lifecycle notifications
//!
//! The server side of the management interface reports client sessions as
//! `>CLIENT:` lines. A CONNECT or REAUTH header opens an event, `ENV` lines
//! attach attributes to it, and `ENV,END` closes it:
//!
//! ```text
//! >CLIENT:CONNECT,7,3
//! >CLIENT:ENV,common_name=alice
//! >CLIENT:ENV,END
//! ```

use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Namespace prefix of client notifications
pub const CLIENT_PREFIX: &str = ">CLIENT:";

const END_TOKEN: &str = "end";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    #[error("missing ',' after event type in {0:?}")]
    MissingSeparator(String),
    #[error("unknown client event type: {0}")]
    UnknownType(String),
    #[error("{event_type} header expects <id>,<key>, got {data:?}")]
    WrongArity {
        event_type: ClientEventType,
        data: String,
    },
    #[error("invalid {field} in {event_type} header: {value:?}")]
    InvalidNumber {
        event_type: ClientEventType,
        field: &'static str,
        value: String,
    },
    #[error("environment fragment without '=': {0:?}")]
    InvalidEnv(String),
}

/// Event type token, exactly as the daemon spells it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientEventType {
    Connect,
    Reauth,
    Established,
    Disconnect,
    Address,
    /// Pseudo event: an attribute line belonging to the event in progress
    Env,
}

impl ClientEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientEventType::Connect => "CONNECT",
            ClientEventType::Reauth => "REAUTH",
            ClientEventType::Established => "ESTABLISHED",
            ClientEventType::Disconnect => "DISCONNECT",
            ClientEventType::Address => "ADDRESS",
            ClientEventType::Env => "ENV",
        }
    }
}

impl fmt::Display for ClientEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ClientEventType {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CONNECT" => Ok(ClientEventType::Connect),
            "REAUTH" => Ok(ClientEventType::Reauth),
            "ESTABLISHED" => Ok(ClientEventType::Established),
            "DISCONNECT" => Ok(ClientEventType::Disconnect),
            "ADDRESS" => Ok(ClientEventType::Address),
            "ENV" => Ok(ClientEventType::Env),
            _ => Err(EventError::UnknownType(s.to_string())),
        }
    }
}

/// One completed lifecycle notification for one client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientEvent {
    pub event_type: ClientEventType,
    pub client_id: u64,
    pub client_key: u64,
    pub env: HashMap<String, String>,
}

impl ClientEvent {
    pub fn new(event_type: ClientEventType, client_id: u64, client_key: u64) -> Self {
        Self {
            event_type,
            client_id,
            client_key,
            env: HashMap::new(),
        }
    }
}

/// A single `>CLIENT:` line, prefix already stripped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientLine {
    /// CONNECT or REAUTH: opens a new event
    Header {
        event_type: ClientEventType,
        client_id: u64,
        client_key: u64,
    },
    /// ESTABLISHED, DISCONNECT or ADDRESS: recognized, not accumulated
    Notice {
        event_type: ClientEventType,
        data: String,
    },
    Env { key: String, value: String },
    End,
    /// Any other event type (CR_RESPONSE, ...): owned, but ignored
    Unknown { token: String, data: String },
}

impl ClientLine {
    pub fn parse(line: &str) -> Result<Self, EventError> {
        let (token, data) = line
            .split_once(',')
            .ok_or_else(|| EventError::MissingSeparator(line.to_string()))?;
        let Ok(event_type) = token.parse::<ClientEventType>() else {
            return Ok(ClientLine::Unknown {
                token: token.to_string(),
                data: data.to_string(),
            });
        };

        match event_type {
            ClientEventType::Connect | ClientEventType::Reauth => {
                let (client_id, client_key) = parse_id_and_key(event_type, data)?;
                Ok(ClientLine::Header {
                    event_type,
                    client_id,
                    client_key,
                })
            }
            ClientEventType::Env => parse_env(data),
            ClientEventType::Established | ClientEventType::Disconnect | ClientEventType::Address => {
                Ok(ClientLine::Notice {
                    event_type,
                    data: data.to_string(),
                })
            }
        }
    }
}

fn parse_id_and_key(event_type: ClientEventType, data: &str) -> Result<(u64, u64), EventError> {
    let fields: Vec<&str> = data.split(',').collect();
    let [id, key] = fields.as_slice() else {
        return Err(EventError::WrongArity {
            event_type,
            data: data.to_string(),
        });
    };

    let parse = |field: &'static str, value: &str| {
        value
            .trim()
            .parse::<u64>()
            .map_err(|_| EventError::InvalidNumber {
                event_type,
                field,
                value: value.to_string(),
            })
    };

    Ok((parse("client id", *id)?, parse("client key", *key)?))
}

fn parse_env(data: &str) -> Result<ClientLine, EventError> {
    if data.trim().eq_ignore_ascii_case(END_TOKEN) {
        return Ok(ClientLine::End);
    }

    let (key, value) = data
        .split_once('=')
        .ok_or_else(|| EventError::InvalidEnv(data.to_string()))?;
    Ok(ClientLine::Env {
        key: key.to_string(),
        value: value.to_string(),
    })
}

/// Accumulation state of the single in-flight event
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum AccumulatorState {
    #[default]
    Idle,
    Collecting(ClientEvent),
}

/// Merges header and `ENV` lines into completed [`ClientEvent`]s
///
/// Holds at most one event. A new header replaces whatever is in flight.
#[derive(Debug, Default)]
pub struct EventAccumulator {
    state: AccumulatorState,
}

impl EventAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &AccumulatorState {
        &self.state
    }

    /// Feed one parsed line. Returns the event once its terminator arrives;
    /// the accumulator is back to `Idle` by the time the caller sees it.
    pub fn accept(&mut self, line: ClientLine) -> Option<ClientEvent> {
        match line {
            ClientLine::Header {
                event_type,
                client_id,
                client_key,
            } => {
                self.state =
                    AccumulatorState::Collecting(ClientEvent::new(event_type, client_id, client_key));
                None
            }
            ClientLine::Env { key, value } => {
                if let AccumulatorState::Collecting(event) = &mut self.state {
                    event.env.insert(key, value);
                }
                None
            }
            ClientLine::End => match std::mem::take(&mut self.state) {
                AccumulatorState::Collecting(event) => Some(event),
                AccumulatorState::Idle => None,
            },
            ClientLine::Notice { .. } | ClientLine::Unknown { .. } => None,
        }
    }
}
