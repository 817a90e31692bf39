//! OpenVPN management interface middlewares
//!
//! This crate watches the line-oriented management channel of an OpenVPN
//! daemon and answers two kinds of server-pushed events:
//!
//! - the client-side `>PASSWORD:Need 'Auth' username/password` challenge,
//!   answered with credentials from a provider
//! - the server-side `>CLIENT:` lifecycle notifications, answered with a
//!   `client-pf` packet filter limiting the client to configured subnets
//!
//! # Architecture
//!
//! - `management`: middleware and command-writer traits, TCP transport
//! - `server`: client event parsing/accumulation and the filter middleware
//! - `client`: credential challenge middleware
//! - `config`: Configuration file handling (TOML)
//!
//! # Usage
//!
//! Start the daemon with a management socket, then attach:
//! ```bash
//! openvpn --config server.conf --management 127.0.0.1 7505
//! openvpn-mgmt server --subnet 10.8.0.0/24
//! ```

pub mod client;
pub mod config;
pub mod management;
pub mod server;

pub use client::AuthMiddleware;
pub use config::Config;
pub use management::{CommandWriter, Connection, Middleware};
pub use server::FilterMiddleware;
