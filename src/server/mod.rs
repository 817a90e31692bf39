//! Server-side middlewares
//!
//! Consume the `>CLIENT:` notifications a server-mode daemon emits for
//! each connecting client.

pub mod event;
pub mod filter;

pub use event::{ClientEvent, ClientEventType, EventAccumulator, EventError};
pub use filter::{FilterMiddleware, RenderError, render_filter};
