//! Per-connection protocol state machine.
//!
//! Each accepted socket is owned by one [`HttpConnection`] task that moves
//! through [`State`]. The application side of a transaction talks to it over
//! a command channel ([`ConnectionLink`]); every command is answered once the
//! connection has acted on it, which is what gives the streaming APIs their
//! backpressure.

mod command;
mod http_connection;
mod state;
mod strategy;

pub(crate) use command::{Command, ConnectionLink, Reply};
pub(crate) use http_connection::HttpConnection;
pub use state::State;
