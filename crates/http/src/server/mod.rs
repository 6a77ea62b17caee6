//! The listening side: accept loop, connection registry and callback dispatch.

mod config;
mod dispatch;
mod error;
#[allow(clippy::module_inception, reason = "the server type lives in its own file like the other modules")]
mod server;

pub use config::{ServerBuilder, ServerConfig};
pub use dispatch::Dispatch;
pub(crate) use dispatch::Dispatcher;
pub use error::ServerError;
pub use server::HttpServer;
pub(crate) use server::ServerShared;
