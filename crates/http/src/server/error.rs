use std::io;
use std::net::SocketAddr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("can't listen on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("the server is already started")]
    AlreadyStarted,

    #[error("the server is not started")]
    NotStarted,

    #[error("the server has been disposed")]
    Disposed,
}
