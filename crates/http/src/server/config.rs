use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use crate::codec::MAX_HEADER_BYTES;
use crate::server::{Dispatch, HttpServer};

const DEFAULT_BACKLOG: u32 = 100;
const DEFAULT_READ_BUFFER_SIZE: usize = 4096;
const DEFAULT_DIAGNOSTICS_INTERVAL: Duration = Duration::from_secs(1);

/// Settings of an [`HttpServer`], fixed once it is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// `0` lets the OS pick a port, see [`HttpServer::bound_port`]
    pub port: u16,
    pub backlog: u32,
    pub bind_address: IpAddr,
    pub dispatch: Dispatch,
    /// Bytes requested from the socket per read
    pub read_buffer_size: usize,
    /// Request line plus headers; larger heads are answered with `431`
    pub max_header_size: usize,
    /// How often live connections are logged at `debug`, `None` disables it
    pub diagnostics_interval: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 0,
            backlog: DEFAULT_BACKLOG,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            dispatch: Dispatch::default(),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_header_size: MAX_HEADER_BYTES,
            diagnostics_interval: Some(DEFAULT_DIAGNOSTICS_INTERVAL),
        }
    }
}

/// Builder for [`HttpServer`].
///
/// ```
/// use std::net::Ipv4Addr;
/// use evented_http::server::{Dispatch, HttpServer};
///
/// let server = HttpServer::builder()
///     .bind_address(Ipv4Addr::LOCALHOST.into())
///     .port(8080)
///     .dispatch(Dispatch::Serial)
///     .build();
/// assert_eq!(server.config().port, 8080);
/// ```
#[derive(Debug, Clone, Default)]
pub struct ServerBuilder {
    config: ServerConfig,
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    #[must_use]
    pub fn backlog(mut self, backlog: u32) -> Self {
        self.config.backlog = backlog;
        self
    }

    #[must_use]
    pub fn bind_address(mut self, address: IpAddr) -> Self {
        self.config.bind_address = address;
        self
    }

    #[must_use]
    pub fn dispatch(mut self, dispatch: Dispatch) -> Self {
        self.config.dispatch = dispatch;
        self
    }

    #[must_use]
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.config.read_buffer_size = size.max(1);
        self
    }

    #[must_use]
    pub fn max_header_size(mut self, size: usize) -> Self {
        self.config.max_header_size = size;
        self
    }

    #[must_use]
    pub fn diagnostics_interval(mut self, interval: Option<Duration>) -> Self {
        self.config.diagnostics_interval = interval;
        self
    }

    /// The server is returned stopped, see [`HttpServer::start`].
    pub fn build(self) -> HttpServer {
        HttpServer::with_config(self.config)
    }
}
