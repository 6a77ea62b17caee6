use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket};
use tokio::select;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::connection::{Command, ConnectionLink, HttpConnection, State};
use crate::handler::Handler;
use crate::protocol::Transaction;
use crate::server::{Dispatcher, ServerBuilder, ServerConfig, ServerError};

/// Pause after a failed accept, e.g. when the process ran out of file descriptors
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// An embeddable HTTP/1.x server.
///
/// Register handlers, then [`start`](Self::start) it from within a tokio
/// runtime. Every accepted connection runs as its own task; handlers are
/// posted to the configured [`Dispatch`](crate::server::Dispatch).
///
/// Dropping the server disposes it.
pub struct HttpServer {
    shared: Arc<ServerShared>,
}

impl HttpServer {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// A stopped server with the default configuration.
    pub fn new() -> Self {
        Self::with_config(ServerConfig::default())
    }

    pub fn with_config(config: ServerConfig) -> Self {
        Self { shared: Arc::new(ServerShared::new(config)) }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    /// Sets the handler invoked once a request is ready.
    ///
    /// Without one every request is answered with `404 Not Found`.
    pub fn handle_request<H: Handler>(&self, handler: H) {
        *self.shared.request_handler.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(handler));
    }

    /// Sets the handler invoked for requests carrying `Expect: 100-continue`.
    ///
    /// It decides whether the body is wanted: either call
    /// [`Request::send_100_continue`](crate::protocol::Request::send_100_continue)
    /// or reject the request with a response. Returning without doing either
    /// sends `100 Continue`. Without this handler `100 Continue` is sent
    /// right away.
    pub fn handle_expect_100_continue<H: Handler>(&self, handler: H) {
        *self.shared.continue_handler.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(handler));
    }

    /// Binds the listener and starts accepting connections.
    ///
    /// # Errors
    ///
    /// Fails when the address can't be bound or the server was already
    /// started or disposed.
    pub async fn start(&self) -> Result<SocketAddr, ServerError> {
        self.shared.ensure_stopped()?;

        let config = &self.shared.config;
        let addr = SocketAddr::new(config.bind_address, config.port);
        let listener = bind(addr, config.backlog).map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener.local_addr().map_err(|source| ServerError::Bind { addr, source })?;

        let shutdown = CancellationToken::new();
        let dispatcher = Dispatcher::new(config.dispatch);
        {
            let mut state = self.shared.lock();
            match state.phase {
                Phase::Stopped => state.phase = Phase::Running { local_addr, shutdown: shutdown.clone() },
                Phase::Running { .. } => return Err(ServerError::AlreadyStarted),
                Phase::Disposed => return Err(ServerError::Disposed),
            }
        }

        info!(addr = %local_addr, backlog = config.backlog, dispatch = ?config.dispatch, "start listening");
        tokio::spawn(accept_loop(Arc::clone(&self.shared), listener, dispatcher, shutdown.clone()));
        if let Some(interval) = config.diagnostics_interval {
            tokio::spawn(diagnostics(Arc::clone(&self.shared), interval, shutdown));
        }

        Ok(local_addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self.shared.lock().phase {
            Phase::Running { local_addr, .. } => Some(local_addr),
            Phase::Stopped | Phase::Disposed => None,
        }
    }

    /// The port actually bound, useful when configured with port `0`.
    ///
    /// # Errors
    ///
    /// Fails when the server isn't running.
    pub fn bound_port(&self) -> Result<u16, ServerError> {
        match self.shared.lock().phase {
            Phase::Running { local_addr, .. } => Ok(local_addr.port()),
            Phase::Stopped => Err(ServerError::NotStarted),
            Phase::Disposed => Err(ServerError::Disposed),
        }
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.shared.connection_count()
    }

    /// Number of connections that have closed since the server was created.
    pub fn closed_connections(&self) -> u64 {
        self.shared.closed_connections()
    }

    pub fn is_disposed(&self) -> bool {
        matches!(self.shared.lock().phase, Phase::Disposed)
    }

    /// Stops accepting and disposes every live connection. Idempotent.
    pub fn dispose(&self) {
        self.shared.dispose();
    }
}

impl Default for HttpServer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for HttpServer {
    fn drop(&mut self) {
        self.shared.dispose();
    }
}

impl fmt::Debug for HttpServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpServer").field("shared", &self.shared).finish()
    }
}

enum Phase {
    Stopped,
    Running { local_addr: SocketAddr, shutdown: CancellationToken },
    Disposed,
}

struct ConnectionEntry {
    peer: SocketAddr,
    token: CancellationToken,
    state: watch::Receiver<State>,
}

struct ServerState {
    phase: Phase,
    next_id: u64,
    /// Connections that went through their own shutdown
    closed: u64,
    connections: HashMap<u64, ConnectionEntry>,
}

/// Server state shared with the accept loop and every connection.
///
/// The lock only guards membership and the lifecycle phase; connections keep
/// their protocol state to themselves and publish it through a watch channel.
pub(crate) struct ServerShared {
    config: ServerConfig,
    request_handler: RwLock<Option<Arc<dyn Handler>>>,
    continue_handler: RwLock<Option<Arc<dyn Handler>>>,
    state: Mutex<ServerState>,
}

impl ServerShared {
    pub(crate) fn new(config: ServerConfig) -> Self {
        Self {
            config,
            request_handler: RwLock::new(None),
            continue_handler: RwLock::new(None),
            state: Mutex::new(ServerState { phase: Phase::Stopped, next_id: 0, closed: 0, connections: HashMap::new() }),
        }
    }

    pub(crate) fn config(&self) -> &ServerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_stopped(&self) -> Result<(), ServerError> {
        match self.lock().phase {
            Phase::Stopped => Ok(()),
            Phase::Running { .. } => Err(ServerError::AlreadyStarted),
            Phase::Disposed => Err(ServerError::Disposed),
        }
    }

    #[cfg(test)]
    pub(crate) fn set_request_handler(&self, handler: Option<Arc<dyn Handler>>) {
        *self.request_handler.write().unwrap_or_else(PoisonError::into_inner) = handler;
    }

    #[cfg(test)]
    pub(crate) fn set_continue_handler(&self, handler: Option<Arc<dyn Handler>>) {
        *self.continue_handler.write().unwrap_or_else(PoisonError::into_inner) = handler;
    }

    /// Tracks a new connection; `None` once the server is disposed.
    pub(crate) fn register(&self, peer: SocketAddr, token: CancellationToken, state: watch::Receiver<State>) -> Option<u64> {
        let mut guard = self.lock();
        if matches!(guard.phase, Phase::Disposed) {
            return None;
        }
        let id = guard.next_id;
        guard.next_id += 1;
        guard.connections.insert(id, ConnectionEntry { peer, token, state });
        Some(id)
    }

    /// Called once by every registered connection when it closes, also after `dispose`.
    pub(crate) fn unregister(&self, id: u64) {
        let mut guard = self.lock();
        guard.connections.remove(&id);
        guard.closed += 1;
    }

    pub(crate) fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    pub(crate) fn closed_connections(&self) -> u64 {
        self.lock().closed
    }

    /// Posts the request handler; `false` when none is registered.
    pub(crate) fn dispatch_request(&self, dispatcher: &Dispatcher, tx: Transaction) -> bool {
        let Some(handler) = self.request_handler.read().unwrap_or_else(PoisonError::into_inner).clone() else {
            return false;
        };

        dispatcher.dispatch(async move {
            if let Err(e) = handler.call(tx).await {
                error!(cause = %e, "request handler failed");
            }
        });
        true
    }

    /// Posts the expect-continue handler; `false` when none is registered.
    ///
    /// `link` tells the connection when the handler has returned.
    pub(crate) fn dispatch_expect_continue(&self, dispatcher: &Dispatcher, tx: Transaction, link: ConnectionLink) -> bool {
        let Some(handler) = self.continue_handler.read().unwrap_or_else(PoisonError::into_inner).clone() else {
            return false;
        };

        dispatcher.dispatch(async move {
            if let Err(e) = handler.call(tx).await {
                error!(cause = %e, "expect-continue handler failed");
            }
            link.notify(Command::ContinueHandled);
        });
        true
    }

    fn dispose(&self) {
        let (shutdown, connections) = {
            let mut guard = self.lock();
            let shutdown = match std::mem::replace(&mut guard.phase, Phase::Disposed) {
                Phase::Disposed => return,
                Phase::Running { shutdown, .. } => Some(shutdown),
                Phase::Stopped => None,
            };
            (shutdown, std::mem::take(&mut guard.connections))
        };

        if let Some(shutdown) = shutdown {
            shutdown.cancel();
        }
        for entry in connections.values() {
            entry.token.cancel();
        }
        info!(connections = connections.len(), "server disposed");
    }

    fn log_connections(&self) {
        let guard = self.lock();
        trace!(connections = guard.connections.len(), closed = guard.closed, "server diagnostics");
        for (id, entry) in &guard.connections {
            debug!(id, peer = %entry.peer, state = ?*entry.state.borrow(), "live connection");
        }
    }
}

impl fmt::Debug for ServerShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerShared").field("config", &self.config).finish_non_exhaustive()
    }
}

/// Waits [`ACCEPT_BACKOFF`]; false when the server shut down meanwhile.
async fn back_off(shutdown: &CancellationToken) -> bool {
    select! {
        () = shutdown.cancelled() => false,
        () = tokio::time::sleep(ACCEPT_BACKOFF) => true,
    }
}

fn bind(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() { TcpSocket::new_v4()? } else { TcpSocket::new_v6()? };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(backlog)
}

async fn accept_loop(shared: Arc<ServerShared>, listener: TcpListener, dispatcher: Dispatcher, shutdown: CancellationToken) {
    loop {
        let (stream, peer) = select! {
            biased;
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(cause = %e, "failed to accept");
                    if back_off(&shutdown).await {
                        continue;
                    }
                    break;
                }
            },
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, cause = %e, "can't disable nagle");
        }

        let Some(connection) =
            HttpConnection::new(stream, peer, Arc::clone(&shared), dispatcher.clone(), shutdown.child_token())
        else {
            break;
        };
        tokio::spawn(connection.run());
    }
    debug!("accept loop stopped");
}

async fn diagnostics(shared: Arc<ServerShared>, period: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        select! {
            biased;
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => shared.log_connections(),
        }
    }
}
