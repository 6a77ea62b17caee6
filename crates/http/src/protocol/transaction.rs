use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::protocol::{Request, Response};
use crate::server::Dispatcher;

type Listener = Box<dyn FnOnce() + Send + 'static>;

enum Listeners {
    Waiting(Vec<Listener>),
    Fired,
    Released,
}

/// Cancellation shared between a transaction and its connection.
///
/// Listeners run at most once, on the dispatcher. Once the response has been
/// fully sent the listeners are released without being called.
pub(crate) struct TxSignals {
    token: CancellationToken,
    listeners: Mutex<Listeners>,
    dispatcher: Dispatcher,
}

impl TxSignals {
    pub(crate) fn new(dispatcher: Dispatcher) -> Self {
        Self { token: CancellationToken::new(), listeners: Mutex::new(Listeners::Waiting(Vec::new())), dispatcher }
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub(crate) fn cancel(&self) {
        self.token.cancel();

        let listeners = {
            let mut guard = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
            match std::mem::replace(&mut *guard, Listeners::Fired) {
                Listeners::Waiting(listeners) => listeners,
                previous => {
                    *guard = previous;
                    return;
                }
            }
        };

        debug!(listeners = listeners.len(), "transaction canceled");
        for listener in listeners {
            self.dispatcher.dispatch_fn(listener);
        }
    }

    /// Drops pending listeners once the transaction completed normally.
    pub(crate) fn release(&self) {
        let mut guard = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(*guard, Listeners::Waiting(_)) {
            *guard = Listeners::Released;
        }
    }

    fn on_canceled(&self, listener: Listener) {
        let mut guard = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        if let Listeners::Waiting(listeners) = &mut *guard {
            listeners.push(listener);
            return;
        }

        let fired = matches!(*guard, Listeners::Fired);
        drop(guard);
        if fired {
            self.dispatcher.dispatch_fn(listener);
        }
    }
}

impl fmt::Debug for TxSignals {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxSignals").field("canceled", &self.token.is_cancelled()).finish_non_exhaustive()
    }
}

/// One request/response exchange on a connection.
///
/// Cloning is cheap and every clone refers to the same exchange. The
/// connection notices when all clones (and any
/// [`ResponseBodyWriter`](crate::protocol::ResponseBodyWriter)) are dropped: a
/// response that was never started is then answered with `500`, one that was
/// left unfinished aborts the connection.
#[derive(Clone, Debug)]
pub struct Transaction {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    request: Request,
    response: Response,
    signals: Arc<TxSignals>,
}

impl Transaction {
    pub(crate) fn new(request: Request, response: Response, signals: Arc<TxSignals>) -> Self {
        Self { inner: Arc::new(Inner { request, response, signals }) }
    }

    pub fn request(&self) -> &Request {
        &self.inner.request
    }

    pub fn response(&self) -> &Response {
        &self.inner.response
    }

    /// Aborts the exchange and closes the connection.
    ///
    /// Canceled listeners are notified once, further calls do nothing.
    pub fn cancel(&self) {
        self.inner.signals.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.signals.token().is_cancelled()
    }

    /// Registers a callback for cancellation, whether by [`cancel`](Self::cancel)
    /// or because the connection went away mid-exchange.
    ///
    /// The callback runs right away (on the dispatcher) if the transaction is
    /// already canceled, and never if it completes normally.
    pub fn on_canceled<F>(&self, listener: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.signals.on_canceled(Box::new(listener));
    }

    /// Resolves when the transaction is canceled.
    pub async fn canceled(&self) {
        self.inner.signals.token().cancelled().await;
    }
}
