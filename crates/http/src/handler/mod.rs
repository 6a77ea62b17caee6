//! Callbacks invoked by the server for each transaction.
//!
//! A [`Handler`] receives the [`Transaction`] by value. Returning an error is
//! logged; if the handler didn't start a response the connection answers
//! `500` once the transaction is dropped.

use std::error::Error;
use std::future::Future;

use async_trait::async_trait;

use crate::protocol::Transaction;

pub type HandlerError = Box<dyn Error + Send + Sync>;

#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn call(&self, tx: Transaction) -> Result<(), HandlerError>;
}

#[derive(Debug)]
pub struct HandlerFn<F> {
    f: F,
}

#[async_trait]
impl<Err, F, Fut> Handler for HandlerFn<F>
where
    F: Fn(Transaction) -> Fut + Send + Sync + 'static,
    Err: Into<HandlerError> + 'static,
    Fut: Future<Output = Result<(), Err>> + Send + 'static,
{
    async fn call(&self, tx: Transaction) -> Result<(), HandlerError> {
        (self.f)(tx).await.map_err(Into::into)
    }
}

/// Wraps an async closure into a [`Handler`].
///
/// ```no_run
/// use evented_http::handler::make_handler;
/// use evented_http::protocol::{HttpError, Transaction};
/// use http::StatusCode;
///
/// let handler = make_handler(|tx: Transaction| async move {
///     tx.response().respond(StatusCode::OK, "hello").await?;
///     Ok::<_, HttpError>(())
/// });
/// ```
pub fn make_handler<F, Err, Fut>(f: F) -> HandlerFn<F>
where
    Err: Into<HandlerError>,
    Fut: Future<Output = Result<(), Err>>,
    F: Fn(Transaction) -> Fut,
{
    HandlerFn { f }
}
