use bytes::Bytes;
use tracing::trace;

use crate::connection::{Command, ConnectionLink};
use crate::protocol::HttpError;

/// Writes the body of a response started with
/// [`Response::begin_response`](crate::protocol::Response::begin_response).
///
/// Each write resolves once the bytes have been handed to the socket. The
/// body must be ended with [`write_last`](Self::write_last) or
/// [`finish`](Self::finish); dropping the writer earlier aborts the connection.
#[derive(Debug)]
pub struct ResponseBodyWriter {
    link: ConnectionLink,
    finished: bool,
}

impl ResponseBodyWriter {
    pub(crate) fn new(link: ConnectionLink) -> Self {
        Self { link, finished: false }
    }

    /// # Errors
    ///
    /// Fails when the data overruns the declared `Content-Length` (the
    /// connection is then closed), or when the body has already been finished.
    pub async fn write(&mut self, data: impl Into<Bytes>) -> Result<(), HttpError> {
        self.send(data.into(), false).await
    }

    /// Writes the final bytes of the body.
    ///
    /// # Errors
    ///
    /// Besides the errors of [`write`](Self::write), fails when a
    /// `Content-Length` body is left short.
    pub async fn write_last(&mut self, data: impl Into<Bytes>) -> Result<(), HttpError> {
        self.send(data.into(), true).await
    }

    /// Ends the body without more data.
    ///
    /// # Errors
    ///
    /// See [`write_last`](Self::write_last).
    pub async fn finish(&mut self) -> Result<(), HttpError> {
        self.send(Bytes::new(), true).await
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    async fn send(&mut self, data: Bytes, is_last: bool) -> Result<(), HttpError> {
        if self.finished {
            return Err(HttpError::ResponseFinished);
        }
        if is_last {
            self.finished = true;
        }
        trace!(size = data.len(), is_last, "send response buffer");
        self.link.request(|reply| Command::ResponseBuffer { data, is_last, reply }).await.unwrap_or(Ok(()))
    }
}

impl Drop for ResponseBodyWriter {
    fn drop(&mut self) {
        if !self.finished {
            self.link.notify(Command::Abort);
        }
    }
}
