use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::channel::{mpsc, oneshot};
use futures::{Stream, StreamExt};
use http_body::{Body, Frame, SizeHint};
use tracing::trace;

use crate::protocol::ParseError;

/// Cap on what [`RequestBodyStream::collect_bytes`] reserves up front
const MAX_INITIAL_CAPACITY: usize = 64 * 1024;

/// One slice of a streamed request body.
///
/// The connection doesn't read further from the socket until the buffer is
/// completed, either explicitly with [`RequestBuffer::complete`] or by dropping it.
#[derive(Debug)]
pub struct RequestBuffer {
    data: Bytes,
    is_last: bool,
    done: Option<oneshot::Sender<()>>,
}

impl RequestBuffer {
    pub(crate) fn new(data: Bytes, is_last: bool) -> (Self, oneshot::Receiver<()>) {
        let (done, completed) = oneshot::channel();
        (Self { data, is_last, done: Some(done) }, completed)
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// True for the buffer carrying the final bytes of the body.
    pub fn is_last(&self) -> bool {
        self.is_last
    }

    /// Hands the buffer back, allowing the next read.
    pub fn complete(mut self) {
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
    }

    /// Completes the buffer and keeps its bytes.
    pub fn into_data(mut self) -> Bytes {
        let data = std::mem::take(&mut self.data);
        self.complete();
        data
    }
}

/// Consumer side of a streamed request body.
///
/// Buffers arrive one at a time; the stream ends after the last buffer. If the
/// connection goes away before the last buffer, [`Body::poll_frame`] reports an
/// unexpected end of body.
#[derive(Debug)]
pub struct RequestBodyStream {
    buffers: mpsc::Receiver<RequestBuffer>,
    remaining: u64,
    finished: bool,
}

impl RequestBodyStream {
    pub(crate) fn channel(content_length: u64) -> (mpsc::Sender<RequestBuffer>, Self) {
        let (sender, buffers) = mpsc::channel(0);
        (sender, Self { buffers, remaining: content_length, finished: false })
    }

    /// Waits for the next buffer, `None` once the body has been fully delivered
    /// or the connection is gone.
    pub async fn next_buffer(&mut self) -> Option<RequestBuffer> {
        if self.finished {
            return None;
        }
        match self.buffers.next().await {
            Some(buffer) => Some(self.track(buffer)),
            None => {
                self.finished = true;
                None
            }
        }
    }

    /// Reads the remaining body into memory.
    ///
    /// # Errors
    ///
    /// Fails when the body ends before its declared length.
    pub async fn collect_bytes(mut self) -> Result<Bytes, ParseError> {
        let initial = usize::try_from(self.remaining).map_or(MAX_INITIAL_CAPACITY, |n| n.min(MAX_INITIAL_CAPACITY));
        let mut collected = Vec::with_capacity(initial);
        while !self.finished {
            match self.buffers.next().await {
                Some(buffer) => collected.extend_from_slice(&self.track(buffer).into_data()),
                None => return Err(unexpected_end()),
            }
        }
        Ok(Bytes::from(collected))
    }

    fn track(&mut self, buffer: RequestBuffer) -> RequestBuffer {
        self.remaining = self.remaining.saturating_sub(buffer.len() as u64);
        if buffer.is_last() {
            self.finished = true;
        }
        trace!(size = buffer.len(), is_last = buffer.is_last(), "received request buffer");
        buffer
    }
}

fn unexpected_end() -> ParseError {
    ParseError::io(io::Error::new(io::ErrorKind::UnexpectedEof, "request body ended early"))
}

impl Body for RequestBodyStream {
    type Data = Bytes;
    type Error = ParseError;

    fn poll_frame(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        if self.finished {
            return Poll::Ready(None);
        }

        match Pin::new(&mut self.buffers).poll_next(cx) {
            Poll::Ready(Some(buffer)) => {
                let data = self.track(buffer).into_data();
                Poll::Ready(Some(Ok(Frame::data(data))))
            }
            Poll::Ready(None) => {
                self.finished = true;
                Poll::Ready(Some(Err(unexpected_end())))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.finished
    }

    fn size_hint(&self) -> SizeHint {
        SizeHint::with_exact(self.remaining)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[tokio::test]
    async fn streams_until_last_buffer() {
        let (mut sender, stream) = RequestBodyStream::channel(6);

        let producer = tokio::spawn(async move {
            let (first, done) = RequestBuffer::new(Bytes::from_static(b"abc"), false);
            sender.try_send(first).unwrap();
            done.await.unwrap();

            let (last, done) = RequestBuffer::new(Bytes::from_static(b"def"), true);
            sender.try_send(last).unwrap();
            done.await.unwrap();
        });

        let body = stream.collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"abcdef");
        producer.await.unwrap();
    }

    #[tokio::test]
    async fn declared_length_is_not_preallocated() {
        let (mut sender, stream) = RequestBodyStream::channel(u64::MAX);
        let (last, _done) = RequestBuffer::new(Bytes::from_static(b"abc"), true);
        sender.try_send(last).unwrap();

        let body = stream.collect_bytes().await.unwrap();
        assert_eq!(&body[..], b"abc");
    }

    #[tokio::test]
    async fn dropping_a_buffer_completes_it() {
        let (buffer, done) = RequestBuffer::new(Bytes::from_static(b"x"), true);
        drop(buffer);
        assert!(done.await.is_err());
    }

    #[tokio::test]
    async fn early_disconnect_is_an_error() {
        let (mut sender, stream) = RequestBodyStream::channel(10);
        let (first, _done) = RequestBuffer::new(Bytes::from_static(b"abc"), false);
        sender.try_send(first).unwrap();
        drop(sender);

        assert!(stream.collect_bytes().await.is_err());
    }

    #[tokio::test]
    async fn next_buffer_reports_end() {
        let (mut sender, mut stream) = RequestBodyStream::channel(1);
        let (last, _done) = RequestBuffer::new(Bytes::from_static(b"z"), true);
        sender.try_send(last).unwrap();

        let buffer = stream.next_buffer().await.unwrap();
        assert!(buffer.is_last());
        buffer.complete();
        assert!(stream.next_buffer().await.is_none());
        assert!(stream.is_end_stream());
    }
}
