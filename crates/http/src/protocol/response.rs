use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use bytes::{Buf, Bytes};
use futures::StreamExt;
use http::{Method, StatusCode};
use http_body::Body;
use http_body_util::BodyExt;
use tokio::io::AsyncRead;
use tokio_util::io::ReaderStream;

use crate::connection::{Command, ConnectionLink};
use crate::protocol::body::ResponseBodyWriter;
use crate::protocol::{CookieError, HeaderError, HttpCookie, HttpError, HttpHeaders, SendError};

/// Buffer size used when streaming a reader into a response
const READER_BUFFER_SIZE: usize = 32 * 1024;

/// Everything that goes into the status line and header block of a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub http10: bool,
    pub headers: HttpHeaders,
    pub cookies: Vec<HttpCookie>,
}

impl ResponseHead {
    pub fn new(status: StatusCode, http10: bool) -> Self {
        Self { status, http10, headers: HttpHeaders::new(), cookies: Vec::new() }
    }
}

pub(crate) type DoneCallback = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Default)]
struct Parts {
    headers: HttpHeaders,
    cookies: Vec<HttpCookie>,
}

/// The response side of a [`Transaction`](crate::protocol::Transaction).
///
/// Headers and cookies can be set until the response is started. A response
/// is started exactly once, either in one go with one of the `respond*`
/// methods or incrementally with [`begin_response`](Self::begin_response).
///
/// Without a `Content-Length` the body is sent chunked (or, for HTTP/1.0
/// clients, delimited by closing the connection).
#[derive(Debug)]
pub struct Response {
    http10: bool,
    parts: Mutex<Parts>,
    started: AtomicBool,
    link: ConnectionLink,
}

impl Response {
    pub(crate) fn new(method: &Method, http10: bool, link: ConnectionLink) -> Self {
        let mut parts = Parts::default();
        if matches!(*method, Method::HEAD | Method::DELETE) {
            parts.headers.set_content_length(Some(0));
        }
        Self { http10, parts: Mutex::new(parts), started: AtomicBool::new(false), link }
    }

    fn parts(&self) -> MutexGuard<'_, Parts> {
        self.parts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.parts().headers.get(name).map(str::to_string)
    }

    /// # Errors
    ///
    /// Fails for names or values that can't appear in a header line.
    pub fn set_header(&self, name: &str, value: impl Into<String>) -> Result<(), HeaderError> {
        self.parts().headers.set(name, value)
    }

    pub fn remove_header(&self, name: &str) -> Option<String> {
        self.parts().headers.remove(name)
    }

    /// Runs `f` with the response headers locked.
    pub fn with_headers<R>(&self, f: impl FnOnce(&mut HttpHeaders) -> R) -> R {
        f(&mut self.parts().headers)
    }

    /// A snapshot of the current headers.
    pub fn headers(&self) -> HttpHeaders {
        self.parts().headers.clone()
    }

    pub fn set_content_length(&self, length: Option<u64>) {
        self.parts().headers.set_content_length(length);
    }

    /// Adds a cookie, replacing one with the same name.
    pub fn set_cookie(&self, cookie: HttpCookie) {
        let mut parts = self.parts();
        match parts.cookies.iter_mut().find(|c| c.name() == cookie.name()) {
            Some(existing) => *existing = cookie,
            None => parts.cookies.push(cookie),
        }
    }

    /// Adds a cookie from its parts.
    ///
    /// # Errors
    ///
    /// A cookie can't have both an absolute expiry and a max age.
    pub fn set_cookie_with(
        &self,
        name: &str,
        value: &str,
        domain: Option<&str>,
        expires: Option<SystemTime>,
        max_age: Option<Duration>,
    ) -> Result<(), CookieError> {
        let mut cookie = HttpCookie::with_lifetime(name, value, expires, max_age)?;
        if let Some(domain) = domain {
            cookie = cookie.domain(domain);
        }
        self.set_cookie(cookie);
        Ok(())
    }

    /// Tells the client to drop the cookie by sending it expired.
    pub fn remove_cookie(&self, name: &str) {
        self.set_cookie(HttpCookie::expired(name));
    }

    pub fn cookies(&self) -> Vec<HttpCookie> {
        self.parts().cookies.clone()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Sends the status line and headers; the body follows through the returned writer.
    ///
    /// Resolves once the head has been written. When the request body wasn't
    /// consumed it is read and discarded first.
    ///
    /// # Errors
    ///
    /// Fails when the response was already started or the connection is not
    /// in a state that accepts a response.
    pub async fn begin_response(&self, status: StatusCode) -> Result<ResponseBodyWriter, HttpError> {
        self.start(status, None).await
    }

    /// Like [`begin_response`](Self::begin_response); `on_done` runs once the
    /// exchange ends, whether the body was fully sent or the connection was lost.
    ///
    /// # Errors
    ///
    /// See [`begin_response`](Self::begin_response).
    pub async fn begin_response_with_done<F>(&self, status: StatusCode, on_done: F) -> Result<ResponseBodyWriter, HttpError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.start(status, Some(Box::new(on_done))).await
    }

    fn ensure_not_started(&self) -> Result<(), HttpError> {
        if self.is_started() {
            return Err(HttpError::already_started("response"));
        }
        Ok(())
    }

    async fn start(&self, status: StatusCode, on_done: Option<DoneCallback>) -> Result<ResponseBodyWriter, HttpError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(HttpError::already_started("response"));
        }

        let head = {
            let parts = self.parts();
            ResponseHead { status, http10: self.http10, headers: parts.headers.clone(), cookies: parts.cookies.clone() }
        };

        let result = self.link.request(|reply| Command::BeginResponse { head, on_done, reply }).await;
        if let Some(Err(e)) = result {
            if matches!(e, HttpError::InvalidState { .. }) {
                self.started.store(false, Ordering::Release);
            }
            return Err(e);
        }
        Ok(ResponseBodyWriter::new(self.link.clone()))
    }

    /// Sends a complete response with `Content-Length` set to the body size.
    ///
    /// # Errors
    ///
    /// See [`begin_response`](Self::begin_response).
    pub async fn respond(&self, status: StatusCode, body: impl Into<Bytes>) -> Result<(), HttpError> {
        self.ensure_not_started()?;
        let body = body.into();
        self.set_content_length(Some(body.len() as u64));
        let mut writer = self.begin_response(status).await?;
        writer.write_last(body).await
    }

    /// # Errors
    ///
    /// See [`begin_response`](Self::begin_response).
    pub async fn respond_empty(&self, status: StatusCode) -> Result<(), HttpError> {
        self.respond(status, Bytes::new()).await
    }

    /// Streams an [`http_body::Body`]; an exact size hint becomes the `Content-Length`.
    ///
    /// # Errors
    ///
    /// Besides the errors of [`begin_response`](Self::begin_response), a body
    /// error aborts the connection and is returned as [`SendError::InvalidBody`].
    pub async fn respond_body<B>(&self, status: StatusCode, body: B) -> Result<(), HttpError>
    where
        B: Body + Send,
        B::Data: Send,
        B::Error: Into<Box<dyn Error + Send + Sync>>,
    {
        self.ensure_not_started()?;
        self.set_content_length(body.size_hint().exact());

        let mut writer = self.begin_response(status).await?;
        let mut body = std::pin::pin!(body);
        while let Some(frame) = body.frame().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    self.link.notify(Command::Abort);
                    let e: Box<dyn Error + Send + Sync> = e.into();
                    return Err(SendError::invalid_body(e).into());
                }
            };
            if let Ok(mut data) = frame.into_data() {
                let data = data.copy_to_bytes(data.remaining());
                writer.write(data).await?;
            }
        }
        writer.finish().await
    }

    /// Streams from a reader in 32 KiB buffers.
    ///
    /// With a known `length` the response carries a `Content-Length` and the
    /// reader must yield exactly that many bytes.
    ///
    /// # Errors
    ///
    /// Besides the errors of [`begin_response`](Self::begin_response), a read
    /// error aborts the connection.
    pub async fn respond_reader<R>(&self, status: StatusCode, reader: R, length: Option<u64>) -> Result<(), HttpError>
    where
        R: AsyncRead + Send + Unpin,
    {
        self.ensure_not_started()?;
        self.set_content_length(length);

        let mut writer = self.begin_response(status).await?;
        let mut stream = ReaderStream::with_capacity(reader, READER_BUFFER_SIZE);
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(data) => writer.write(data).await?,
                Err(e) => {
                    self.link.notify(Command::Abort);
                    return Err(SendError::io(e).into());
                }
            }
        }
        writer.finish().await
    }
}
