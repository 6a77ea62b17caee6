use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use http::Method;

use crate::connection::{Command, ConnectionLink};
use crate::protocol::body::RequestBodyStream;
use crate::protocol::{DataDictionary, HttpError, HttpHeaders, parse_cookie_header};

/// The parsed request line and headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: Method,
    /// The request target exactly as sent, query string included
    pub raw_path: String,
    pub http10: bool,
    pub headers: HttpHeaders,
}

/// A file received in a `multipart/form-data` body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    field_name: String,
    file_name: String,
    content_type: Option<String>,
    contents: Bytes,
}

impl UploadedFile {
    pub(crate) fn new(field_name: String, file_name: String, content_type: Option<String>, contents: Bytes) -> Self {
        Self { field_name, file_name, content_type, contents }
    }

    /// The form field the file was posted under
    pub fn field_name(&self) -> &str {
        &self.field_name
    }

    /// The client side file name
    pub fn name(&self) -> &str {
        &self.file_name
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn contents(&self) -> &Bytes {
        &self.contents
    }

    pub fn len(&self) -> usize {
        self.contents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contents.is_empty()
    }
}

#[derive(Debug, Default)]
pub(crate) struct FormUpload {
    pub(crate) fields: Vec<(String, String)>,
    pub(crate) files: HashMap<String, UploadedFile>,
}

/// The request side of a [`Transaction`](crate::protocol::Transaction).
///
/// Query, form and cookie data are parsed lazily on first access. Form data
/// is only available once the body has been read, i.e. not from an
/// expect-continue handler.
#[derive(Debug)]
pub struct Request {
    head: RequestHead,
    path_len: usize,
    remote_addr: SocketAddr,
    streaming: bool,
    stream_started: AtomicBool,
    form_body: OnceLock<String>,
    upload: OnceLock<FormUpload>,
    query_data: OnceLock<DataDictionary>,
    post_data: OnceLock<DataDictionary>,
    data: OnceLock<DataDictionary>,
    cookies: OnceLock<DataDictionary>,
    link: ConnectionLink,
}

impl Request {
    pub(crate) fn new(head: RequestHead, remote_addr: SocketAddr, streaming: bool, link: ConnectionLink) -> Self {
        let path_len = head.raw_path.find('?').unwrap_or(head.raw_path.len());
        Self {
            head,
            path_len,
            remote_addr,
            streaming,
            stream_started: AtomicBool::new(false),
            form_body: OnceLock::new(),
            upload: OnceLock::new(),
            query_data: OnceLock::new(),
            post_data: OnceLock::new(),
            data: OnceLock::new(),
            cookies: OnceLock::new(),
            link,
        }
    }

    pub fn method(&self) -> &Method {
        &self.head.method
    }

    /// The request target as received, including the query string.
    pub fn raw_path(&self) -> &str {
        &self.head.raw_path
    }

    /// The request target up to the `?`, not url-decoded.
    pub fn path(&self) -> &str {
        &self.head.raw_path[..self.path_len]
    }

    pub fn query_string(&self) -> Option<&str> {
        self.head.raw_path.get(self.path_len + 1..)
    }

    pub fn headers(&self) -> &HttpHeaders {
        &self.head.headers
    }

    pub fn is_http10(&self) -> bool {
        self.head.http10
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Parameters from the query string.
    pub fn query_data(&self) -> &DataDictionary {
        self.query_data.get_or_init(|| self.query_string().map(DataDictionary::from_url_encoded).unwrap_or_default())
    }

    /// Parameters from a url-encoded or multipart form body.
    pub fn post_data(&self) -> &DataDictionary {
        self.post_data.get_or_init(|| {
            let mut post = self.form_body.get().map(|body| DataDictionary::from_url_encoded(body)).unwrap_or_default();
            if let Some(upload) = self.upload.get() {
                for (name, value) in &upload.fields {
                    post.set(name, value.as_str());
                }
            }
            post
        })
    }

    /// Query parameters first, then form parameters.
    pub fn data(&self) -> &DataDictionary {
        self.data.get_or_init(|| {
            let mut data = DataDictionary::new();
            data.add_child(self.query_data().clone());
            data.add_child(self.post_data().clone());
            data
        })
    }

    /// Files of a multipart form body, by field name.
    pub fn files(&self) -> Option<&HashMap<String, UploadedFile>> {
        self.upload.get().map(|upload| &upload.files)
    }

    pub fn file(&self, field_name: &str) -> Option<&UploadedFile> {
        self.files().and_then(|files| files.get(field_name))
    }

    pub fn cookies(&self) -> &DataDictionary {
        self.cookies.get_or_init(|| self.head.headers.get("Cookie").map(parse_cookie_header).unwrap_or_default())
    }

    /// The raw url-encoded body, if the request had one.
    pub fn form_body(&self) -> Option<&str> {
        self.form_body.get().map(String::as_str)
    }

    /// True when the body is left for the handler to stream.
    pub fn is_streaming_body(&self) -> bool {
        self.streaming
    }

    /// Declared body length, zero without a `Content-Length`.
    pub fn content_length(&self) -> u64 {
        self.head.headers.content_length().ok().flatten().unwrap_or(0)
    }

    /// Starts receiving a streamed body.
    ///
    /// Only available for streaming requests, before a response has been
    /// started, and only once. Buffers are delivered one at a time; the next
    /// socket read waits for the previous buffer to be completed.
    ///
    /// # Errors
    ///
    /// Fails when called a second time or when the body can't be streamed.
    pub async fn begin_streaming_body(&self) -> Result<RequestBodyStream, HttpError> {
        if self.stream_started.swap(true, Ordering::AcqRel) {
            return Err(HttpError::already_started("request body stream"));
        }

        let (buffers, stream) = RequestBodyStream::channel(self.content_length());
        self.link.request(|reply| Command::BeginRequestBody { buffers, reply }).await.unwrap_or(Ok(()))?;
        Ok(stream)
    }

    /// Sends the interim `100 Continue` from an expect-continue handler.
    ///
    /// # Errors
    ///
    /// Fails when the connection isn't waiting for that decision.
    pub async fn send_100_continue(&self) -> Result<(), HttpError> {
        self.link.request(|reply| Command::Send100Continue { reply }).await.unwrap_or(Ok(()))
    }

    pub(crate) fn set_form_body(&self, body: String) {
        let _ = self.form_body.set(body);
    }

    pub(crate) fn set_upload(&self, upload: FormUpload) {
        let _ = self.upload.set(upload);
    }
}
