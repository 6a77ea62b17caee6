use std::io;

use http::StatusCode;
use thiserror::Error;

use crate::connection::State;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request error: {source}")]
    RequestError {
        #[from]
        source: ParseError,
    },

    #[error("response error: {source}")]
    ResponseError {
        #[from]
        source: SendError,
    },

    #[error("header error: {source}")]
    HeaderError {
        #[from]
        source: HeaderError,
    },

    #[error("{operation} is not allowed while the connection is in state {state:?}")]
    InvalidState { operation: &'static str, state: State },

    #[error("{what} can only be started once")]
    AlreadyStarted { what: &'static str },

    #[error("the response body has already been completed")]
    ResponseFinished,

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl HttpError {
    pub fn invalid_state(operation: &'static str, state: State) -> Self {
        Self::InvalidState { operation, state }
    }

    pub fn already_started(what: &'static str) -> Self {
        Self::AlreadyStarted { what }
    }
}

/// Errors raised while reading a request off the wire.
///
/// Every variant except [`ParseError::Io`] is answered with a minimal error
/// response, see [`ParseError::status`].
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("header size too large, current: {current_size} exceed the limit {max_size}")]
    TooLargeHeader { current_size: usize, max_size: usize },

    #[error("invalid request line: {line:?}")]
    InvalidRequestLine { line: String },

    #[error("invalid http version: {version:?}")]
    InvalidVersion { version: String },

    #[error("unsupported http method: {method:?}")]
    UnknownMethod { method: String },

    #[error("invalid header: {reason}")]
    InvalidHeader { reason: String },

    #[error("invalid content-length header: {reason}")]
    InvalidContentLength { reason: String },

    #[error("chunked request bodies are not supported")]
    ChunkedRequestBody,

    #[error("invalid multipart body: {reason}")]
    InvalidMultipart { reason: String },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl ParseError {
    pub fn too_large_header(current_size: usize, max_size: usize) -> Self {
        Self::TooLargeHeader { current_size, max_size }
    }

    pub fn invalid_request_line<S: ToString>(str: S) -> Self {
        Self::InvalidRequestLine { line: str.to_string() }
    }

    pub fn invalid_version<S: ToString>(str: S) -> Self {
        Self::InvalidVersion { version: str.to_string() }
    }

    pub fn unknown_method<S: ToString>(str: S) -> Self {
        Self::UnknownMethod { method: str.to_string() }
    }

    pub fn invalid_header<S: ToString>(str: S) -> Self {
        Self::InvalidHeader { reason: str.to_string() }
    }

    pub fn invalid_content_length<S: ToString>(str: S) -> Self {
        Self::InvalidContentLength { reason: str.to_string() }
    }

    pub fn invalid_multipart<S: ToString>(str: S) -> Self {
        Self::InvalidMultipart { reason: str.to_string() }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: e.into() }
    }

    /// The status code sent back to the client before the connection is closed.
    ///
    /// Transport errors have no status, the connection is simply dropped.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::TooLargeHeader { .. } => Some(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE),
            Self::InvalidRequestLine { .. } | Self::InvalidVersion { .. } => Some(StatusCode::HTTP_VERSION_NOT_SUPPORTED),
            Self::UnknownMethod { .. } | Self::ChunkedRequestBody => Some(StatusCode::NOT_IMPLEMENTED),
            Self::InvalidHeader { .. } | Self::InvalidContentLength { .. } | Self::InvalidMultipart { .. } => {
                Some(StatusCode::BAD_REQUEST)
            }
            Self::Io { .. } => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum SendError {
    #[error("response body overruns the declared content-length {declared}, attempted to send {attempted} bytes")]
    ContentLengthOverrun { declared: u64, attempted: u64 },

    #[error("last response buffer leaves {missing} of the declared content-length {declared} bytes unsent")]
    ContentLengthUnderrun { declared: u64, missing: u64 },

    #[error("invalid body: {reason}")]
    InvalidBody { reason: String },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl SendError {
    pub fn overrun(declared: u64, attempted: u64) -> Self {
        Self::ContentLengthOverrun { declared, attempted }
    }

    pub fn underrun(declared: u64, missing: u64) -> Self {
        Self::ContentLengthUnderrun { declared, missing }
    }

    pub fn invalid_body<S: ToString>(str: S) -> Self {
        Self::InvalidBody { reason: str.to_string() }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: e.into() }
    }

    /// Framing violations tear the connection down.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ContentLengthOverrun { .. } | Self::ContentLengthUnderrun { .. })
    }
}

/// Errors from the typed header accessors of [`HttpHeaders`](crate::protocol::HttpHeaders).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HeaderError {
    #[error("invalid header name: {name:?}")]
    InvalidName { name: String },

    #[error("invalid value for header {name}: {value:?}")]
    InvalidValue { name: String, value: String },

    #[error("malformed header block: {reason}")]
    Malformed { reason: &'static str },

    #[error("invalid content-length: {value:?}")]
    InvalidContentLength { value: String },

    #[error("invalid range: {value:?}")]
    InvalidRange { value: String },

    #[error("invalid content-range: {value:?}")]
    InvalidContentRange { value: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CookieError {
    #[error("a cookie can't carry both expires and max-age")]
    ExpiresAndMaxAge,
}
