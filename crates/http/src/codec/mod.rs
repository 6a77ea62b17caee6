//! Wire codecs for the request and response side of a connection.
//!
//! - [`RequestHeadDecoder`]: resumable byte-level decoder for the request line and headers
//! - [`ResponseHeadEncoder`]: serializes the status line, headers and cookies
//! - [`PayloadEncoder`]: frames response bodies as length-delimited, chunked,
//!   close-delimited or discarded
//! - [`MultipartDecoder`]: incremental `multipart/form-data` decoder
//!
//! Everything works on [`BytesMut`](bytes::BytesMut) through the
//! [`tokio_util::codec`] traits, so the connection can feed partial reads as
//! they arrive.

mod body;
mod header;
mod multipart;

pub use body::PayloadEncoder;
pub use header::{MAX_HEADER_BYTES, RequestHeadDecoder, ResponseHeadEncoder};
pub use multipart::{MultipartDecoder, MultipartPart, decode_text, is_multipart_form, parse_boundary};
