//! Streaming bodies: request bodies delivered buffer by buffer, and the
//! writer for response bodies of unknown or large size.

mod request_body;
mod response_body;

pub use request_body::{RequestBodyStream, RequestBuffer};
pub use response_body::ResponseBodyWriter;
