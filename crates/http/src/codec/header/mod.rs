//! Request head decoding and response head encoding.

mod header_decoder;
mod header_encoder;

pub use header_decoder::{MAX_HEADER_BYTES, RequestHeadDecoder};
pub(crate) use header_encoder::FastWrite;
pub use header_encoder::ResponseHeadEncoder;
