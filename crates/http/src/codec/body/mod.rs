//! Response body framing.
//!
//! - [`ChunkedEncoder`](chunked_encoder::ChunkedEncoder): `Transfer-Encoding: chunked`
//! - [`LengthEncoder`](length_encoder::LengthEncoder): `Content-Length`, with overrun and underrun checks
//! - [`PayloadEncoder`]: picks one of the above, or raw/discarding output, from a
//!   [`PayloadSize`](crate::protocol::PayloadSize)
//!
//! Request bodies are never chunked, so there is no decoder counterpart: the
//! connection slices `Content-Length` bytes off its read buffer directly.

mod chunked_encoder;
mod length_encoder;
mod payload_encoder;

pub use payload_encoder::PayloadEncoder;
