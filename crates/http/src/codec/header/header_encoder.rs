//! Serializes the status line, headers and cookies of a response.
//!
//! Framing headers (`Content-Length`, `Transfer-Encoding`) are decided by the
//! connection before encoding; this encoder writes the header block verbatim.

use std::io::{self, Write};

use bytes::{BufMut, BytesMut};
use tokio_util::codec::Encoder;

use crate::protocol::{ResponseHead, SendError};

/// Initial buffer size allocated for header serialization
const INIT_HEADER_SIZE: usize = 1024;

/// Encoder for HTTP response heads implementing the [`Encoder`] trait.
#[derive(Debug, Default)]
pub struct ResponseHeadEncoder;

impl Encoder<&ResponseHead> for ResponseHeadEncoder {
    type Error = SendError;

    /// Writes `HTTP/<1.0|1.1> <code> <reason>\r\n`, the headers in stored order,
    /// one `Set-Cookie` line per cookie and the terminating blank line.
    fn encode(&mut self, head: &ResponseHead, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(INIT_HEADER_SIZE);

        let version = if head.http10 { "1.0" } else { "1.1" };
        let reason = head.status.canonical_reason().unwrap_or("Unknown");
        write!(FastWrite(dst), "HTTP/{version} {} {reason}\r\n", head.status.as_str())?;

        head.headers.write_to(dst, &head.cookies);
        Ok(())
    }
}

/// Fast writer implementation for writing to BytesMut.
pub(crate) struct FastWrite<'a>(pub(crate) &'a mut BytesMut);

impl Write for FastWrite<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.put_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
