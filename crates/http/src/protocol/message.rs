use bytes::{Buf, Bytes};

/// One step of a response body fed to the payload encoders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadItem<Data: Buf = Bytes> {
    Chunk(Data),
    /// The handler wrote its last buffer
    Eof,
}

/// How the body of a response is framed on the wire.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PayloadSize {
    /// `Content-Length` bytes
    Length(u64),
    /// `Transfer-Encoding: chunked`
    Chunked,
    /// HTTP/1.0 body without a length, delimited by closing the connection
    UntilClose,
    /// Nothing is transmitted, whatever the handler writes (`HEAD` responses)
    Empty,
}

impl PayloadSize {
    /// Framing of a response body whose size is `length`, if known up front.
    ///
    /// HTTP/1.0 clients don't understand chunked bodies, so an unknown size
    /// falls back to closing the connection after the body.
    pub fn for_response(length: Option<u64>, http10: bool) -> Self {
        match length {
            Some(length) => Self::Length(length),
            None if http10 => Self::UntilClose,
            None => Self::Chunked,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_framing() {
        assert_eq!(PayloadSize::for_response(Some(12), false), PayloadSize::Length(12));
        assert_eq!(PayloadSize::for_response(Some(0), true), PayloadSize::Length(0));
        assert_eq!(PayloadSize::for_response(None, false), PayloadSize::Chunked);
        assert_eq!(PayloadSize::for_response(None, true), PayloadSize::UntilClose);
    }
}
