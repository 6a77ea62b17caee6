use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::Encoder;

use crate::protocol::{PayloadItem, SendError};

/// Passes data through while enforcing the declared `Content-Length`.
///
/// A chunk that would exceed the remaining length is rejected before anything
/// is written. Ending the body while bytes remain is an error as well.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LengthEncoder {
    declared: u64,
    remaining: u64,
}

impl LengthEncoder {
    pub fn new(length: u64) -> Self {
        Self { declared: length, remaining: length }
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    pub fn is_finish(&self) -> bool {
        self.remaining == 0
    }
}

impl<D: Buf> Encoder<PayloadItem<D>> for LengthEncoder {
    type Error = SendError;

    fn encode(&mut self, item: PayloadItem<D>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            PayloadItem::Chunk(bytes) => {
                let len = bytes.remaining() as u64;
                if len > self.remaining {
                    let sent = self.declared - self.remaining;
                    return Err(SendError::overrun(self.declared, sent + len));
                }

                dst.put(bytes);
                self.remaining -= len;
                Ok(())
            }
            PayloadItem::Eof if self.remaining > 0 => Err(SendError::underrun(self.declared, self.remaining)),
            PayloadItem::Eof => Ok(()),
        }
    }
}
