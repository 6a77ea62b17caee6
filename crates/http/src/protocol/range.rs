//! `Range` and `Content-Range` header values, byte units only.

use std::fmt;
use std::str::FromStr;

use crate::ensure;
use crate::protocol::HeaderError;

/// A `Range: bytes=<start>-[<end>]` request.
///
/// A bare `bytes=<n>` is read as the first `n` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpRange {
    pub offset: u64,
    /// `None` for an open-ended range
    pub count: Option<u64>,
}

impl HttpRange {
    pub fn new(offset: u64, count: Option<u64>) -> Self {
        Self { offset, count }
    }
}

impl FromStr for HttpRange {
    type Err = HeaderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || HeaderError::InvalidRange { value: s.to_string() };

        let bytes_range = s.strip_prefix("bytes=").ok_or_else(invalid)?;

        let Some((from, to)) = bytes_range.split_once('-') else {
            let count = bytes_range.trim().parse::<u64>().map_err(|_| invalid())?;
            return Ok(Self::new(0, Some(count)));
        };

        let offset = from.trim().parse::<u64>().map_err(|_| invalid())?;
        let to = to.trim();
        if to.is_empty() {
            return Ok(Self::new(offset, None));
        }

        let to = to.parse::<u64>().map_err(|_| invalid())?;
        ensure!(to >= offset, invalid());
        let count = (to - offset).checked_add(1).ok_or_else(invalid)?;
        Ok(Self::new(offset, Some(count)))
    }
}

impl fmt::Display for HttpRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.count {
            None => write!(f, "bytes={}-", self.offset),
            Some(count) => write!(f, "bytes={}-{}", self.offset, last_byte(self.offset, count)),
        }
    }
}

/// A `Content-Range: bytes <start>-<end>/<total|*>` response value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpContentRange {
    pub offset: u64,
    pub count: u64,
    /// `None` when the complete length is unknown (`*`)
    pub total: Option<u64>,
}

impl HttpContentRange {
    pub fn new(offset: u64, count: u64, total: Option<u64>) -> Self {
        Self { offset, count, total }
    }
}

impl FromStr for HttpContentRange {
    type Err = HeaderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || HeaderError::InvalidContentRange { value: s.to_string() };

        let bytes_range = s.strip_prefix("bytes ").ok_or_else(invalid)?;
        let (range, total) = bytes_range.split_once('/').ok_or_else(invalid)?;
        let (from, to) = range.split_once('-').ok_or_else(invalid)?;

        let total = match total.trim() {
            "*" => None,
            total => Some(total.parse::<u64>().map_err(|_| invalid())?),
        };
        let offset = from.trim().parse::<u64>().map_err(|_| invalid())?;
        let to = to.trim().parse::<u64>().map_err(|_| invalid())?;
        ensure!(to >= offset, invalid());
        let count = (to - offset).checked_add(1).ok_or_else(invalid)?;

        Ok(Self::new(offset, count, total))
    }
}

impl fmt::Display for HttpContentRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let last = last_byte(self.offset, self.count);
        match self.total {
            Some(total) => write!(f, "bytes {}-{}/{}", self.offset, last, total),
            None => write!(f, "bytes {}-{}/*", self.offset, last),
        }
    }
}

/// Index of the last byte of `count` bytes starting at `offset`.
fn last_byte(offset: u64, count: u64) -> u64 {
    match count.checked_sub(1) {
        Some(span) => offset.saturating_add(span),
        None => offset.saturating_sub(1),
    }
}
