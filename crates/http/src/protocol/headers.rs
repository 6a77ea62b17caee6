//! Ordered header store keyed by normalized header names.
//!
//! Names are normalized on every access (`content-type` and `CONTENT-TYPE`
//! are both stored as `Content-Type`), values keep insertion order so the
//! response is serialized in the order the handler set them.

use bytes::{BufMut, BytesMut};
use http::{HeaderName, HeaderValue};

use crate::ensure;
use crate::protocol::{HeaderError, HttpContentRange, HttpCookie, HttpRange};

pub const CONTENT_LENGTH: &str = "Content-Length";
pub const CONTENT_TYPE: &str = "Content-Type";
pub const CONTENT_RANGE: &str = "Content-Range";
pub const TRANSFER_ENCODING: &str = "Transfer-Encoding";
pub const CONNECTION: &str = "Connection";
pub const EXPECT: &str = "Expect";
pub const RANGE: &str = "Range";
pub const USER_AGENT: &str = "User-Agent";
pub const HOST: &str = "Host";
pub const COOKIE: &str = "Cookie";

const DEFAULT_CHARSET: &str = "utf-8";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpHeaders {
    items: Vec<(String, String)>,
}

impl HttpHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upper-cases the first letter and every letter following a `-`,
    /// lower-cases all other letters.
    pub fn normalize_name(name: &str) -> String {
        let mut normalized = String::with_capacity(name.len());
        let mut previous = '-';
        for c in name.chars() {
            if previous == '-' {
                normalized.push(c.to_ascii_uppercase());
            } else {
                normalized.push(c.to_ascii_lowercase());
            }
            previous = c;
        }
        normalized
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.get_normalized(&Self::normalize_name(name))
    }

    fn get_normalized(&self, name: &str) -> Option<&str> {
        self.items.iter().find(|(key, _)| key == name).map(|(_, value)| value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Sets a header, replacing an existing value in place.
    ///
    /// # Errors
    ///
    /// Fails when the name or value can't be written on the wire as-is.
    pub fn set(&mut self, name: &str, value: impl Into<String>) -> Result<(), HeaderError> {
        let value = value.into();
        ensure!(HeaderName::from_bytes(name.as_bytes()).is_ok(), HeaderError::InvalidName { name: name.to_string() });
        ensure!(
            HeaderValue::from_str(&value).is_ok(),
            HeaderError::InvalidValue { name: name.to_string(), value }
        );
        self.set_unchecked(name, value);
        Ok(())
    }

    /// Sets a header read off the wire without validating it.
    pub(crate) fn set_unchecked(&mut self, name: &str, value: impl Into<String>) {
        let name = Self::normalize_name(name);
        let value = value.into();
        match self.items.iter_mut().find(|(key, _)| *key == name) {
            Some((_, existing)) => *existing = value,
            None => self.items.push((name, value)),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        let name = Self::normalize_name(name);
        let index = self.items.iter().position(|(key, _)| *key == name)?;
        Some(self.items.remove(index).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.items.iter().map(|(name, value)| (name.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Parses a block of `Name: value` lines terminated by an empty line or
    /// the end of input. Lines starting with whitespace continue the previous value.
    ///
    /// # Errors
    ///
    /// Fails on a line starting with whitespace without a preceding header,
    /// a line without a colon or a header without a value.
    pub fn parse(text: &str) -> Result<Self, HeaderError> {
        let mut headers = Self::new();
        let mut current: Option<(String, String)> = None;

        for line in text.lines() {
            if line.is_empty() {
                break;
            }

            if line.starts_with(char::is_whitespace) {
                let (_, value) = current.as_mut().ok_or(HeaderError::Malformed { reason: "found whitespace before data" })?;
                value.push(' ');
                value.push_str(line.trim());
                continue;
            }

            if let Some((name, value)) = current.take() {
                headers.set_unchecked(&name, value);
            }

            let line = line.trim_end();
            let (name, value) = line.split_once(':').ok_or(HeaderError::Malformed { reason: "no colon found" })?;
            ensure!(!name.is_empty(), HeaderError::Malformed { reason: "no header name found" });
            let value = value.trim_start();
            ensure!(!value.is_empty(), HeaderError::Malformed { reason: "no value found" });

            current = Some((name.to_string(), value.to_string()));
        }

        if let Some((name, value)) = current {
            headers.set_unchecked(&name, value);
        }
        Ok(headers)
    }

    /// Writes every header line, the `Set-Cookie` lines and the terminating empty line.
    pub fn write_to<'a>(&self, dst: &mut BytesMut, cookies: impl IntoIterator<Item = &'a HttpCookie>) {
        for (name, value) in &self.items {
            dst.put_slice(name.as_bytes());
            dst.put_slice(b": ");
            dst.put_slice(value.as_bytes());
            dst.put_slice(b"\r\n");
        }
        for cookie in cookies {
            cookie.write_to(dst);
        }
        dst.put_slice(b"\r\n");
    }

    /// # Errors
    ///
    /// Fails when the header is present but isn't a non-negative integer.
    pub fn content_length(&self) -> Result<Option<u64>, HeaderError> {
        self.get_normalized(CONTENT_LENGTH)
            .map(|value| {
                value.trim().parse::<u64>().map_err(|_| HeaderError::InvalidContentLength { value: value.to_string() })
            })
            .transpose()
    }

    pub fn set_content_length(&mut self, length: Option<u64>) {
        match length {
            Some(length) => self.set_unchecked(CONTENT_LENGTH, length.to_string()),
            None => {
                self.remove(CONTENT_LENGTH);
            }
        }
    }

    pub fn content_type(&self) -> Option<&str> {
        self.get_normalized(CONTENT_TYPE)
    }

    /// The `charset` attribute of the content type, `utf-8` when absent.
    pub fn content_encoding(&self) -> String {
        let Some(content_type) = self.content_type() else {
            return DEFAULT_CHARSET.to_string();
        };

        match content_type.parse::<mime::Mime>() {
            Ok(mime) => mime.get_param(mime::CHARSET).map_or_else(|| DEFAULT_CHARSET.to_string(), |charset| charset.to_string()),
            Err(_) => get_attribute(content_type, "charset=").unwrap_or(DEFAULT_CHARSET).to_string(),
        }
    }

    pub fn is_chunked_encoding(&self) -> bool {
        self.get_normalized(TRANSFER_ENCODING).is_some_and(|value| value.to_ascii_lowercase().contains("chunked"))
    }

    pub fn set_chunked_encoding(&mut self) {
        self.set_unchecked(TRANSFER_ENCODING, "chunked");
    }

    /// # Errors
    ///
    /// Fails when the header is present but malformed.
    pub fn range(&self) -> Result<Option<HttpRange>, HeaderError> {
        self.get_normalized(RANGE).map(str::parse).transpose()
    }

    pub fn set_range(&mut self, range: HttpRange) {
        self.set_unchecked(RANGE, range.to_string());
    }

    /// # Errors
    ///
    /// Fails when the header is present but malformed.
    pub fn content_range(&self) -> Result<Option<HttpContentRange>, HeaderError> {
        self.get_normalized(CONTENT_RANGE).map(str::parse).transpose()
    }

    pub fn set_content_range(&mut self, range: HttpContentRange) {
        self.set_unchecked(CONTENT_RANGE, range.to_string());
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.get_normalized(USER_AGENT)
    }

    pub fn host(&self) -> Option<&str> {
        self.get_normalized(HOST)
    }

    pub fn is_connection_close(&self) -> bool {
        self.get_normalized(CONNECTION).is_some_and(|value| value.trim().eq_ignore_ascii_case("close"))
    }

    pub fn is_connection_keep_alive(&self) -> bool {
        self.get_normalized(CONNECTION).is_some_and(|value| value.trim().eq_ignore_ascii_case("keep-alive"))
    }

    pub fn set_connection_close(&mut self, close: bool) {
        if close {
            self.set_unchecked(CONNECTION, "close");
        } else {
            self.remove(CONNECTION);
        }
    }

    pub fn is_expect_continue(&self) -> bool {
        self.get_normalized(EXPECT).is_some_and(|value| value.trim().eq_ignore_ascii_case("100-continue"))
    }
}

/// Extracts an attribute like `charset=` or `boundary=` from a header value.
///
/// Quoted values are returned without the quotes, an unclosed quote yields `None`.
/// Unquoted values run until the next space or `;`.
pub fn get_attribute<'a>(header_value: &'a str, attr: &str) -> Option<&'a str> {
    let start = header_value.find(attr)? + attr.len();
    let rest = &header_value[start..];
    if rest.is_empty() {
        return None;
    }

    if let Some(quoted) = rest.strip_prefix('"') {
        return quoted.find('"').map(|end| &quoted[..end]);
    }

    let end = rest.find([' ', ';']).unwrap_or(rest.len());
    Some(&rest[..end])
}
