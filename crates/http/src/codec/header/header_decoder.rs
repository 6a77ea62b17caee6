//! Byte-level decoder for the request line and header block.
//!
//! The decoder is resumable: bytes can be fed in arbitrary slices and the
//! result is the same as decoding the whole head at once. Lines end with
//! `\r\n`; a `\r` followed by anything other than `\n` is kept in the line
//! as a literal `\r` plus that byte.
//!
//! # Limits
//!
//! - Maximum header size: 8KB by default, see [`RequestHeadDecoder::with_max_size`]
//!
//! Once the blank line ending the head has been consumed the request line
//! is validated and the header lines are stored into [`HttpHeaders`]:
//!
//! - a request line that doesn't split into exactly three tokens, or whose
//!   version doesn't start with `HTTP/`, is rejected with `505`
//! - a method other than `GET`, `POST`, `PUT`, `HEAD` and `DELETE` is
//!   rejected with `501`
//! - a header line without a colon, or with nothing after it, is rejected with `400`

use bytes::{Buf, BytesMut};
use http::Method;
use tokio_util::codec::Decoder;
use tracing::{debug, trace};

use crate::ensure;
use crate::protocol::{HttpHeaders, ParseError, RequestHead};

use HeaderState::*;

/// Maximum size in bytes allowed for the entire header section
pub const MAX_HEADER_BYTES: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeaderState {
    /// Accumulating the request line
    FirstLine,
    /// Saw `\r` inside the request line
    FirstLineR,
    /// Accumulating a header line
    HeaderLine,
    /// Saw `\r` inside a header line
    HeaderLineR,
    /// Saw `\r` on an empty header line
    LastHeaderLineR,
}

enum Step {
    Next(HeaderState),
    FirstLineDone,
    HeaderLineDone,
    HeadDone,
}

impl HeaderState {
    fn step(self, byte: u8, line: &mut Vec<u8>) -> Step {
        match (self, byte) {
            (FirstLine, b'\r') => Step::Next(FirstLineR),
            (FirstLine, b) => {
                line.push(b);
                Step::Next(FirstLine)
            }

            (FirstLineR, b'\n') => Step::FirstLineDone,
            (FirstLineR, b) => {
                line.extend_from_slice(&[b'\r', b]);
                Step::Next(FirstLine)
            }

            (HeaderLine, b'\r') if line.is_empty() => Step::Next(LastHeaderLineR),
            (HeaderLine, b'\r') => Step::Next(HeaderLineR),
            (HeaderLine, b) => {
                line.push(b);
                Step::Next(HeaderLine)
            }

            (HeaderLineR, b'\n') => Step::HeaderLineDone,
            (LastHeaderLineR, b'\n') => Step::HeadDone,
            (HeaderLineR | LastHeaderLineR, b) => {
                line.extend_from_slice(&[b'\r', b]);
                Step::Next(HeaderLine)
            }
        }
    }
}

/// Decoder for HTTP request heads implementing the [`Decoder`] trait.
///
/// The decoder consumes exactly the bytes of the head from the source buffer,
/// anything following the blank line (a body or a pipelined request) stays in it.
#[derive(Debug)]
pub struct RequestHeadDecoder {
    state: HeaderState,
    line: Vec<u8>,
    first_line: String,
    header_lines: Vec<String>,
    consumed: usize,
    max_size: usize,
}

impl Default for RequestHeadDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestHeadDecoder {
    pub fn new() -> Self {
        Self::with_max_size(MAX_HEADER_BYTES)
    }

    pub fn with_max_size(max_size: usize) -> Self {
        Self {
            state: FirstLine,
            line: Vec::with_capacity(128),
            first_line: String::new(),
            header_lines: Vec::new(),
            consumed: 0,
            max_size,
        }
    }

    /// True while no byte of the next head has been consumed.
    pub fn is_idle(&self) -> bool {
        self.consumed == 0 && self.line.is_empty()
    }

    fn reset(&mut self) {
        self.state = FirstLine;
        self.line.clear();
        self.first_line.clear();
        self.header_lines.clear();
        self.consumed = 0;
    }

    fn take_line(&mut self) -> String {
        let line = String::from_utf8_lossy(&self.line).into_owned();
        self.line.clear();
        line
    }
}

impl Decoder for RequestHeadDecoder {
    type Item = RequestHead;
    type Error = ParseError;

    /// Consumes bytes until the head is complete.
    ///
    /// # Returns
    ///
    /// - `Ok(Some(head))` once the blank line ending the head has been read
    /// - `Ok(None)` if more data is needed
    /// - `Err(ParseError)` if the head is oversized or invalid
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        while src.has_remaining() {
            let byte = src.get_u8();
            self.consumed += 1;
            ensure!(self.consumed <= self.max_size, ParseError::too_large_header(self.consumed, self.max_size));

            self.state = match self.state.step(byte, &mut self.line) {
                Step::Next(state) => state,
                Step::FirstLineDone if self.line.is_empty() => {
                    // empty lines before the request line are skipped
                    trace!("skip empty line before request line");
                    FirstLine
                }
                Step::FirstLineDone => {
                    self.first_line = self.take_line();
                    HeaderLine
                }
                Step::HeaderLineDone => {
                    let line = self.take_line();
                    self.header_lines.push(line);
                    HeaderLine
                }
                Step::HeadDone => {
                    trace!(head_size = self.consumed, "parsed request head");
                    let result = parse_head(&self.first_line, &self.header_lines);
                    self.reset();
                    return result.map(Some);
                }
            };
        }

        Ok(None)
    }
}

/// Validates the request line and stores the header lines.
fn parse_head(first_line: &str, header_lines: &[String]) -> Result<RequestHead, ParseError> {
    debug!(request_line = first_line, "received request");

    let tokens: Vec<&str> = first_line.split(' ').filter(|token| !token.is_empty()).collect();
    let &[method, target, version] = tokens.as_slice() else {
        return Err(ParseError::invalid_request_line(first_line));
    };

    let version = version.trim().to_ascii_uppercase();
    ensure!(version.starts_with("HTTP/"), ParseError::invalid_version(version));
    let http10 = version.ends_with("1.0");

    let method = match method.trim().to_ascii_uppercase().as_str() {
        "HEAD" => Method::HEAD,
        "GET" => Method::GET,
        "PUT" => Method::PUT,
        "DELETE" => Method::DELETE,
        "POST" => Method::POST,
        other => return Err(ParseError::unknown_method(other)),
    };

    let mut headers = HttpHeaders::new();
    for line in header_lines {
        trace!(header_line = %line);
        let (name, value) = line.split_once(':').ok_or_else(|| ParseError::invalid_header(format!("no colon in {line:?}")))?;
        let name = name.trim();
        ensure!(!name.is_empty(), ParseError::invalid_header(format!("empty name in {line:?}")));
        let value = value.trim();
        ensure!(!value.is_empty(), ParseError::invalid_header(format!("no value in {line:?}")));
        headers.set_unchecked(name, value);
    }

    Ok(RequestHead { method, raw_path: target.to_string(), http10, headers })
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    fn crlf(s: &str) -> String {
        s.replace('\n', "\r\n")
    }

    fn decode_all(input: &[u8]) -> Result<Option<RequestHead>, ParseError> {
        let mut buf = BytesMut::from(input);
        RequestHeadDecoder::new().decode(&mut buf)
    }

    #[test]
    fn from_curl() {
        let str = crlf(indoc! {r##"
        GET /index.html?a=1 HTTP/1.1
        Host: 127.0.0.1:8080
        User-Agent: curl/7.79.1
        Accept: */*

        "##});

        let head = decode_all(str.as_bytes()).unwrap().unwrap();

        assert_eq!(head.method, Method::GET);
        assert_eq!(head.raw_path, "/index.html?a=1");
        assert!(!head.http10);
        assert_eq!(head.headers.len(), 3);
        assert_eq!(head.headers.host(), Some("127.0.0.1:8080"));
        assert_eq!(head.headers.user_agent(), Some("curl/7.79.1"));
        assert_eq!(head.headers.get("accept"), Some("*/*"));
    }

    #[test]
    fn leaves_body_bytes_in_buffer() {
        let str = crlf(indoc! {r##"
        POST /upload HTTP/1.1
        Content-Length: 3

        123"##});

        let mut buf = BytesMut::from(str.as_str());
        let head = RequestHeadDecoder::new().decode(&mut buf).unwrap().unwrap();

        assert_eq!(head.method, Method::POST);
        assert_eq!(head.headers.content_length(), Ok(Some(3)));
        assert_eq!(&buf[..], b"123");
    }

    #[test]
    fn any_split_yields_the_same_head() {
        let str = crlf(indoc! {r##"
        PUT /items/7?x=y HTTP/1.0
        Host: example.com
        content-type: text/plain
        X-Weird:   spaced value

        "##});
        let bytes = str.as_bytes();

        let expected = decode_all(bytes).unwrap().unwrap();

        for split in 0..=bytes.len() {
            let mut decoder = RequestHeadDecoder::new();
            let mut first = BytesMut::from(&bytes[..split]);
            let mut second = BytesMut::from(&bytes[split..]);

            let head = match decoder.decode(&mut first).unwrap() {
                Some(head) => head,
                None => decoder.decode(&mut second).unwrap().unwrap(),
            };
            assert_eq!(head, expected, "split at {split}");
        }
    }

    #[test]
    fn byte_by_byte() {
        let str = crlf("DELETE /a HTTP/1.1\nHost: x\n\n");
        let mut decoder = RequestHeadDecoder::new();
        let mut result = None;
        for b in str.as_bytes() {
            let mut one = BytesMut::from(&[*b][..]);
            if let Some(head) = decoder.decode(&mut one).unwrap() {
                result = Some(head);
            }
        }
        let head = result.unwrap();
        assert_eq!(head.method, Method::DELETE);
        assert!(decoder.is_idle());
    }

    #[test]
    fn bare_cr_is_kept_in_the_line() {
        let head = decode_all(b"GET / HTTP/1.1\r\nX-A: a\rb\r\n\r\n").unwrap().unwrap();
        assert_eq!(head.headers.get("X-A"), Some("a\rb"));
    }

    #[test]
    fn bare_cr_on_empty_line_starts_a_header() {
        let head = decode_all(b"GET / HTTP/1.1\r\n\rX-A: 1\r\n\r\n").unwrap().unwrap();
        assert_eq!(head.headers.get("X-A"), Some("1"));
        assert_eq!(head.headers.len(), 1);
    }

    #[test]
    fn http10_and_lowercase_tokens() {
        let head = decode_all(b"head /x http/1.0\r\n\r\n").unwrap().unwrap();
        assert_eq!(head.method, Method::HEAD);
        assert!(head.http10);
    }

    #[test]
    fn skips_leading_empty_lines() {
        let head = decode_all(b"\r\n\r\nGET / HTTP/1.1\r\n\r\n").unwrap().unwrap();
        assert_eq!(head.raw_path, "/");
    }

    #[test]
    fn malformed_request_line_is_505() {
        let err = decode_all(b"GET /\r\n\r\n").unwrap_err();
        assert!(matches!(err, ParseError::InvalidRequestLine { .. }));
        assert_eq!(err.status(), Some(http::StatusCode::HTTP_VERSION_NOT_SUPPORTED));

        let err = decode_all(b"GET / FTP/1.1\r\n\r\n").unwrap_err();
        assert!(matches!(err, ParseError::InvalidVersion { .. }));
    }

    #[test]
    fn unknown_method_is_501() {
        let err = decode_all(b"PATCH / HTTP/1.1\r\n\r\n").unwrap_err();
        assert!(matches!(err, ParseError::UnknownMethod { .. }));
        assert_eq!(err.status(), Some(http::StatusCode::NOT_IMPLEMENTED));
    }

    #[test]
    fn header_without_colon_is_400() {
        let err = decode_all(b"GET / HTTP/1.1\r\nbroken\r\n\r\n").unwrap_err();
        assert_eq!(err.status(), Some(http::StatusCode::BAD_REQUEST));
    }

    #[test]
    fn colon_at_line_end_is_400() {
        for input in [&b"GET / HTTP/1.1\r\nX-Empty:\r\n\r\n"[..], b"GET / HTTP/1.1\r\nX-Empty:   \r\n\r\n"] {
            let err = decode_all(input).unwrap_err();
            assert_eq!(err.status(), Some(http::StatusCode::BAD_REQUEST));
        }
    }

    #[test]
    fn oversized_head_is_431() {
        let mut decoder = RequestHeadDecoder::with_max_size(32);
        let mut buf = BytesMut::from(&b"GET / HTTP/1.1\r\nX-Long: aaaaaaaaaaaaaaaaaaaaaaa\r\n\r\n"[..]);
        let err = decoder.decode(&mut buf).unwrap_err();
        assert_eq!(err.status(), Some(http::StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE));
    }

    #[test]
    fn partial_head_needs_more_data() {
        let mut decoder = RequestHeadDecoder::new();
        let mut buf = BytesMut::from(&b"GET / HTTP/1.1\r\nHost: a"[..]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
        assert!(!decoder.is_idle());
    }
}
