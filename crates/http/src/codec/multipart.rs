//! Incremental decoder for `multipart/form-data` request bodies.
//!
//! Body bytes are fed as they arrive; each completed part is yielded once its
//! closing delimiter has been seen. Part data is never scanned twice: bytes that
//! can't be the start of a delimiter are moved into the current part right away.

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::ensure;
use crate::protocol::{ParseError, get_attribute};

/// Upper bound for the header block of a single part
const MAX_PART_HEADER_BYTES: usize = 8 * 1024;
const MAX_PART_HEADERS: usize = 16;

/// A decoded form part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartPart {
    pub name: String,
    /// Set for file uploads
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub data: Bytes,
}

impl MultipartPart {
    pub fn is_file(&self) -> bool {
        self.filename.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Skipping everything before the first boundary
    Preamble,
    /// Right after a boundary, expecting `\r\n` or the closing `--`
    AfterBoundary,
    Headers,
    Body,
    /// After the closing boundary, remaining bytes are ignored
    Epilogue,
}

#[derive(Debug)]
struct PartHead {
    name: String,
    filename: Option<String>,
    content_type: Option<String>,
}

#[derive(Debug)]
pub struct MultipartDecoder {
    /// `--boundary`
    dash_boundary: Vec<u8>,
    /// `\r\n--boundary`
    delimiter: Vec<u8>,
    state: State,
    current: Option<PartHead>,
    data: BytesMut,
}

impl MultipartDecoder {
    pub fn new(boundary: &str) -> Self {
        let dash_boundary = format!("--{boundary}").into_bytes();
        let mut delimiter = b"\r\n".to_vec();
        delimiter.extend_from_slice(&dash_boundary);

        Self { dash_boundary, delimiter, state: State::Preamble, current: None, data: BytesMut::new() }
    }

    /// True once the closing boundary has been read.
    pub fn is_finished(&self) -> bool {
        self.state == State::Epilogue
    }
}

impl Decoder for MultipartDecoder {
    type Item = MultipartPart;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state {
                State::Preamble => match find(src, &self.dash_boundary) {
                    Some(index) => {
                        src.advance(index + self.dash_boundary.len());
                        self.state = State::AfterBoundary;
                    }
                    None => {
                        let keep = self.dash_boundary.len() - 1;
                        if src.len() > keep {
                            src.advance(src.len() - keep);
                        }
                        return Ok(None);
                    }
                },

                State::AfterBoundary => {
                    if src.len() < 2 {
                        return Ok(None);
                    }
                    match &src[..2] {
                        b"--" => self.state = State::Epilogue,
                        b"\r\n" => {
                            src.advance(2);
                            self.state = State::Headers;
                        }
                        _ => return Err(ParseError::invalid_multipart("expected CRLF after boundary")),
                    }
                }

                State::Headers => {
                    if src.len() < 2 {
                        return Ok(None);
                    }
                    ensure!(!src.starts_with(b"\r\n"), ParseError::invalid_multipart("part without headers"));

                    let Some(end) = find(src, b"\r\n\r\n") else {
                        ensure!(src.len() <= MAX_PART_HEADER_BYTES, ParseError::invalid_multipart("part headers too large"));
                        return Ok(None);
                    };
                    let block = src.split_to(end + 4);
                    self.current = Some(parse_part_head(&block)?);
                    self.state = State::Body;
                }

                State::Body => match find(src, &self.delimiter) {
                    Some(index) => {
                        self.data.extend_from_slice(&src[..index]);
                        src.advance(index + self.delimiter.len());
                        self.state = State::AfterBoundary;

                        let head = self.current.take().ok_or_else(|| ParseError::invalid_multipart("part without headers"))?;
                        let part = MultipartPart {
                            name: head.name,
                            filename: head.filename,
                            content_type: head.content_type,
                            data: self.data.split().freeze(),
                        };
                        trace!(name = %part.name, size = part.data.len(), "decoded multipart part");
                        return Ok(Some(part));
                    }
                    None => {
                        let safe = src.len().saturating_sub(self.delimiter.len() - 1);
                        self.data.extend_from_slice(&src[..safe]);
                        src.advance(safe);
                        return Ok(None);
                    }
                },

                State::Epilogue => {
                    src.clear();
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(part) => Ok(Some(part)),
            None if self.is_finished() => Ok(None),
            None => Err(ParseError::invalid_multipart("body ended before the closing boundary")),
        }
    }
}

/// True when the content type names `multipart/form-data`.
pub fn is_multipart_form(content_type: &str) -> bool {
    content_type.to_ascii_lowercase().contains("multipart/form-data")
}

/// The `boundary` attribute of a `multipart/form-data` content type.
pub fn parse_boundary(content_type: &str) -> Option<&str> {
    if !is_multipart_form(content_type) {
        return None;
    }
    get_attribute(content_type, "boundary=").filter(|boundary| !boundary.is_empty())
}

/// Decodes a text field with the declared charset, falling back to utf-8.
pub fn decode_text(data: &[u8], charset: &str) -> String {
    if charset.eq_ignore_ascii_case("iso-8859-1") || charset.eq_ignore_ascii_case("latin1") {
        data.iter().map(|&b| char::from(b)).collect()
    } else {
        String::from_utf8_lossy(data).into_owned()
    }
}

fn parse_part_head(block: &[u8]) -> Result<PartHead, ParseError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_PART_HEADERS];
    let headers = match httparse::parse_headers(block, &mut headers) {
        Ok(httparse::Status::Complete((_, headers))) => headers,
        Ok(httparse::Status::Partial) => return Err(ParseError::invalid_multipart("incomplete part headers")),
        Err(e) => return Err(ParseError::invalid_multipart(e)),
    };

    let mut disposition = None;
    let mut content_type = None;
    for header in headers.iter() {
        let value = String::from_utf8_lossy(header.value).into_owned();
        if header.name.eq_ignore_ascii_case("content-disposition") {
            disposition = Some(value);
        } else if header.name.eq_ignore_ascii_case("content-type") {
            content_type = Some(value);
        }
    }

    let disposition = disposition.ok_or_else(|| ParseError::invalid_multipart("missing content-disposition"))?;
    let (name, filename) = parse_content_disposition(&disposition)?;
    Ok(PartHead { name, filename, content_type })
}

/// `form-data; name="field"; filename="file.txt"`
fn parse_content_disposition(value: &str) -> Result<(String, Option<String>), ParseError> {
    let mut name = None;
    let mut filename = None;

    for param in value.split(';').map(str::trim) {
        let Some((key, value)) = param.split_once('=') else {
            continue;
        };
        match key.trim().to_ascii_lowercase().as_str() {
            "name" => name = Some(unquote(value)),
            "filename" => filename = Some(unquote(value)),
            _ => {}
        }
    }

    let name = name.ok_or_else(|| ParseError::invalid_multipart("content-disposition without a name"))?;
    Ok((name, filename))
}

fn unquote(s: &str) -> String {
    let s = s.trim();
    s.strip_prefix('"').and_then(|s| s.strip_suffix('"')).unwrap_or(s).to_string()
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}
