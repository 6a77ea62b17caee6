use http::Method;

use crate::codec::{is_multipart_form, parse_boundary};
use crate::protocol::{ParseError, RequestHead};

/// How the connection consumes a request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum BodyStrategy {
    /// No body, the request is dispatched right away
    Empty,
    /// url-encoded form, buffered before dispatch
    Form,
    /// `multipart/form-data`, decoded before dispatch
    Multipart { boundary: String, charset: String },
    /// Dispatched right away, the handler pulls the body
    Stream,
}

impl BodyStrategy {
    /// Picks the strategy from the method, `Content-Type` and body length.
    ///
    /// Only `POST` bodies are parsed as forms.
    pub(crate) fn select(head: &RequestHead, content_length: u64) -> Result<Self, ParseError> {
        if content_length == 0 {
            return Ok(Self::Empty);
        }
        if head.method != Method::POST {
            return Ok(Self::Stream);
        }

        let Some(content_type) = head.headers.content_type() else {
            return Ok(Self::Stream);
        };

        if is_multipart_form(content_type) {
            let boundary = parse_boundary(content_type).ok_or_else(|| ParseError::invalid_multipart("missing boundary"))?;
            return Ok(Self::Multipart { boundary: boundary.to_string(), charset: head.headers.content_encoding() });
        }

        if content_type.to_ascii_lowercase().contains("application/x-www-form-urlencoded") {
            return Ok(Self::Form);
        }

        Ok(Self::Stream)
    }

    pub(crate) fn is_stream(&self) -> bool {
        matches!(self, Self::Stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::HttpHeaders;

    fn head(method: Method, content_type: Option<&str>) -> RequestHead {
        let mut headers = HttpHeaders::new();
        if let Some(content_type) = content_type {
            headers.set("Content-Type", content_type).unwrap();
        }
        RequestHead { method, raw_path: "/".to_string(), http10: false, headers }
    }

    #[test]
    fn no_body_is_empty() {
        let head = head(Method::POST, Some("application/x-www-form-urlencoded"));
        assert_eq!(BodyStrategy::select(&head, 0).unwrap(), BodyStrategy::Empty);
    }

    #[test]
    fn urlencoded_post_is_buffered() {
        let head = head(Method::POST, Some("application/x-www-form-urlencoded; charset=utf-8"));
        assert_eq!(BodyStrategy::select(&head, 7).unwrap(), BodyStrategy::Form);
    }

    #[test]
    fn multipart_post_is_decoded() {
        let head = head(Method::POST, Some("multipart/form-data; boundary=----abc"));
        assert_eq!(
            BodyStrategy::select(&head, 100).unwrap(),
            BodyStrategy::Multipart { boundary: "----abc".to_string(), charset: "utf-8".to_string() }
        );
    }

    #[test]
    fn multipart_without_boundary_is_rejected() {
        let head = head(Method::POST, Some("multipart/form-data"));
        let err = BodyStrategy::select(&head, 100).unwrap_err();
        assert_eq!(err.status(), Some(http::StatusCode::BAD_REQUEST));
    }

    #[test]
    fn everything_else_is_streamed() {
        assert!(BodyStrategy::select(&head(Method::PUT, Some("application/x-www-form-urlencoded")), 3).unwrap().is_stream());
        assert!(BodyStrategy::select(&head(Method::POST, Some("application/json")), 3).unwrap().is_stream());
        assert!(BodyStrategy::select(&head(Method::POST, None), 3).unwrap().is_stream());
    }
}
