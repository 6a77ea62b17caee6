use std::time::{Duration, SystemTime};

use bytes::{BufMut, BytesMut};

use crate::protocol::{CookieError, DataDictionary};

/// A cookie sent to the client with `Set-Cookie`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpCookie {
    name: String,
    value: String,
    domain: Option<String>,
    path: Option<String>,
    expires: Option<SystemTime>,
    secure: bool,
    http_only: bool,
}

impl HttpCookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: None,
            path: None,
            expires: None,
            secure: false,
            http_only: false,
        }
    }

    /// Builds a cookie that either expires at a fixed time or after `max_age`.
    ///
    /// # Errors
    ///
    /// Returns [`CookieError::ExpiresAndMaxAge`] when both are given.
    pub fn with_lifetime(
        name: impl Into<String>,
        value: impl Into<String>,
        expires: Option<SystemTime>,
        max_age: Option<Duration>,
    ) -> Result<Self, CookieError> {
        let expires = match (expires, max_age) {
            (Some(_), Some(_)) => return Err(CookieError::ExpiresAndMaxAge),
            (Some(at), None) => Some(at),
            (None, Some(age)) => Some(SystemTime::now() + age),
            (None, None) => None,
        };
        Ok(Self { expires, ..Self::new(name, value) })
    }

    /// A cookie that instructs the client to drop `name`.
    pub fn expired(name: impl Into<String>) -> Self {
        const ONE_YEAR: Duration = Duration::from_secs(365 * 24 * 60 * 60);
        let expires = SystemTime::now().checked_sub(ONE_YEAR).unwrap_or(SystemTime::UNIX_EPOCH);
        Self { expires: Some(expires), ..Self::new(name, "") }
    }

    #[must_use]
    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    #[must_use]
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    #[must_use]
    pub fn expires(mut self, expires: SystemTime) -> Self {
        self.expires = Some(expires);
        self
    }

    #[must_use]
    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    #[must_use]
    pub fn http_only(mut self, http_only: bool) -> Self {
        self.http_only = http_only;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn get_domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    pub fn get_path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn get_expires(&self) -> Option<SystemTime> {
        self.expires
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn is_http_only(&self) -> bool {
        self.http_only
    }

    /// Appends the `Set-Cookie` header line, CRLF included.
    pub fn write_to(&self, dst: &mut BytesMut) {
        dst.put_slice(b"Set-Cookie: ");
        dst.put_slice(self.name.as_bytes());
        dst.put_u8(b'=');
        dst.put_slice(self.value.as_bytes());
        if let Some(domain) = &self.domain {
            dst.put_slice(b"; domain=");
            dst.put_slice(domain.as_bytes());
        }
        if let Some(path) = &self.path {
            dst.put_slice(b"; path=");
            dst.put_slice(path.as_bytes());
        }
        if let Some(expires) = self.expires {
            dst.put_slice(b"; expires=");
            dst.put_slice(httpdate::fmt_http_date(expires).as_bytes());
        }
        if self.secure {
            dst.put_slice(b"; secure");
        }
        if self.http_only {
            dst.put_slice(b"; HttpOnly");
        }
        dst.put_slice(b"\r\n");
    }
}

/// Parses a request `Cookie: a=1; b=2` header value.
pub fn parse_cookie_header(value: &str) -> DataDictionary {
    let mut cookies = DataDictionary::new();
    for pair in value.split(';') {
        if let Some((name, value)) = pair.split_once('=') {
            let name = name.trim();
            if !name.is_empty() {
                cookies.set(name, value.trim());
            }
        }
    }
    cookies
}

#[cfg(test)]
mod tests {
    use super::*;

    fn serialize(cookie: &HttpCookie) -> String {
        let mut buf = BytesMut::new();
        cookie.write_to(&mut buf);
        String::from_utf8(buf.to_vec()).unwrap()
    }

    #[test]
    fn minimal_cookie() {
        assert_eq!(serialize(&HttpCookie::new("sid", "abc")), "Set-Cookie: sid=abc\r\n");
    }

    #[test]
    fn cookie_with_attributes() {
        let expires = SystemTime::UNIX_EPOCH + Duration::from_secs(784_111_777);
        let cookie = HttpCookie::new("sid", "abc").domain("example.com").path("/").expires(expires).secure(true).http_only(true);
        assert_eq!(
            serialize(&cookie),
            "Set-Cookie: sid=abc; domain=example.com; path=/; expires=Sun, 06 Nov 1994 08:49:37 GMT; secure; HttpOnly\r\n"
        );
    }

    #[test]
    fn expires_and_max_age_conflict() {
        let result = HttpCookie::with_lifetime("a", "b", Some(SystemTime::now()), Some(Duration::from_secs(1)));
        assert_eq!(result, Err(CookieError::ExpiresAndMaxAge));
    }

    #[test]
    fn max_age_sets_expiry_in_the_future() {
        let cookie = HttpCookie::with_lifetime("a", "b", None, Some(Duration::from_secs(3600))).unwrap();
        assert!(cookie.get_expires().unwrap() > SystemTime::now());
    }

    #[test]
    fn expired_cookie_is_in_the_past() {
        let cookie = HttpCookie::expired("sid");
        assert_eq!(cookie.value(), "");
        assert!(cookie.get_expires().unwrap() < SystemTime::now());
    }

    #[test]
    fn parses_request_cookie_header() {
        let cookies = parse_cookie_header("sid=abc; theme = dark;broken; =x");
        assert_eq!(cookies.get("sid"), Some("abc"));
        assert_eq!(cookies.get("theme"), Some("dark"));
        assert_eq!(cookies.len(), 2);
    }
}
