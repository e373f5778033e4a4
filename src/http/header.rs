//! Request and response heads, built line by line.

use crate::{
    errors::Error,
    http::{
        codec,
        types::{slice_to_u64, Fields, Method, StatusCode, Url, Version},
    },
};
use std::{
    fmt,
    time::{Duration, SystemTime},
};

/// Parsed request head.
///
/// Lines are pushed through [`RequestHeader::parse_line`]: the first one is
/// the request line, the following ones are fields, and an empty line ends
/// the head. The head is *valid* once the request line has been parsed.
#[derive(Debug, Clone)]
pub struct RequestHeader {
    method: Method,
    url: Url,
    version: Version,
    fields: Fields,
    valid: bool,

    header_count: usize,
    query_parts: usize,
}

impl RequestHeader {
    pub(crate) fn new(header_count: usize, query_parts: usize) -> Self {
        Self {
            method: Method::Get,
            url: Url::default(),
            version: Version::Http11,
            fields: Fields::new(),
            valid: false,
            header_count,
            query_parts,
        }
    }

    /// Consumes one line. Returns `true` once the terminating empty line
    /// has been seen.
    pub fn parse_line(&mut self, line: &[u8]) -> Result<bool, Error> {
        if !self.valid {
            let (method, url, version) = codec::parse_request_line(line, self.query_parts)?;
            self.method = method;
            self.url = url;
            self.version = version;
            self.valid = true;
            return Ok(false);
        }

        if matches!(line, b"\r\n" | b"\n" | b"") {
            return Ok(true);
        }

        if self.fields.len() >= self.header_count {
            return Err(Error::TooManyHeaders);
        }

        let (name, value) = codec::parse_field_line(line)?;
        self.fields.append(name, value);
        Ok(false)
    }

    /// The request line has been parsed.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    #[inline]
    pub fn method(&self) -> Method {
        self.method
    }

    #[inline]
    pub fn url(&self) -> &Url {
        &self.url
    }

    #[inline]
    pub(crate) fn url_mut(&mut self) -> &mut Url {
        &mut self.url
    }

    #[inline]
    pub fn version(&self) -> Version {
        self.version
    }

    #[inline]
    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    /// First value of field `name`.
    #[inline]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name)
    }

    /// Connection reuse was asked for with an explicit `keep-alive` token.
    pub fn keep_alive(&self) -> bool {
        self.fields.has_token("Connection", "keep-alive")
    }

    /// `Connection: upgrade` together with `Upgrade: websocket`.
    pub fn is_websocket_upgrade(&self) -> bool {
        self.fields.has_token("Connection", "upgrade")
            && self.fields.has_token("Upgrade", "websocket")
    }

    /// `Sec-WebSocket-Key` when present and non-empty.
    pub fn websocket_key(&self) -> Option<&str> {
        self.fields
            .get("Sec-WebSocket-Key")
            .map(str::trim)
            .filter(|key| !key.is_empty())
    }

    /// Declared body length, `None` when absent.
    pub fn content_length(&self) -> Result<Option<u64>, Error> {
        let mut values = self.fields.get_all("Content-Length");
        let Some(first) = values.next() else {
            return Ok(None);
        };

        let length = slice_to_u64(first.trim().as_bytes()).ok_or(Error::InvalidContentLength)?;
        match values.all(|other| slice_to_u64(other.trim().as_bytes()) == Some(length)) {
            true => Ok(Some(length)),
            false => Err(Error::InvalidContentLength),
        }
    }

    /// Value of cookie `name` from the `Cookie` fields.
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies().find(|(n, _)| *n == name).map(|(_, v)| v)
    }

    /// Every `name=value` pair of the `Cookie` fields, in order.
    pub fn cookies(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields
            .get_all("Cookie")
            .flat_map(|value| value.split(';'))
            .filter_map(|pair| {
                let (name, value) = pair.split_once('=')?;
                Some((name.trim(), value.trim().trim_matches('"')))
            })
    }

    /// Client listed `gzip` in `Accept-Encoding` without `q=0`.
    pub fn accepts_gzip(&self) -> bool {
        self.fields
            .get_all("Accept-Encoding")
            .flat_map(|value| value.split(','))
            .any(|coding| {
                let mut parts = coding.split(';').map(str::trim);
                parts.next().is_some_and(|c| c.eq_ignore_ascii_case("gzip"))
                    && !parts.any(|p| p.replace(' ', "") == "q=0")
            })
    }

    /// Start offset of a `Range: bytes=<start>-[<end>]` field.
    ///
    /// The end offset is accepted but not used. Any other form of the field,
    /// including suffix and multi ranges, yields `None`.
    pub fn range_start(&self) -> Option<u64> {
        let spec = self.fields.get("Range")?.trim().strip_prefix("bytes=")?;
        if spec.contains(',') {
            return None;
        }

        let (start, end) = spec.split_once('-')?;
        let start = slice_to_u64(start.trim().as_bytes())?;

        match end.trim() {
            "" => Some(start),
            end => slice_to_u64(end.as_bytes()).map(|_| start),
        }
    }
}

/// Response head: status, version and fields.
///
/// A fresh head reports `400 Bad Request` with `Content-Length: 0` until
/// a handler sets something else.
#[derive(Debug, Clone)]
pub struct ResponseHeader {
    code: u16,
    reason: Option<String>,
    version: Version,
    pub fields: Fields,
    valid: bool,
}

impl Default for ResponseHeader {
    fn default() -> Self {
        let mut fields = Fields::new();
        fields.set("Content-Length", 0);

        Self {
            code: StatusCode::BadRequest.as_u16(),
            reason: None,
            version: Version::Http11,
            fields,
            valid: false,
        }
    }
}

impl ResponseHeader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Client side: consumes one line of a received response head.
    /// Returns `true` on the terminating empty line.
    pub fn parse_line(&mut self, line: &[u8]) -> Result<bool, Error> {
        if !self.valid {
            let (version, code, reason) = codec::parse_status_line(line)?;
            self.version = version;
            self.code = code;
            self.reason = Some(reason);
            self.fields = Fields::new();
            self.valid = true;
            return Ok(false);
        }

        if matches!(line, b"\r\n" | b"\n" | b"") {
            return Ok(true);
        }

        let (name, value) = codec::parse_field_line(line)?;
        self.fields.append(name, value);
        Ok(false)
    }

    pub fn set_status(&mut self, status: StatusCode) -> &mut Self {
        self.code = status.as_u16();
        self.reason = None;
        self
    }

    /// Numeric status.
    #[inline]
    pub fn code(&self) -> u16 {
        self.code
    }

    /// Known status, `None` for codes outside the registry table.
    #[inline]
    pub fn status(&self) -> Option<StatusCode> {
        StatusCode::from_u16(self.code)
    }

    /// Received reason phrase, or the registry one.
    pub fn reason(&self) -> &str {
        match (&self.reason, self.status()) {
            (Some(reason), _) => reason,
            (None, Some(status)) => status.reason(),
            (None, None) => "",
        }
    }

    #[inline]
    pub fn version(&self) -> Version {
        self.version
    }

    #[inline]
    pub(crate) fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    /// Adds a `Set-Cookie` field; cookies are never merged.
    pub fn set_cookie(&mut self, cookie: Cookie) -> &mut Self {
        self.fields.append("Set-Cookie", cookie);
        self
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(128 + self.fields.len() * 32);
        codec::write_head(&mut buffer, self.version, self.code, self.reason(), &self.fields);
        buffer
    }
}

/// `Set-Cookie` value builder.
///
/// ```
/// use wicket::Cookie;
///
/// let cookie = Cookie::new("theme", "dark").attr("HttpOnly").attr("Path=/");
/// assert_eq!(cookie.to_string(), "theme=dark; HttpOnly; Path=/");
/// ```
#[derive(Debug, Clone)]
pub struct Cookie {
    name: String,
    value: String,
    expires: Option<SystemTime>,
    attrs: Vec<String>,
}

impl Cookie {
    pub fn new<N: Into<String>, V: Into<String>>(name: N, value: V) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            expires: None,
            attrs: Vec::new(),
        }
    }

    /// Expires `minutes` from now, rendered as an HTTP date.
    pub fn expires_in(mut self, minutes: u64) -> Self {
        self.expires = Some(SystemTime::now() + Duration::from_secs(minutes * 60));
        self
    }

    /// Flag (`HttpOnly`) or `key=value` (`Path=/`) attribute, kept verbatim.
    pub fn attr<A: Into<String>>(mut self, attr: A) -> Self {
        self.attrs.push(attr.into());
        self
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)?;
        if let Some(expires) = self.expires {
            write!(f, "; Expires={}", httpdate::fmt_http_date(expires))?;
        }
        for attr in &self.attrs {
            write!(f, "; {attr}")?;
        }
        Ok(())
    }
}


#[cfg(test)]
mod response_tests {
    use super::*;

    #[test]
    fn defaults_to_error() {
        let header = ResponseHeader::new();
        assert_eq!(header.code(), 400);
        assert_eq!(header.fields.get("content-length"), Some("0"));
        assert_eq!(
            header.to_bytes(),
            b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n"
        );
    }

    #[test]
    fn client_parse() {
        let mut header = ResponseHeader::new();
        let lines: [&[u8]; 4] = [
            b"HTTP/1.1 299 Custom Thing\r\n",
            b"Set-Cookie: a=1\r\n",
            b"Set-Cookie: b=2\r\n",
            b"\r\n",
        ];

        let done: Vec<bool> = lines.iter().map(|l| header.parse_line(l).unwrap()).collect();
        assert_eq!(done, [false, false, false, true]);
        assert_eq!(header.code(), 299);
        assert_eq!(header.status(), None);
        assert_eq!(header.reason(), "Custom Thing");
        assert_eq!(header.fields.get_all("set-cookie").count(), 2);
    }

    #[test]
    fn cookies_append() {
        let mut header = ResponseHeader::new();
        header
            .set_cookie(Cookie::new("a", "1"))
            .set_cookie(Cookie::new("b", "2").expires_in(5).attr("HttpOnly"));

        let values: Vec<&str> = header.fields.get_all("Set-Cookie").collect();
        assert_eq!(values[0], "a=1");
        assert!(values[1].starts_with("b=2; Expires="));
        assert!(values[1].ends_with(" GMT; HttpOnly"));
    }
}
