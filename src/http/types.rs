#![allow(rustdoc::bare_urls)]

//! Core HTTP protocol types and utilities

use crate::{
    errors::Error,
    http::query::{Query, QueryCollector},
};
use std::fmt;

#[inline(always)]
pub(crate) fn slice_to_u64(bytes: &[u8]) -> Option<u64> {
    if bytes.is_empty() {
        return None;
    }

    let mut result: u64 = 0;
    for &byte in bytes {
        if !byte.is_ascii_digit() {
            return None;
        }

        result = result.checked_mul(10)?.checked_add((byte - b'0') as u64)?;
    }

    Some(result)
}

#[inline]
fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

/// Decodes `%XX` escapes (and `+` as space when `plus` is set).
///
/// Broken escapes are kept literally. Fails only when the decoded bytes
/// are not UTF-8.
pub(crate) fn percent_decode(src: &[u8], plus: bool) -> Result<String, Error> {
    let mut out = Vec::with_capacity(src.len());
    let mut i = 0;

    while i < src.len() {
        match src[i] {
            b'%' if i + 2 < src.len() => {
                match (hex_value(src[i + 1]), hex_value(src[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push(hi << 4 | lo);
                        i += 3;
                        continue;
                    }
                    _ => out.push(b'%'),
                }
            }
            b'+' if plus => out.push(b' '),
            byte => out.push(byte),
        }
        i += 1;
    }

    String::from_utf8(out).map_err(|_| Error::InvalidUrl)
}

// METHOD

/// HTTP request methods
///
/// `TRACE` and `CONNECT` are well-formed tokens but no handler serves them,
/// so they (and any unknown token) are answered with `405`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Put,
    Post,
    Head,
    Patch,
    Delete,
    Options,
}

impl Method {
    pub(crate) fn from_token(token: &str) -> Result<Self, Error> {
        match token {
            "GET" => Ok(Method::Get),
            "PUT" => Ok(Method::Put),
            "POST" => Ok(Method::Post),
            "HEAD" => Ok(Method::Head),
            "PATCH" => Ok(Method::Patch),
            "DELETE" => Ok(Method::Delete),
            "OPTIONS" => Ok(Method::Options),
            _ if !token.is_empty() && token.bytes().all(is_token_byte) => {
                Err(Error::MethodNotAllowed)
            }
            _ => Err(Error::InvalidRequestLine),
        }
    }

    /// Canonical upper-case token.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Put => "PUT",
            Method::Post => "POST",
            Method::Head => "HEAD",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[inline]
pub(crate) fn is_token_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&byte)
}

// VERSION

/// HTTP protocol version
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum Version {
    /// [RFC 1945](https://tools.ietf.org/html/rfc1945)
    Http10,
    /// [RFC 9112](https://www.rfc-editor.org/rfc/rfc9112)
    #[default]
    Http11,
}

impl Version {
    pub(crate) fn from_token(src: &str) -> Result<Self, Error> {
        match src {
            "HTTP/1.1" => Ok(Self::Http11),
            "HTTP/1.0" => Ok(Self::Http10),
            _ if src.starts_with("HTTP/") => Err(Error::UnsupportedVersion),
            _ => Err(Error::InvalidRequestLine),
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Http10 => "HTTP/1.0",
            Self::Http11 => "HTTP/1.1",
        }
    }
}

// STATUS_CODE

macro_rules! set_status_codes {
    ($( $name:ident = ($num:expr, $str:expr); )+) => {
        /// HTTP status codes with their registry reason phrases.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum StatusCode { $(
            #[doc = concat!(stringify!($num), " ", $str)]
            $name = $num,
        )+ }

        impl StatusCode {
            /// Numeric code.
            #[inline]
            pub const fn as_u16(&self) -> u16 {
                *self as u16
            }

            /// Reason phrase from the status registry.
            pub const fn reason(&self) -> &'static str {
                match self { $( StatusCode::$name => $str, )+ }
            }

            /// Looks up a known code.
            pub const fn from_u16(code: u16) -> Option<Self> {
                match code { $( $num => Some(StatusCode::$name), )+ _ => None }
            }
        }
    }
}

set_status_codes! {
    Continue = (100, "Continue");
    SwitchingProtocols = (101, "Switching Protocols");

    Ok = (200, "OK");
    Created = (201, "Created");
    Accepted = (202, "Accepted");
    NoContent = (204, "No Content");
    PartialContent = (206, "Partial Content");

    MovedPermanently = (301, "Moved Permanently");
    Found = (302, "Found");
    SeeOther = (303, "See Other");
    NotModified = (304, "Not Modified");
    TemporaryRedirect = (307, "Temporary Redirect");
    PermanentRedirect = (308, "Permanent Redirect");

    BadRequest = (400, "Bad Request");
    Unauthorized = (401, "Unauthorized");
    Forbidden = (403, "Forbidden");
    NotFound = (404, "Not Found");
    MethodNotAllowed = (405, "Method Not Allowed");
    NotAcceptable = (406, "Not Acceptable");
    RequestTimeout = (408, "Request Timeout");
    Conflict = (409, "Conflict");
    Gone = (410, "Gone");
    LengthRequired = (411, "Length Required");
    PayloadTooLarge = (413, "Payload Too Large");
    UriTooLong = (414, "URI Too Long");
    UnsupportedMediaType = (415, "Unsupported Media Type");
    RangeNotSatisfiable = (416, "Range Not Satisfiable");
    ImaTeapot = (418, "I'm a teapot");
    UnprocessableEntity = (422, "Unprocessable Entity");
    UpgradeRequired = (426, "Upgrade Required");
    TooManyRequests = (429, "Too Many Requests");
    RequestHeaderFieldsTooLarge = (431, "Request Header Fields Too Large");

    InternalServerError = (500, "Internal Server Error");
    NotImplemented = (501, "Not Implemented");
    BadGateway = (502, "Bad Gateway");
    ServiceUnavailable = (503, "Service Unavailable");
    GatewayTimeout = (504, "Gateway Timeout");
    HttpVersionNotSupported = (505, "HTTP Version Not Supported");
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.as_u16(), self.reason())
    }
}

// URL

struct DecodedQuery(Vec<(String, String)>, Option<Error>);

impl<'a> QueryCollector<'a> for DecodedQuery {
    fn add_param(&mut self, key: &'a [u8], value: &'a [u8]) {
        if self.1.is_some() {
            return;
        }
        match (percent_decode(key, true), percent_decode(value, true)) {
            (Ok(key), Ok(value)) => self.0.push((key, value)),
            (Err(err), _) | (_, Err(err)) => self.1 = Some(err),
        }
    }

    fn length(&self) -> usize {
        self.0.len()
    }

    fn with_capacity(capacity: usize) -> Self {
        DecodedQuery(Vec::with_capacity(capacity), None)
    }
}

/// Request target split into its parts.
///
/// # Components
///
/// - **Full**: the target exactly as sent (e.g. `/files/a%20b.txt?x=1&x=2`)
/// - **Path**: percent-decoded path (e.g. `/files/a b.txt`)
/// - **Query**: decoded pairs in order, duplicates and blank values kept
/// - **Captures**: positional groups filled in by the [`Router`](crate::Router)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Url {
    full: String,
    path: String,
    query: Vec<(String, String)>,
    pub(crate) captures: Vec<Option<String>>,
}

impl Url {
    /// Parses an origin-form (`/path?query`) or absolute-form
    /// (`http://host/path?query`) target.
    pub fn parse(target: &str, query_limit: usize) -> Result<Self, Error> {
        let origin = match target.strip_prefix("http://") {
            Some(rest) => match rest.find('/') {
                Some(index) => &rest[index..],
                None => "/",
            },
            None => target,
        };

        if !origin.starts_with('/') {
            return Err(Error::InvalidUrl);
        }

        let (raw_path, raw_query) = match memchr::memchr(b'?', origin.as_bytes()) {
            Some(index) => (&origin[..index], &origin[index + 1..]),
            None => (origin, ""),
        };

        let query = match raw_query.is_empty() {
            true => Vec::new(),
            false => {
                let collected: DecodedQuery = Query::parse(raw_query.as_bytes(), query_limit)?;
                if let Some(err) = collected.1 {
                    return Err(err);
                }
                collected.0
            }
        };

        Ok(Self {
            full: target.to_owned(),
            path: percent_decode(raw_path.as_bytes(), false)?,
            query,
            captures: Vec::new(),
        })
    }

    /// The target as received.
    #[inline]
    pub fn full(&self) -> &str {
        &self.full
    }

    /// Decoded path without the query string.
    #[inline]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// First value for `key`.
    ///
    /// For `/search?tag=a&tag=b&flag`:
    /// - `query("tag")`: `Some("a")`
    /// - `query("flag")`: `Some("")`
    /// - `query("page")`: `None`
    pub fn query(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Every value for `key`, in order.
    pub fn query_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.query
            .iter()
            .filter(move |(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// All query pairs in order.
    #[inline]
    pub fn query_pairs(&self) -> &[(String, String)] {
        &self.query
    }

    /// Positional route capture. Both an out-of-range index and a group
    /// that did not participate in the match give `None`.
    pub fn capture(&self, index: usize) -> Option<&str> {
        self.captures.get(index)?.as_deref()
    }

    /// All route captures.
    #[inline]
    pub fn captures(&self) -> &[Option<String>] {
        &self.captures
    }
}

// FIELDS

/// Ordered header field list.
///
/// Insertion order is kept and names may repeat. Lookups compare names
/// ASCII case-insensitively and return the first match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fields(Vec<(String, String)>);

impl Fields {
    #[inline]
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Value of the first field called `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Values of every field called `name`, in order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Replaces the value of the first field called `name`, or appends it.
    pub fn set<N: Into<String>, V: fmt::Display>(&mut self, name: N, value: V) -> &mut Self {
        let name = name.into();
        match self.0.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(&name)) {
            Some(field) => field.1 = value.to_string(),
            None => self.0.push((name, value.to_string())),
        }
        self
    }

    /// Always appends, even when `name` is already present.
    pub fn append<N: Into<String>, V: fmt::Display>(&mut self, name: N, value: V) -> &mut Self {
        self.0.push((name.into(), value.to_string()));
        self
    }

    /// Removes every field called `name`, returning how many were dropped.
    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.0.len();
        self.0.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        before - self.0.len()
    }

    #[inline]
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// `true` when the comma-separated value of `name` lists `token`.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .flat_map(|value| value.split(','))
            .any(|part| part.trim().eq_ignore_ascii_case(token))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub(crate) fn extend_from(&mut self, other: &Fields) {
        for (name, value) in other.iter() {
            self.set(name, value);
        }
    }

    pub(crate) fn write_to(&self, buffer: &mut Vec<u8>) {
        for (name, value) in &self.0 {
            buffer.extend_from_slice(name.as_bytes());
            buffer.extend_from_slice(b": ");
            buffer.extend_from_slice(value.as_bytes());
            buffer.extend_from_slice(b"\r\n");
        }
    }
}

#[cfg(test)]
mod fields_tests {
    use super::*;

    #[test]
    fn set_replaces_first() {
        let mut fields = Fields::new();
        fields.append("Accept", "a").append("X-Id", 1).append("accept", "b");

        fields.set("ACCEPT", "c");
        let len = fields.len();
        fields.set("accept", "d");

        assert_eq!(fields.len(), len);
        assert_eq!(fields.get_all("accept").collect::<Vec<_>>(), ["d", "b"]);
        assert_eq!(fields.get("x-id"), Some("1"));
    }

    #[test]
    fn set_twice_single_field() {
        let mut fields = Fields::new();
        fields.set("Content-Type", "text/plain");
        let len = fields.len();
        fields.set("Content-Type", "text/html");

        assert_eq!(fields.len(), len);
        assert_eq!(fields.get_all("content-type").count(), 1);
        assert_eq!(fields.get("Content-Type"), Some("text/html"));
    }

    #[test]
    fn append_always_grows() {
        let mut fields = Fields::new();
        for i in 0..5 {
            fields.append("Set-Cookie", format!("k{i}=v"));
            assert_eq!(fields.len(), i + 1);
        }
        assert_eq!(fields.get("set-cookie"), Some("k0=v"));
    }

    #[test]
    fn remove_and_tokens() {
        let mut fields = Fields::new();
        fields
            .append("Connection", "Upgrade, keep-alive")
            .append("connection", "close");

        assert!(fields.has_token("connection", "KEEP-ALIVE"));
        assert!(fields.has_token("Connection", "close"));
        assert!(!fields.has_token("Connection", "keep"));
        assert_eq!(fields.remove("CONNECTION"), 2);
        assert!(fields.is_empty());
    }

    #[test]
    fn serialization_order() {
        let mut fields = Fields::new();
        fields.append("B", "2").append("A", "1");

        let mut buf = Vec::new();
        fields.write_to(&mut buf);
        assert_eq!(buf, b"B: 2\r\nA: 1\r\n");
    }
}

#[cfg(test)]
mod url_tests {
    use super::*;

    #[test]
    fn parts() {
        let url = Url::parse("/files/a%20b.txt?tag=x&tag=y&flag&name=J%C3%B6rg+K", 16).unwrap();

        assert_eq!(url.full(), "/files/a%20b.txt?tag=x&tag=y&flag&name=J%C3%B6rg+K");
        assert_eq!(url.path(), "/files/a b.txt");
        assert_eq!(url.query("tag"), Some("x"));
        assert_eq!(url.query_all("tag").collect::<Vec<_>>(), ["x", "y"]);
        assert_eq!(url.query("flag"), Some(""));
        assert_eq!(url.query("name"), Some("Jörg K"));
        assert_eq!(url.query("missing"), None);
    }

    #[test]
    fn forms() {
        let cases = [
            ("/", "/"),
            ("/a/b/", "/a/b/"),
            ("/a?", "/a"),
            ("http://example.com/x?y=1", "/x"),
            ("http://example.com", "/"),
            ("/bad%zz", "/bad%zz"),
        ];

        for (target, path) in cases {
            assert_eq!(Url::parse(target, 8).unwrap().path(), path, "{target}");
        }
    }

    #[test]
    fn invalid() {
        for target in ["", "*", "example.com/a", "/%FF"] {
            assert!(Url::parse(target, 8).is_err(), "{target}");
        }
        assert!(matches!(
            Url::parse("/?a&b&c", 2),
            Err(Error::Query(crate::query::Error::OverLimit(2)))
        ));
    }

    #[test]
    fn captures() {
        let mut url = Url::parse("/a/b", 8).unwrap();
        url.captures = vec![Some("b".into()), None];

        assert_eq!(url.capture(0), Some("b"));
        assert_eq!(url.capture(1), None);
        assert_eq!(url.capture(2), None);
    }
}

#[cfg(test)]
mod token_tests {
    use super::*;

    #[test]
    fn methods() {
        assert_eq!(Method::from_token("GET").unwrap(), Method::Get);
        assert_eq!(Method::from_token("DELETE").unwrap(), Method::Delete);
        assert!(matches!(Method::from_token("TRACE"), Err(Error::MethodNotAllowed)));
        assert!(matches!(Method::from_token("BREW"), Err(Error::MethodNotAllowed)));
        assert!(matches!(Method::from_token("GE T"), Err(Error::InvalidRequestLine)));
        assert!(matches!(Method::from_token(""), Err(Error::InvalidRequestLine)));
    }

    #[test]
    fn versions() {
        assert_eq!(Version::from_token("HTTP/1.1").unwrap(), Version::Http11);
        assert_eq!(Version::from_token("HTTP/1.0").unwrap(), Version::Http10);
        assert!(matches!(Version::from_token("HTTP/2.0"), Err(Error::UnsupportedVersion)));
        assert!(matches!(Version::from_token("HTP/1.1"), Err(Error::InvalidRequestLine)));
    }

    #[test]
    fn status_codes() {
        assert_eq!(StatusCode::PartialContent.as_u16(), 206);
        assert_eq!(StatusCode::from_u16(416), Some(StatusCode::RangeNotSatisfiable));
        assert_eq!(StatusCode::from_u16(299), None);
        assert_eq!(StatusCode::NotFound.to_string(), "404 Not Found");
    }

    #[test]
    fn numbers() {
        assert_eq!(slice_to_u64(b"100"), Some(100));
        assert_eq!(slice_to_u64(b""), None);
        assert_eq!(slice_to_u64(b"-1"), None);
        assert_eq!(slice_to_u64(b"99999999999999999999999"), None);
    }
}
