//! Stateless line codec: start lines and field lines in, head bytes out.
//!
//! WebSocket frames live in [`crate::websocket::frame`].

use crate::{
    errors::Error,
    http::types::{is_token_byte, Fields, Method, Url, Version},
};

/// Strips the line terminator (`\r\n` or a bare `\n`) and checks UTF-8.
#[inline]
pub(crate) fn line_str(line: &[u8]) -> Result<&str, Error> {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    let line = line.strip_suffix(b"\r").unwrap_or(line);

    simdutf8::basic::from_utf8(line).map_err(|_| Error::InvalidHeader)
}

/// `METHOD SP target SP HTTP/x.y`
pub fn parse_request_line(line: &[u8], query_limit: usize) -> Result<(Method, Url, Version), Error> {
    let line = line_str(line).map_err(|_| Error::InvalidRequestLine)?;

    let mut parts = line.split(' ');
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(Error::InvalidRequestLine);
    };

    if target.is_empty() {
        return Err(Error::InvalidRequestLine);
    }

    let version = Version::from_token(version)?;
    let method = Method::from_token(method)?;

    Ok((method, Url::parse(target, query_limit)?, version))
}

/// `HTTP/x.y SP code [SP reason]`, the reason phrase may contain spaces.
pub fn parse_status_line(line: &[u8]) -> Result<(Version, u16, String), Error> {
    let line = line_str(line)?;

    let mut parts = line.splitn(3, ' ');
    let version = Version::from_token(parts.next().unwrap_or_default())?;

    let code = parts
        .next()
        .filter(|code| code.len() == 3)
        .and_then(|code| code.parse::<u16>().ok())
        .filter(|code| (100..600).contains(code))
        .ok_or(Error::InvalidRequestLine)?;

    Ok((version, code, parts.next().unwrap_or_default().to_owned()))
}

/// `name: value`; the name must be a token, surrounding whitespace of the
/// value is dropped. Folded continuation lines are rejected.
pub fn parse_field_line(line: &[u8]) -> Result<(String, String), Error> {
    let line = line_str(line)?;

    let (name, value) = line.split_once(':').ok_or(Error::InvalidHeader)?;
    if name.is_empty() || !name.bytes().all(is_token_byte) {
        return Err(Error::InvalidHeader);
    }

    Ok((name.to_owned(), value.trim_matches([' ', '\t']).to_owned()))
}

/// Serializes a status line, the fields and the blank separator line.
pub(crate) fn write_head(
    buffer: &mut Vec<u8>,
    version: Version,
    code: u16,
    reason: &str,
    fields: &Fields,
) {
    buffer.extend_from_slice(version.as_str().as_bytes());
    buffer.push(b' ');
    buffer.extend_from_slice(code.to_string().as_bytes());
    buffer.push(b' ');
    buffer.extend_from_slice(reason.as_bytes());
    buffer.extend_from_slice(b"\r\n");
    fields.write_to(buffer);
    buffer.extend_from_slice(b"\r\n");
}

/// Serializes a request head (used by the client).
pub(crate) fn write_request_head(
    buffer: &mut Vec<u8>,
    method: Method,
    target: &str,
    fields: &Fields,
) {
    buffer.extend_from_slice(method.as_str().as_bytes());
    buffer.push(b' ');
    buffer.extend_from_slice(target.as_bytes());
    buffer.extend_from_slice(b" HTTP/1.1\r\n");
    fields.write_to(buffer);
    buffer.extend_from_slice(b"\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_lines() {
        let (method, url, version) = parse_request_line(b"GET /a/b?x=1 HTTP/1.1\r\n", 8).unwrap();
        assert_eq!(method, Method::Get);
        assert_eq!(url.path(), "/a/b");
        assert_eq!(url.query("x"), Some("1"));
        assert_eq!(version, Version::Http11);

        let (method, _, version) = parse_request_line(b"POST / HTTP/1.0\n", 8).unwrap();
        assert_eq!((method, version), (Method::Post, Version::Http10));
    }

    #[test]
    fn request_line_errors() {
        let cases: [(&[u8], u16); 8] = [
            (b"GET /\r\n", 400),
            (b"GET  / HTTP/1.1\r\n", 400),
            (b"GET / HTTP/1.1 extra\r\n", 400),
            (b"GET / HTTP/2.0\r\n", 505),
            (b"GET / FTP/1.0\r\n", 400),
            (b"BREW / HTTP/1.1\r\n", 405),
            (b"GET nope HTTP/1.1\r\n", 400),
            (b"GET /\xFF HTTP/1.1\r\n", 400),
        ];

        for (line, status) in cases {
            let err = parse_request_line(line, 8).unwrap_err();
            assert_eq!(err.status().as_u16(), status, "{:?}", String::from_utf8_lossy(line));
        }
    }

    #[test]
    fn status_lines() {
        assert_eq!(
            parse_status_line(b"HTTP/1.1 404 Not Found\r\n").unwrap(),
            (Version::Http11, 404, "Not Found".to_owned())
        );
        assert_eq!(
            parse_status_line(b"HTTP/1.0 299\r\n").unwrap(),
            (Version::Http10, 299, String::new())
        );
        assert!(parse_status_line(b"HTTP/1.1 20 OK\r\n").is_err());
        assert!(parse_status_line(b"HTTP/1.1 abc OK\r\n").is_err());
    }

    #[test]
    fn field_lines() {
        let cases: [(&[u8], (&str, &str)); 4] = [
            (b"Host: example.com\r\n", ("Host", "example.com")),
            (b"X-Empty:\r\n", ("X-Empty", "")),
            (b"Range:bytes=10-  \t\r\n", ("Range", "bytes=10-")),
            (b"Time: 12:30:00\r\n", ("Time", "12:30:00")),
        ];

        for (line, (name, value)) in cases {
            let (n, v) = parse_field_line(line).unwrap();
            assert_eq!((n.as_str(), v.as_str()), (name, value));
        }

        for line in [&b": value\r\n"[..], b"No colon\r\n", b" folded: x\r\n", b"Bad Name: x\r\n"] {
            assert!(matches!(parse_field_line(line), Err(Error::InvalidHeader)));
        }
    }

    #[test]
    fn head_bytes() {
        let mut fields = Fields::new();
        fields.set("Content-Length", 0);

        let mut buffer = Vec::new();
        write_head(&mut buffer, Version::Http11, 204, "No Content", &fields);
        assert_eq!(buffer, b"HTTP/1.1 204 No Content\r\nContent-Length: 0\r\n\r\n");
    }
}
