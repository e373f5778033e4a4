use crate::http::{query, types::StatusCode};
use std::io;

/// Everything that can end a request cycle.
///
/// Every variant maps to a status line and a stable machine code through
/// [`Error::status`] and [`Error::code`]. Transport failures
/// ([`Error::is_transport`]) never produce a response.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid request line")]
    InvalidRequestLine,
    #[error("Invalid header format")]
    InvalidHeader,
    #[error("Invalid URL format")]
    InvalidUrl,
    #[error("Invalid query string: {0}")]
    Query(#[from] query::Error),
    #[error("Invalid Content-Length")]
    InvalidContentLength,
    #[error("HTTP version not supported")]
    UnsupportedVersion,

    #[error("Too many headers")]
    TooManyHeaders,
    #[error("Header line too long")]
    LineTooLong,
    #[error("Request timeout")]
    RequestTimeout,
    #[error("Request body too large")]
    BodyTooLarge,

    #[error("Method not allowed")]
    MethodNotAllowed,
    #[error("Not found")]
    NotFound,
    #[error("{}", .0.reason())]
    Status(StatusCode),

    #[error("WebSocket protocol violation: {0}")]
    Protocol(&'static str),
    #[error("Internal server error: {0}")]
    Internal(String),
    #[error("Service temporarily unavailable")]
    ServiceUnavailable,
    #[error("Outbound queue overflow")]
    Overflow,
    #[error("Unexpected end of stream")]
    StreamEnd,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

macro_rules! http_errors {
    ($($name:ident: $status:ident => $code:literal;)*) => {
        impl Error {
            /// Status code sent for this error.
            pub fn status(&self) -> StatusCode {
                match self {
                    Self::Status(status) => *status,
                    $(Self::$name { .. } => StatusCode::$status,)*
                }
            }

            /// Machine readable code used in JSON error bodies.
            pub fn code(&self) -> &'static str {
                match self {
                    Self::Status(_) => "HTTP_ERROR",
                    $(Self::$name { .. } => $code,)*
                }
            }
        }
    };
}

http_errors! {
    InvalidRequestLine: BadRequest => "INVALID_REQUEST_LINE";
    InvalidHeader: BadRequest => "INVALID_HEADER";
    InvalidUrl: BadRequest => "INVALID_URL";
    Query: BadRequest => "INVALID_QUERY";
    InvalidContentLength: BadRequest => "INVALID_CONTENT_LENGTH";
    UnsupportedVersion: HttpVersionNotSupported => "UNSUPPORTED_VERSION";

    TooManyHeaders: RequestHeaderFieldsTooLarge => "TOO_MANY_HEADERS";
    LineTooLong: RequestHeaderFieldsTooLarge => "LINE_TOO_LONG";
    RequestTimeout: RequestTimeout => "REQUEST_TIMEOUT";
    BodyTooLarge: PayloadTooLarge => "BODY_TOO_LARGE";

    MethodNotAllowed: MethodNotAllowed => "METHOD_NOT_ALLOWED";
    NotFound: NotFound => "NOT_FOUND";

    Protocol: BadRequest => "PROTOCOL_ERROR";
    Internal: InternalServerError => "INTERNAL_ERROR";
    ServiceUnavailable: ServiceUnavailable => "SERVICE_UNAVAILABLE";
    Overflow: ServiceUnavailable => "OUTBOUND_OVERFLOW";
    StreamEnd: BadRequest => "STREAM_END";
    Io: InternalServerError => "IO_ERROR";
}

impl Error {
    /// `true` for failures of the byte stream itself (reset, broken pipe,
    /// premature EOF, stalled write). Nothing more is written after these.
    pub fn is_transport(&self) -> bool {
        match self {
            Self::StreamEnd => true,
            Self::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::NotConnected
            ),
            _ => false,
        }
    }

    /// Text placed in the `error` member of a JSON error body.
    ///
    /// Server faults only reveal their diagnostic text when `debug` is set.
    pub(crate) fn public_message(&self, debug: bool) -> String {
        match self.status().as_u16() >= 500 && !debug {
            true => self.status().reason().to_owned(),
            false => self.to_string(),
        }
    }

    pub(crate) fn internal<E: std::fmt::Display>(err: E) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::RequestTimeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_table() {
        let cases = [
            (Error::InvalidHeader, 400, "INVALID_HEADER"),
            (Error::TooManyHeaders, 431, "TOO_MANY_HEADERS"),
            (Error::RequestTimeout, 408, "REQUEST_TIMEOUT"),
            (Error::BodyTooLarge, 413, "BODY_TOO_LARGE"),
            (Error::MethodNotAllowed, 405, "METHOD_NOT_ALLOWED"),
            (Error::NotFound, 404, "NOT_FOUND"),
            (Error::UnsupportedVersion, 505, "UNSUPPORTED_VERSION"),
            (Error::Internal("boom".into()), 500, "INTERNAL_ERROR"),
            (Error::Overflow, 503, "OUTBOUND_OVERFLOW"),
            (Error::Status(StatusCode::Forbidden), 403, "HTTP_ERROR"),
            (Error::Query(query::Error::OverLimit(2)), 400, "INVALID_QUERY"),
        ];

        for (err, status, code) in cases {
            assert_eq!(err.status().as_u16(), status, "{err:?}");
            assert_eq!(err.code(), code);
        }
    }

    #[test]
    fn transport_kinds() {
        let reset = Error::Io(io::Error::from(io::ErrorKind::ConnectionReset));
        let pipe = Error::Io(io::Error::from(io::ErrorKind::BrokenPipe));
        let other = Error::Io(io::Error::from(io::ErrorKind::PermissionDenied));

        assert!(reset.is_transport());
        assert!(pipe.is_transport());
        assert!(Error::StreamEnd.is_transport());
        assert!(!other.is_transport());
        assert!(!Error::InvalidHeader.is_transport());
    }

    #[test]
    fn internal_detail_hidden() {
        let err = Error::Internal("db exploded".into());

        assert_eq!(err.public_message(false), "Internal Server Error");
        assert_eq!(err.public_message(true), "Internal server error: db exploded");
        assert_eq!(Error::NotFound.public_message(false), "Not found");
    }
}
