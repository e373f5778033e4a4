//! Response builder, finalization and the lazy send sequence.

use crate::{
    errors::Error,
    http::{
        header::{Cookie, RequestHeader, ResponseHeader},
        types::{Fields, StatusCode, Version},
    },
    limits::{RespLimits, ServerLimits},
    store::cache::{CachedFile, FileData},
    websocket::frame::accept_key,
};
use bytes::Bytes;
use flate2::{write::GzEncoder, Compression};
use serde::Serialize;
use std::{
    fmt,
    io::{self, SeekFrom, Write},
    path::PathBuf,
};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// HTTP response under construction.
///
/// Handlers pick a status and a body with one of [`text`](Response::text),
/// [`json`](Response::json), [`file`](Response::file),
/// [`render_with`](Response::render_with), [`error`](Response::error) or
/// [`upgrade_websocket`](Response::upgrade_websocket). The connection then
/// finalizes framing fields and streams it through a [`Sender`].
///
/// ```
/// use wicket::{Response, StatusCode};
///
/// let mut resp = Response::default();
/// resp.text(StatusCode::Ok, "Hello World").field("Cache-Control", "no-store");
///
/// assert_eq!(resp.header.code(), 200);
/// assert_eq!(resp.body_len(), Some(11));
/// ```
#[derive(Default)]
pub struct Response {
    pub header: ResponseHeader,
    body: Option<Body>,
    range: bool,
    compress: Option<bool>,
}

enum Body {
    Memory(Vec<u8>),
    // Cached buffer, shared with the file cache and never closed.
    Shared(Bytes),
    // Opened by the sender, `len` bytes from `offset`.
    File { path: PathBuf, offset: u64, len: u64 },
}

impl Body {
    fn len(&self) -> u64 {
        match self {
            Body::Memory(data) => data.len() as u64,
            Body::Shared(data) => data.len() as u64,
            Body::File { len, .. } => *len,
        }
    }

    fn skip(self, skip: u64) -> Self {
        match self {
            Body::Memory(mut data) => {
                data.drain(..skip as usize);
                Body::Memory(data)
            }
            Body::Shared(data) => Body::Shared(data.slice(skip as usize..)),
            Body::File { path, offset, len } => Body::File {
                path,
                offset: offset + skip,
                len: len - skip,
            },
        }
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("header", &self.header)
            .field("body_len", &self.body_len())
            .field("range", &self.range)
            .field("compress", &self.compress)
            .finish()
    }
}

impl Response {
    pub(crate) fn with_fields(base: &Fields, version: Version) -> Self {
        let mut response = Self::default();
        response.header.fields.extend_from(base);
        response.header.set_version(version);
        response
    }

    /// Sets only the status code.
    pub fn status(&mut self, status: StatusCode) -> &mut Self {
        self.header.set_status(status);
        self
    }

    /// Sets (replaces) a header field.
    pub fn field<V: fmt::Display>(&mut self, name: &str, value: V) -> &mut Self {
        self.header.fields.set(name, value);
        self
    }

    pub fn set_cookie(&mut self, cookie: Cookie) -> &mut Self {
        self.header.set_cookie(cookie);
        self
    }

    /// Status with no body.
    pub fn error(&mut self, status: StatusCode) -> &mut Self {
        self.body = None;
        self.status(status)
    }

    /// Plain text body.
    pub fn text<T: Into<String>>(&mut self, status: StatusCode, text: T) -> &mut Self {
        let text: String = text.into();
        self.bytes(status, "text/plain; charset=utf-8", text)
    }

    /// HTML body.
    pub fn html<T: Into<String>>(&mut self, status: StatusCode, html: T) -> &mut Self {
        let html: String = html.into();
        self.bytes(status, "text/html; charset=utf-8", html)
    }

    /// Raw body with an explicit content type.
    pub fn bytes<B: Into<Vec<u8>>>(&mut self, status: StatusCode, content_type: &str, body: B) -> &mut Self {
        self.status(status).field("Content-Type", content_type);
        self.body = Some(Body::Memory(body.into()));
        self
    }

    /// Serializes `value` as compact JSON.
    pub fn json<T: Serialize + ?Sized>(&mut self, status: StatusCode, value: &T) -> Result<&mut Self, Error> {
        let body = serde_json::to_vec(value).map_err(Error::internal)?;
        Ok(self.bytes(status, "application/json", body))
    }

    /// Serializes `value` as indented JSON.
    pub fn json_pretty<T: Serialize + ?Sized>(&mut self, status: StatusCode, value: &T) -> Result<&mut Self, Error> {
        let body = serde_json::to_vec_pretty(value).map_err(Error::internal)?;
        Ok(self.bytes(status, "application/json", body))
    }

    /// Body from the file cache, with range support switched on.
    ///
    /// Buffered files share the cached bytes; others are opened by the
    /// [`Sender`] and closed once sent.
    pub fn file(&mut self, status: StatusCode, file: &CachedFile) -> Result<&mut Self, Error> {
        self.body = Some(match &file.data {
            FileData::Buffered(bytes) => Body::Shared(bytes.clone()),
            FileData::Unbuffered => Body::File {
                path: file.path.clone(),
                offset: 0,
                len: file.size,
            },
        });

        self.status(status)
            .field("Content-Type", file.content_type)
            .field("Last-Modified", httpdate::fmt_http_date(file.modified))
            .enable_range();
        Ok(self)
    }

    /// Fills the body through an [`io::Write`] sink, e.g. a template engine.
    pub fn render_with<F>(&mut self, status: StatusCode, content_type: &str, f: F) -> Result<&mut Self, Error>
    where
        F: FnOnce(&mut BodyWriter) -> io::Result<()>,
    {
        let mut body = Vec::new();
        f(&mut BodyWriter(&mut body)).map_err(Error::internal)?;
        Ok(self.bytes(status, content_type, body))
    }

    /// `101 Switching Protocols` answering a WebSocket key.
    pub fn upgrade_websocket(&mut self, key: &str) -> &mut Self {
        self.body = None;
        self.status(StatusCode::SwitchingProtocols)
            .field("Upgrade", "websocket")
            .field("Connection", "Upgrade")
            .field("Sec-WebSocket-Accept", accept_key(key))
    }

    /// Honors `Range` requests for this response.
    pub fn enable_range(&mut self) -> &mut Self {
        self.range = true;
        self.field("Accept-Ranges", "bytes")
    }

    /// Overrides the server-wide gzip switch for this response.
    pub fn compress(&mut self, enabled: bool) -> &mut Self {
        self.compress = Some(enabled);
        self
    }

    /// Length of the body set so far.
    pub fn body_len(&self) -> Option<u64> {
        self.body.as_ref().map(Body::len)
    }

    /// Finalizes framing fields against the request.
    ///
    /// - no body: `Content-Length: 0`
    /// - range enabled and `Range: bytes=N-` present: `206` with the tail
    ///   from `N`; an end offset is ignored; `N` past the end gives `416`
    /// - otherwise gzip when enabled, accepted and the body is in memory
    /// - `Content-Length` always matches what is sent
    pub fn prepare_response(&mut self, request: &RequestHeader, limits: &RespLimits) -> Result<(), Error> {
        self.header.fields.remove("Content-Length");

        if self.header.code() == StatusCode::SwitchingProtocols.as_u16() {
            self.body = None;
            return Ok(());
        }

        let Some(body) = self.body.take() else {
            self.header.fields.set("Content-Length", 0);
            return Ok(());
        };

        let total = body.len();
        let start = request.range_start().filter(|_| self.range);

        let body = match start {
            Some(start) if start >= total => {
                self.status(StatusCode::RangeNotSatisfiable)
                    .field("Content-Range", format!("bytes */{total}"))
                    .field("Content-Length", 0);
                return Ok(());
            }
            Some(start) => {
                self.status(StatusCode::PartialContent).field(
                    "Content-Range",
                    format!("bytes {start}-{}/{total}", total - 1),
                );
                body.skip(start)
            }
            None if self.compress.unwrap_or(limits.gzip) && request.accepts_gzip() => {
                match body {
                    Body::Memory(data) => self.gzip(&data)?,
                    Body::Shared(data) => self.gzip(&data)?,
                    file => file,
                }
            }
            None => body,
        };

        self.header.fields.set("Content-Length", body.len());
        self.body = Some(body);
        Ok(())
    }

    fn gzip(&mut self, data: &[u8]) -> Result<Body, Error> {
        let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
        encoder.write_all(data)?;

        self.field("Content-Encoding", "gzip").field("Vary", "Accept-Encoding");
        Ok(Body::Memory(encoder.finish()?))
    }

    /// Turns this response into the answer for `error`.
    ///
    /// Fields set so far (cookies, base fields) survive, the body and its
    /// framing fields are replaced and the connection is marked for close.
    pub(crate) fn into_failure(mut self, error: &Error, limits: &ServerLimits) -> Self {
        for name in ["Content-Type", "Content-Length", "Content-Range", "Content-Encoding", "Accept-Ranges"] {
            self.header.fields.remove(name);
        }

        self.header.set_status(error.status());
        self.body = None;
        self.range = false;

        if limits.json_errors {
            let body = serde_json::json!({
                "error": error.public_message(limits.debug_errors),
                "code": error.code(),
            });
            self.field("Content-Type", "application/json");
            self.body = Some(Body::Memory(body.to_string().into_bytes()));
        }

        let length = self.body_len().unwrap_or(0);
        self.field("Content-Length", length).field("Connection", "close");
        self
    }

    /// Head and in-memory body as one buffer; file bodies are left out.
    pub(crate) fn to_bytes(&self) -> Vec<u8> {
        let mut buffer = self.header.to_bytes();
        match &self.body {
            Some(Body::Memory(data)) => buffer.extend_from_slice(data),
            Some(Body::Shared(data)) => buffer.extend_from_slice(data),
            Some(Body::File { .. }) | None => {}
        }
        buffer
    }

    /// Lazy send sequence: the serialized head first, then body chunks of at
    /// most `chunk_size` bytes. Consumes the response.
    pub fn sender(self, chunk_size: usize) -> Sender {
        let body = match self.body {
            None => SendBody::Done,
            Some(Body::Memory(data)) => SendBody::Memory(Bytes::from(data)),
            Some(Body::Shared(data)) => SendBody::Memory(data),
            Some(Body::File { path, offset, len }) => SendBody::File {
                path,
                offset,
                file: None,
                remaining: len,
            },
        };

        Sender {
            head: Some(self.header.to_bytes()),
            body,
            chunk_size: chunk_size.max(1),
        }
    }
}

/// Yields a response as byte chunks, see [`Response::sender`].
///
/// A file body is closed when the sender is dropped; a cached buffer is
/// only released.
pub struct Sender {
    head: Option<Vec<u8>>,
    body: SendBody,
    chunk_size: usize,
}

enum SendBody {
    Done,
    Memory(Bytes),
    File {
        path: PathBuf,
        offset: u64,
        file: Option<tokio::fs::File>,
        remaining: u64,
    },
}

impl Sender {
    /// Next chunk, `None` once everything was yielded.
    pub async fn next(&mut self) -> io::Result<Option<Bytes>> {
        if let Some(head) = self.head.take() {
            return Ok(Some(Bytes::from(head)));
        }

        let chunk = match &mut self.body {
            SendBody::Done => None,
            SendBody::Memory(data) if data.is_empty() => None,
            SendBody::Memory(data) => Some(data.split_to(self.chunk_size.min(data.len()))),
            SendBody::File { remaining: 0, .. } => None,
            SendBody::File {
                path,
                offset,
                file,
                remaining,
            } => {
                if file.is_none() {
                    let mut opened = tokio::fs::File::open(&*path).await?;
                    opened.seek(SeekFrom::Start(*offset)).await?;
                    *file = Some(opened);
                }
                let Some(file) = file.as_mut() else {
                    return Ok(None);
                };

                let mut chunk = vec![0; (*remaining).min(self.chunk_size as u64) as usize];
                file.read_exact(&mut chunk).await?;
                *remaining -= chunk.len() as u64;
                Some(Bytes::from(chunk))
            }
        };

        if chunk.is_none() {
            self.body = SendBody::Done;
        }
        Ok(chunk)
    }
}

/// Body sink handed out by [`Response::render_with`].
///
/// ```
/// use std::io::Write;
/// use wicket::{Response, StatusCode};
///
/// let mut resp = Response::default();
/// resp.render_with(StatusCode::Ok, "text/html", |w| {
///     write!(w, "<p>{} + {} = {}</p>", 2, 2, 4)
/// })
/// .unwrap();
/// assert_eq!(resp.body_len(), Some(16));
/// ```
#[derive(Debug)]
pub struct BodyWriter<'a>(pub(crate) &'a mut Vec<u8>);

impl BodyWriter<'_> {
    #[inline]
    pub fn push_str(&mut self, value: &str) {
        self.0.extend_from_slice(value.as_bytes());
    }
}

impl io::Write for BodyWriter<'_> {
    #[inline]
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.extend_from_slice(buf);
        Ok(buf.len())
    }

    #[inline]
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}


#[cfg(test)]
mod sender_tests {
    use super::*;
    use crate::tools::*;

    async fn collect(mut sender: Sender) -> Vec<Bytes> {
        let mut chunks = Vec::new();
        while let Some(chunk) = sender.next().await.unwrap() {
            chunks.push(chunk);
        }
        chunks
    }

    #[tokio::test]
    async fn head_then_chunks() {
        let mut resp = Response::default();
        resp.bytes(StatusCode::Ok, "text/plain", vec![b'a'; 25]);
        resp.prepare_response(&request(&[]), &RespLimits::default()).unwrap();

        let chunks = collect(resp.sender(10)).await;
        let head = std::str::from_utf8(&chunks[0]).unwrap();

        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.ends_with("Content-Length: 25\r\n\r\n"));
        assert_eq!(chunks[1..].iter().map(Bytes::len).collect::<Vec<_>>(), [10, 10, 5]);
    }

    #[tokio::test]
    async fn no_body_only_head() {
        let mut resp = Response::default();
        resp.error(StatusCode::NoContent);
        resp.prepare_response(&request(&[]), &RespLimits::default()).unwrap();

        assert_eq!(collect(resp.sender(10)).await.len(), 1);
    }

    #[tokio::test]
    async fn unbuffered_file_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.bin");
        let content: Vec<u8> = (0..100u8).collect();
        std::fs::write(&path, &content).unwrap();

        let cache = crate::store::cache::FileCache::new(&crate::limits::CacheLimits {
            max_size: 10,
            ..Default::default()
        });
        let file = cache.get(&path).unwrap();

        let mut resp = Response::default();
        resp.file(StatusCode::Ok, &file).unwrap();
        resp.prepare_response(&request(&["Range: bytes=10-"]), &RespLimits::default()).unwrap();

        let chunks = collect(resp.sender(32)).await;
        let body: Vec<u8> = chunks[1..].concat();
        assert_eq!(body, &content[10..]);
        assert_eq!(chunks[1..].iter().map(Bytes::len).collect::<Vec<_>>(), [32, 32, 26]);
    }

    #[tokio::test]
    async fn unbuffered_file_opened_by_sender() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.bin");
        std::fs::write(&path, [7u8; 64]).unwrap();

        let cache = crate::store::cache::FileCache::new(&crate::limits::CacheLimits {
            max_size: 10,
            ..Default::default()
        });
        let file = cache.get(&path).unwrap();

        let mut resp = Response::default();
        resp.file(StatusCode::Ok, &file).unwrap();
        resp.prepare_response(&request(&[]), &RespLimits::default()).unwrap();
        std::fs::remove_file(&path).unwrap();

        let mut sender = resp.sender(32);
        assert!(sender.next().await.unwrap().is_some());
        assert!(sender.next().await.is_err());
    }
}
