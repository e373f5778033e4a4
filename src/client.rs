//! Minimal outbound HTTP/1.1 client and multipart encoder.

use crate::{
    errors::Error,
    http::{
        codec,
        header::ResponseHeader,
        types::{Fields, Method},
    },
};
use std::time::Duration;
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    time::timeout,
};

/// Received response: head plus the whole body.
#[derive(Debug)]
pub struct ClientResponse {
    pub header: ResponseHeader,
    pub body: Vec<u8>,
}

impl ClientResponse {
    pub fn text(&self) -> Result<&str, Error> {
        simdutf8::basic::from_utf8(&self.body).map_err(|_| Error::Internal("response body is not UTF-8".to_owned()))
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, Error> {
        serde_json::from_slice(&self.body).map_err(Error::internal)
    }
}

/// One-shot requests over plain TCP, one connection per request.
///
/// Only `http://` URLs are accepted; TLS is left to the transport.
///
/// ```no_run
/// # #[tokio::main]
/// # async fn main() -> Result<(), wicket::Error> {
/// use wicket::Client;
///
/// let response = Client::new().get("http://127.0.0.1:8080/json").await?;
/// println!("{} {}", response.header.code(), response.text()?);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Client {
    /// Limit for connecting and for every read of the response.
    pub timeout: Duration,
    /// Longest accepted status or field line.
    pub line_size: usize,
}

impl Default for Client {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            line_size: 8 * 1024,
        }
    }
}

impl Client {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, url: &str) -> Result<ClientResponse, Error> {
        self.request(Method::Get, url, None).await
    }

    pub async fn post<B: Into<Vec<u8>>>(&self, url: &str, content_type: &str, body: B) -> Result<ClientResponse, Error> {
        self.request(Method::Post, url, Some((content_type, body.into()))).await
    }

    pub async fn post_multipart(&self, url: &str, form: &Multipart) -> Result<ClientResponse, Error> {
        self.request(Method::Post, url, Some((&form.content_type(), form.to_bytes())))
            .await
    }

    /// Sends `method url` with an optional `(content type, body)` and reads
    /// the response until `Content-Length` bytes or EOF.
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        body: Option<(&str, Vec<u8>)>,
    ) -> Result<ClientResponse, Error> {
        let (host, target) = split_url(url)?;

        let mut fields = Fields::new();
        fields.set("Host", host.trim_end_matches(":80"));
        fields.set("Connection", "close");
        fields.set("Content-Length", body.as_ref().map_or(0, |(_, body)| body.len()));
        if let Some((content_type, _)) = &body {
            fields.set("Content-Type", content_type);
        }

        let mut head = Vec::with_capacity(256);
        codec::write_request_head(&mut head, method, target, &fields);

        let mut stream = timeout(self.timeout, TcpStream::connect(&host)).await??;
        stream.write_all(&head).await?;
        if let Some((_, body)) = &body {
            stream.write_all(body).await?;
        }
        stream.flush().await?;

        tracing::debug!(%method, %url, "Request sent");
        self.read_response(stream).await
    }

    async fn read_response(&self, stream: TcpStream) -> Result<ClientResponse, Error> {
        let mut reader = BufReader::new(stream);
        let mut header = ResponseHeader::new();
        let mut line = Vec::with_capacity(256);

        loop {
            line.clear();
            let read = timeout(self.timeout, (&mut reader).take(self.line_size as u64).read_until(b'\n', &mut line)).await??;

            if read == 0 {
                return Err(Error::StreamEnd);
            }
            if !line.ends_with(b"\n") {
                return Err(Error::LineTooLong);
            }
            if header.parse_line(&line)? {
                break;
            }
        }

        let length = match header.fields.get("Content-Length") {
            Some(value) => Some(value.parse::<u64>().map_err(|_| Error::InvalidContentLength)?),
            None => None,
        };

        let mut body = Vec::new();
        match length {
            Some(length) => {
                timeout(self.timeout, (&mut reader).take(length).read_to_end(&mut body)).await??;
                if (body.len() as u64) < length {
                    return Err(Error::StreamEnd);
                }
            }
            None => {
                timeout(self.timeout, reader.read_to_end(&mut body)).await??;
            }
        }

        Ok(ClientResponse { header, body })
    }
}

/// `http://host[:port]/path?query` into a connect address and a target.
fn split_url(url: &str) -> Result<(String, &str), Error> {
    let rest = match url.split_once("://") {
        Some(("http", rest)) => rest,
        Some(_) => return Err(Error::InvalidUrl),
        None => url,
    };

    let (host, target) = match rest.find('/') {
        Some(index) => rest.split_at(index),
        None => (rest, "/"),
    };
    if host.is_empty() {
        return Err(Error::InvalidUrl);
    }

    let host = match host.rsplit_once(':') {
        Some((_, port)) if port.parse::<u16>().is_ok() => host.to_owned(),
        _ => format!("{host}:80"),
    };
    Ok((host, target))
}

/// `multipart/form-data` body builder.
///
/// ```
/// use wicket::Multipart;
///
/// let mut form = Multipart::new();
/// form.add_field("title", "notes")
///     .add_file("upload", "notes.txt", "text/plain", "hello");
///
/// assert!(form.content_type().starts_with("multipart/form-data; boundary="));
/// assert_eq!(form.size(), form.to_bytes().len() as u64);
/// ```
#[derive(Debug, Clone)]
pub struct Multipart {
    boundary: String,
    parts: Vec<(Fields, Vec<u8>)>,
}

impl Default for Multipart {
    fn default() -> Self {
        Self::new()
    }
}

impl Multipart {
    pub fn new() -> Self {
        Self {
            boundary: uuid::Uuid::new_v4().simple().to_string(),
            parts: Vec::new(),
        }
    }

    #[inline]
    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// Part with arbitrary fields.
    pub fn add_part<B: Into<Vec<u8>>>(&mut self, fields: Fields, body: B) -> &mut Self {
        self.parts.push((fields, body.into()));
        self
    }

    pub fn add_field<B: Into<Vec<u8>>>(&mut self, name: &str, value: B) -> &mut Self {
        let mut fields = Fields::new();
        fields.set("Content-Disposition", format!("form-data; name=\"{name}\""));
        self.add_part(fields, value)
    }

    pub fn add_file<B: Into<Vec<u8>>>(&mut self, name: &str, filename: &str, content_type: &str, data: B) -> &mut Self {
        let mut fields = Fields::new();
        fields.set(
            "Content-Disposition",
            format!("form-data; name=\"{name}\"; filename=\"{filename}\""),
        );
        fields.set("Content-Type", content_type);
        self.add_part(fields, data)
    }

    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    /// Encoded length, the request's `Content-Length`.
    pub fn size(&self) -> u64 {
        let delimiter = self.boundary.len() + 4;
        let parts: usize = self
            .parts
            .iter()
            .map(|(fields, body)| {
                let mut head = Vec::new();
                fields.write_to(&mut head);
                delimiter + head.len() + 2 + body.len() + 2
            })
            .sum();

        (parts + delimiter + 2) as u64
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(self.size() as usize);

        for (fields, body) in &self.parts {
            buffer.extend_from_slice(b"--");
            buffer.extend_from_slice(self.boundary.as_bytes());
            buffer.extend_from_slice(b"\r\n");
            fields.write_to(&mut buffer);
            buffer.extend_from_slice(b"\r\n");
            buffer.extend_from_slice(body);
            buffer.extend_from_slice(b"\r\n");
        }

        buffer.extend_from_slice(b"--");
        buffer.extend_from_slice(self.boundary.as_bytes());
        buffer.extend_from_slice(b"--\r\n");
        buffer
    }
}

#[cfg(test)]
mod client_tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn urls() {
        let cases = [
            ("http://example.com/a?b=1", ("example.com:80", "/a?b=1")),
            ("http://127.0.0.1:8080", ("127.0.0.1:8080", "/")),
            ("localhost:9000/x", ("localhost:9000", "/x")),
        ];

        for (url, (host, target)) in cases {
            let (got_host, got_target) = split_url(url).unwrap();
            assert_eq!((got_host.as_str(), got_target), (host, target), "{url}");
        }

        assert!(matches!(split_url("https://example.com/"), Err(Error::InvalidUrl)));
        assert!(matches!(split_url("http:///path"), Err(Error::InvalidUrl)));
    }

    #[test]
    fn multipart_layout() {
        let mut form = Multipart::new();
        form.add_field("a", "1").add_file("f", "x.txt", "text/plain", "hi");

        let boundary = form.boundary().to_owned();
        let expected = format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"a\"\r\n\r\n1\r\n\
             --{boundary}\r\nContent-Disposition: form-data; name=\"f\"; filename=\"x.txt\"\r\n\
             Content-Type: text/plain\r\n\r\nhi\r\n\
             --{boundary}--\r\n"
        );

        assert_eq!(String::from_utf8(form.to_bytes()).unwrap(), expected);
        assert_eq!(form.size(), expected.len() as u64);
        assert_ne!(Multipart::new().boundary(), boundary);
    }

    /// Accepts one connection, captures the request head and answers `reply`.
    async fn serve_once(reply: &'static [u8]) -> (String, tokio::task::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(stream);
            let mut request = Vec::new();
            while !request.ends_with(b"\r\n\r\n") {
                reader.read_until(b'\n', &mut request).await.unwrap();
            }
            reader.get_mut().write_all(reply).await.unwrap();
            request
        });

        (format!("http://{addr}"), task)
    }

    #[tokio::test]
    async fn content_length_body() {
        let (base, task) = serve_once(b"HTTP/1.1 201 Created\r\nContent-Length: 5\r\nX-A: 1\r\n\r\nhello trailing").await;

        let response = Client::new().post(&format!("{base}/notes"), "text/plain", "").await.unwrap();
        assert_eq!(response.header.code(), 201);
        assert_eq!(response.header.reason(), "Created");
        assert_eq!(response.header.fields.get("x-a"), Some("1"));
        assert_eq!(response.text().unwrap(), "hello");

        let request = String::from_utf8(task.await.unwrap()).unwrap();
        assert!(request.starts_with("POST /notes HTTP/1.1\r\n"));
        assert!(request.contains("Connection: close\r\n"));
        assert!(request.contains("Content-Type: text/plain\r\n"));
    }

    #[tokio::test]
    async fn body_until_eof() {
        let (base, task) = serve_once(b"HTTP/1.0 200 OK\r\n\r\n{\"ok\":true}").await;

        let response = Client::new().get(&base).await.unwrap();
        let value: serde_json::Value = response.json().unwrap();
        assert_eq!(value, serde_json::json!({"ok": true}));

        let request = String::from_utf8(task.await.unwrap()).unwrap();
        assert!(request.starts_with("GET / HTTP/1.1\r\n"));
        assert!(request.contains("Content-Length: 0\r\n"));
    }
}
