use crate::{
    errors::Error,
    http::{
        header::RequestHeader,
        response::Response,
        types::{Method, Version},
    },
    limits::ConnLimits,
    server::{
        handler::{DynHandler, Exchange, Prepare, Upgrade},
        pool::panic_message,
        server_impl::Shared,
    },
    websocket::{client::WsClient, room::Outbound},
};
use futures_util::FutureExt;
use std::{
    mem,
    net::SocketAddr,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
    time::Instant,
};
use tokio::{
    io::{
        split, AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt,
        BufReader, ReadHalf, WriteHalf,
    },
    sync::mpsc,
    time::timeout,
};

/// Drives one transport from the first request line to close.
///
/// ```text
/// read head -> route -> prepare -+- Continue -> body -> execute -> send -+- keep-alive -> read head
///                                |                                     +- close
///                                +- Upgrade -> 101 -> reader | writer -> close
///                                +- Abort -> close
/// ```
/// Any error ends the connection after one best-effort error response.
pub(crate) struct HttpConnection<S> {
    reader: BufReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
    addr: SocketAddr,
    shared: Arc<Shared>,

    connection: Connection,
    head_sent: bool,
}

enum Next {
    KeepAlive,
    Close,
}

struct Failure {
    error: Error,
    response: Option<Response>,
}

impl From<Error> for Failure {
    #[inline]
    fn from(error: Error) -> Self {
        Self {
            error,
            response: None,
        }
    }
}

impl<S> HttpConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub(crate) fn new(stream: S, addr: SocketAddr, shared: Arc<Shared>) -> Self {
        let (reader, writer) = split(stream);

        Self {
            reader: BufReader::new(reader),
            writer,
            addr,
            shared,

            connection: Connection::new(),
            head_sent: false,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            self.head_sent = false;

            match self.serve_one().await {
                Ok(Next::KeepAlive) => self.connection.request_count += 1,
                Ok(Next::Close) => break,
                Err(failure) => {
                    self.fail(failure).await;
                    break;
                }
            }
        }

        let _ = self.writer.shutdown().await;
    }

    async fn serve_one(&mut self) -> Result<Next, Failure> {
        let shared = self.shared.clone();
        let Some(mut request) = self.read_head().await? else {
            return Ok(Next::Close);
        };

        let resolved = shared.router.resolve(request.url().path());
        request.url_mut().captures = resolved.captures;

        let response = Response::with_fields(&shared.base_fields, request.version());
        let mut ex = Exchange::new(request, response, resolved.user_data, self.addr, shared.clone());
        let mut handler = (resolved.factory)();

        match self.dispatch(handler.as_mut(), &mut ex).await {
            Ok(next) => Ok(next),
            Err(error) => Err(Failure {
                error,
                response: Some(mem::take(&mut ex.response)),
            }),
        }
    }

    /// `None` when the peer closed (or an idle keep-alive connection timed
    /// out) before sending anything.
    async fn read_head(&mut self) -> Result<Option<RequestHeader>, Error> {
        let limits = &self.shared.limits;
        let read_timeout = limits.conn.socket_read_timeout;
        let line_size = limits.req.line_size;

        let mut request = RequestHeader::new(limits.req.header_count, limits.req.url_query_parts);
        let mut line = Vec::with_capacity(256);

        loop {
            match timeout(read_timeout, read_line(&mut self.reader, &mut line, line_size)).await {
                Ok(result) => result?,
                Err(_) if self.is_idle(&request, &line) => return Ok(None),
                Err(_) => return Err(Error::RequestTimeout),
            }

            if line.is_empty() {
                return match request.is_valid() {
                    true => Err(Error::StreamEnd),
                    false => Ok(None),
                };
            }
            if !line.ends_with(b"\n") {
                return Err(Error::StreamEnd);
            }
            if !request.is_valid() && matches!(line.as_slice(), b"\r\n" | b"\n") {
                continue;
            }

            if request.parse_line(&line)? {
                return Ok(Some(request));
            }
        }
    }

    #[inline]
    fn is_idle(&self, request: &RequestHeader, line: &[u8]) -> bool {
        self.connection.request_count > 0 && !request.is_valid() && line.is_empty()
    }

    async fn dispatch(&mut self, handler: &mut dyn DynHandler, ex: &mut Exchange) -> Result<Next, Error> {
        let shared = self.shared.clone();
        let limits = &shared.limits;

        match guard(|| handler.prepare(ex))? {
            Prepare::Abort => {
                tracing::debug!(client = %self.addr, url = %ex.request.url().full(), "Request aborted");
                Ok(Next::Close)
            }
            Prepare::Upgrade => {
                let upgrade = ex
                    .take_upgrade()
                    .ok_or_else(|| Error::internal("upgrade without a protocol handler"))?;

                ex.response.prepare_response(&ex.request, &limits.resp)?;
                self.log(ex);
                self.send(mem::take(&mut ex.response), true).await?;

                self.run_upgrade(upgrade).await;
                Ok(Next::Close)
            }
            Prepare::Continue => {
                self.read_body(handler, ex).await?;

                AssertUnwindSafe(handler.execute(ex))
                    .catch_unwind()
                    .await
                    .map_err(|panic| Error::Internal(panic_message(panic.as_ref())))??;

                ex.response.prepare_response(&ex.request, &limits.resp)?;

                let keep_alive = self.keep_alive(&ex.request);
                ex.response.field("Connection", if keep_alive { "keep-alive" } else { "close" });
                self.log(ex);

                let head_only = ex.request.method() == Method::Head;
                self.send(mem::take(&mut ex.response), head_only).await?;

                Ok(if keep_alive { Next::KeepAlive } else { Next::Close })
            }
        }
    }

    async fn read_body(&mut self, handler: &mut dyn DynHandler, ex: &mut Exchange) -> Result<(), Error> {
        let shared = self.shared.clone();
        let limits = &shared.limits;

        let Some(length) = ex.request.content_length()? else {
            return Ok(());
        };
        if length > limits.req.body_size {
            return Err(Error::BodyTooLarge);
        }

        let mut remaining = length;
        let mut chunk = vec![0; (limits.conn.chunk_size as u64).min(length).max(1) as usize];

        while remaining > 0 {
            let want = remaining.min(chunk.len() as u64) as usize;
            let read = timeout(limits.conn.socket_read_timeout, self.reader.read(&mut chunk[..want])).await??;
            if read == 0 {
                return Err(Error::StreamEnd);
            }

            guard(|| handler.feed(ex, &chunk[..read]))?;
            remaining -= read as u64;
        }

        Ok(())
    }

    async fn send(&mut self, response: Response, head_only: bool) -> Result<(), Error> {
        let shared = self.shared.clone();
        let conn = &shared.limits.conn;
        self.head_sent = true;

        match head_only {
            true => conn.write_bytes(&mut self.writer, &response.header.to_bytes()).await?,
            false => {
                let mut sender = response.sender(conn.chunk_size);
                while let Some(chunk) = sender.next().await? {
                    conn.write_bytes(&mut self.writer, &chunk).await?;
                }
            }
        }

        self.writer.flush().await?;
        Ok(())
    }

    async fn run_upgrade(&mut self, upgrade: Upgrade) {
        let Upgrade {
            mut client,
            mut outbound,
        } = upgrade;
        let shared = self.shared.clone();
        let conn = &shared.limits.conn;

        let handle = client.handle().clone();
        client.open().await;

        let result = tokio::select! {
            result = read_frames(&mut self.reader, &mut client, conn.chunk_size) => result,
            result = write_frames(&mut self.writer, &mut outbound, conn) => result,
            _ = handle.stalled() => Err(Error::Overflow),
        };

        // The close echo is still queued when the client closed first.
        if result.is_ok() {
            while let Ok(Outbound::Data(bytes)) = outbound.try_recv() {
                if conn.write_bytes(&mut self.writer, &bytes).await.is_err() {
                    break;
                }
            }
            let _ = self.writer.flush().await;
        }

        tracing::debug!(client = %self.addr, id = client.handle().id(), clean = result.is_ok(), "Upgraded connection closed");
        client.finish(result.err()).await;
    }

    async fn fail(&mut self, failure: Failure) {
        let Failure { error, response } = failure;

        if error.is_transport() {
            tracing::debug!(client = %self.addr, error = %error, "Connection dropped");
            return;
        }

        let status = error.status().as_u16();
        match status >= 500 {
            true => tracing::error!(client = %self.addr, status, error = %error, "Request failed"),
            false => tracing::warn!(client = %self.addr, status, error = %error, "Request rejected"),
        }

        if self.head_sent {
            return;
        }

        let shared = self.shared.clone();
        let response = response.unwrap_or_else(|| Response::with_fields(&shared.base_fields, Version::Http11));
        let _ = shared
            .limits
            .conn
            .send_error(&mut self.writer, &error, response, &shared.limits.server)
            .await;
    }

    fn keep_alive(&self, request: &RequestHeader) -> bool {
        let limits = &self.shared.limits.conn;

        request.keep_alive()
            && self.connection.request_count + 1 < limits.max_requests_per_connection
            && self.connection.created.elapsed() < limits.connection_lifetime
    }

    fn log(&self, ex: &Exchange) {
        tracing::info!(
            status = ex.response.header.code(),
            reason = %ex.response.header.reason(),
            client = %self.addr,
            method = %ex.request.method(),
            url = %ex.request.url().full(),
            "Request served"
        );
    }
}

#[derive(Debug)]
struct Connection {
    created: Instant,
    request_count: usize,
}

impl Connection {
    #[inline(always)]
    fn new() -> Self {
        Self {
            created: Instant::now(),
            request_count: 0,
        }
    }
}

/// Reads up to and including `\n`; a line that stops short of it means EOF.
async fn read_line<R>(reader: &mut R, line: &mut Vec<u8>, limit: usize) -> Result<(), Error>
where
    R: AsyncBufRead + Unpin,
{
    line.clear();

    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(());
        }

        let (take, done) = match memchr::memchr(b'\n', available) {
            Some(end) => (end + 1, true),
            None => (available.len(), false),
        };
        if line.len() + take > limit {
            return Err(Error::LineTooLong);
        }

        line.extend_from_slice(&available[..take]);
        reader.consume(take);

        if done {
            return Ok(());
        }
    }
}

async fn read_frames<R>(reader: &mut R, client: &mut WsClient, chunk_size: usize) -> Result<(), Error>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = vec![0; chunk_size.max(1)];

    loop {
        let read = reader.read(&mut buffer).await?;
        if read == 0 {
            return Err(Error::StreamEnd);
        }
        if !client.feed(&buffer[..read]).await? {
            return Ok(());
        }
    }
}

async fn write_frames<W>(writer: &mut W, outbound: &mut mpsc::Receiver<Outbound>, conn: &ConnLimits) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    while let Some(item) = outbound.recv().await {
        match item {
            Outbound::Data(bytes) => {
                conn.write_bytes(writer, &bytes).await?;
                writer.flush().await?;
            }
            Outbound::Close => break,
        }
    }
    Ok(())
}

/// Runs a synchronous hook, turning a panic into a `500`.
fn guard<T>(hook: impl FnOnce() -> Result<T, Error>) -> Result<T, Error> {
    catch_unwind(AssertUnwindSafe(hook)).unwrap_or_else(|panic| Err(Error::Internal(panic_message(panic.as_ref()))))
}
