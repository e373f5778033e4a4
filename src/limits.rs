//! Server configuration: limits, timeouts and feature switches
//!
//! Every struct carries conservative defaults. Change only what you need and
//! keep the rest with `..Default::default()`.
//!
//! # Examples
//!
//! ```no_run
//! use wicket::{Router, Server, limits::{ConnLimits, ReqLimits, ServerLimits}};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     Server::builder()
//!         .listener(Server::bind("127.0.0.1:8080".parse().unwrap()).unwrap())
//!         .router(Router::new())
//!         .server_limits(ServerLimits {
//!             max_connections: 500,
//!             ..ServerLimits::default()
//!         })
//!         .connection_limits(ConnLimits {
//!             socket_read_timeout: Duration::from_secs(10),
//!             ..ConnLimits::default()
//!         })
//!         .request_limits(ReqLimits {
//!             body_size: 16 * 1024 * 1024,
//!             ..ReqLimits::default()
//!         })
//!         .build()
//!         .launch()
//!         .await;
//! }
//! ```

use crate::{errors::Error, http::response::Response};
use std::{io, time::Duration};
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    time::timeout,
};

/// Controls server-level concurrency, queueing and error formatting.
///
/// # Connection management
/// ```text
///                            [------------]
///                            [ Tcp accept ]
///                            [------------]
///                                  ||
///                                  \/
/// [--------------]   Yes   /----------------\   No   [-------------]
/// [ Add to queue ] <====== | Queue has room? | ====> [ Sending 503 ]
/// [--------------]         \----------------/        [-------------]
///        ||
///        \/
/// [---------]   Yes   /--------------------------\   No   [------]
/// [ Worker  ] <====== | Is there a free worker?  | =====> [ Wait ]
/// [---------]         \--------------------------/        [------]
/// ```
///
/// Workers are long-lived tasks spawned once by [`ServerBuilder::build`](crate::ServerBuilder::build).
/// Each one drives a single connection at a time.
#[derive(Debug, Clone)]
pub struct ServerLimits {
    /// Number of connection workers, i.e. connections served at once (default: `100`).
    pub max_connections: usize,

    /// Accepted connections waiting for a worker (default: `250`).
    ///
    /// When the queue is full, new connections get an immediate `503`.
    pub max_pending_connections: usize,

    /// How idle workers wait for the queue (default: `Sleep(50µs)`).
    pub wait_strategy: WaitStrategy,

    /// Tasks answering queue overflow with `503` (default: `1`).
    ///
    /// With `0` overflowing connections are closed silently.
    pub count_503_handlers: usize,

    /// Error bodies as JSON (default: `true`)
    ///
    /// ```text
    /// HTTP/1.1 413 Payload Too Large\r
    /// Server: wicket/0.1.2\r
    /// Content-Type: application/json\r
    /// Content-Length: 53\r
    /// Connection: close\r
    /// \r
    /// {"error":"Request body too large","code":"BODY_TOO_LARGE"}
    /// ```
    /// With `false` the body is empty.
    pub json_errors: bool,

    /// Expose the diagnostic text of server faults in `500` bodies (default: `false`).
    pub debug_errors: bool,

    /// Threads running synchronous work offloaded by handlers, file cache
    /// loads and room hooks (default: `5`).
    pub worker_threads: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            max_connections: 100,
            max_pending_connections: 250,
            wait_strategy: WaitStrategy::Sleep(Duration::from_micros(50)),
            count_503_handlers: 1,
            json_errors: true,
            debug_errors: false,
            worker_threads: 5,

            _priv: (),
        }
    }
}

/// Strategy for worker task waiting when no connections are available
#[derive(Debug, Clone)]
pub enum WaitStrategy {
    /// Spin with [`tokio::task::yield_now()`]. Burns a core while idle.
    Yield,

    /// Sleep with [`tokio::time::sleep()`] between polls.
    Sleep(Duration),
}

/// Connection-level limits and timeouts
#[derive(Debug, Clone)]
pub struct ConnLimits {
    /// Time allowed for each header line and body read (default: `5 seconds`).
    ///
    /// Expiry while reading a request answers `408 Request Timeout`.
    pub socket_read_timeout: Duration,

    /// Time allowed for each write to the socket (default: `3 seconds`).
    pub socket_write_timeout: Duration,

    /// Requests served on one keep-alive connection (default: `100`).
    pub max_requests_per_connection: usize,

    /// Maximum age of a keep-alive connection (default: `2 minutes`).
    ///
    /// Upgraded connections are not bound by it.
    pub connection_lifetime: Duration,

    /// Read and send quantum (default: `50 KiB`).
    pub chunk_size: usize,

    /// Frames buffered for one upgraded connection before it is dropped as
    /// a slow consumer (default: `64`).
    pub outbound_queue: usize,

    /// Largest WebSocket message, single frame or reassembled, accepted
    /// from a client (default: `1 MiB`).
    ///
    /// Bigger messages end the connection with a protocol error.
    pub message_size: u64,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ConnLimits {
    #[inline(always)]
    fn default() -> Self {
        Self {
            socket_read_timeout: Duration::from_secs(5),
            socket_write_timeout: Duration::from_secs(3),
            max_requests_per_connection: 100,
            connection_lifetime: Duration::from_secs(120),
            chunk_size: 50 * 1024,
            outbound_queue: 64,
            message_size: 1024 * 1024,

            _priv: (),
        }
    }
}

impl ConnLimits {
    #[inline]
    pub(crate) async fn write_bytes<W>(&self, stream: &mut W, bytes: &[u8]) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        match timeout(self.socket_write_timeout, stream.write_all(bytes)).await {
            Ok(result) => result,
            Err(_) => Err(io::ErrorKind::TimedOut.into()),
        }
    }

    /// Best-effort error response; write failures are reported to the caller
    /// which is free to ignore them.
    #[inline]
    pub(crate) async fn send_error<W>(
        &self,
        stream: &mut W,
        error: &Error,
        response: Response,
        server: &ServerLimits,
    ) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let bytes = response.into_failure(error, server).to_bytes();
        self.write_bytes(stream, &bytes).await?;
        stream.flush().await
    }
}

/// Request parsing limits
///
/// # Body storage
///
/// Declared bodies up to `memory_body_size` are buffered in memory, larger
/// ones are spilled to an anonymous temporary file:
/// ```text
/// Content-Length <= memory_body_size  ->  Vec<u8>
/// Content-Length >  memory_body_size  ->  tempfile
/// Content-Length >  body_size         ->  413 Payload Too Large
/// ```
#[derive(Debug, Clone)]
pub struct ReqLimits {
    /// Maximum length of the request line and of every header line (default: `8 KiB`).
    ///
    /// Longer lines answer `431`.
    pub line_size: usize,

    /// Maximum number of header fields (default: `100`).
    pub header_count: usize,

    /// Maximum number of query parameters (default: `64`).
    pub url_query_parts: usize,

    /// Maximum declared body length and WebSocket frame payload (default: `1 GiB`).
    pub body_size: u64,

    /// Spill-to-disk threshold for request bodies (default: `100 KiB`).
    pub memory_body_size: u64,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ReqLimits {
    fn default() -> Self {
        Self {
            line_size: 8 * 1024,
            header_count: 100,
            url_query_parts: 64,
            body_size: 1024 * 1024 * 1024,
            memory_body_size: 100 * 1024,

            _priv: (),
        }
    }
}

/// Response finalization switches
#[derive(Debug, Clone)]
pub struct RespLimits {
    /// Gzip in-memory bodies for clients that accept it (default: `false`).
    ///
    /// A handler may override it per response with
    /// [`Response::compress`](crate::Response::compress).
    pub gzip: bool,

    /// Value of the `Server` field added to every response (default: `wicket/<version>`).
    pub server_name: String,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for RespLimits {
    fn default() -> Self {
        Self {
            gzip: false,
            server_name: concat!("wicket/", env!("CARGO_PKG_VERSION")).to_owned(),

            _priv: (),
        }
    }
}

/// Static file cache ceiling
#[derive(Debug, Clone)]
pub struct CacheLimits {
    /// Aggregate size of buffered files in bytes (default: `100 MiB`).
    ///
    /// Files bigger than this are streamed from disk on every request.
    pub max_size: u64,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for CacheLimits {
    fn default() -> Self {
        Self {
            max_size: 100 * 1024 * 1024,
            _priv: (),
        }
    }
}

/// Session store settings
#[derive(Debug, Clone)]
pub struct SessionLimits {
    /// Idle time after which a session expires (default: `60 seconds`).
    pub ttl: Duration,

    /// Cookie carrying the session id (default: `session_id`).
    pub cookie_name: String,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            cookie_name: "session_id".to_owned(),
            _priv: (),
        }
    }
}

/// Every limit a connection consults, bundled once at build time.
#[derive(Debug, Clone, Default)]
pub(crate) struct AllLimits {
    pub(crate) server: ServerLimits,
    pub(crate) conn: ConnLimits,
    pub(crate) req: ReqLimits,
    pub(crate) resp: RespLimits,
    pub(crate) cache: CacheLimits,
    pub(crate) session: SessionLimits,
}
