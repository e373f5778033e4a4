use crate::{
    errors::Error,
    http::{
        response::Response,
        types::{Fields, Version},
    },
    limits::{
        AllLimits, CacheLimits, ConnLimits, ReqLimits, RespLimits, ServerLimits, SessionLimits,
        WaitStrategy,
    },
    server::{connection::HttpConnection, pool::WorkerPool, router::Router},
    store::{cache::FileCache, session::SessionStore},
};
use crossbeam::queue::SegQueue;
use socket2::{Domain, Protocol, Socket, Type};
use std::{fmt::Display, io, net::SocketAddr, sync::Arc};
use tokio::{
    net::{TcpListener, TcpStream},
    task::yield_now,
    time::sleep as tokio_sleep,
};

/// State owned by one server and shared by all of its connections.
pub(crate) struct Shared {
    pub(crate) router: Router,
    pub(crate) cache: FileCache,
    pub(crate) sessions: SessionStore,
    pub(crate) pool: Arc<WorkerPool>,
    pub(crate) limits: AllLimits,
    pub(crate) base_fields: Fields,
}

impl Shared {
    pub(crate) fn new(router: Router, limits: AllLimits, mut base_fields: Fields) -> Self {
        if !base_fields.contains("Server") {
            base_fields.set("Server", &limits.resp.server_name);
        }

        Self {
            router,
            cache: FileCache::new(&limits.cache),
            sessions: SessionStore::new(&limits.session),
            pool: Arc::new(WorkerPool::new(limits.server.worker_threads)),
            limits,
            base_fields,
        }
    }
}

/// An HTTP server that processes incoming connections and requests.
///
/// Connection workers are spawned once by [`ServerBuilder::build`] and
/// pull accepted streams from a bounded queue.
///
/// # Examples
///
/// ```no_run
/// use wicket::{Error, Exchange, Handler, Router, Server, StatusCode};
///
/// struct Hello;
///
/// impl Handler for Hello {
///     async fn get(&mut self, ex: &mut Exchange) -> Result<(), Error> {
///         ex.response.text(StatusCode::Ok, "Hello world!");
///         Ok(())
///     }
/// }
///
/// #[tokio::main]
/// async fn main() {
///     Server::builder()
///         .listener(Server::bind("127.0.0.1:8080".parse().unwrap()).unwrap())
///         .router(Router::new().route("/", || Hello).unwrap())
///         .build()
///         .launch()
///         .await
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    stream_queue: TcpQueue,
    error_queue: TcpQueue,
    server_limits: ServerLimits,
}

impl Server {
    /// Creates a new builder for configuring the server instance.
    #[inline]
    pub fn builder() -> ServerBuilder {
        ServerBuilder {
            listener: None,
            router: None,
            base_fields: Fields::new(),

            server_limits: None,
            connection_limits: None,
            request_limits: None,
            response_limits: None,
            cache_limits: None,
            session_limits: None,
        }
    }

    /// Binds a listener with `SO_REUSEADDR` set, ready for
    /// [`ServerBuilder::listener`]. Must run inside a tokio runtime.
    pub fn bind(addr: SocketAddr) -> io::Result<TcpListener> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(1024)?;

        TcpListener::from_std(socket.into())
    }

    /// Starts the server and begins accepting incoming connections.
    #[inline]
    pub async fn launch(self) {
        if let Ok(addr) = self.listener.local_addr() {
            tracing::info!(%addr, workers = self.server_limits.max_connections, "Server started");
        }

        loop {
            let value = match self.listener.accept().await {
                Ok(value) => value,
                Err(err) => {
                    tracing::warn!(error = %err, "Accept failed");
                    continue;
                }
            };

            match self.stream_queue.len() < self.server_limits.max_pending_connections {
                true => self.stream_queue.push(value),
                false => {
                    tracing::warn!(client = %value.1, "Connection queue full");
                    self.error_queue.push(value)
                }
            }
        }
    }

    #[inline]
    async fn get_stream(queue: &TcpQueue, wait: &WaitStrategy) -> (TcpStream, SocketAddr) {
        loop {
            if let Some(value) = queue.pop() {
                return value;
            }

            match wait {
                WaitStrategy::Yield => yield_now().await,
                WaitStrategy::Sleep(time) => tokio_sleep(*time).await,
            }
        }
    }
}

//

/// Builder for configuring and creating [`Server`] instances.
///
/// [`listener`](Self::listener) and [`router`](Self::router) are required;
/// every limits struct falls back to its `Default`.
pub struct ServerBuilder {
    listener: Option<TcpListener>,
    router: Option<Router>,
    base_fields: Fields,

    server_limits: Option<ServerLimits>,
    connection_limits: Option<ConnLimits>,
    request_limits: Option<ReqLimits>,
    response_limits: Option<RespLimits>,
    cache_limits: Option<CacheLimits>,
    session_limits: Option<SessionLimits>,
}

impl ServerBuilder {
    /// Sets the TCP listener that the server will use to accept connections.
    ///
    /// **This is a required component.**
    #[inline(always)]
    pub fn listener(mut self, listener: TcpListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Sets the route table.
    ///
    /// **This is a required component.**
    #[inline(always)]
    pub fn router(mut self, router: Router) -> Self {
        self.router = Some(router);
        self
    }

    /// Adds a field sent with every response, errors included.
    ///
    /// ```no_run
    /// # #[tokio::main]
    /// # async fn main() {
    /// use wicket::{Router, Server};
    ///
    /// let server = Server::builder()
    ///     .listener(Server::bind("127.0.0.1:8080".parse().unwrap()).unwrap())
    ///     .router(Router::new())
    ///     .base_field("X-Frame-Options", "DENY")
    ///     .build();
    /// # }
    /// ```
    #[inline(always)]
    pub fn base_field<V: Display>(mut self, name: &str, value: V) -> Self {
        self.base_fields.set(name, value);
        self
    }

    /// Configures server-level concurrency and error formatting.
    ///
    /// ```no_run
    /// # #[tokio::main]
    /// # async fn main() {
    /// use wicket::{Router, Server, limits::ServerLimits};
    ///
    /// let server = Server::builder()
    ///     .listener(Server::bind("127.0.0.1:8080".parse().unwrap()).unwrap())
    ///     .router(Router::new())
    ///     .server_limits(ServerLimits {
    ///         max_connections: 2500,
    ///         max_pending_connections: 10000,
    ///         ..ServerLimits::default() // Required line
    ///     })
    ///     .build();
    /// # }
    /// ```
    #[inline(always)]
    pub fn server_limits(mut self, limits: ServerLimits) -> Self {
        self.server_limits = Some(limits);
        self
    }

    /// Configures connection timeouts and keep-alive limits.
    #[inline(always)]
    pub fn connection_limits(mut self, limits: ConnLimits) -> Self {
        self.connection_limits = Some(limits);
        self
    }

    /// Configures request parsing limits.
    #[inline(always)]
    pub fn request_limits(mut self, limits: ReqLimits) -> Self {
        self.request_limits = Some(limits);
        self
    }

    #[inline(always)]
    pub fn response_limits(mut self, limits: RespLimits) -> Self {
        self.response_limits = Some(limits);
        self
    }

    #[inline(always)]
    pub fn cache_limits(mut self, limits: CacheLimits) -> Self {
        self.cache_limits = Some(limits);
        self
    }

    #[inline(always)]
    pub fn session_limits(mut self, limits: SessionLimits) -> Self {
        self.session_limits = Some(limits);
        self
    }

    /// Finalizes the builder and spawns the connection workers.
    ///
    /// Must run inside a tokio runtime.
    ///
    /// # Panics
    ///
    /// Error messages:
    /// - ``The `listener` method must be called to create``
    /// - ``The `router` method must be called to create``
    #[inline]
    #[track_caller]
    pub fn build(self) -> Server {
        let (listener, shared) = self.get_all_parts();

        let stream_queue = Arc::new(SegQueue::new());
        let error_queue = Arc::new(SegQueue::new());

        for _ in 0..shared.limits.server.max_connections {
            Self::spawn_worker(&stream_queue, &shared);
        }
        if shared.limits.server.count_503_handlers != 0 {
            for _ in 0..shared.limits.server.count_503_handlers {
                Self::spawn_alarmist(&error_queue, &shared);
            }
        } else {
            Self::spawn_quiet_alarmist(&error_queue, &shared);
        }

        Server {
            listener,
            stream_queue,
            error_queue,
            server_limits: shared.limits.server.clone(),
        }
    }

    #[inline]
    fn spawn_worker(queue: &TcpQueue, shared: &Arc<Shared>) {
        let queue = queue.clone();
        let shared = shared.clone();

        tokio::spawn(async move {
            loop {
                let (stream, addr) = Server::get_stream(&queue, &shared.limits.server.wait_strategy).await;
                let _ = stream.set_nodelay(true);

                HttpConnection::new(stream, addr, shared.clone()).run().await;
            }
        });
    }

    #[inline]
    fn spawn_alarmist(queue: &TcpQueue, shared: &Arc<Shared>) {
        let queue = queue.clone();
        let shared = shared.clone();

        tokio::spawn(async move {
            let limits = &shared.limits;

            loop {
                let (mut stream, _) = Server::get_stream(&queue, &limits.server.wait_strategy).await;

                let response = Response::with_fields(&shared.base_fields, Version::Http11);
                let _ = limits
                    .conn
                    .send_error(&mut stream, &Error::ServiceUnavailable, response, &limits.server)
                    .await;
            }
        });
    }

    #[inline]
    fn spawn_quiet_alarmist(queue: &TcpQueue, shared: &Arc<Shared>) {
        let queue = queue.clone();
        let shared = shared.clone();

        tokio::spawn(async move {
            loop {
                let (stream, _) = Server::get_stream(&queue, &shared.limits.server.wait_strategy).await;

                drop(stream);
            }
        });
    }

    #[inline]
    #[track_caller]
    fn get_all_parts(self) -> (TcpListener, Arc<Shared>) {
        let listener = self
            .listener
            .expect("The `listener` method must be called to create");
        let router = self
            .router
            .expect("The `router` method must be called to create");

        let limits = AllLimits {
            server: self.server_limits.unwrap_or_default(),
            conn: self.connection_limits.unwrap_or_default(),
            req: self.request_limits.unwrap_or_default(),
            resp: self.response_limits.unwrap_or_default(),
            cache: self.cache_limits.unwrap_or_default(),
            session: self.session_limits.unwrap_or_default(),
        };

        (listener, Arc::new(Shared::new(router, limits, self.base_fields)))
    }
}

type TcpQueue = Arc<SegQueue<(TcpStream, SocketAddr)>>;

#[cfg(test)]
mod server_tests {
    use super::*;
    use crate::{Client, Exchange, Handler, StatusCode};
    use tokio::io::AsyncReadExt;

    struct Hello;

    impl Handler for Hello {
        async fn get(&mut self, ex: &mut Exchange) -> Result<(), Error> {
            let name = ex.capture(0).unwrap_or("world").to_owned();
            ex.response.text(StatusCode::Ok, format!("Hello, {name}!"));
            Ok(())
        }
    }

    fn router() -> Router {
        Router::new().route("/hello/(\\w+)", || Hello).unwrap()
    }

    #[test]
    fn shared_sets_server_field_once() {
        let shared = Shared::new(Router::new(), AllLimits::default(), Fields::new());
        assert!(shared.base_fields.get("Server").unwrap().starts_with("wicket/"));

        let mut fields = Fields::new();
        fields.set("Server", "custom");
        let shared = Shared::new(Router::new(), AllLimits::default(), fields);
        assert_eq!(shared.base_fields.get("Server"), Some("custom"));
        assert_eq!(shared.base_fields.len(), 1);
    }

    #[tokio::test]
    async fn serves_over_tcp() {
        let listener = Server::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();

        let server = Server::builder()
            .listener(listener)
            .router(router())
            .server_limits(ServerLimits {
                max_connections: 2,
                ..ServerLimits::default()
            })
            .base_field("X-Test", 1)
            .build();
        tokio::spawn(server.launch());

        let response = Client::new().get(&format!("http://{addr}/hello/tcp")).await.unwrap();
        assert_eq!(response.header.code(), 200);
        assert_eq!(response.header.fields.get("X-Test"), Some("1"));
        assert_eq!(response.body, b"Hello, tcp!");
    }

    #[tokio::test]
    async fn overflow_gets_503() {
        let listener = Server::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();

        let server = Server::builder()
            .listener(listener)
            .router(router())
            .server_limits(ServerLimits {
                max_connections: 0,
                max_pending_connections: 0,
                ..ServerLimits::default()
            })
            .build();
        tokio::spawn(server.launch());

        let mut stream = TcpStream::connect(addr).await.unwrap();

        let mut output = Vec::new();
        stream.read_to_end(&mut output).await.unwrap();
        let output = String::from_utf8(output).unwrap();

        assert!(output.starts_with("HTTP/1.1 503 Service Unavailable\r\n"), "{output}");
        assert!(output.contains("SERVICE_UNAVAILABLE"));
    }
}
