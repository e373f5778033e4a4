//! The handler contract and the per-request exchange.

use crate::{
    errors::Error,
    http::{
        data::HttpData,
        header::{Cookie, RequestHeader},
        response::Response,
        types::{Method, StatusCode},
    },
    server::{router::UserData, server_impl::Shared},
    store::{cache::CachedFile, session::Session},
    websocket::{
        client::WsClient,
        room::{Outbound, Room},
    },
};
use futures_util::future::BoxFuture;
use std::{
    future::Future,
    net::SocketAddr,
    path::{Component, Path, PathBuf},
    sync::Arc,
};
use tokio::sync::mpsc;

/// Outcome of [`Handler::prepare`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prepare {
    /// Read the declared body, then run [`Handler::execute_request`].
    Continue,
    /// Send the upgrade response and hand the connection to the room.
    Upgrade,
    /// Close the connection without a response.
    Abort,
}

/// Application code for one route.
///
/// The router builds a fresh handler for every request. Only the hooks that
/// matter need an implementation: `prepare` defaults to body allocation (or
/// a WebSocket upgrade on routes with a room), `feed` to buffering, and the
/// verb methods to `405 Method Not Allowed`.
///
/// # Examples
///
/// ```
/// use wicket::{Error, Exchange, Handler, StatusCode};
///
/// struct Hello;
///
/// impl Handler for Hello {
///     async fn get(&mut self, ex: &mut Exchange) -> Result<(), Error> {
///         let name = ex.request.url().query("name").unwrap_or("world").to_owned();
///         ex.response.text(StatusCode::Ok, format!("Hello, {name}!"));
///         Ok(())
///     }
/// }
/// ```
///
/// Reading a JSON body:
/// ```
/// use wicket::{Error, Exchange, Handler, StatusCode};
///
/// #[derive(serde::Deserialize)]
/// struct Note {
///     text: String,
/// }
///
/// struct Notes;
///
/// impl Handler for Notes {
///     async fn post(&mut self, ex: &mut Exchange) -> Result<(), Error> {
///         let Some(body) = ex.body() else {
///             return Err(Error::Status(StatusCode::BadRequest));
///         };
///         let note: Note = body.json()?;
///
///         ex.response.json(StatusCode::Created, &serde_json::json!({ "len": note.text.len() }))?;
///         Ok(())
///     }
/// }
/// ```
#[allow(unused_variables)]
pub trait Handler: Send + 'static {
    /// Runs once the head is parsed, before any body byte is read.
    fn prepare(&mut self, ex: &mut Exchange) -> Result<Prepare, Error> {
        ex.prepare_default()
    }

    /// Receives the body in chunks of at most the connection's chunk size.
    fn feed(&mut self, ex: &mut Exchange, chunk: &[u8]) -> Result<(), Error> {
        ex.feed_body(chunk)
    }

    fn get(&mut self, ex: &mut Exchange) -> impl Future<Output = Result<(), Error>> + Send {
        async { Err(Error::MethodNotAllowed) }
    }

    fn put(&mut self, ex: &mut Exchange) -> impl Future<Output = Result<(), Error>> + Send {
        async { Err(Error::MethodNotAllowed) }
    }

    fn post(&mut self, ex: &mut Exchange) -> impl Future<Output = Result<(), Error>> + Send {
        async { Err(Error::MethodNotAllowed) }
    }

    fn delete(&mut self, ex: &mut Exchange) -> impl Future<Output = Result<(), Error>> + Send {
        async { Err(Error::MethodNotAllowed) }
    }

    /// Dispatches on the request method; `HEAD` goes through `get` and only
    /// the head of its response is sent.
    fn execute_request(&mut self, ex: &mut Exchange) -> impl Future<Output = Result<(), Error>> + Send {
        async move {
            match ex.request.method() {
                Method::Get | Method::Head => self.get(ex).await,
                Method::Put => self.put(ex).await,
                Method::Post => self.post(ex).await,
                Method::Delete => self.delete(ex).await,
                Method::Patch | Method::Options => Err(Error::MethodNotAllowed),
            }
        }
    }
}

/// Object-safe face of [`Handler`] used by the router.
pub(crate) trait DynHandler: Send {
    fn prepare(&mut self, ex: &mut Exchange) -> Result<Prepare, Error>;
    fn feed(&mut self, ex: &mut Exchange, chunk: &[u8]) -> Result<(), Error>;
    fn execute<'a>(&'a mut self, ex: &'a mut Exchange) -> BoxFuture<'a, Result<(), Error>>;
}

impl<H: Handler> DynHandler for H {
    #[inline]
    fn prepare(&mut self, ex: &mut Exchange) -> Result<Prepare, Error> {
        Handler::prepare(self, ex)
    }

    #[inline]
    fn feed(&mut self, ex: &mut Exchange, chunk: &[u8]) -> Result<(), Error> {
        Handler::feed(self, ex, chunk)
    }

    #[inline]
    fn execute<'a>(&'a mut self, ex: &'a mut Exchange) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(Handler::execute_request(self, ex))
    }
}

/// A connection switched to the WebSocket protocol.
pub(crate) struct Upgrade {
    pub(crate) client: WsClient,
    pub(crate) outbound: mpsc::Receiver<Outbound>,
}

/// Everything a handler sees of one request cycle.
pub struct Exchange {
    pub request: RequestHeader,
    pub response: Response,
    body: Option<HttpData>,
    user_data: UserData,
    addr: SocketAddr,
    shared: Arc<Shared>,
    session: Option<Arc<Session>>,
    upgrade: Option<Upgrade>,
}

impl Exchange {
    pub(crate) fn new(
        request: RequestHeader,
        response: Response,
        user_data: UserData,
        addr: SocketAddr,
        shared: Arc<Shared>,
    ) -> Self {
        Self {
            request,
            response,
            body: None,
            user_data,
            addr,
            shared,
            session: None,
            upgrade: None,
        }
    }

    /// Peer address.
    #[inline]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Route user data merged with router globals.
    #[inline]
    pub fn user_data(&self) -> &UserData {
        &self.user_data
    }

    #[inline]
    pub fn room(&self) -> Option<&Arc<Room>> {
        self.user_data.room()
    }

    /// Positional capture of the matched route.
    #[inline]
    pub fn capture(&self, index: usize) -> Option<&str> {
        self.request.url().capture(index)
    }

    /// Buffered body, `None` for requests without one.
    pub fn body(&mut self) -> Option<&mut HttpData> {
        self.body.as_mut()
    }

    pub fn take_body(&mut self) -> Option<HttpData> {
        self.body.take()
    }

    /// Sizes the body buffer from `Content-Length`.
    pub fn allocate_body(&mut self) -> Result<(), Error> {
        let limits = &self.shared.limits.req;
        let length = self.request.content_length()?.unwrap_or(0);

        if length > limits.body_size {
            return Err(Error::BodyTooLarge);
        }
        if length > 0 && self.body.is_none() {
            self.body = Some(HttpData::new(length, limits.memory_body_size)?);
        }
        Ok(())
    }

    /// Appends a body chunk, allocating the buffer on first use.
    pub fn feed_body(&mut self, chunk: &[u8]) -> Result<(), Error> {
        if self.body.is_none() {
            self.allocate_body()?;
        }
        match &mut self.body {
            Some(body) => body.feed(chunk),
            None => Err(Error::BodyTooLarge),
        }
    }

    /// Default preparation: upgrade WebSocket requests on routes carrying a
    /// room, allocate the body buffer otherwise.
    pub fn prepare_default(&mut self) -> Result<Prepare, Error> {
        if self.request.is_websocket_upgrade() && self.room().is_some() {
            return Ok(match self.accept_websocket() {
                Ok(()) => Prepare::Upgrade,
                Err(_) => Prepare::Abort,
            });
        }

        self.allocate_body()?;
        Ok(Prepare::Continue)
    }

    /// Writes the `101` response and sets up the room client.
    pub fn accept_websocket(&mut self) -> Result<(), Error> {
        let key = self
            .request
            .websocket_key()
            .ok_or(Error::Protocol("missing Sec-WebSocket-Key"))?
            .to_owned();
        let room = self
            .room()
            .cloned()
            .ok_or(Error::Protocol("route has no room"))?;

        let (client, outbound) = WsClient::new(
            room,
            self.addr,
            self.shared.pool.clone(),
            self.shared.limits.conn.outbound_queue,
            self.shared.limits.conn.message_size,
        );

        self.response.upgrade_websocket(&key);
        self.upgrade = Some(Upgrade { client, outbound });
        Ok(())
    }

    pub(crate) fn take_upgrade(&mut self) -> Option<Upgrade> {
        self.upgrade.take()
    }

    /// Session of this client, created on first use.
    ///
    /// A new session adds `Set-Cookie` to the response.
    pub fn session(&mut self) -> Arc<Session> {
        if let Some(session) = &self.session {
            return session.clone();
        }

        let cookie_name = &self.shared.limits.session.cookie_name;
        let (session, created) = self
            .shared
            .sessions
            .lookup(self.request.cookie(cookie_name), self.addr.ip());

        if created {
            self.response.set_cookie(
                Cookie::new(cookie_name.clone(), session.id())
                    .attr("HttpOnly")
                    .attr("Path=/"),
            );
        }

        self.session = Some(session.clone());
        session
    }

    /// Runs blocking work on the worker pool.
    pub async fn offload<F, T>(&self, job: F) -> Result<T, Error>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.shared.pool.run(job).await
    }

    /// Resolves a file through the shared cache.
    pub async fn cached_file<P: Into<PathBuf>>(&self, path: P) -> Result<CachedFile, Error> {
        let path = path.into();
        let shared = self.shared.clone();
        self.shared.pool.run(move || shared.cache.get(&path)).await?
    }

    /// Responds with a file from the cache, range requests enabled.
    pub async fn send_file<P: Into<PathBuf>>(&mut self, status: StatusCode, path: P) -> Result<(), Error> {
        let file = self.cached_file(path).await?;
        self.response.file(status, &file)?;
        Ok(())
    }
}

/// Fallback for unmatched paths.
pub(crate) struct NotFound;

impl Handler for NotFound {
    fn prepare(&mut self, _: &mut Exchange) -> Result<Prepare, Error> {
        Err(Error::NotFound)
    }
}

/// Entry point of WebSocket routes: upgrades or aborts.
///
/// ```
/// use wicket::{Room, Router, UserData, WebSocketEntry};
///
/// let room = Room::new("chat", ());
/// let router = Router::new()
///     .route_with("/ws", || WebSocketEntry, UserData::new().with_room(room))
///     .unwrap();
/// ```
pub struct WebSocketEntry;

impl Handler for WebSocketEntry {
    fn prepare(&mut self, ex: &mut Exchange) -> Result<Prepare, Error> {
        if !ex.request.is_websocket_upgrade() || ex.room().is_none() {
            return Ok(Prepare::Abort);
        }

        Ok(match ex.accept_websocket() {
            Ok(()) => Prepare::Upgrade,
            Err(_) => Prepare::Abort,
        })
    }
}

/// Serves `<root>/<capture 0>` through the file cache.
///
/// `root` comes from the route user data (`String`, `&'static str` or
/// `PathBuf`). Paths leaving the root are refused with `403`.
///
/// ```
/// use wicket::{Router, StaticFiles, UserData};
///
/// let router = Router::new()
///     .route_with("/static/(.*)", || StaticFiles, UserData::new().with("root", "./public"))
///     .unwrap();
/// ```
pub struct StaticFiles;

impl StaticFiles {
    fn root(data: &UserData) -> Option<PathBuf> {
        data.get::<PathBuf>("root")
            .cloned()
            .or_else(|| data.get::<String>("root").map(PathBuf::from))
            .or_else(|| data.get::<&'static str>("root").map(PathBuf::from))
    }
}

impl Handler for StaticFiles {
    async fn get(&mut self, ex: &mut Exchange) -> Result<(), Error> {
        let root = Self::root(ex.user_data()).ok_or(Error::NotFound)?;

        let relative = match ex.capture(0).unwrap_or("") {
            "" => "index.html",
            path => path,
        };
        if !Path::new(relative).components().all(|part| matches!(part, Component::Normal(_))) {
            return Err(Error::Status(StatusCode::Forbidden));
        }

        let path = root.join(relative);
        ex.send_file(StatusCode::Ok, path).await
    }
}
