//! wicket - HTTP/1.1 server engine with routing, range delivery and WebSocket rooms
//!
//! A connection-oriented server: each accepted stream is driven by one worker
//! through header parsing, body streaming, handler dispatch and keep-alive,
//! or switched in place to the WebSocket protocol and attached to a room.
//!
//! # Features
//!
//! - **Routing** - ordered regex patterns with positional captures and per-route user data
//! - **Handlers** - one fresh value per request, `get`/`put`/`post`/`delete` plus lifecycle hooks
//! - **Bodies** - `Content-Length` delimited, buffered in memory or spilled to a temporary file
//! - **Responses** - text, JSON, files, byte ranges, optional gzip, lazy chunked sending
//! - **Static files** - mtime-checked in-memory cache with a size ceiling
//! - **Sessions** - cookie-bound, per client address, lazily expired
//! - **WebSocket** - handshake, frame codec, fragmentation, broadcast rooms
//! - **Client** - minimal outbound HTTP/1.1 with multipart bodies
//!
//! # Examples
//!
//! Quick start:
//! ```no_run
//! use wicket::{Error, Exchange, Handler, Router, Server, StatusCode};
//!
//! struct Hello;
//!
//! impl Handler for Hello {
//!     async fn get(&mut self, ex: &mut Exchange) -> Result<(), Error> {
//!         let name = ex.capture(0).unwrap_or("world").to_owned();
//!         ex.response.text(StatusCode::Ok, format!("Hello, {name}!"));
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let router = Router::new()
//!         .route("/", || Hello)
//!         .unwrap()
//!         .route("/hello/(\\w+)", || Hello)
//!         .unwrap();
//!
//!     Server::builder()
//!         .listener(Server::bind("127.0.0.1:8080".parse().unwrap()).unwrap())
//!         .router(router)
//!         .build()
//!         .launch()
//!         .await;
//! }
//! ```
//! Static files and a chat room:
//! ```no_run
//! use wicket::{ClientHandle, Message, Room, RoomHandler, Router, Server, StaticFiles, UserData, WebSocketEntry};
//!
//! struct Chat;
//!
//! impl RoomHandler for Chat {
//!     fn on_message(&self, room: &Room, _: &ClientHandle, message: Message) {
//!         room.broadcast(message);
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let router = Router::new()
//!         .route_with("/ws", || WebSocketEntry, UserData::new().with_room(Room::new("chat", Chat)))
//!         .unwrap()
//!         .route_with("/(.*)", || StaticFiles, UserData::new().with("root", "./public"))
//!         .unwrap();
//!
//!     Server::builder()
//!         .listener(Server::bind("127.0.0.1:8080".parse().unwrap()).unwrap())
//!         .router(router)
//!         .build()
//!         .launch()
//!         .await;
//! }
//! ```

pub(crate) mod http {
    pub mod codec;
    pub(crate) mod data;
    pub(crate) mod header;
    pub mod mime;
    pub mod query;
    pub(crate) mod response;
    pub(crate) mod types;
}
pub(crate) mod server {
    pub(crate) mod connection;
    pub(crate) mod handler;
    pub(crate) mod pool;
    pub(crate) mod router;
    pub(crate) mod server_impl;
}
pub(crate) mod store {
    pub(crate) mod cache;
    pub(crate) mod session;
}
pub(crate) mod websocket {
    pub(crate) mod client;
    pub(crate) mod frame;
    pub(crate) mod room;
}
pub(crate) mod client;
pub(crate) mod errors;
pub mod limits;

pub use crate::{
    client::{Client, ClientResponse, Multipart},
    errors::Error,
    http::{
        codec,
        data::{HttpData, Storage},
        header::{Cookie, RequestHeader, ResponseHeader},
        mime, query,
        response::{BodyWriter, Response, Sender},
        types::{Fields, Method, StatusCode, Url, Version},
    },
    server::{
        handler::{Exchange, Handler, Prepare, StaticFiles, WebSocketEntry},
        router::{Resolved, Router, UserData},
        server_impl::{Server, ServerBuilder},
    },
    store::{
        cache::{CachedFile, FileCache, FileData},
        session::{Session, SessionStore},
    },
    websocket::{
        frame::{accept_key, Frame, OpCode},
        room::{ClientHandle, Message, Room, RoomHandler},
    },
};

#[cfg(test)]
pub mod tools {
    use crate::http::header::RequestHeader;
    use std::str::from_utf8;

    #[inline]
    pub fn str_2<'a>(value: (&'a [u8], &'a [u8])) -> (&'a str, &'a str) {
        (from_utf8(value.0).unwrap(), from_utf8(value.1).unwrap())
    }

    /// `GET / HTTP/1.1` with the given field lines.
    pub fn request(fields: &[&str]) -> RequestHeader {
        let mut request = RequestHeader::new(100, 64);
        request.parse_line(b"GET / HTTP/1.1\r\n").unwrap();

        for field in fields {
            assert!(!request.parse_line(format!("{field}\r\n").as_bytes()).unwrap());
        }
        assert!(request.parse_line(b"\r\n").unwrap());
        request
    }
}
