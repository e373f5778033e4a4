//! Broadcast groups of WebSocket clients.

use crate::{
    errors::Error,
    websocket::frame::{Frame, OpCode},
};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::{
    collections::HashMap,
    fmt,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    Notify,
};

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Item of an upgraded connection's outbound queue.
#[derive(Debug)]
pub(crate) enum Outbound {
    Data(Bytes),
    Close,
}

/// Application message carried by text or binary frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Bytes),
}

impl Message {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Message::Text(text) => Some(text),
            Message::Binary(_) => None,
        }
    }

    fn into_frame(self) -> Frame {
        match self {
            Message::Text(text) => Frame::text(text),
            Message::Binary(data) => Frame::new(OpCode::Binary, data),
        }
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Message::Text(text.to_owned())
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Message::Text(text)
    }
}

/// Sending side of one connected client.
///
/// Frames are queued in send-call order and written by the connection's
/// outbound loop. A frame that does not fit into a full queue stalls the
/// client: its connection is torn down instead of skipping frames.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    id: u64,
    addr: SocketAddr,
    tx: mpsc::Sender<Outbound>,
    stall: Arc<Notify>,
}

impl ClientHandle {
    pub(crate) fn new(addr: SocketAddr, capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            id: NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed),
            addr,
            tx,
            stall: Arc::new(Notify::new()),
        };
        (handle, rx)
    }

    /// Process-unique id.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Queues a message for this client only; `false` when its queue is
    /// full or the connection is gone.
    pub fn send<M: Into<Message>>(&self, message: M) -> bool {
        let message: Message = message.into();
        self.push(Bytes::from(message.into_frame().encode()))
    }

    /// Sends a close frame and ends the connection once it is written.
    pub fn close(&self) -> bool {
        self.push(Bytes::from(Frame::close().encode())) && self.tx.try_send(Outbound::Close).is_ok()
    }

    pub(crate) fn push(&self, frame: Bytes) -> bool {
        match self.tx.try_send(Outbound::Data(frame)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.stall.notify_one();
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Resolves once a frame was refused by the full queue.
    pub(crate) async fn stalled(&self) {
        self.stall.notified().await
    }
}

impl PartialEq for ClientHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

/// Room behavior. Hooks run on the worker pool, so blocking is allowed.
///
/// ```
/// use wicket::{ClientHandle, Message, Room, RoomHandler};
///
/// struct Echo;
///
/// impl RoomHandler for Echo {
///     fn on_message(&self, room: &Room, client: &ClientHandle, message: Message) {
///         room.send(Some(client), message);
///     }
/// }
///
/// let room = Room::new("echo", Echo);
/// assert_eq!(room.name(), "echo");
/// ```
#[allow(unused_variables)]
pub trait RoomHandler: Send + Sync + 'static {
    /// A client joined after its upgrade was sent.
    fn on_new(&self, room: &Room, client: &ClientHandle) {}

    /// A complete text or binary message arrived.
    fn on_message(&self, room: &Room, client: &ClientHandle, message: Message) {}

    /// The client sent a close frame or the connection ended.
    fn on_close(&self, room: &Room, client: &ClientHandle) {}

    /// The connection failed; the client is already gone from the room.
    fn on_error(&self, room: &Room, client: &ClientHandle, error: &Error) {}
}

impl RoomHandler for () {}

/// Named broadcast group owning its member list.
///
/// Delivery never waits. A client whose queue is full gets its connection
/// ended and leaves the room through the usual close path.
pub struct Room {
    name: String,
    members: Mutex<Vec<ClientHandle>>,
    pongs: Mutex<HashMap<u64, Instant>>,
    handler: Box<dyn RoomHandler>,
}

impl Room {
    pub fn new<N: Into<String>, H: RoomHandler>(name: N, handler: H) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            members: Mutex::new(Vec::new()),
            pongs: Mutex::new(HashMap::new()),
            handler: Box::new(handler),
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn hooks(&self) -> &dyn RoomHandler {
        self.handler.as_ref()
    }

    pub(crate) fn join(&self, client: ClientHandle) {
        let mut members = self.members.lock();
        members.push(client);
        tracing::debug!(room = %self.name, members = members.len(), "Client joined");
    }

    /// Removes a member, `true` when it was there.
    pub fn leave(&self, client: &ClientHandle) -> bool {
        self.pongs.lock().remove(&client.id);

        let mut members = self.members.lock();
        let before = members.len();
        members.retain(|member| member.id != client.id);

        let left = members.len() != before;
        if left {
            tracing::debug!(room = %self.name, members = members.len(), "Client left");
        }
        left
    }

    /// Snapshot of the members.
    pub fn clients(&self) -> Vec<ClientHandle> {
        self.members.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.members.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sends to one member, or to every member with `None`. Returns the
    /// number of queues the message went into.
    pub fn send<M: Into<Message>>(&self, to: Option<&ClientHandle>, message: M) -> usize {
        let message: Message = message.into();
        self.send_frame(to, message.into_frame())
    }

    pub fn broadcast<M: Into<Message>>(&self, message: M) -> usize {
        self.send(None, message)
    }

    /// Sends `value` as indented JSON text.
    pub fn send_json<T: Serialize + ?Sized>(&self, to: Option<&ClientHandle>, value: &T) -> serde_json::Result<usize> {
        let text = serde_json::to_string_pretty(value)?;
        Ok(self.send(to, text))
    }

    /// Pings every member; answers show up in [`Room::last_pong`].
    pub fn ping_all(&self) -> usize {
        self.send_frame(None, Frame::new(OpCode::Ping, Bytes::new()))
    }

    /// When `client` last answered a ping.
    pub fn last_pong(&self, client: &ClientHandle) -> Option<Instant> {
        self.pongs.lock().get(&client.id).copied()
    }

    pub(crate) fn record_pong(&self, client: &ClientHandle) {
        self.pongs.lock().insert(client.id, Instant::now());
    }

    fn send_frame(&self, to: Option<&ClientHandle>, frame: Frame) -> usize {
        let bytes = Bytes::from(frame.encode());
        let mut delivered = 0;

        for member in self.members.lock().iter() {
            if to.is_some_and(|to| to.id != member.id) {
                continue;
            }

            match member.push(bytes.clone()) {
                true => delivered += 1,
                false => tracing::debug!(room = %self.name, client = member.id, "Outbound queue refused a frame"),
            }
        }

        delivered
    }
}

impl fmt::Debug for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Room")
            .field("name", &self.name)
            .field("members", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(capacity: usize) -> (ClientHandle, mpsc::Receiver<Outbound>) {
        ClientHandle::new("127.0.0.1:4000".parse().unwrap(), capacity)
    }

    fn frames(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while let Ok(Outbound::Data(bytes)) = rx.try_recv() {
            out.push(bytes.to_vec());
        }
        out
    }

    #[test]
    fn broadcast_and_direct() {
        let room = Room::new("chat", ());
        let (alice, mut alice_rx) = client(8);
        let (bob, mut bob_rx) = client(8);
        room.join(alice.clone());
        room.join(bob.clone());

        assert_eq!(room.broadcast("hi"), 2);
        assert_eq!(room.send(Some(&bob), "psst"), 1);

        assert_eq!(frames(&mut alice_rx), [b"\x81\x02hi".to_vec()]);
        assert_eq!(frames(&mut bob_rx), [b"\x81\x02hi".to_vec(), b"\x81\x04psst".to_vec()]);
    }

    #[tokio::test]
    async fn full_queue_stalls_member() {
        let room = Room::new("chat", ());
        let (slow, mut rx) = client(1);
        room.join(slow.clone());

        assert_eq!(room.broadcast("one"), 1);
        assert_eq!(room.broadcast("two"), 0);

        // Still a member until its connection is torn down.
        assert_eq!(room.len(), 1);
        tokio::time::timeout(std::time::Duration::from_secs(1), slow.stalled())
            .await
            .unwrap();

        assert_eq!(frames(&mut rx), [b"\x81\x03one".to_vec()]);
    }

    #[test]
    fn leave_and_pongs() {
        let room = Room::new("chat", ());
        let (alice, _rx) = client(8);
        room.join(alice.clone());

        assert_eq!(room.last_pong(&alice), None);
        room.record_pong(&alice);
        assert!(room.last_pong(&alice).is_some());

        assert!(room.leave(&alice));
        assert!(!room.leave(&alice));
        assert_eq!(room.last_pong(&alice), None);
        assert_eq!(room.clients().len(), 0);
    }

    #[test]
    fn ping_and_json() {
        let room = Room::new("chat", ());
        let (alice, mut rx) = client(8);
        room.join(alice);

        room.ping_all();
        room.send_json(None, &serde_json::json!({"a": 1})).unwrap();

        let sent = frames(&mut rx);
        assert_eq!(sent[0], b"\x89\x00");
        assert_eq!(&sent[1][2..], b"{\n  \"a\": 1\n}");
    }

    #[test]
    fn close_queues_frame_then_end() {
        let (alice, mut rx) = client(8);
        assert!(alice.close());

        assert!(matches!(rx.try_recv(), Ok(Outbound::Data(bytes)) if bytes.as_ref() == b"\x88\x00"));
        assert!(matches!(rx.try_recv(), Ok(Outbound::Close)));
    }
}
