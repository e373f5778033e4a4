//! Server side of one upgraded WebSocket connection.

use crate::{
    errors::Error,
    server::pool::WorkerPool,
    websocket::{
        frame::{Frame, OpCode},
        room::{ClientHandle, Message, Outbound, Room},
    },
};
use bytes::Bytes;
use std::{net::SocketAddr, sync::Arc};
use tokio::sync::mpsc;

/// Turns inbound bytes into frames and frames into room events.
///
/// Control frames are answered here; fragmented messages are reassembled
/// before the room sees them.
pub(crate) struct WsClient {
    room: Arc<Room>,
    handle: ClientHandle,
    pool: Arc<WorkerPool>,
    pending: Vec<u8>,
    fragments: Option<(OpCode, Vec<u8>)>,
    max_message: u64,
    closed: bool,
}

impl WsClient {
    pub(crate) fn new(
        room: Arc<Room>,
        addr: SocketAddr,
        pool: Arc<WorkerPool>,
        queue: usize,
        max_message: u64,
    ) -> (Self, mpsc::Receiver<Outbound>) {
        let (handle, outbound) = ClientHandle::new(addr, queue);
        let client = Self {
            room,
            handle,
            pool,
            pending: Vec::new(),
            fragments: None,
            max_message,
            closed: false,
        };
        (client, outbound)
    }

    #[inline]
    pub(crate) fn handle(&self) -> &ClientHandle {
        &self.handle
    }

    /// Joins the room; call once the upgrade response is out.
    pub(crate) async fn open(&self) {
        self.room.join(self.handle.clone());
        self.hook(|room, client| room.hooks().on_new(room, client)).await;
    }

    /// Consumes inbound bytes. `Ok(false)` once the client closed.
    pub(crate) async fn feed(&mut self, bytes: &[u8]) -> Result<bool, Error> {
        self.pending.extend_from_slice(bytes);

        let mut consumed = 0;
        let result = loop {
            let frame = match Frame::decode(&self.pending[consumed..], self.max_message) {
                Ok(Some((frame, used))) => {
                    consumed += used;
                    frame
                }
                Ok(None) => break Ok(true),
                Err(e) => break Err(e),
            };

            match self.on_frame(frame).await {
                Ok(true) => continue,
                other => break other,
            }
        };

        self.pending.drain(..consumed);
        result
    }

    async fn on_frame(&mut self, frame: Frame) -> Result<bool, Error> {
        match frame.opcode {
            OpCode::Ping => {
                self.handle.push(Bytes::from(Frame::new(OpCode::Pong, frame.payload).encode()));
                Ok(true)
            }
            OpCode::Pong => {
                self.room.record_pong(&self.handle);
                Ok(true)
            }
            OpCode::Close => {
                self.closed = true;
                self.room.leave(&self.handle);
                self.hook(|room, client| room.hooks().on_close(room, client)).await;
                self.handle.close();
                Ok(false)
            }
            OpCode::Text | OpCode::Binary if self.fragments.is_some() => {
                Err(Error::Protocol("expected a continuation frame"))
            }
            OpCode::Text | OpCode::Binary if frame.fin => {
                self.deliver(frame.opcode, frame.payload.to_vec()).await?;
                Ok(true)
            }
            OpCode::Text | OpCode::Binary => {
                self.fragments = Some((frame.opcode, frame.payload.to_vec()));
                Ok(true)
            }
            OpCode::Continuation => {
                let Some((opcode, mut data)) = self.fragments.take() else {
                    return Err(Error::Protocol("continuation without a message"));
                };

                data.extend_from_slice(&frame.payload);
                if data.len() as u64 > self.max_message {
                    return Err(Error::Protocol("message too large"));
                }

                match frame.fin {
                    true => self.deliver(opcode, data).await?,
                    false => self.fragments = Some((opcode, data)),
                }
                Ok(true)
            }
        }
    }

    async fn deliver(&self, opcode: OpCode, data: Vec<u8>) -> Result<(), Error> {
        let message = match opcode {
            OpCode::Text => {
                let text = simdutf8::basic::from_utf8(&data).map_err(|_| Error::Protocol("text is not UTF-8"))?;
                Message::Text(text.to_owned())
            }
            _ => Message::Binary(Bytes::from(data)),
        };

        self.hook(move |room, client| room.hooks().on_message(room, client, message))
            .await;
        Ok(())
    }

    /// Leaves the room after the connection ended without a close frame.
    pub(crate) async fn finish(self, error: Option<Error>) {
        if self.closed {
            return;
        }
        self.room.leave(&self.handle);

        match error {
            Some(error) if !error.is_transport() => {
                tracing::warn!(room = %self.room.name(), client = %self.handle.addr(), error = %error, "WebSocket failure");
                self.hook(move |room, client| room.hooks().on_error(room, client, &error))
                    .await
            }
            _ => {
                self.hook(|room, client| room.hooks().on_close(room, client))
                    .await
            }
        }
    }

    async fn hook<F>(&self, hook: F)
    where
        F: FnOnce(&Room, &ClientHandle) + Send + 'static,
    {
        let room = self.room.clone();
        let client = self.handle.clone();

        if let Err(e) = self.pool.run(move || hook(&room, &client)).await {
            tracing::error!(room = %self.room.name(), error = %e, "Room hook failed");
        }
    }
}
