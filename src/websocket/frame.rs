//! RFC 6455 frame codec (no extensions).

use crate::errors::Error;
use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;
use sha1::{Digest, Sha1};

const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// `Sec-WebSocket-Accept` value for a client key.
///
/// ```
/// assert_eq!(
///     wicket::accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
///     "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
/// );
/// ```
pub fn accept_key(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.trim().as_bytes());
    sha1.update(WEBSOCKET_GUID.as_bytes());
    STANDARD.encode(sha1.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    fn from_u8(value: u8) -> Result<Self, Error> {
        Ok(match value {
            0x0 => Self::Continuation,
            0x1 => Self::Text,
            0x2 => Self::Binary,
            0x8 => Self::Close,
            0x9 => Self::Ping,
            0xA => Self::Pong,
            _ => return Err(Error::Protocol("unknown opcode")),
        })
    }

    #[inline]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
        }
    }

    #[inline]
    pub fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }
}

/// One decoded frame, payload already unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: OpCode,
    pub mask: Option<[u8; 4]>,
    pub payload: Bytes,
}

impl Frame {
    /// Final, unmasked frame.
    pub fn new<P: Into<Bytes>>(opcode: OpCode, payload: P) -> Self {
        Self {
            fin: true,
            opcode,
            mask: None,
            payload: payload.into(),
        }
    }

    pub fn text<T: Into<String>>(text: T) -> Self {
        let text: String = text.into();
        Self::new(OpCode::Text, text)
    }

    pub fn close() -> Self {
        Self::new(OpCode::Close, Bytes::new())
    }

    /// Decodes one frame from the front of `src`.
    ///
    /// `Ok(None)` means more bytes are needed; otherwise the frame comes back
    /// with the number of bytes it used. Payloads over `max_payload` and
    /// unknown opcodes are protocol errors.
    pub fn decode(src: &[u8], max_payload: u64) -> Result<Option<(Frame, usize)>, Error> {
        let &[first, second, ..] = src else {
            return Ok(None);
        };

        if first & 0x70 != 0 {
            return Err(Error::Protocol("reserved bits set"));
        }
        let fin = first & 0x80 != 0;
        let opcode = OpCode::from_u8(first & 0x0F)?;

        let masked = second & 0x80 != 0;
        let (len, mut pos) = match second & 0x7F {
            126 => match src.get(2..4) {
                Some(ext) => (u16::from_be_bytes([ext[0], ext[1]]) as u64, 4),
                None => return Ok(None),
            },
            127 => match src.get(2..10) {
                Some(ext) => {
                    let mut raw = [0; 8];
                    raw.copy_from_slice(ext);
                    (u64::from_be_bytes(raw), 10)
                }
                None => return Ok(None),
            },
            len => (len as u64, 2),
        };

        if len > max_payload {
            return Err(Error::Protocol("frame too large"));
        }
        if opcode.is_control() && (len > 125 || !fin) {
            return Err(Error::Protocol("invalid control frame"));
        }

        let mask = match masked {
            true => {
                let Some(key) = src.get(pos..pos + 4) else {
                    return Ok(None);
                };
                pos += 4;
                Some([key[0], key[1], key[2], key[3]])
            }
            false => None,
        };

        let end = pos + len as usize;
        let Some(payload) = src.get(pos..end) else {
            return Ok(None);
        };

        let mut payload = payload.to_vec();
        if let Some(mask) = mask {
            for (i, byte) in payload.iter_mut().enumerate() {
                *byte ^= mask[i % 4];
            }
        }

        let frame = Frame {
            fin,
            opcode,
            mask,
            payload: payload.into(),
        };
        Ok(Some((frame, end)))
    }

    /// Serializes the frame unmasked, whatever `mask` holds.
    pub fn encode(&self) -> Vec<u8> {
        let len = self.payload.len();
        let mut buffer = Vec::with_capacity(len + 10);

        buffer.push(((self.fin as u8) << 7) | self.opcode.as_u8());
        match len {
            0..=125 => buffer.push(len as u8),
            126..=0xFFFF => {
                buffer.push(126);
                buffer.extend_from_slice(&(len as u16).to_be_bytes());
            }
            _ => {
                buffer.push(127);
                buffer.extend_from_slice(&(len as u64).to_be_bytes());
            }
        }

        buffer.extend_from_slice(&self.payload);
        buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mask(payload: &[u8], key: [u8; 4]) -> Vec<u8> {
        payload.iter().enumerate().map(|(i, b)| b ^ key[i % 4]).collect()
    }

    #[test]
    fn text_frame() {
        let bytes = Frame::text("hello").encode();
        assert_eq!(bytes, b"\x81\x05hello");

        let (frame, used) = Frame::decode(&bytes, 1024).unwrap().unwrap();
        assert!(frame.fin);
        assert_eq!(frame.opcode, OpCode::Text);
        assert_eq!(frame.payload.as_ref(), b"hello");
        assert_eq!(used, 7);
    }

    #[test]
    fn masked_client_frame() {
        let key = [0x37, 0xfa, 0x21, 0x3d];
        let mut bytes = vec![0x81, 0x85];
        bytes.extend_from_slice(&key);
        bytes.extend_from_slice(&mask(b"hello", key));

        let (frame, used) = Frame::decode(&bytes, 1024).unwrap().unwrap();
        assert_eq!(frame.payload.as_ref(), b"hello");
        assert_eq!(frame.mask, Some(key));
        assert_eq!(used, 11);
    }

    #[test]
    fn length_tiers() {
        let cases = [(125, 2), (126, 4), (0xFFFF, 4), (0x10000, 10)];

        for (len, head) in cases {
            let bytes = Frame::new(OpCode::Binary, vec![7u8; len]).encode();
            assert_eq!(bytes.len(), len + head, "{len}");

            let (frame, used) = Frame::decode(&bytes, u64::MAX).unwrap().unwrap();
            assert_eq!(frame.payload.len(), len);
            assert_eq!(used, bytes.len());
        }
    }

    #[test]
    fn partial_input() {
        let bytes = Frame::new(OpCode::Binary, vec![1u8; 300]).encode();

        for cut in [0, 1, 3, 100, bytes.len() - 1] {
            assert!(Frame::decode(&bytes[..cut], u64::MAX).unwrap().is_none(), "{cut}");
        }
    }

    #[test]
    fn protocol_violations() {
        let cases: [&[u8]; 4] = [
            b"\x83\x00",          // reserved opcode
            b"\xc1\x00",          // rsv1 without extension
            b"\x09\x00",          // fragmented ping
            b"\x81\x7e\x04\x00",  // over max payload
        ];

        for bytes in cases {
            assert!(matches!(Frame::decode(bytes, 512), Err(Error::Protocol(_))), "{bytes:?}");
        }
    }

    #[test]
    fn accept_key_sample() {
        assert_eq!(accept_key("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }
}
