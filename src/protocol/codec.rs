//! Frame codec. Outgoing frames are length-prefixed:
//! `u32_LE length | u8 seq | u8 command | payload`, `length = 2 + payload len`.
//! Incoming frames share the prefix; the first payload byte is the echoed
//! sequence number, 0 meaning an asynchronous notification.

use crate::error::Error;
use crate::protocol::Command;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Upper bound for an announced payload. The largest legitimate frame is a
/// full 64K memory read plus the sequence byte; anything bigger means the
/// stream is out of sync.
pub const MAX_FRAME_LEN: usize = 0x1_0000 + 16;

const HEADER_LEN: usize = 4;

/// Sequence numbers occupy 1..=255; 0 is reserved for notifications.
pub fn next_seq(seq: u8) -> u8 {
    if seq == u8::MAX {
        1
    } else {
        seq + 1
    }
}

/// Encode one outgoing command frame.
pub fn encode_frame(seq: u8, command: Command, payload: &[u8]) -> Bytes {
    debug_assert!(seq != 0, "sequence number 0 is reserved for notifications");
    let mut buf = BytesMut::with_capacity(HEADER_LEN + 2 + payload.len());
    buf.put_u32_le((2 + payload.len()) as u32);
    buf.put_u8(seq);
    buf.put_u8(command.code());
    buf.put_slice(payload);
    buf.freeze()
}

/// A complete inbound frame. `payload` excludes the echoed sequence byte.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct InboundFrame {
    pub seq: u8,
    pub payload: Bytes,
}

impl InboundFrame {
    pub fn is_notification(&self) -> bool {
        self.seq == 0
    }
}

/// Incremental frame decoder. Tolerates arbitrary fragmentation and
/// coalescing of the byte stream: header bytes are collected until the
/// announced length is known, then the payload is buffered until complete,
/// and decoding continues on any excess bytes in the same feed.
#[derive(Default)]
pub struct FrameDecoder {
    buf: BytesMut,
    /// Announced payload length of the frame currently being collected.
    expected: Option<usize>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True while a frame is partially collected. Used by the dispatcher to
    /// arm the chunk timeout: a stalled partial frame signals a dead
    /// transport, not a protocol error.
    pub fn mid_frame(&self) -> bool {
        self.expected.is_some() || !self.buf.is_empty()
    }

    /// Consume a chunk of transport bytes, appending every completed frame
    /// to `out`.
    pub fn feed(&mut self, chunk: &[u8], out: &mut Vec<InboundFrame>) -> Result<(), Error> {
        self.buf.extend_from_slice(chunk);

        loop {
            let expected = match self.expected {
                Some(len) => len,
                None => {
                    if self.buf.len() < HEADER_LEN {
                        return Ok(());
                    }
                    let len = self.buf.get_u32_le() as usize;
                    if len == 0 {
                        return Err(Error::MalformedFrame("zero-length frame"));
                    }
                    if len > MAX_FRAME_LEN {
                        return Err(Error::MalformedFrame("frame length out of bounds"));
                    }
                    *self.expected.insert(len)
                }
            };

            if self.buf.len() < expected {
                return Ok(());
            }

            let mut payload = self.buf.split_to(expected).freeze();
            let seq = payload.get_u8();
            out.push(InboundFrame { seq, payload });
            self.expected = None;
        }
    }
}
