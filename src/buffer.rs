//! Length-prefixed message framing over a byte stream.
//!
//! A frame is `tag:u8, length:u32, payload`, the length counting itself but
//! not the tag. [`ReadBuffer`] accumulates raw bytes and hands out one
//! message at a time; [`WriteBuffer`] builds outgoing frames, backpatching
//! the length once the payload is complete.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::protocol::{
    ProtocolError, TypeId,
    ext::{BytesExt, UsizeExt},
};

const DEFAULT_BUF_CAPACITY: usize = 1024;

/// Largest frame accepted from a client.
const MAX_MESSAGE_LEN: usize = 64 * 1024 * 1024;

/// Incoming side of the framed stream.
#[derive(Debug)]
pub struct ReadBuffer {
    buf: BytesMut,
    current: Option<Message>,
}

#[derive(Debug)]
struct Message {
    tag: u8,
    payload: Bytes,
}

impl ReadBuffer {
    pub fn new() -> ReadBuffer {
        ReadBuffer {
            buf: BytesMut::with_capacity(DEFAULT_BUF_CAPACITY),
            current: None,
        }
    }

    /// Raw storage for the io loop to read into.
    pub fn bytes_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Returns true iff a full frame is buffered, positioning the payload
    /// cursor at its start. Idempotent: repeated calls return the same
    /// message until [`finish_message`][ReadBuffer::finish_message] or
    /// [`discard_message`][ReadBuffer::discard_message].
    pub fn take_message(&mut self) -> Result<bool, ProtocolError> {
        if self.current.is_some() {
            return Ok(true);
        }

        let Some(mut header) = self.buf.get(..5) else {
            return Ok(false);
        };

        let tag = header.get_u8();
        let len = header.get_u32() as usize;

        if !(4..=MAX_MESSAGE_LEN).contains(&len) {
            return Err(ProtocolError::BadLength);
        }
        if self.buf.len() - 1 < len {
            self.buf.reserve(1 + len - self.buf.len());
            return Ok(false);
        }

        self.buf.advance(5);
        let payload = self.buf.split_to(len - 4).freeze();
        self.current = Some(Message { tag, payload });
        Ok(true)
    }

    /// Tag of the current message.
    ///
    /// # Panics
    ///
    /// Panics if no message was taken.
    pub fn message_tag(&self) -> u8 {
        self.current.as_ref().expect("no message taken").tag
    }

    fn payload(&mut self) -> &mut Bytes {
        &mut self.current.as_mut().expect("no message taken").payload
    }

    /// Remaining unread payload, detached. Used by handlers that consume
    /// the rest of the frame wholesale (restore data, auth tokens).
    pub fn take_rest(&mut self) -> Bytes {
        let payload = self.payload();
        payload.split_to(payload.len())
    }

    pub fn read_byte(&mut self) -> Result<u8, ProtocolError> {
        BytesExt::try_get_u8(self.payload())
    }

    pub fn read_int16(&mut self) -> Result<i16, ProtocolError> {
        BytesExt::try_get_i16(self.payload())
    }

    pub fn read_uint16(&mut self) -> Result<u16, ProtocolError> {
        BytesExt::try_get_u16(self.payload())
    }

    pub fn read_int32(&mut self) -> Result<i32, ProtocolError> {
        BytesExt::try_get_i32(self.payload())
    }

    pub fn read_uint32(&mut self) -> Result<u32, ProtocolError> {
        BytesExt::try_get_u32(self.payload())
    }

    pub fn read_int64(&mut self) -> Result<i64, ProtocolError> {
        BytesExt::try_get_i64(self.payload())
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<Bytes, ProtocolError> {
        self.payload().try_get_bytes(n)
    }

    pub fn read_len_prefixed_bytes(&mut self) -> Result<Bytes, ProtocolError> {
        self.payload().get_lp_bytes()
    }

    pub fn read_len_prefixed_utf8(&mut self) -> Result<String, ProtocolError> {
        self.payload().get_lp_str()
    }

    pub fn read_type_id(&mut self) -> Result<TypeId, ProtocolError> {
        self.payload().get_type_id()
    }

    /// Close out the current message, requiring the payload to be fully
    /// consumed.
    pub fn finish_message(&mut self) -> Result<(), ProtocolError> {
        match self.current.take() {
            Some(msg) if msg.payload.is_empty() => Ok(()),
            Some(_) => Err(ProtocolError::UnparsedData),
            None => Ok(()),
        }
    }

    /// Drop the current message regardless of unread payload. Used by the
    /// recovery loop that skips to the next `Sync`.
    pub fn discard_message(&mut self) {
        self.current = None;
    }
}

impl Default for ReadBuffer {
    fn default() -> ReadBuffer {
        ReadBuffer::new()
    }
}

/// Outgoing side of the framed stream.
///
/// The frame length is not known while encoding, so `new_message` reserves
/// the length field and `end_message` patches it, guaranteeing the declared
/// length always equals the bytes written.
#[derive(Debug)]
pub struct WriteBuffer {
    buf: BytesMut,
    // offset of the length field of the open message
    open: Option<usize>,
}

impl WriteBuffer {
    pub fn new() -> WriteBuffer {
        WriteBuffer {
            buf: BytesMut::with_capacity(DEFAULT_BUF_CAPACITY),
            open: None,
        }
    }

    pub fn new_message(&mut self, tag: u8) -> &mut WriteBuffer {
        assert!(self.open.is_none(), "previous message not ended");
        self.buf.put_u8(tag);
        self.open = Some(self.buf.len());
        self.buf.put_u32(0);
        self
    }

    pub fn end_message(&mut self) {
        let offset = self.open.take().expect("no message started");
        let len = (self.buf.len() - offset).to_u32();
        self.buf[offset..offset + 4].copy_from_slice(&len.to_be_bytes());
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Buffered frames, for the io loop to flush.
    ///
    /// # Panics
    ///
    /// Panics if a message is still open.
    pub fn take(&mut self) -> BytesMut {
        assert!(self.open.is_none(), "message not ended");
        self.buf.split()
    }
}

impl Default for WriteBuffer {
    fn default() -> WriteBuffer {
        WriteBuffer::new()
    }
}

// Payload writers go through BufMut so the `ext` helpers apply.
unsafe impl BufMut for WriteBuffer {
    fn remaining_mut(&self) -> usize {
        self.buf.remaining_mut()
    }

    unsafe fn advance_mut(&mut self, cnt: usize) {
        unsafe { self.buf.advance_mut(cnt) }
    }

    fn chunk_mut(&mut self) -> &mut bytes::buf::UninitSlice {
        self.buf.chunk_mut()
    }
}
