//! ## eddy-io::codec
//! **Caller-supplied framing**
//!
//! The engine knows nothing about packet layout. A [`Codec`] turns buffered
//! bytes into packets and packets into bytes:
//! - `decode` sees the unconsumed input and answers with a tagged
//!   [`Decoded`] result, consuming exactly the bytes of one packet
//! - `encode` appends a packet to an [`OutputSink`] backed by allocator
//!   buffers
//! - `session_id` extracts the correlation key client sessions are matched on

use bytes::{Buf, Bytes, BytesMut};
use eddy_core::alloc::{Allocator, Arena, ArenaRef, Buffer};
use eddy_core::AllocError;

use crate::error::ProtocolError;

/// Size of each output buffer a sink allocates for small packets.
pub const OUTPUT_CHUNK: usize = 4096;

#[derive(Debug)]
pub enum Decoded<P> {
    /// One complete packet; its bytes have been consumed.
    Packet(P),
    /// At least this many more bytes are needed before decoding can progress.
    NeedMore(usize),
    /// The input can never decode; the connection is closed.
    Error(ProtocolError),
}

pub trait Codec: Send + Sync + 'static {
    type Packet: Send + 'static;

    fn decode(&self, input: &mut Input<'_>) -> Decoded<Self::Packet>;

    fn encode(&self, packet: &Self::Packet, out: &mut OutputSink<'_>)
        -> Result<(), ProtocolError>;

    /// Key a response is matched to its request by. Packets without one
    /// cannot be sent as client requests.
    fn session_id(&self, _packet: &Self::Packet) -> Option<u64> {
        None
    }
}

/// Unconsumed input of one connection plus the arena of the current batch.
pub struct Input<'a> {
    buf: &'a mut BytesMut,
    arena: &'a Arena,
}

impl<'a> Input<'a> {
    /// Views `buf` as codec input. The engine builds these per read; codec
    /// tests build them directly.
    pub fn new(buf: &'a mut BytesMut, arena: &'a Arena) -> Self {
        Self { buf, arena }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// All buffered bytes, without consuming them.
    pub fn peek(&self) -> &[u8] {
        &self.buf[..]
    }

    /// Consumes `n` bytes without copying.
    ///
    /// # Panics
    /// If `n > self.len()`.
    pub fn take(&mut self, n: usize) -> Bytes {
        self.buf.split_to(n).freeze()
    }

    pub fn skip(&mut self, n: usize) {
        self.buf.advance(n);
    }

    /// Consumes `n` bytes by copying them into the batch arena.
    pub fn take_into_arena(&mut self, n: usize) -> Result<ArenaRef, AllocError> {
        let r = self.arena.alloc_copy(&self.buf[..n])?;
        self.buf.advance(n);
        Ok(r)
    }

    /// Arena shared by every request decoded in this read batch.
    pub fn arena(&self) -> &Arena {
        self.arena
    }
}

/// One queued output buffer with its fill level and write cursor.
#[derive(Debug)]
pub struct OutChunk {
    buf: Buffer,
    filled: usize,
    written: usize,
}

impl OutChunk {
    fn new(buf: Buffer) -> Self {
        Self {
            buf,
            filled: 0,
            written: 0,
        }
    }

    /// Bytes not yet written to the socket.
    #[inline]
    pub fn remaining(&self) -> &[u8] {
        &self.buf[self.written..self.filled]
    }

    #[inline]
    pub fn advance(&mut self, n: usize) {
        self.written = (self.written + n).min(self.filled);
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.written == self.filled
    }
}

/// Destination of `Codec::encode`.
pub struct OutputSink<'a> {
    allocator: &'a dyn Allocator,
    arena: Option<&'a Arena>,
    chunks: Vec<OutChunk>,
    len: usize,
}

impl<'a> OutputSink<'a> {
    pub fn new(allocator: &'a dyn Allocator, arena: Option<&'a Arena>) -> Self {
        Self {
            allocator,
            arena,
            chunks: Vec::new(),
            len: 0,
        }
    }

    /// Arena of the request being answered; `None` for client requests.
    pub fn arena(&self) -> Option<&Arena> {
        self.arena
    }

    /// Total bytes appended so far.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn put(&mut self, mut data: &[u8]) -> Result<(), AllocError> {
        self.len += data.len();
        while !data.is_empty() {
            if let Some(last) = self.chunks.last_mut() {
                let room = last.buf.len() - last.filled;
                if room > 0 {
                    let n = room.min(data.len());
                    last.buf[last.filled..last.filled + n].copy_from_slice(&data[..n]);
                    last.filled += n;
                    data = &data[n..];
                    continue;
                }
            }
            let size = if data.len() > OUTPUT_CHUNK {
                data.len()
            } else {
                OUTPUT_CHUNK
            };
            self.chunks
                .push(OutChunk::new(self.allocator.allocate(size)?));
        }
        Ok(())
    }

    pub fn put_u8(&mut self, value: u8) -> Result<(), AllocError> {
        self.put(&[value])
    }

    pub fn put_u16(&mut self, value: u16) -> Result<(), AllocError> {
        self.put(&value.to_be_bytes())
    }

    pub fn put_u32(&mut self, value: u32) -> Result<(), AllocError> {
        self.put(&value.to_be_bytes())
    }

    pub fn put_u64(&mut self, value: u64) -> Result<(), AllocError> {
        self.put(&value.to_be_bytes())
    }

    pub(crate) fn finish(self) -> Vec<OutChunk> {
        self.chunks
    }
}
