//! ## eddy-io::connection
//! **Per-socket state machine, independent of the event loop**
//!
//! A [`Connection`] owns one stream's input buffer, its output queue and its
//! lifecycle state. It is generic over `Read + Write` so the reassembly and
//! partial-write logic is exercised without sockets; the reactor drives it
//! with mio streams.
//!
//! `Connecting -> Established -> Closing -> Closed`. Reads and writes
//! interleave freely while established. `Closing` keeps flushing queued
//! output and in-flight replies but reads nothing more.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use eddy_core::alloc::Arena;

use crate::backpressure::Backpressure;
use crate::codec::{Codec, Decoded, Input, OutChunk};
use crate::error::{ConnError, ProtocolError};
use crate::message::ConnId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Established,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accepted from a listener; decoded packets become requests.
    Server,
    /// Opened by `send`; decoded packets complete sessions.
    Client,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConnStats {
    pub bytes_in: u64,
    pub bytes_out: u64,
    /// Packets decoded on this connection.
    pub packets_in: u64,
    /// Packets encoded onto this connection.
    pub packets_out: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOutcome {
    pub bytes: usize,
    /// The peer closed its write side.
    pub eof: bool,
}

pub struct Connection<S> {
    id: ConnId,
    stream: S,
    peer: SocketAddr,
    role: Role,
    state: ConnState,
    input: BytesMut,
    need: usize,
    output: VecDeque<OutChunk>,
    queued: usize,
    read_paused: bool,
    in_flight: usize,
    next_seq: u64,
    closed: Arc<AtomicBool>,
    stats: ConnStats,
}

impl<S> Connection<S> {
    pub fn new(id: ConnId, stream: S, peer: SocketAddr, role: Role, state: ConnState) -> Self {
        Self {
            id,
            stream,
            peer,
            role,
            state,
            input: BytesMut::new(),
            need: 0,
            output: VecDeque::new(),
            queued: 0,
            read_paused: false,
            in_flight: 0,
            next_seq: 0,
            closed: Arc::new(AtomicBool::new(false)),
            stats: ConnStats::default(),
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn stats(&self) -> ConnStats {
        self.stats
    }

    pub fn stream(&self) -> &S {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Input bytes buffered and not yet decoded.
    pub fn buffered(&self) -> usize {
        self.input.len()
    }

    /// Buffered length below which decoding is not attempted.
    pub fn need(&self) -> usize {
        self.need
    }

    /// Output bytes queued and not yet written.
    pub fn queued_bytes(&self) -> usize {
        self.queued
    }

    pub fn is_read_paused(&self) -> bool {
        self.read_paused
    }

    /// Whether reading should be attempted at all.
    pub fn wants_read(&self) -> bool {
        self.state == ConnState::Established && !self.read_paused
    }

    pub fn has_output(&self) -> bool {
        !self.output.is_empty()
    }

    /// Messages handed to a handler whose replies have not come back.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// No queued output and no outstanding replies.
    pub fn is_idle(&self) -> bool {
        self.in_flight == 0 && self.output.is_empty()
    }

    pub(crate) fn closed_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.closed)
    }

    pub(crate) fn begin_dispatch(&mut self, requests: usize) -> u64 {
        let first = self.next_seq;
        self.next_seq += requests as u64;
        self.in_flight += 1;
        first
    }

    pub(crate) fn finish_dispatch(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
    }

    pub fn establish(&mut self) {
        if self.state == ConnState::Connecting {
            self.state = ConnState::Established;
        }
    }

    /// Stops reading; queued output and in-flight replies still drain.
    pub fn begin_close(&mut self) {
        if self.state != ConnState::Closed {
            self.state = ConnState::Closing;
        }
    }

    /// Final state. Pending output is dropped and in-flight requests see
    /// their connection as closed.
    pub fn mark_closed(&mut self) {
        self.state = ConnState::Closed;
        self.closed.store(true, Ordering::Release);
        self.output.clear();
        self.queued = 0;
    }

    /// Appends encoded chunks to the output queue.
    pub fn enqueue(&mut self, chunks: Vec<OutChunk>) {
        self.stats.packets_out += 1;
        for chunk in chunks {
            if !chunk.is_done() {
                self.queued += chunk.remaining().len();
                self.output.push_back(chunk);
            }
        }
    }

    /// Re-evaluates read throttling. Returns the new paused state when it
    /// changed.
    pub fn update_backpressure(&mut self, policy: &dyn Backpressure) -> Option<bool> {
        let pause = policy.should_pause(self.queued, self.read_paused);
        if pause == self.read_paused {
            return None;
        }
        self.read_paused = pause;
        Some(pause)
    }

    /// Decodes as many complete packets as the buffer holds, in order.
    pub fn decode<C: Codec>(
        &mut self,
        codec: &C,
        arena: &Arena,
        max_packet: usize,
    ) -> Result<Vec<C::Packet>, ProtocolError> {
        let mut packets = Vec::new();
        while !self.input.is_empty() && self.input.len() >= self.need {
            let before = self.input.len();
            let decoded = codec.decode(&mut Input::new(&mut self.input, arena));
            match decoded {
                Decoded::Packet(packet) => {
                    if self.input.len() == before {
                        return Err(ProtocolError::NoProgress);
                    }
                    self.need = 0;
                    self.stats.packets_in += 1;
                    packets.push(packet);
                }
                Decoded::NeedMore(more) => {
                    let need = self.input.len() + more.max(1);
                    if need > max_packet {
                        return Err(ProtocolError::FrameTooLarge {
                            size: need,
                            limit: max_packet,
                        });
                    }
                    self.need = need;
                    break;
                }
                Decoded::Error(e) => return Err(e),
            }
        }
        Ok(packets)
    }
}

impl<S: Read> Connection<S> {
    /// Reads until the stream would block or reports end of stream.
    pub fn read_available(&mut self, chunk: usize) -> Result<ReadOutcome, ConnError> {
        let mut total = 0;
        loop {
            let start = self.input.len();
            self.input.resize(start + chunk, 0);
            let result = self.stream.read(&mut self.input[start..]);
            match result {
                Ok(0) => {
                    self.input.truncate(start);
                    return Ok(ReadOutcome {
                        bytes: total,
                        eof: true,
                    });
                }
                Ok(n) => {
                    self.input.truncate(start + n);
                    total += n;
                    self.stats.bytes_in += n as u64;
                }
                Err(e) => {
                    self.input.truncate(start);
                    match e.kind() {
                        io::ErrorKind::WouldBlock => {
                            return Ok(ReadOutcome {
                                bytes: total,
                                eof: false,
                            })
                        }
                        io::ErrorKind::Interrupted => continue,
                        _ => return Err(ConnError::Io(e)),
                    }
                }
            }
        }
    }
}

impl<S: Write> Connection<S> {
    /// Writes queued output until the queue is empty or the stream would
    /// block. Returns the bytes written by this call.
    pub fn flush(&mut self) -> Result<usize, ConnError> {
        let mut written = 0;
        while let Some(front) = self.output.front_mut() {
            match self.stream.write(front.remaining()) {
                Ok(0) => {
                    return Err(ConnError::Io(io::Error::from(io::ErrorKind::WriteZero)));
                }
                Ok(n) => {
                    front.advance(n);
                    if front.is_done() {
                        self.output.pop_front();
                    }
                    self.queued -= n;
                    written += n;
                    self.stats.bytes_out += n as u64;
                }
                Err(e) => match e.kind() {
                    io::ErrorKind::WouldBlock => break,
                    io::ErrorKind::Interrupted => continue,
                    _ => return Err(ConnError::Io(e)),
                },
            }
        }
        Ok(written)
    }
}

impl<S> std::fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("buffered", &self.input.len())
            .field("queued", &self.queued)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::backpressure::Watermark;
    use crate::codec::OutputSink;
    use bytes::Bytes;
    use eddy_core::alloc::{Allocator, SystemAllocator};
    use proptest::prelude::*;

    /// Stream fed by the test: each queued chunk is one `read`, then
    /// `WouldBlock`. Writes accept up to `write_budget` bytes.
    #[derive(Default)]
    pub(crate) struct MockStream {
        pub reads: VecDeque<Vec<u8>>,
        pub eof: bool,
        pub written: Vec<u8>,
        pub write_budget: usize,
    }

    impl Read for MockStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.reads.pop_front() {
                Some(mut chunk) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    if n < chunk.len() {
                        self.reads.push_front(chunk.split_off(n));
                    }
                    Ok(n)
                }
                None if self.eof => Ok(0),
                None => Err(io::ErrorKind::WouldBlock.into()),
            }
        }
    }

    impl Write for MockStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.write_budget == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.write_budget);
            self.write_budget -= n;
            self.written.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Fixed-length frames.
    pub(crate) struct FixedCodec(pub usize);

    impl Codec for FixedCodec {
        type Packet = Bytes;

        fn decode(&self, input: &mut Input<'_>) -> Decoded<Bytes> {
            if input.len() < self.0 {
                return Decoded::NeedMore(self.0 - input.len());
            }
            Decoded::Packet(input.take(self.0))
        }

        fn encode(&self, packet: &Bytes, out: &mut OutputSink<'_>) -> Result<(), ProtocolError> {
            Ok(out.put(packet)?)
        }
    }

    fn allocator() -> Arc<dyn Allocator> {
        Arc::new(SystemAllocator::new())
    }

    fn connection() -> Connection<MockStream> {
        Connection::new(
            1,
            MockStream::default(),
            "127.0.0.1:1".parse().unwrap(),
            Role::Server,
            ConnState::Established,
        )
    }

    fn feed(
        conn: &mut Connection<MockStream>,
        chunk: &[u8],
        arena: &Arena,
    ) -> Result<Vec<Bytes>, ProtocolError> {
        conn.stream_mut().reads.push_back(chunk.to_vec());
        let outcome = conn.read_available(64).unwrap();
        assert_eq!(outcome.bytes, chunk.len());
        conn.decode(&FixedCodec(10), arena, 1024)
    }

    #[test]
    fn chunked_delivery_matches_single_delivery() {
        let arena = Arena::acquire(allocator(), 256).unwrap();
        let frames: Vec<u8> = (0..30u8).collect();

        let mut whole = connection();
        let all_at_once = feed(&mut whole, &frames, &arena).unwrap();

        let mut split = connection();
        let mut pieces = Vec::new();
        pieces.extend(feed(&mut split, &frames[..7], &arena).unwrap());
        assert_eq!(split.need(), 10);
        pieces.extend(feed(&mut split, &frames[7..20], &arena).unwrap());
        pieces.extend(feed(&mut split, &frames[20..], &arena).unwrap());

        assert_eq!(all_at_once.len(), 3);
        assert_eq!(pieces, all_at_once);
        assert_eq!(split.buffered(), 0);
        assert_eq!(split.stats().packets_in, 3);
    }

    #[test]
    fn oversize_need_is_a_protocol_error() {
        struct Greedy;
        impl Codec for Greedy {
            type Packet = ();
            fn decode(&self, _input: &mut Input<'_>) -> Decoded<()> {
                Decoded::NeedMore(1 << 20)
            }
            fn encode(&self, _: &(), _: &mut OutputSink<'_>) -> Result<(), ProtocolError> {
                Ok(())
            }
        }
        let arena = Arena::acquire(allocator(), 256).unwrap();
        let mut conn = connection();
        conn.stream_mut().reads.push_back(vec![0; 4]);
        conn.read_available(64).unwrap();
        assert!(matches!(
            conn.decode(&Greedy, &arena, 4096),
            Err(ProtocolError::FrameTooLarge { limit: 4096, .. })
        ));
    }

    #[test]
    fn packet_without_progress_is_rejected() {
        struct Stuck;
        impl Codec for Stuck {
            type Packet = ();
            fn decode(&self, _input: &mut Input<'_>) -> Decoded<()> {
                Decoded::Packet(())
            }
            fn encode(&self, _: &(), _: &mut OutputSink<'_>) -> Result<(), ProtocolError> {
                Ok(())
            }
        }
        let arena = Arena::acquire(allocator(), 256).unwrap();
        let mut conn = connection();
        conn.stream_mut().reads.push_back(vec![1]);
        conn.read_available(64).unwrap();
        assert_eq!(conn.decode(&Stuck, &arena, 64), Err(ProtocolError::NoProgress));
    }

    #[test]
    fn eof_is_reported_after_pending_bytes() {
        let mut conn = connection();
        conn.stream_mut().reads.push_back(b"tail".to_vec());
        conn.stream_mut().eof = true;
        let outcome = conn.read_available(2).unwrap();
        assert_eq!(outcome, ReadOutcome { bytes: 4, eof: true });
        assert_eq!(conn.buffered(), 4);
    }

    #[test]
    fn partial_writes_resume_where_they_stopped() {
        let allocator = allocator();
        let mut conn = connection();
        for text in [&b"hello "[..], b"partial ", b"world"] {
            let mut sink = OutputSink::new(allocator.as_ref(), None);
            sink.put(text).unwrap();
            conn.enqueue(sink.finish());
        }
        assert_eq!(conn.queued_bytes(), 19);

        conn.stream_mut().write_budget = 4;
        assert_eq!(conn.flush().unwrap(), 4);
        assert_eq!(conn.queued_bytes(), 15);
        assert!(conn.has_output());

        conn.stream_mut().write_budget = 9;
        conn.flush().unwrap();
        conn.stream_mut().write_budget = 100;
        conn.flush().unwrap();
        assert!(!conn.has_output());
        assert_eq!(conn.stream().written, b"hello partial world");
        assert_eq!(conn.stats().bytes_out, 19);
    }

    #[test]
    fn backpressure_pauses_and_resumes_reading() {
        let allocator = allocator();
        let policy = Watermark { high: 10, low: 4 };
        let mut conn = connection();

        let mut sink = OutputSink::new(allocator.as_ref(), None);
        sink.put(&[7; 12]).unwrap();
        conn.enqueue(sink.finish());
        assert_eq!(conn.update_backpressure(&policy), Some(true));
        assert!(!conn.wants_read());

        conn.stream_mut().write_budget = 6;
        conn.flush().unwrap();
        assert_eq!(conn.update_backpressure(&policy), None);

        conn.stream_mut().write_budget = 3;
        conn.flush().unwrap();
        assert_eq!(conn.queued_bytes(), 3);
        assert_eq!(conn.update_backpressure(&policy), Some(false));
        assert!(conn.wants_read());
    }

    #[test]
    fn closing_drops_output_and_flags_requests() {
        let allocator = allocator();
        let mut conn = connection();
        let flag = conn.closed_flag();
        let mut sink = OutputSink::new(allocator.as_ref(), None);
        sink.put(b"never sent").unwrap();
        conn.enqueue(sink.finish());

        conn.begin_close();
        assert_eq!(conn.state(), ConnState::Closing);
        assert!(!conn.wants_read());
        conn.mark_closed();
        assert!(flag.load(Ordering::Acquire));
        assert!(conn.is_idle());
        assert_eq!(allocator.memtotal(), 0);
    }

    proptest! {
        #[test]
        fn any_chunking_yields_the_same_frames(
            frames in 1usize..20,
            cuts in proptest::collection::vec(any::<prop::sample::Index>(), 0..10),
        ) {
            let data: Vec<u8> = (0..frames * 10).map(|i| (i * 7 % 251) as u8).collect();
            let mut bounds: Vec<usize> = cuts.iter().map(|c| c.index(data.len())).collect();
            bounds.push(0);
            bounds.push(data.len());
            bounds.sort_unstable();
            bounds.dedup();

            let arena = Arena::acquire(allocator(), 256).unwrap();
            let mut conn = connection();
            let mut decoded = Vec::new();
            for pair in bounds.windows(2) {
                decoded.extend(feed(&mut conn, &data[pair[0]..pair[1]], &arena).unwrap());
            }

            prop_assert_eq!(decoded.len(), frames);
            for (i, frame) in decoded.iter().enumerate() {
                prop_assert_eq!(&frame[..], &data[i * 10..(i + 1) * 10]);
            }
        }
    }
}
