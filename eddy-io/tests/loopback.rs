//! End-to-end runs of a server engine and a client engine over loopback.

use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes};
use eddy_config::IoConfig;
use eddy_core::alloc::{Allocator, SlabAllocator, SystemAllocator, Zone};
use eddy_io::{
    Codec, Decoded, Eio, Handler, Input, NoServer, OutputSink, ProtocolError, Request,
    SessionError,
};
use eddy_telemetry::MetricsRecorder;
use parking_lot::Mutex;
use tracing_test::traced_test;

/// `u32` body length, `u64` id, body.
#[derive(Debug, Clone, PartialEq)]
struct Frame {
    id: u64,
    body: Bytes,
}

const HEADER: usize = 12;

struct FrameCodec;

impl Codec for FrameCodec {
    type Packet = Frame;

    fn decode(&self, input: &mut Input<'_>) -> Decoded<Frame> {
        if input.len() < HEADER {
            return Decoded::NeedMore(HEADER - input.len());
        }
        let mut header = &input.peek()[..HEADER];
        let len = header.get_u32() as usize;
        let id = header.get_u64();
        if input.len() < HEADER + len {
            return Decoded::NeedMore(HEADER + len - input.len());
        }
        input.skip(HEADER);
        Decoded::Packet(Frame {
            id,
            body: input.take(len),
        })
    }

    fn encode(&self, frame: &Frame, out: &mut OutputSink<'_>) -> Result<(), ProtocolError> {
        out.put_u32(frame.body.len() as u32)?;
        out.put_u64(frame.id)?;
        out.put(&frame.body)?;
        Ok(())
    }

    fn session_id(&self, frame: &Frame) -> Option<u64> {
        (frame.id != 0).then_some(frame.id)
    }
}

fn config(worker_threads: usize) -> IoConfig {
    IoConfig {
        io_threads: 2,
        worker_threads,
        tick_ms: 10,
        ..IoConfig::default()
    }
}

fn slab_allocator() -> Arc<dyn Allocator> {
    let zone = Arc::new(Zone::create(8 << 20).unwrap());
    Arc::new(SlabAllocator::with_defaults(zone).unwrap())
}

fn engine<H: Handler<Frame>>(handler: H, workers: usize) -> Eio<FrameCodec, H> {
    let engine = Eio::new(
        FrameCodec,
        handler,
        config(workers),
        slab_allocator(),
        Arc::new(MetricsRecorder::new().unwrap()),
    )
    .unwrap();
    engine.start().unwrap();
    engine
}

fn client() -> Eio<FrameCodec, NoServer> {
    let engine = Eio::new(
        FrameCodec,
        NoServer,
        config(0),
        Arc::new(SystemAllocator::new()),
        Arc::new(MetricsRecorder::new().unwrap()),
    )
    .unwrap();
    engine.start().unwrap();
    engine
}

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn frame(id: u64, body: &'static [u8]) -> Frame {
    Frame {
        id,
        body: Bytes::from_static(body),
    }
}

fn echo(request: &mut Request<Frame>) {
    if let Some(frame) = request.take_input() {
        request.reply(frame);
    }
}

fn wait_until(mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn echo_inline_and_on_workers() {
    for workers in [0, 2] {
        let server = engine(echo, workers);
        let addr = server.listen(loopback()).unwrap();
        let client = client();

        let pending: Vec<_> = (1..=100u64)
            .map(|id| client.send(addr, frame(id, b"ping"), Duration::from_secs(5)))
            .collect();
        for (id, pending) in (1..=100u64).zip(pending) {
            assert_eq!(pending.id(), id);
            assert_eq!(pending.blocking_wait(), Ok(frame(id, b"ping")));
        }
        assert_eq!(server.metrics().requests.get(), 100);
        wait_until(|| client.metrics().responses.get() == 100);
        assert_eq!(client.metrics().late_responses.get(), 0);
    }
}

#[test]
fn requests_on_one_connection_reach_the_handler_in_order() {
    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<(u64, u64)>>>);

    impl Handler<Frame> for Recorder {
        fn process(&self, request: &mut Request<Frame>) {
            self.0.lock().push((request.conn_id(), request.seq()));
            echo(request);
        }
    }

    let recorder = Recorder::default();
    let server = engine(recorder.clone(), 3);
    let addr = server.listen(loopback()).unwrap();
    let client = client();

    let pending: Vec<_> = (1..=200u64)
        .map(|id| client.send(addr, frame(id, b"x"), Duration::from_secs(5)))
        .collect();
    for pending in pending {
        assert!(pending.blocking_wait().is_ok());
    }

    let seen = recorder.0.lock().clone();
    assert_eq!(seen.len(), 200);
    let conn = seen[0].0;
    assert!(seen.iter().all(|&(c, _)| c == conn));
    let seqs: Vec<u64> = seen.iter().map(|&(_, seq)| seq).collect();
    assert_eq!(seqs, (0..200).collect::<Vec<_>>());
}

#[test]
fn unanswered_request_times_out() {
    let server = engine(|_: &mut Request<Frame>| {}, 0);
    let addr = server.listen(loopback()).unwrap();
    let client = client();

    let started = Instant::now();
    let outcome = client
        .send(addr, frame(7, b"silence"), Duration::from_millis(100))
        .blocking_wait();
    let elapsed = started.elapsed();

    assert_eq!(outcome, Err(SessionError::Timeout));
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_secs(2));
    wait_until(|| client.metrics().session_timeouts.get() == 1);
}

#[test]
fn cancelled_request_resolves_immediately() {
    let server = engine(|_: &mut Request<Frame>| {}, 0);
    let addr = server.listen(loopback()).unwrap();
    let client = client();

    let pending = client.send(addr, frame(11, b"wait"), Duration::from_secs(30));
    client.cancel(11);
    assert_eq!(pending.blocking_wait(), Err(SessionError::Cancelled));
}

#[test]
fn access_control_rejects_before_any_request() {
    struct DenyAll;

    impl Handler<Frame> for DenyAll {
        fn on_connect(&self, _peer: SocketAddr, _local: SocketAddr) -> bool {
            false
        }

        fn process(&self, request: &mut Request<Frame>) {
            echo(request);
        }
    }

    let server = engine(DenyAll, 0);
    let addr = server.listen(loopback()).unwrap();
    let client = client();

    let outcome = client
        .send(addr, frame(3, b"denied"), Duration::from_secs(5))
        .blocking_wait();
    assert!(matches!(
        outcome,
        Err(SessionError::ConnectionClosed | SessionError::ConnectFailed)
    ));
    wait_until(|| server.metrics().connections_rejected.get() == 1);
    assert_eq!(server.metrics().requests.get(), 0);
}

#[test]
fn unreachable_peer_fails_to_connect() {
    let closed = {
        let probe = TcpListener::bind(loopback()).unwrap();
        probe.local_addr().unwrap()
    };
    let client = client();
    let outcome = client
        .send(closed, frame(1, b"nobody"), Duration::from_secs(5))
        .blocking_wait();
    assert_eq!(outcome, Err(SessionError::ConnectFailed));
}

#[test]
fn packets_without_session_ids_are_refused() {
    let client = client();
    let pending = client.send(loopback(), frame(0, b"anonymous"), Duration::from_secs(1));
    assert_eq!(pending.id(), 0);
    assert_eq!(pending.blocking_wait(), Err(SessionError::Unkeyed));
}

#[traced_test]
#[test]
fn stop_drains_in_flight_requests() {
    let entered = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&entered);
    let server = engine(
        move |request: &mut Request<Frame>| {
            flag.store(true, Ordering::Release);
            thread::sleep(Duration::from_millis(100));
            echo(request);
        },
        1,
    );
    let addr = server.listen(loopback()).unwrap();
    let client = client();

    let pending = client.send(addr, frame(5, b"slow"), Duration::from_secs(5));
    wait_until(|| entered.load(Ordering::Acquire));
    server.stop();
    assert!(logs_contain("Listener queued"));
    assert!(logs_contain("Engine stopping"));

    assert_eq!(pending.blocking_wait(), Ok(frame(5, b"slow")));
    server.wait();
    assert!(matches!(server.listen(loopback()), Err(eddy_io::EngineError::Stopped)));

    let refused = client.send(addr, frame(6, b"late"), Duration::from_secs(1));
    assert!(matches!(
        refused.blocking_wait(),
        Err(SessionError::ConnectFailed | SessionError::ConnectionClosed)
    ));

    client.stop();
    let after = client.send(addr, frame(8, b"gone"), Duration::from_secs(1));
    assert_eq!(after.blocking_wait(), Err(SessionError::Shutdown));
}
