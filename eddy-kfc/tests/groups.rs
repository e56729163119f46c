//! Group messaging between KFC instances over loopback.

use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use eddy_config::{IoConfig, KfcConfig};
use eddy_core::alloc::SystemAllocator;
use eddy_kfc::{AgentState, Kfc, KfcError, KfcPacket, MembershipError, SchedulerKind};
use eddy_telemetry::MetricsRecorder;

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn kfc(membership: &str, local: &[&str], workers: usize) -> Kfc {
    let config = KfcConfig {
        local_hosts: local.iter().map(|host| host.to_string()).collect(),
        ..KfcConfig::default()
    };
    let io = IoConfig {
        io_threads: 2,
        worker_threads: workers,
        tick_ms: 10,
        ..IoConfig::default()
    };
    let kfc = Kfc::create(
        membership.parse().unwrap(),
        config,
        io,
        Arc::new(SystemAllocator::new()),
        Arc::new(MetricsRecorder::new().unwrap()),
    )
    .unwrap();
    kfc.start().unwrap();
    kfc
}

/// A server instance that answers every request in `group` with `tag`.
fn tagged_server(group: &str, port: u16, tag: &'static [u8]) -> Kfc {
    let server = kfc(
        &format!("127.0.0.1 role=server group={group} port={port}"),
        &["127.0.0.1"],
        0,
    );
    server
        .join_server(group, move |_: &KfcPacket| Some(Bytes::from_static(tag)))
        .unwrap();
    server
}

fn client_of(group: &str, ports: &[u16]) -> Kfc {
    let mut records = format!("app-host role=client group={group} port=0\n");
    for port in ports {
        records.push_str(&format!("127.0.0.1 role=server group={group} port={port}\n"));
    }
    kfc(&records, &["app-host"], 0)
}

fn wait_until(mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(5));
    }
}

#[tokio::test]
async fn both_roles_in_one_process() {
    let port = free_port();
    let node = kfc(
        &format!("127.0.0.1 role=both group=echo port={port}"),
        &["127.0.0.1"],
        2,
    );
    let bound = node
        .join_server("echo", |request: &KfcPacket| Some(request.payload.clone()))
        .unwrap();
    assert_eq!(bound.len(), 1);
    assert_eq!(bound[0].port(), port);
    node.allow_client("echo", "*", true).unwrap();

    let agent = node.join_client("echo").unwrap();
    assert_eq!(agent.state(), AgentState::Active);
    let timeout = Duration::from_secs(2);
    let channels: Vec<u64> = (0..50)
        .map(|i| agent.send(Bytes::from(format!("msg-{i}")), timeout).unwrap())
        .collect();
    for (i, channel) in channels.into_iter().enumerate().rev() {
        let reply = agent.recv_channel(channel, timeout).await.unwrap();
        assert_eq!(reply, Bytes::from(format!("msg-{i}")));
    }
    assert_eq!(agent.outstanding(), 0);
    assert!(matches!(
        agent.recv(timeout).await,
        Err(KfcError::NoPending(_))
    ));
}

#[tokio::test]
async fn silent_server_times_out_and_drops_late_replies() {
    let (silent_port, slow_port) = (free_port(), free_port());
    let silent = kfc(
        &format!("127.0.0.1 role=server group=silent port={silent_port}"),
        &["127.0.0.1"],
        0,
    );
    silent.join_server("silent", |_: &KfcPacket| None).unwrap();

    let start = Instant::now();
    let client = client_of("silent", &[silent_port]);
    let agent = client.join_client("silent").unwrap();
    let sent = Instant::now();
    let channel = agent
        .send(Bytes::from_static(b"hello"), Duration::from_millis(100))
        .unwrap();
    assert!(matches!(
        agent.recv_channel(channel, Duration::from_secs(2)).await,
        Err(KfcError::Timeout)
    ));
    let waited = sent.elapsed();
    eprintln!("100ms request timed out after {waited:?}");
    assert!(waited >= Duration::from_millis(100), "timed out after {waited:?}");
    assert!(waited <= Duration::from_millis(170), "timed out after {waited:?}");
    assert!(start.elapsed() < Duration::from_secs(2));

    let slow = kfc(
        &format!("127.0.0.1 role=server group=slow port={slow_port}"),
        &["127.0.0.1"],
        2,
    );
    slow.join_server("slow", |request: &KfcPacket| {
        thread::sleep(Duration::from_millis(200));
        Some(request.payload.clone())
    })
    .unwrap();

    let client = client_of("slow", &[slow_port]);
    let agent = client.join_client("slow").unwrap();
    let channel = agent
        .send(Bytes::from_static(b"late"), Duration::from_millis(100))
        .unwrap();
    assert!(matches!(
        agent.recv_channel(channel, Duration::from_secs(2)).await,
        Err(KfcError::Timeout)
    ));
    wait_until(|| client.metrics().late_responses.get() == 1);
    assert!(matches!(
        agent.recv_channel(channel, Duration::from_millis(10)).await,
        Err(KfcError::NoPending(c)) if c == channel
    ));
    assert_eq!(client.metrics().responses.get(), 0);
}

#[tokio::test]
async fn round_robin_rotates_and_hashed_sticks() {
    let ports = [free_port(), free_port(), free_port()];
    let _servers = [
        tagged_server("rot", ports[0], b"A"),
        tagged_server("rot", ports[1], b"B"),
        tagged_server("rot", ports[2], b"C"),
    ];
    let client = client_of("rot", &ports);
    let agent = client.join_client("rot").unwrap();
    assert_eq!(agent.scheduler_kind(), SchedulerKind::RoundRobin);
    assert_eq!(agent.servers().len(), 3);

    let timeout = Duration::from_secs(2);
    let mut order = Vec::new();
    for _ in 0..6 {
        let channel = agent.send(Bytes::from_static(b"x"), timeout).unwrap();
        order.push(agent.recv_channel(channel, timeout).await.unwrap());
    }
    let tags: String = order
        .iter()
        .map(|tag| String::from_utf8_lossy(tag).into_owned())
        .collect();
    assert_eq!(tags, "ABCABC");

    agent.choice_scheduler(SchedulerKind::Hashed);
    let mut seen = Vec::new();
    for _ in 0..5 {
        let channel = agent.send_keyed(42, Bytes::from_static(b"x"), timeout).unwrap();
        seen.push(agent.recv_channel(channel, timeout).await.unwrap());
    }
    assert!(seen.iter().all(|tag| tag == &seen[0]));

    agent.choice_scheduler(SchedulerKind::ResponseTime);
    for _ in 0..10 {
        agent.send(Bytes::from_static(b"x"), timeout).unwrap();
        agent.recv(timeout).await.unwrap();
    }
}

#[tokio::test]
async fn access_rules_gate_connections() {
    let port = free_port();
    let server = tagged_server("guarded", port, b"ok");
    let timeout = Duration::from_millis(500);

    server.allow_client("guarded", "10.1.2.*", false).unwrap();
    let client = client_of("guarded", &[port]);
    let agent = client.join_client("guarded").unwrap();
    let channel = agent.send(Bytes::from_static(b"x"), timeout).unwrap();
    assert_eq!(&agent.recv_channel(channel, timeout).await.unwrap()[..], b"ok");

    server.allow_client("guarded", "127.0.0.*", false).unwrap();
    let client = client_of("guarded", &[port]);
    let agent = client.join_client("guarded").unwrap();
    let channel = agent.send(Bytes::from_static(b"x"), timeout).unwrap();
    let err = agent.recv_channel(channel, timeout).await.unwrap_err();
    assert!(
        matches!(err, KfcError::Transport(_) | KfcError::Timeout),
        "unexpected {err:?}"
    );
    wait_until(|| server.metrics().connections_rejected.get() >= 1);
}

#[tokio::test]
async fn leave_drains_outstanding_channels() {
    let port = free_port();
    let server = kfc(
        &format!("127.0.0.1 role=server group=sink port={port}"),
        &["127.0.0.1"],
        0,
    );
    server.join_server("sink", |_: &KfcPacket| None).unwrap();

    let client = client_of("sink", &[port]);
    let agent = client.join_client("sink").unwrap();
    for _ in 0..3 {
        agent
            .send(Bytes::from_static(b"x"), Duration::from_secs(30))
            .unwrap();
    }
    assert_eq!(agent.outstanding(), 3);

    let started = Instant::now();
    agent.leave().await;
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(agent.state(), AgentState::Left);
    assert_eq!(agent.outstanding(), 0);
    assert!(matches!(
        agent.send(Bytes::from_static(b"x"), Duration::from_secs(1)),
        Err(KfcError::State("left"))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sends_racing_leave_are_refused_or_drained() {
    let port = free_port();
    let server = kfc(
        &format!("127.0.0.1 role=server group=race port={port}"),
        &["127.0.0.1"],
        0,
    );
    server.join_server("race", |_: &KfcPacket| None).unwrap();

    let client = client_of("race", &[port]);
    let agent = Arc::new(client.join_client("race").unwrap());
    let senders: Vec<_> = (0..4)
        .map(|_| {
            let agent = Arc::clone(&agent);
            thread::spawn(move || {
                let mut accepted = 0usize;
                loop {
                    match agent.send(Bytes::from_static(b"x"), Duration::from_secs(30)) {
                        Ok(_) => accepted += 1,
                        Err(KfcError::State(_)) => return accepted,
                        Err(e) => panic!("unexpected {e:?}"),
                    }
                    thread::sleep(Duration::from_millis(1));
                }
            })
        })
        .collect();

    wait_until(|| agent.outstanding() >= 20);
    agent.leave().await;
    let accepted: usize = senders.into_iter().map(|h| h.join().unwrap()).sum();
    assert!(accepted >= 20);
    assert_eq!(agent.state(), AgentState::Left);
    assert_eq!(agent.outstanding(), 0);
}

#[test]
fn membership_errors_leave_no_state_behind() {
    let node = kfc(
        "127.0.0.1 role=client group=empty port=1\n\
         10.9.9.9 role=server group=remote port=7000\n\
         127.0.0.1 role=client group=remote port=1\n",
        &["127.0.0.1"],
        0,
    );

    assert!(matches!(
        node.join_client("missing"),
        Err(KfcError::Membership(MembershipError::UnknownGroup(_)))
    ));
    assert!(matches!(
        node.allow_client("missing", "*", false),
        Err(KfcError::Membership(MembershipError::UnknownGroup(_)))
    ));
    assert!(matches!(
        node.join_client("empty"),
        Err(KfcError::Membership(MembershipError::NoServers(_)))
    ));
    assert!(matches!(
        node.join_server("remote", |_: &KfcPacket| None),
        Err(KfcError::Membership(MembershipError::NotAMember { role: "server", .. }))
    ));
    assert!(matches!(
        node.allow_client("remote", "10.300.*", true),
        Err(KfcError::Membership(MembershipError::Pattern { .. }))
    ));

    let agent = node.join_client("remote").unwrap();
    let remote: SocketAddr = "10.9.9.9:7000".parse().unwrap();
    assert_eq!(agent.servers().to_vec(), vec![remote]);
}

#[test]
fn blocking_receive_outside_a_runtime() {
    let port = free_port();
    let _server = tagged_server("plain", port, b"pong");
    let client = client_of("plain", &[port]);
    let agent = client.join_client("plain").unwrap();

    for _ in 0..3 {
        agent
            .send(Bytes::from_static(b"ping"), Duration::from_secs(2))
            .unwrap();
    }
    for _ in 0..3 {
        assert_eq!(&agent.recv_blocking().unwrap()[..], b"pong");
    }
    assert!(matches!(agent.recv_blocking(), Err(KfcError::NoPending(_))));
}
