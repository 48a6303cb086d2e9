// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Control-channel integration: ping/pong, heartbeats, retries, failure.

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use common::{wait_until, ClientEvent, RecordingClient, WAIT};
use crossbeam::channel::unbounded;
use kinstream::protocol::{
    self, ErrorPayload, MessageType, ServerIdentity, PROTOCOL_VERSION,
};
use kinstream::transport::{RepSocket, ReqSocket, SocketEvent};
use kinstream::{Client, Context, MockKinect, Server};

fn localhost() -> std::net::IpAddr {
    "127.0.0.1".parse().unwrap()
}

fn test_server(ctx: &Arc<Context>) -> Server {
    Server::builder()
        .name("itest-server")
        .address(localhost())
        .context(Arc::clone(ctx))
        .start_immediately()
        .build()
        .unwrap()
}

fn control_endpoint(server: &Server) -> String {
    server
        .endpoints()
        .get(&kinstream::EndpointType::Control)
        .unwrap()
        .clone()
}

#[test]
fn test_ping_pong() {
    common::init();
    let ctx = Context::new().unwrap();
    let server = test_server(&ctx);

    let listener = Arc::new(RecordingClient::default());
    let client = Client::builder(control_endpoint(&server))
        .context(Arc::clone(&ctx))
        .listener(listener.clone())
        .connect_immediately()
        .build()
        .unwrap();
    assert!(client.is_connected());

    let ponged = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ponged);
    client.ping(move || flag.store(true, Ordering::Release)).unwrap();

    assert!(wait_until(WAIT, || ponged.load(Ordering::Acquire)));
    assert!(client.is_connected());
    assert_eq!(listener.count(&ClientEvent::Connect), 1);
    assert_eq!(listener.count(&ClientEvent::Disconnect), 0);
}

#[test]
fn test_many_pings_replied_in_order() {
    common::init();
    let ctx = Context::new().unwrap();
    let server = test_server(&ctx);

    let client = Client::builder(control_endpoint(&server))
        .context(Arc::clone(&ctx))
        .connect_immediately()
        .build()
        .unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    for n in 0..10usize {
        let order = Arc::clone(&order);
        client.ping(move || order.lock().unwrap().push(n)).unwrap();
    }

    assert!(wait_until(WAIT, || order.lock().unwrap().len() == 10));
    assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<_>>());
}

#[test]
fn test_connect_disconnect_lifecycle() {
    common::init();
    let ctx = Context::new().unwrap();
    let server = test_server(&ctx);

    let listener = Arc::new(RecordingClient::default());
    let client = Client::builder(control_endpoint(&server))
        .context(Arc::clone(&ctx))
        .listener(listener.clone())
        .build()
        .unwrap();

    assert!(!client.is_connected());
    client.connect().unwrap();
    assert!(client.is_connected());
    client.disconnect().unwrap();
    assert!(!client.is_connected());

    assert_eq!(listener.count(&ClientEvent::Connect), 1);
    assert_eq!(listener.count(&ClientEvent::Disconnect), 1);
}

#[test]
fn test_server_name_learned_from_heartbeat() {
    common::init();
    let ctx = Context::new().unwrap();
    let server = test_server(&ctx);

    let client = Client::builder(control_endpoint(&server))
        .context(Arc::clone(&ctx))
        .connect_immediately()
        .build()
        .unwrap();

    assert!(wait_until(WAIT, || {
        client.server_name().as_deref() == Some("itest-server")
    }));
}

#[test]
fn test_device_set_tracked_via_heartbeat() {
    common::init();
    let ctx = Context::new().unwrap();
    let server = test_server(&ctx);

    let listener = Arc::new(RecordingClient::default());
    let client = Client::builder(control_endpoint(&server))
        .context(Arc::clone(&ctx))
        .listener(listener.clone())
        .heartbeat_period(Duration::from_millis(100))
        .connect_immediately()
        .build()
        .unwrap();

    // Attach after the initial identity exchange so the add arrives via a
    // periodic heartbeat.
    assert!(wait_until(WAIT, || client.server_name().is_some()));
    let kinect = Arc::new(MockKinect::with_device_id("K1"));
    server.add_kinect(kinect).unwrap();

    assert!(wait_until(WAIT, || {
        listener.count(&ClientEvent::AddKinect("K1".into())) == 1
    }));
    assert_eq!(client.kinect_ids(), vec!["K1".to_string()]);

    server.remove_kinect("K1").unwrap();
    assert!(wait_until(WAIT, || {
        listener.count(&ClientEvent::RemoveKinect("K1".into())) == 1
    }));
    assert!(client.kinect_ids().is_empty());
}

#[test]
fn test_device_attached_before_connect_is_reported() {
    common::init();
    let ctx = Context::new().unwrap();
    let server = test_server(&ctx);
    server
        .add_kinect(Arc::new(MockKinect::with_device_id("K0")))
        .unwrap();

    let listener = Arc::new(RecordingClient::default());
    let client = Client::builder(control_endpoint(&server))
        .context(Arc::clone(&ctx))
        .listener(listener.clone())
        .connect_immediately()
        .build()
        .unwrap();

    assert!(wait_until(WAIT, || {
        client.kinect_ids() == vec!["K0".to_string()]
    }));
    assert_eq!(listener.count(&ClientEvent::AddKinect("K0".into())), 1);
}

#[test]
fn test_unknown_tag_gets_error_400_and_session_survives() {
    common::init();
    let ctx = Context::new().unwrap();
    let server = test_server(&ctx);

    let (tx, rx) = unbounded();
    let req = ReqSocket::connect(&ctx, &control_endpoint(&server), tx).unwrap();

    // A well-formed message with a tag the server does not know.
    req.send(vec![vec![0x7f]]).unwrap();
    let parts = recv_message(&rx);
    let (msg_type, payload) = protocol::parse_message(&parts).unwrap();
    assert_eq!(msg_type, MessageType::Error);
    let error: ErrorPayload = serde_json::from_value(payload.unwrap()).unwrap();
    assert_eq!(error.code, 400);

    // A malformed (three-part) message also gets a 400 reply.
    req.send(vec![vec![0x01], vec![], vec![]]).unwrap();
    let parts = recv_message(&rx);
    let (msg_type, _) = protocol::parse_message(&parts).unwrap();
    assert_eq!(msg_type, MessageType::Error);

    // The request socket stays usable afterwards.
    req.send(protocol::encode_message(MessageType::Ping, None))
        .unwrap();
    let parts = recv_message(&rx);
    let (msg_type, _) = protocol::parse_message(&parts).unwrap();
    assert_eq!(msg_type, MessageType::Pong);
}

#[test]
fn test_who_is_idempotent() {
    common::init();
    let ctx = Context::new().unwrap();
    let server = test_server(&ctx);
    server
        .add_kinect(Arc::new(MockKinect::with_device_id("K1")))
        .unwrap();

    let (tx, rx) = unbounded();
    let req = ReqSocket::connect(&ctx, &control_endpoint(&server), tx).unwrap();

    req.send(protocol::encode_message(MessageType::Who, None))
        .unwrap();
    let first = recv_message(&rx);
    req.send(protocol::encode_message(MessageType::Who, None))
        .unwrap();
    let second = recv_message(&rx);

    // Unchanged server state: byte-identical identity replies.
    assert_eq!(first, second);

    let (msg_type, payload) = protocol::parse_message(&first).unwrap();
    assert_eq!(msg_type, MessageType::Me);
    let identity: ServerIdentity = serde_json::from_value(payload.unwrap()).unwrap();
    assert_eq!(identity.version, PROTOCOL_VERSION);
    assert_eq!(identity.name, "itest-server");
    assert_eq!(identity.devices.len(), 1);
    assert_eq!(identity.devices[0].id, "K1");
    assert!(identity.devices[0].endpoints.contains_key("depth"));
}

#[test]
fn test_stall_recovery_reconnects_and_succeeds() {
    common::init();
    let ctx = Context::new().unwrap();

    // Control server that answers correctly but delays its first reply
    // beyond one request timeout, so the client reconnects and resends.
    let (srv_tx, srv_rx) = unbounded();
    let rep = RepSocket::bind(&ctx, localhost(), 0, srv_tx).unwrap();
    let endpoint = rep.endpoint();

    let served = Arc::new(AtomicUsize::new(0));
    let served_count = Arc::clone(&served);
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = Arc::clone(&stop);
    let handler = std::thread::spawn(move || {
        let start = Instant::now();
        let stall = Duration::from_millis(450);
        while !stop_flag.load(Ordering::Relaxed) {
            let event = match srv_rx.recv_timeout(Duration::from_millis(50)) {
                Ok(event) => event,
                Err(_) => continue,
            };
            if let SocketEvent::Message { peer, parts, .. } = event {
                if let Some(wait) = stall.checked_sub(start.elapsed()) {
                    std::thread::sleep(wait);
                }
                let reply = match protocol::parse_message(&parts) {
                    Ok((MessageType::Ping, _)) => {
                        protocol::encode_message(MessageType::Pong, None)
                    }
                    _ => protocol::encode_payload(
                        MessageType::Me,
                        &ServerIdentity {
                            version: PROTOCOL_VERSION,
                            name: "stall-server".into(),
                            endpoints: Default::default(),
                            devices: Vec::new(),
                        },
                    )
                    .unwrap(),
                };
                let _ = rep.reply(peer, reply);
                served_count.fetch_add(1, Ordering::Relaxed);
            }
        }
    });

    let listener = Arc::new(RecordingClient::default());
    let client = Client::builder(endpoint)
        .context(Arc::clone(&ctx))
        .listener(listener.clone())
        .request_timeout(Duration::from_millis(200))
        .request_max_tries(5)
        .connect_immediately()
        .build()
        .unwrap();

    // The initial `who` times out at least once, the session survives, and
    // the identity lands after the stall clears.
    assert!(wait_until(WAIT, || {
        client.server_name().as_deref() == Some("stall-server")
    }));
    assert!(client.is_connected());
    assert_eq!(listener.count(&ClientEvent::Disconnect), 0);

    let ponged = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ponged);
    client.ping(move || flag.store(true, Ordering::Release)).unwrap();
    assert!(wait_until(WAIT, || ponged.load(Ordering::Acquire)));

    drop(client);
    stop.store(true, Ordering::Relaxed);
    handler.join().unwrap();
}

#[test]
fn test_retry_exhaustion_disconnects_exactly_once() {
    common::init();
    let ctx = Context::new().unwrap();

    // Nothing listens here: grab a free port and release it.
    let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let dead = format!("tcp://{}", probe.local_addr().unwrap());
    drop(probe);

    let listener = Arc::new(RecordingClient::default());
    let client = Client::builder(dead)
        .context(Arc::clone(&ctx))
        .listener(listener.clone())
        .request_timeout(Duration::from_millis(150))
        .request_max_tries(2)
        .build()
        .unwrap();

    let started = Instant::now();
    client.connect().unwrap();

    assert!(wait_until(WAIT, || {
        listener.count(&ClientEvent::Disconnect) == 1
    }));
    // Roughly max_tries * request_timeout.
    assert!(started.elapsed() >= Duration::from_millis(250));
    assert!(!client.is_connected());

    // No further disconnects arrive afterwards.
    std::thread::sleep(Duration::from_millis(400));
    assert_eq!(listener.count(&ClientEvent::Disconnect), 1);
}

#[test]
fn test_stopping_server_disconnects_client() {
    common::init();
    let ctx = Context::new().unwrap();
    let server = test_server(&ctx);

    let listener = Arc::new(RecordingClient::default());
    let client = Client::builder(control_endpoint(&server))
        .context(Arc::clone(&ctx))
        .listener(listener.clone())
        .heartbeat_period(Duration::from_millis(100))
        .request_timeout(Duration::from_millis(150))
        .request_max_tries(2)
        .connect_immediately()
        .build()
        .unwrap();

    assert!(wait_until(WAIT, || client.server_name().is_some()));
    server.stop().unwrap();

    // The next heartbeat goes unanswered; retries exhaust; one disconnect.
    assert!(wait_until(WAIT, || {
        listener.count(&ClientEvent::Disconnect) == 1
    }));
    assert!(!client.is_connected());
}

#[test]
fn test_disconnect_cancels_inflight_handlers() {
    common::init();
    let ctx = Context::new().unwrap();

    let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let dead = format!("tcp://{}", probe.local_addr().unwrap());
    drop(probe);

    let listener = Arc::new(RecordingClient::default());
    let client = Client::builder(dead)
        .context(Arc::clone(&ctx))
        .listener(listener.clone())
        .request_timeout(Duration::from_secs(30))
        .build()
        .unwrap();

    client.connect().unwrap();
    let fired = Arc::new(AtomicBool::new(false));
    for _ in 0..3 {
        let flag = Arc::clone(&fired);
        client.ping(move || flag.store(true, Ordering::Release)).unwrap();
    }

    client.disconnect().unwrap();
    assert_eq!(listener.count(&ClientEvent::Disconnect), 1);

    std::thread::sleep(Duration::from_millis(200));
    assert!(!fired.load(Ordering::Acquire));
}

fn recv_message(rx: &crossbeam::channel::Receiver<SocketEvent>) -> Vec<Vec<u8>> {
    let deadline = Instant::now() + WAIT;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining) {
            Ok(SocketEvent::Message { parts, .. }) => return parts,
            Ok(_) => continue,
            Err(e) => panic!("no reply: {}", e),
        }
    }
}
