// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Stream client.
//!
//! A client supervises one request/reply session with a server: it issues
//! periodic `who` heartbeats to track the device and endpoint set, retries
//! timed-out requests by recreating the request socket, and manages
//! best-effort subscriptions to per-device depth streams.
//!
//! # Request pipeline
//!
//! Outbound requests form an ordered queue. Every reply matches the head of
//! the queue (the protocol is strict FIFO), so a reply cancels the head
//! timeout, pops the head, and resets the retry budget. A head timeout
//! burns one try; when tries run out the client disconnects. Otherwise the
//! request socket is recreated to discard its stuck state and the whole
//! queue is retransmitted in order, which is safe because `ping` and `who`
//! are idempotent. Only the head timeout is re-armed on retransmit; downstream
//! deadlines keep their original arming, which is tolerated because replies
//! still arrive in order.
//!
//! # Threading
//!
//! All session state lives on the client's event-loop thread. Public
//! methods marshal onto it and fail fast with
//! [`Error::NotConnected`] when no session is active. Listener callbacks
//! are invoked on the loop thread and must not block.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, unbounded, Receiver, Sender};
use crossbeam::select;
use parking_lot::Mutex;
use serde_json::Value;

use crate::compress::CompressedFrame;
use crate::error::{Error, Result};
use crate::protocol::{
    encode_message, parse_message, EndpointType, MessageType, ServerIdentity, PROTOCOL_VERSION,
};
use crate::transport::{Context, ReqSocket, SocketEvent, SocketId, SubSocket};

// ============================================================================
// Configuration
// ============================================================================

/// Client session tuning knobs.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Interval between automatic `who` requests.
    pub heartbeat_period: Duration,
    /// Per-attempt deadline for any request.
    pub request_timeout: Duration,
    /// Attempts before declaring the peer dead and disconnecting.
    pub request_max_tries: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            heartbeat_period: Duration::from_millis(10_000),
            request_timeout: Duration::from_millis(500),
            request_max_tries: 3,
        }
    }
}

/// Callbacks emitted by a [`Client`].
///
/// Invoked on the client's event-loop thread; implementations must be
/// `Send + Sync` and must not block.
pub trait ClientListener: Send + Sync {
    /// The session connected.
    fn on_connect(&self) {}

    /// The session ended, voluntarily or after retry exhaustion.
    fn on_disconnect(&self) {}

    /// A heartbeat reported a new device.
    fn on_add_kinect(&self, device_id: &str) {
        let _ = device_id;
    }

    /// A heartbeat reported a device gone.
    fn on_remove_kinect(&self, device_id: &str) {
        let _ = device_id;
    }

    /// A compressed depth frame arrived on an enabled subscription.
    /// Decompression is the subscriber's business.
    fn on_depth_frame(&self, device_id: &str, frame: &CompressedFrame) {
        let _ = (device_id, frame);
    }
}

/// Listener that ignores everything.
struct NoopListener;

impl ClientListener for NoopListener {}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`Client`].
pub struct ClientBuilder {
    control_endpoint: String,
    config: ClientConfig,
    connect_immediately: bool,
    context: Option<Arc<Context>>,
    listener: Arc<dyn ClientListener>,
}

impl ClientBuilder {
    pub fn heartbeat_period(mut self, period: Duration) -> Self {
        self.config.heartbeat_period = period;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn request_max_tries(mut self, tries: u32) -> Self {
        self.config.request_max_tries = tries.max(1);
        self
    }

    /// Connect during construction instead of waiting for
    /// [`Client::connect`].
    pub fn connect_immediately(mut self) -> Self {
        self.connect_immediately = true;
        self
    }

    /// Transport context. Defaults to the process-wide instance.
    pub fn context(mut self, context: Arc<Context>) -> Self {
        self.context = Some(context);
        self
    }

    pub fn listener(mut self, listener: Arc<dyn ClientListener>) -> Self {
        self.listener = listener;
        self
    }

    pub fn build(self) -> Result<Client> {
        let ctx = match self.context {
            Some(ctx) => ctx,
            None => Context::instance()?,
        };

        let shared = Arc::new(ClientShared {
            connected: AtomicBool::new(false),
            server_name: Mutex::new(None),
            kinect_ids: Mutex::new(Vec::new()),
        });

        let (cmd_tx, cmd_rx) = unbounded();
        let (socket_tx, socket_rx) = unbounded();

        let event_loop = ClientLoop {
            ctx,
            config: self.config,
            listener: self.listener,
            control_endpoint: self.control_endpoint.clone(),
            shared: Arc::clone(&shared),
            cmd_rx,
            socket_tx,
            socket_rx,
            req: None,
            pending: VecDeque::new(),
            tries_left: 0,
            next_heartbeat: None,
            devices: HashMap::new(),
            subs: HashMap::new(),
        };

        let thread = std::thread::Builder::new()
            .name("kinstream-client".to_string())
            .spawn(move || event_loop.run())?;

        let client = Client {
            control_endpoint: self.control_endpoint,
            shared,
            cmd_tx,
            thread: Mutex::new(Some(thread)),
        };

        if self.connect_immediately {
            client.connect()?;
        }
        Ok(client)
    }
}

// ============================================================================
// Public handle
// ============================================================================

struct ClientShared {
    connected: AtomicBool,
    server_name: Mutex<Option<String>>,
    kinect_ids: Mutex<Vec<String>>,
}

enum ClientCommand {
    Connect(Sender<Result<()>>),
    Disconnect(Sender<Result<()>>),
    Ping(Box<dyn FnOnce() + Send>, Sender<Result<()>>),
    EnableDepth(String, Sender<Result<()>>),
    DisableDepth(String, Sender<Result<()>>),
    Shutdown,
}

/// Client for one stream server's control endpoint.
pub struct Client {
    control_endpoint: String,
    shared: Arc<ClientShared>,
    cmd_tx: Sender<ClientCommand>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    /// Build a client for the given `tcp://host:port` control endpoint,
    /// typically taken from a discovered
    /// [`ServerInfo`](crate::discovery::ServerInfo).
    pub fn builder(control_endpoint: impl Into<String>) -> ClientBuilder {
        ClientBuilder {
            control_endpoint: control_endpoint.into(),
            config: ClientConfig::default(),
            connect_immediately: false,
            context: None,
            listener: Arc::new(NoopListener),
        }
    }

    fn call(&self, make: impl FnOnce(Sender<Result<()>>) -> ClientCommand) -> Result<()> {
        let (tx, rx) = bounded(1);
        self.cmd_tx
            .send(make(tx))
            .map_err(|_| Error::Disconnected("client event loop stopped".into()))?;
        rx.recv()
            .map_err(|_| Error::Disconnected("client event loop stopped".into()))?
    }

    /// Open the session: connect the request socket, schedule heartbeats,
    /// and issue the initial `who`.
    pub fn connect(&self) -> Result<()> {
        self.call(ClientCommand::Connect)
    }

    /// Close the session, cancelling every in-flight request.
    pub fn disconnect(&self) -> Result<()> {
        self.call(ClientCommand::Disconnect)
    }

    /// Send a `ping`; `callback` runs once on the matching `pong`, on the
    /// client's event-loop thread.
    pub fn ping(&self, callback: impl FnOnce() + Send + 'static) -> Result<()> {
        self.call(|tx| ClientCommand::Ping(Box::new(callback), tx))
    }

    /// Subscribe to a device's depth stream. The device id must have been
    /// reported by a heartbeat.
    pub fn enable_depth_frames(&self, device_id: &str) -> Result<()> {
        let device_id = device_id.to_string();
        self.call(|tx| ClientCommand::EnableDepth(device_id, tx))
    }

    /// Drop a device's depth subscription.
    pub fn disable_depth_frames(&self, device_id: &str) -> Result<()> {
        let device_id = device_id.to_string();
        self.call(|tx| ClientCommand::DisableDepth(device_id, tx))
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Server name learned from the last identity reply.
    pub fn server_name(&self) -> Option<String> {
        self.shared.server_name.lock().clone()
    }

    /// Device ids reported by the last identity reply.
    pub fn kinect_ids(&self) -> Vec<String> {
        self.shared.kinect_ids.lock().clone()
    }

    pub fn control_endpoint(&self) -> &str {
        &self.control_endpoint
    }

    /// Client-level endpoints.
    pub fn endpoints(&self) -> BTreeMap<EndpointType, String> {
        let mut endpoints = BTreeMap::new();
        endpoints.insert(EndpointType::Control, self.control_endpoint.clone());
        endpoints
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(ClientCommand::Shutdown);
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

// ============================================================================
// Event loop
// ============================================================================

enum ResponseHandler {
    /// User `ping`; the callback runs on the matching `pong`.
    Pong(Option<Box<dyn FnOnce() + Send>>),
    /// Internal heartbeat `who`.
    Identity,
}

struct PendingRequest {
    msg_type: MessageType,
    parts: Vec<Vec<u8>>,
    handler: ResponseHandler,
    deadline: Instant,
}

#[derive(Default)]
struct DeviceState {
    endpoints: HashMap<EndpointType, String>,
    subscriptions: HashMap<EndpointType, SubSocket>,
}

enum LoopAction {
    Command(ClientCommand),
    Socket(SocketEvent),
    Tick,
    Stop,
}

struct ClientLoop {
    ctx: Arc<Context>,
    config: ClientConfig,
    listener: Arc<dyn ClientListener>,
    control_endpoint: String,
    shared: Arc<ClientShared>,
    cmd_rx: Receiver<ClientCommand>,
    socket_tx: Sender<SocketEvent>,
    socket_rx: Receiver<SocketEvent>,
    req: Option<ReqSocket>,
    pending: VecDeque<PendingRequest>,
    tries_left: u32,
    next_heartbeat: Option<Instant>,
    devices: HashMap<String, DeviceState>,
    /// Active subscription sockets, keyed by socket id.
    subs: HashMap<SocketId, String>,
}

impl ClientLoop {
    fn run(mut self) {
        loop {
            match self.next_action() {
                LoopAction::Command(cmd) => {
                    if !self.handle_command(cmd) {
                        break;
                    }
                }
                LoopAction::Socket(event) => self.handle_socket_event(event),
                LoopAction::Tick => self.handle_tick(),
                LoopAction::Stop => break,
            }
        }

        if self.connected() {
            self.do_disconnect();
        }
    }

    fn connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Wait for the next command, socket event, or timer expiry.
    fn next_action(&self) -> LoopAction {
        let mut next_deadline = self.next_heartbeat;
        if let Some(head) = self.pending.front() {
            next_deadline = Some(match next_deadline {
                Some(d) => d.min(head.deadline),
                None => head.deadline,
            });
        }

        let cmd_rx = &self.cmd_rx;
        let socket_rx = &self.socket_rx;

        match next_deadline {
            Some(deadline) => {
                let timeout = deadline.saturating_duration_since(Instant::now());
                select! {
                    recv(cmd_rx) -> cmd => match cmd {
                        Ok(cmd) => LoopAction::Command(cmd),
                        Err(_) => LoopAction::Stop,
                    },
                    recv(socket_rx) -> event => match event {
                        Ok(event) => LoopAction::Socket(event),
                        Err(_) => LoopAction::Stop,
                    },
                    default(timeout) => LoopAction::Tick,
                }
            }
            None => select! {
                recv(cmd_rx) -> cmd => match cmd {
                    Ok(cmd) => LoopAction::Command(cmd),
                    Err(_) => LoopAction::Stop,
                },
                recv(socket_rx) -> event => match event {
                    Ok(event) => LoopAction::Socket(event),
                    Err(_) => LoopAction::Stop,
                },
            },
        }
    }

    /// Returns false when the loop should exit.
    fn handle_command(&mut self, cmd: ClientCommand) -> bool {
        match cmd {
            ClientCommand::Connect(reply) => {
                let _ = reply.send(self.do_connect());
            }
            ClientCommand::Disconnect(reply) => {
                let _ = reply.send({
                    if self.connected() {
                        self.do_disconnect();
                        Ok(())
                    } else {
                        log::warn!("client already disconnected");
                        Ok(())
                    }
                });
            }
            ClientCommand::Ping(callback, reply) => {
                let result = if self.connected() {
                    self.send_request(
                        MessageType::Ping,
                        None,
                        ResponseHandler::Pong(Some(callback)),
                    )
                } else {
                    Err(Error::NotConnected)
                };
                let _ = reply.send(result);
            }
            ClientCommand::EnableDepth(device_id, reply) => {
                let _ = reply.send(self.enable_depth(&device_id));
            }
            ClientCommand::DisableDepth(device_id, reply) => {
                let _ = reply.send(self.disable_depth(&device_id));
            }
            ClientCommand::Shutdown => return false,
        }
        true
    }

    fn do_connect(&mut self) -> Result<()> {
        if self.connected() {
            log::warn!("client already connected");
            return Ok(());
        }

        let req = ReqSocket::connect(&self.ctx, &self.control_endpoint, self.socket_tx.clone())?;
        self.req = Some(req);
        self.pending.clear();
        self.tries_left = self.config.request_max_tries;
        self.next_heartbeat = Some(Instant::now() + self.config.heartbeat_period);
        self.shared.connected.store(true, Ordering::Release);

        // Learn the server's identity straight away rather than waiting a
        // full heartbeat period.
        if let Err(e) = self.send_request(MessageType::Who, None, ResponseHandler::Identity) {
            self.req = None;
            self.pending.clear();
            self.next_heartbeat = None;
            self.shared.connected.store(false, Ordering::Release);
            return Err(e);
        }

        self.listener.on_connect();
        Ok(())
    }

    fn do_disconnect(&mut self) {
        // Cancels every in-flight timeout: no further handlers run.
        self.pending.clear();
        self.next_heartbeat = None;
        self.req = None;

        for state in self.devices.values_mut() {
            state.subscriptions.clear();
        }
        self.subs.clear();

        self.shared.connected.store(false, Ordering::Release);
        self.listener.on_disconnect();
    }

    /// Tear the session down after a fatal protocol violation.
    fn fail_session(&mut self, reason: &str) {
        log::warn!("fatal protocol error: {}", reason);
        if self.connected() {
            self.do_disconnect();
        }
    }

    fn send_request(
        &mut self,
        msg_type: MessageType,
        payload: Option<&Value>,
        handler: ResponseHandler,
    ) -> Result<()> {
        let req = self.req.as_ref().ok_or(Error::NotConnected)?;
        let parts = encode_message(msg_type, payload);
        let deadline = Instant::now() + self.config.request_timeout;

        self.pending.push_back(PendingRequest {
            msg_type,
            parts: parts.clone(),
            handler,
            deadline,
        });
        req.send(parts)?;
        Ok(())
    }

    fn handle_tick(&mut self) {
        let now = Instant::now();

        if let Some(deadline) = self.pending.front().map(|p| p.deadline) {
            if now >= deadline {
                self.handle_head_timeout();
            }
        }

        if let Some(heartbeat) = self.next_heartbeat {
            if now >= heartbeat && self.connected() {
                self.next_heartbeat = Some(now + self.config.heartbeat_period);
                if let Err(e) =
                    self.send_request(MessageType::Who, None, ResponseHandler::Identity)
                {
                    log::warn!("failed to send heartbeat: {}", e);
                }
            }
        }
    }

    fn handle_head_timeout(&mut self) {
        self.tries_left = self.tries_left.saturating_sub(1);
        if self.tries_left == 0 {
            log::warn!(
                "no reply after {} attempts, declaring server dead",
                self.config.request_max_tries
            );
            self.do_disconnect();
            return;
        }

        log::warn!(
            "request \"{}\" timed out, reconnecting ({} tries left)",
            self.pending
                .front()
                .map(|p| p.msg_type.to_string())
                .unwrap_or_default(),
            self.tries_left
        );

        // Recreate the request socket to discard its stuck state.
        self.req = None;
        match ReqSocket::connect(&self.ctx, &self.control_endpoint, self.socket_tx.clone()) {
            Ok(req) => self.req = Some(req),
            Err(e) => {
                log::warn!("reconnect failed: {}", e);
                self.do_disconnect();
                return;
            }
        }

        // Re-arm the head timeout only, then retransmit the whole queue in
        // order. Blind resend is safe: every request is idempotent.
        if let Some(head) = self.pending.front_mut() {
            head.deadline = Instant::now() + self.config.request_timeout;
        }
        if let Some(req) = &self.req {
            for request in &self.pending {
                if let Err(e) = req.send(request.parts.clone()) {
                    log::warn!("retransmit failed: {}", e);
                    break;
                }
            }
        }
    }

    fn handle_socket_event(&mut self, event: SocketEvent) {
        match event {
            SocketEvent::Message { socket, parts, .. } => {
                if self.req.as_ref().map(ReqSocket::id) == Some(socket) {
                    self.handle_reply(&parts);
                } else if let Some(device_id) = self.subs.get(&socket).cloned() {
                    match parts.into_iter().next() {
                        Some(data) => {
                            let frame = CompressedFrame { data };
                            self.listener.on_depth_frame(&device_id, &frame);
                        }
                        None => log::warn!("empty depth message from {}", device_id),
                    }
                }
                // Replies from a replaced request socket are stale; drop.
            }
            SocketEvent::Closed { socket, .. } => {
                if self.req.as_ref().map(ReqSocket::id) == Some(socket) {
                    // Request timeouts own the recovery path.
                    log::debug!("control connection lost, awaiting request timeout");
                } else if let Some(device_id) = self.subs.remove(&socket) {
                    log::debug!("depth subscription for {} ended", device_id);
                    if let Some(state) = self.devices.get_mut(&device_id) {
                        state
                            .subscriptions
                            .retain(|_, sub| sub.id() != socket);
                    }
                }
            }
            SocketEvent::Connected { socket } => {
                log::debug!("socket {} connected", socket);
            }
            SocketEvent::Accepted { .. } => {}
            SocketEvent::IoError { socket, error } => {
                log::warn!("socket {} error: {}", socket, error);
            }
        }
    }

    /// Process one control reply against the head of the pending queue.
    fn handle_reply(&mut self, parts: &[Vec<u8>]) {
        let (msg_type, payload) = match parse_message(parts) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.fail_session(&format!("unparseable reply: {}", e));
                return;
            }
        };

        let request = match self.pending.pop_front() {
            Some(request) => request,
            None => {
                log::warn!("unsolicited {} reply ignored", msg_type);
                return;
            }
        };
        self.tries_left = self.config.request_max_tries;

        match request.handler {
            ResponseHandler::Pong(callback) => match msg_type {
                MessageType::Pong => {
                    if let Some(callback) = callback {
                        callback();
                    }
                }
                MessageType::Error => {
                    log::warn!("ping rejected by server: {:?}", payload);
                }
                other => {
                    self.fail_session(&format!("expected pong, got {}", other));
                }
            },
            ResponseHandler::Identity => match (msg_type, payload) {
                (MessageType::Me, Some(value)) => {
                    if let Err(e) = self.handle_identity(value) {
                        self.fail_session(&e.to_string());
                    }
                }
                (MessageType::Me, None) => {
                    self.fail_session("me reply carried no payload");
                }
                (MessageType::Error, payload) => {
                    log::warn!("who rejected by server: {:?}", payload);
                }
                (other, _) => {
                    self.fail_session(&format!("expected me, got {}", other));
                }
            },
        }
    }

    /// Apply one `me` payload: refresh the server name, diff the device set,
    /// and refresh per-device endpoint tables atomically.
    fn handle_identity(&mut self, value: Value) -> Result<()> {
        let identity: ServerIdentity = serde_json::from_value(value)
            .map_err(|e| Error::Protocol(format!("invalid me payload: {}", e)))?;

        if identity.version != PROTOCOL_VERSION {
            return Err(Error::Protocol(format!(
                "unsupported protocol version {}",
                identity.version
            )));
        }

        *self.shared.server_name.lock() = Some(identity.name.clone());

        let new_ids: HashSet<String> =
            identity.devices.iter().map(|d| d.id.clone()).collect();

        // Removes first, then adds, mirroring discovery's remove-before-add.
        let mut removed: Vec<String> = self
            .devices
            .keys()
            .filter(|id| !new_ids.contains(*id))
            .cloned()
            .collect();
        removed.sort();
        for device_id in removed {
            if let Some(state) = self.devices.remove(&device_id) {
                for sub in state.subscriptions.values() {
                    self.subs.remove(&sub.id());
                }
            }
            self.listener.on_remove_kinect(&device_id);
        }

        for device in &identity.devices {
            // Unknown endpoint-type strings are silently skipped.
            let fresh: HashMap<EndpointType, String> = device
                .endpoints
                .iter()
                .filter_map(|(key, uri)| EndpointType::parse(key).map(|t| (t, uri.clone())))
                .collect();

            match self.devices.get_mut(&device.id) {
                None => {
                    self.devices.insert(
                        device.id.clone(),
                        DeviceState {
                            endpoints: fresh,
                            subscriptions: HashMap::new(),
                        },
                    );
                    self.listener.on_add_kinect(&device.id);
                }
                Some(state) => {
                    // An omitted or changed endpoint invalidates its
                    // subscription; re-enabling is the caller's business.
                    let mut stale: Vec<EndpointType> = Vec::new();
                    for (endpoint_type, uri) in &state.endpoints {
                        if fresh.get(endpoint_type) != Some(uri) {
                            stale.push(*endpoint_type);
                        }
                    }
                    for endpoint_type in stale {
                        if let Some(sub) = state.subscriptions.remove(&endpoint_type) {
                            self.subs.remove(&sub.id());
                        }
                    }
                    state.endpoints = fresh;
                }
            }
        }

        let mut ids: Vec<String> = self.devices.keys().cloned().collect();
        ids.sort();
        *self.shared.kinect_ids.lock() = ids;
        Ok(())
    }

    fn enable_depth(&mut self, device_id: &str) -> Result<()> {
        if !self.connected() {
            return Err(Error::NotConnected);
        }
        let state = self
            .devices
            .get_mut(device_id)
            .ok_or_else(|| Error::UnknownDevice(device_id.to_string()))?;
        if state.subscriptions.contains_key(&EndpointType::Depth) {
            log::warn!("depth frames already enabled for {}", device_id);
            return Ok(());
        }
        let endpoint = state
            .endpoints
            .get(&EndpointType::Depth)
            .ok_or_else(|| Error::UnknownDevice(device_id.to_string()))?
            .clone();

        let sub = SubSocket::connect(&self.ctx, &endpoint, self.socket_tx.clone())?;
        self.subs.insert(sub.id(), device_id.to_string());
        state.subscriptions.insert(EndpointType::Depth, sub);
        log::info!("depth frames enabled for {} at {}", device_id, endpoint);
        Ok(())
    }

    fn disable_depth(&mut self, device_id: &str) -> Result<()> {
        let state = self
            .devices
            .get_mut(device_id)
            .ok_or_else(|| Error::UnknownDevice(device_id.to_string()))?;
        if let Some(sub) = state.subscriptions.remove(&EndpointType::Depth) {
            self.subs.remove(&sub.id());
        }
        Ok(())
    }
}
