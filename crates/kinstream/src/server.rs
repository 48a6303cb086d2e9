// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Stream server.
//!
//! A server owns one control rep socket plus one publish socket and one
//! compression pipeline per attached device. A single event-loop thread
//! services control requests, device attach/detach, and publish-side writes;
//! compression runs on the pipeline's worker pool and crosses back via the
//! loop's inbox.
//!
//! ```text
//!            control rep socket          per-device pub sockets
//!                   |                            ^
//!                   v                            |
//!            +-------------------------------------------+
//!            |            server event loop              |
//!            +-------------------------------------------+
//!              ^                ^                 ^
//!              | commands       | socket events   | compressed frames
//!           API methods     I/O thread       DepthCompressor pool
//! ```
//!
//! Lifetime is scoped: dropping a running server withdraws its
//! advertisement and closes its sockets on every exit path.

use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{bounded, unbounded, Receiver, Select, Sender};
use local_ip_address::local_ip;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::compress::{CompressedFrame, DepthCodec, DepthCompressor, JpegCodec};
use crate::discovery::{ServiceRegistration, ServiceResponder};
use crate::error::{Error, Result};
use crate::kinect::{DepthDevice, DepthFrame, FrameListenerId};
use crate::protocol::{
    encode_message, encode_payload, parse_message, DeviceIdentity, EndpointType, ErrorPayload,
    MessageType, ServerIdentity, PROTOCOL_VERSION,
};
use crate::transport::{Context, PeerId, PubSocket, RepSocket, SocketEvent};

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`Server`].
pub struct ServerBuilder {
    name: Option<String>,
    address: Option<IpAddr>,
    context: Option<Arc<Context>>,
    responder: Option<Arc<dyn ServiceResponder>>,
    codec: Arc<dyn DepthCodec>,
    start_immediately: bool,
}

impl ServerBuilder {
    /// Human-readable server name. Defaults to `Kinect2 <uuid4>`.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Bind address. Defaults to the host's primary local IP, falling back
    /// to 127.0.0.1.
    pub fn address(mut self, address: IpAddr) -> Self {
        self.address = Some(address);
        self
    }

    /// Transport context. Defaults to the process-wide instance.
    pub fn context(mut self, context: Arc<Context>) -> Self {
        self.context = Some(context);
        self
    }

    /// Announce the server over this responder while running. Without a
    /// responder the server is reachable by explicit endpoint only.
    pub fn responder(mut self, responder: Arc<dyn ServiceResponder>) -> Self {
        self.responder = Some(responder);
        self
    }

    /// Depth codec for device pipelines. Defaults to [`JpegCodec`].
    pub fn codec(mut self, codec: Arc<dyn DepthCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Call [`Server::start`] before returning from `build`.
    pub fn start_immediately(mut self) -> Self {
        self.start_immediately = true;
        self
    }

    pub fn build(self) -> Result<Server> {
        let name = self
            .name
            .unwrap_or_else(|| format!("Kinect2 {}", Uuid::new_v4()));
        let address = self
            .address
            .unwrap_or_else(|| local_ip().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        let ctx = match self.context {
            Some(ctx) => ctx,
            None => Context::instance()?,
        };

        let shared = Arc::new(ServerShared {
            name,
            address,
            running: AtomicBool::new(false),
            control_endpoint: Mutex::new(None),
            kinect_ids: Mutex::new(Vec::new()),
        });

        let (cmd_tx, cmd_rx) = unbounded();
        let (socket_tx, socket_rx) = unbounded();

        let event_loop = ServerLoop {
            ctx,
            responder: self.responder,
            codec: self.codec,
            shared: Arc::clone(&shared),
            cmd_rx,
            socket_tx,
            socket_rx,
            control: None,
            devices: HashMap::new(),
        };

        let thread = std::thread::Builder::new()
            .name("kinstream-server".to_string())
            .spawn(move || event_loop.run())?;

        let server = Server {
            shared,
            cmd_tx,
            thread: Mutex::new(Some(thread)),
        };

        if self.start_immediately {
            server.start()?;
        }
        Ok(server)
    }
}

// ============================================================================
// Public handle
// ============================================================================

struct ServerShared {
    name: String,
    address: IpAddr,
    running: AtomicBool,
    control_endpoint: Mutex<Option<String>>,
    kinect_ids: Mutex<Vec<String>>,
}

enum ServerCommand {
    Start(Sender<Result<()>>),
    Stop(Sender<Result<()>>),
    AddKinect(Arc<dyn DepthDevice>, Sender<Result<()>>),
    RemoveKinect(String, Sender<Result<()>>),
    Shutdown,
}

/// A server capable of streaming Kinect2 depth data to interested clients.
///
/// All public methods marshal onto the server's event loop and may be
/// called from any thread.
pub struct Server {
    shared: Arc<ServerShared>,
    cmd_tx: Sender<ServerCommand>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder {
            name: None,
            address: None,
            context: None,
            responder: None,
            codec: Arc::new(JpegCodec),
            start_immediately: false,
        }
    }

    fn call(&self, make: impl FnOnce(Sender<Result<()>>) -> ServerCommand) -> Result<()> {
        let (tx, rx) = bounded(1);
        self.cmd_tx
            .send(make(tx))
            .map_err(|_| Error::Disconnected("server event loop stopped".into()))?;
        rx.recv()
            .map_err(|_| Error::Disconnected("server event loop stopped".into()))?
    }

    /// Start serving: bind the control socket and advertise. Starting a
    /// running server logs a warning and is a no-op.
    pub fn start(&self) -> Result<()> {
        self.call(ServerCommand::Start)
    }

    /// Stop serving: withdraw the advertisement and close the control
    /// socket. Stopping a stopped server logs a warning and is a no-op.
    pub fn stop(&self) -> Result<()> {
        self.call(ServerCommand::Stop)
    }

    /// Attach a device: bind its publish socket on a random free port and
    /// wire its frames into a compression pipeline. Valid while stopped or
    /// running.
    pub fn add_kinect(&self, device: Arc<dyn DepthDevice>) -> Result<()> {
        self.call(|tx| ServerCommand::AddKinect(device, tx))
    }

    /// Detach a device, releasing its publish socket and pipeline.
    pub fn remove_kinect(&self, device_id: &str) -> Result<()> {
        let device_id = device_id.to_string();
        self.call(|tx| ServerCommand::RemoveKinect(device_id, tx))
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn address(&self) -> IpAddr {
        self.shared.address
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Server-level endpoints; the control endpoint is present while
    /// running.
    pub fn endpoints(&self) -> BTreeMap<EndpointType, String> {
        let mut endpoints = BTreeMap::new();
        if let Some(endpoint) = self.shared.control_endpoint.lock().clone() {
            endpoints.insert(EndpointType::Control, endpoint);
        }
        endpoints
    }

    /// Ids of currently attached devices.
    pub fn kinect_ids(&self) -> Vec<String> {
        self.shared.kinect_ids.lock().clone()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(ServerCommand::Shutdown);
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

// ============================================================================
// Event loop
// ============================================================================

struct DeviceRecord {
    device: Arc<dyn DepthDevice>,
    listener_id: FrameListenerId,
    pub_socket: PubSocket,
    pipeline: Arc<DepthCompressor>,
    frames_rx: Receiver<CompressedFrame>,
}

struct ServerLoop {
    ctx: Arc<Context>,
    responder: Option<Arc<dyn ServiceResponder>>,
    codec: Arc<dyn DepthCodec>,
    shared: Arc<ServerShared>,
    cmd_rx: Receiver<ServerCommand>,
    socket_tx: Sender<SocketEvent>,
    socket_rx: Receiver<SocketEvent>,
    control: Option<RepSocket>,
    devices: HashMap<String, DeviceRecord>,
}

enum LoopAction {
    Command(ServerCommand),
    Socket(SocketEvent),
    Frame(String, CompressedFrame),
    /// A device pipeline lost its worker pool.
    PipelineGone(String),
    Stop,
}

impl ServerLoop {
    fn run(mut self) {
        loop {
            match self.next_action() {
                LoopAction::Command(cmd) => {
                    if !self.handle_command(cmd) {
                        break;
                    }
                }
                LoopAction::Socket(event) => self.handle_socket_event(event),
                LoopAction::Frame(device_id, frame) => self.publish_frame(&device_id, frame),
                LoopAction::PipelineGone(device_id) => {
                    log::error!(
                        "compression pipeline for {} lost its worker pool, detaching device",
                        device_id
                    );
                    let _ = self.detach(&device_id);
                }
                LoopAction::Stop => break,
            }
        }

        // Scoped teardown on every exit path.
        if self.shared.running.load(Ordering::Acquire) {
            self.do_stop();
        }
        let ids: Vec<String> = self.devices.keys().cloned().collect();
        for id in ids {
            let _ = self.detach(&id);
        }
    }

    /// Block until a command, socket event, or compressed frame arrives.
    fn next_action(&self) -> LoopAction {
        let mut sel = Select::new();
        let cmd_idx = sel.recv(&self.cmd_rx);
        let sock_idx = sel.recv(&self.socket_rx);

        let mut device_idx: Vec<(usize, &String, &DeviceRecord)> = Vec::new();
        for (id, record) in &self.devices {
            device_idx.push((sel.recv(&record.frames_rx), id, record));
        }

        let op = sel.select();
        let index = op.index();

        if index == cmd_idx {
            return match op.recv(&self.cmd_rx) {
                Ok(cmd) => LoopAction::Command(cmd),
                Err(_) => LoopAction::Stop,
            };
        }
        if index == sock_idx {
            return match op.recv(&self.socket_rx) {
                Ok(event) => LoopAction::Socket(event),
                Err(_) => LoopAction::Stop,
            };
        }
        for (idx, id, record) in device_idx {
            if idx == index {
                return match op.recv(&record.frames_rx) {
                    Ok(frame) => LoopAction::Frame(id.clone(), frame),
                    Err(_) => LoopAction::PipelineGone(id.clone()),
                };
            }
        }
        LoopAction::Stop
    }

    /// Returns false when the loop should exit.
    fn handle_command(&mut self, cmd: ServerCommand) -> bool {
        match cmd {
            ServerCommand::Start(reply) => {
                let _ = reply.send(self.do_start());
            }
            ServerCommand::Stop(reply) => {
                let _ = reply.send({
                    if self.shared.running.load(Ordering::Acquire) {
                        self.do_stop();
                        Ok(())
                    } else {
                        log::warn!("server {} already stopped", self.shared.name);
                        Ok(())
                    }
                });
            }
            ServerCommand::AddKinect(device, reply) => {
                let _ = reply.send(self.attach(device));
            }
            ServerCommand::RemoveKinect(device_id, reply) => {
                let _ = reply.send(self.detach(&device_id));
            }
            ServerCommand::Shutdown => return false,
        }
        true
    }

    fn do_start(&mut self) -> Result<()> {
        if self.shared.running.load(Ordering::Acquire) {
            log::warn!("server {} already running", self.shared.name);
            return Ok(());
        }

        let control = RepSocket::bind(
            &self.ctx,
            self.shared.address,
            0,
            self.socket_tx.clone(),
        )?;
        let endpoint = control.endpoint();
        let control_port = control.local_addr().port();

        if let Some(responder) = &self.responder {
            log::info!("registering server \"{}\" with responder", self.shared.name);
            responder.register(ServiceRegistration::stream_server(
                &self.shared.name,
                self.shared.address,
                control_port,
            ))?;
        }

        *self.shared.control_endpoint.lock() = Some(endpoint);
        self.control = Some(control);
        self.shared.running.store(true, Ordering::Release);
        Ok(())
    }

    fn do_stop(&mut self) {
        if let Some(responder) = &self.responder {
            log::info!(
                "unregistering server \"{}\" with responder",
                self.shared.name
            );
            let instance = format!("{}.{}", self.shared.name, crate::discovery::SERVICE_TYPE);
            if let Err(e) = responder.unregister(&instance) {
                log::warn!("failed to withdraw advertisement: {}", e);
            }
        }

        self.control = None;
        *self.shared.control_endpoint.lock() = None;
        self.shared.running.store(false, Ordering::Release);
    }

    fn attach(&mut self, device: Arc<dyn DepthDevice>) -> Result<()> {
        let device_id = device.device_id().to_string();
        if self.devices.contains_key(&device_id) {
            log::warn!("device {} already attached", device_id);
            return Ok(());
        }

        let pub_socket = PubSocket::bind(
            &self.ctx,
            self.shared.address,
            0,
            self.socket_tx.clone(),
        )?;

        let (frames_tx, frames_rx) = unbounded();
        let pipeline = Arc::new(DepthCompressor::new(Arc::clone(&self.codec), frames_tx));

        let submit_pipeline = Arc::clone(&pipeline);
        let listener_id = device.add_frame_listener(Arc::new(
            move |frame: &DepthFrame<'_>| submit_pipeline.submit(frame),
        ));

        log::info!(
            "device {} attached, depth endpoint {}",
            device_id,
            pub_socket.endpoint()
        );
        self.devices.insert(
            device_id,
            DeviceRecord {
                device,
                listener_id,
                pub_socket,
                pipeline,
                frames_rx,
            },
        );
        self.sync_kinect_ids();
        Ok(())
    }

    fn detach(&mut self, device_id: &str) -> Result<()> {
        let record = self
            .devices
            .remove(device_id)
            .ok_or_else(|| Error::UnknownDevice(device_id.to_string()))?;

        record.device.remove_frame_listener(record.listener_id);
        drop(record);
        self.sync_kinect_ids();
        log::info!("device {} detached", device_id);
        Ok(())
    }

    fn sync_kinect_ids(&self) {
        let mut ids: Vec<String> = self.devices.keys().cloned().collect();
        ids.sort();
        *self.shared.kinect_ids.lock() = ids;
    }

    fn handle_socket_event(&mut self, event: SocketEvent) {
        match event {
            SocketEvent::Message {
                socket,
                peer,
                parts,
            } => {
                let is_control = self.control.as_ref().map(RepSocket::id) == Some(socket);
                if is_control {
                    self.handle_control(peer, &parts);
                }
                // Publish sockets never receive application messages.
            }
            SocketEvent::Accepted { socket, peer } => {
                log::debug!("peer {} attached to socket {}", peer, socket);
            }
            SocketEvent::Closed { socket, peer, reason } => {
                log::debug!(
                    "socket {} peer {:?} closed: {}",
                    socket,
                    peer,
                    reason
                );
            }
            SocketEvent::Connected { .. } => {}
            SocketEvent::IoError { socket, error } => {
                log::warn!("socket {} error: {}", socket, error);
            }
        }
    }

    /// Dispatch one control request. Every well-formed or malformed request
    /// gets exactly one reply; the request socket requires it.
    fn handle_control(&mut self, peer: PeerId, parts: &[Vec<u8>]) {
        let reply = match parse_message(parts) {
            Ok((MessageType::Ping, _)) => encode_message(MessageType::Pong, None),
            Ok((MessageType::Who, _)) => {
                match encode_payload(MessageType::Me, &self.identity()) {
                    Ok(parts) => parts,
                    Err(e) => {
                        log::error!("failed to encode identity: {}", e);
                        self.error_reply("internal identity encoding failure")
                    }
                }
            }
            Ok((other, _)) => {
                log::warn!("unsupported control request \"{}\"", other);
                self.error_reply(&format!("unsupported message type \"{}\"", other))
            }
            Err(e) => {
                log::warn!("ignoring invalid control packet: {}", e);
                self.error_reply(&e.to_string())
            }
        };

        if let Some(control) = &self.control {
            if let Err(e) = control.reply(peer, reply) {
                log::warn!("failed to send control reply: {}", e);
            }
        }
    }

    fn error_reply(&self, reason: &str) -> Vec<Vec<u8>> {
        encode_payload(MessageType::Error, &ErrorPayload::bad_request(reason))
            .unwrap_or_else(|_| encode_message(MessageType::Error, None))
    }

    /// Identity snapshot for `me` replies.
    fn identity(&self) -> ServerIdentity {
        let mut endpoints = BTreeMap::new();
        if let Some(endpoint) = self.shared.control_endpoint.lock().clone() {
            endpoints.insert(EndpointType::Control.as_str().to_string(), endpoint);
        }

        let mut devices: Vec<DeviceIdentity> = self
            .devices
            .iter()
            .map(|(id, record)| {
                let mut endpoints = BTreeMap::new();
                endpoints.insert(
                    EndpointType::Depth.as_str().to_string(),
                    record.pub_socket.endpoint(),
                );
                DeviceIdentity {
                    id: id.clone(),
                    endpoints,
                }
            })
            .collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));

        ServerIdentity {
            version: PROTOCOL_VERSION,
            name: self.shared.name.clone(),
            endpoints,
            devices,
        }
    }

    fn publish_frame(&mut self, device_id: &str, frame: CompressedFrame) {
        if let Some(record) = self.devices.get(device_id) {
            if let Err(e) = record.pub_socket.publish(vec![frame.data]) {
                log::warn!("failed to publish depth frame for {}: {}", device_id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockKinect;

    fn test_server() -> Server {
        Server::builder()
            .name("unit-server")
            .address("127.0.0.1".parse().unwrap())
            .context(Context::new().unwrap())
            .build()
            .unwrap()
    }

    #[test]
    fn test_start_stop_state_machine() {
        let server = test_server();
        assert!(!server.is_running());
        assert!(server.endpoints().is_empty());

        server.start().unwrap();
        assert!(server.is_running());
        let endpoints = server.endpoints();
        assert!(endpoints
            .get(&EndpointType::Control)
            .unwrap()
            .starts_with("tcp://127.0.0.1:"));

        // No-op with a warning, not an error.
        server.start().unwrap();

        server.stop().unwrap();
        assert!(!server.is_running());
        assert!(server.endpoints().is_empty());
        server.stop().unwrap();
    }

    #[test]
    fn test_attach_detach_updates_registry() {
        let server = test_server();
        let kinect = Arc::new(MockKinect::with_device_id("K1"));

        server.add_kinect(kinect.clone()).unwrap();
        assert_eq!(server.kinect_ids(), vec!["K1".to_string()]);

        // Duplicate attach warns and no-ops.
        server.add_kinect(kinect).unwrap();
        assert_eq!(server.kinect_ids().len(), 1);

        server.remove_kinect("K1").unwrap();
        assert!(server.kinect_ids().is_empty());
        assert!(matches!(
            server.remove_kinect("K1"),
            Err(Error::UnknownDevice(_))
        ));
    }

    #[test]
    fn test_attach_valid_while_stopped() {
        let server = test_server();
        let kinect = Arc::new(MockKinect::with_device_id("K2"));
        server.add_kinect(kinect).unwrap();

        server.start().unwrap();
        assert_eq!(server.kinect_ids(), vec!["K2".to_string()]);
    }
}
