// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Message-oriented TCP transport.
//!
//! The control and depth channels ride on small message sockets with two
//! patterns:
//!
//! | Pattern | Side | Socket |
//! |---------|------|--------|
//! | request/reply | server | [`RepSocket`] |
//! | request/reply | client | [`ReqSocket`] |
//! | publish/subscribe | server | [`PubSocket`] |
//! | publish/subscribe | client | [`SubSocket`] |
//!
//! A message is a short sequence of byte parts (see
//! [`frame_codec`]). Sockets are serviced by the I/O thread of a
//! [`Context`]; owners receive [`SocketEvent`]s on the channel they supplied
//! at socket creation, so each component keeps single-threaded access to its
//! own state.
//!
//! The context is a dependency-injected parameter everywhere with a lazy
//! process-wide default ([`Context::instance`]); tests create isolated
//! contexts with [`Context::new`]. The global instance is never torn down,
//! process exit reclaims it.

pub mod frame_codec;
mod io_thread;

use std::net::{IpAddr, SocketAddr, TcpListener as StdTcpListener};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

use mio::net::{TcpListener, TcpStream};
use mio::{Poll, Waker};
use parking_lot::Mutex;

use crate::error::{Error, Result};
use frame_codec::DEFAULT_MAX_MESSAGE_SIZE;
use io_thread::{Command, IoThread, WAKER_TOKEN};

pub use io_thread::{SocketEvent, DEFAULT_PUB_QUEUE_LIMIT};

/// One transport message: a sequence of opaque byte parts.
pub type Message = Vec<Vec<u8>>;

/// Identifies a socket within one [`Context`].
pub type SocketId = u64;

/// Identifies a connected peer within one socket.
pub type PeerId = u64;

/// Socket patterns supported by the transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocketKind {
    /// Bound reply socket: many peers, one reply per request.
    Rep,
    /// Bound publish socket: lossy fan-out to subscribers.
    Pub,
    /// Connected request socket.
    Req,
    /// Connected subscribe socket (receive-all).
    Sub,
}

// ============================================================================
// Context
// ============================================================================

static GLOBAL_CONTEXT: Mutex<Option<Arc<Context>>> = Mutex::new(None);

/// Shared transport context owning the I/O thread.
///
/// All sockets created from one context share its poll loop. Dropping the
/// last handle to a non-global context shuts the thread down.
pub struct Context {
    cmd_tx: Sender<Command>,
    waker: Waker,
    running: Arc<AtomicBool>,
    next_socket: AtomicU64,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Context {
    /// Create an isolated context with its own I/O thread.
    pub fn new() -> Result<Arc<Context>> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let (cmd_tx, cmd_rx) = channel();
        let running = Arc::new(AtomicBool::new(true));

        let io = IoThread::new(
            poll,
            cmd_rx,
            Arc::clone(&running),
            DEFAULT_MAX_MESSAGE_SIZE,
            DEFAULT_PUB_QUEUE_LIMIT,
        );
        let thread = std::thread::Builder::new()
            .name("kinstream-io".to_string())
            .spawn(move || io.run())?;

        Ok(Arc::new(Context {
            cmd_tx,
            waker,
            running,
            next_socket: AtomicU64::new(1),
            thread: Mutex::new(Some(thread)),
        }))
    }

    /// The lazily-created process-wide context.
    ///
    /// Components take a context parameter and default to this instance, so
    /// production code shares one I/O thread while tests stay isolated.
    pub fn instance() -> Result<Arc<Context>> {
        let mut slot = GLOBAL_CONTEXT.lock();
        if let Some(ctx) = slot.as_ref() {
            return Ok(Arc::clone(ctx));
        }
        let ctx = Context::new()?;
        *slot = Some(Arc::clone(&ctx));
        Ok(ctx)
    }

    fn alloc_socket_id(&self) -> SocketId {
        self.next_socket.fetch_add(1, Ordering::Relaxed)
    }

    fn send_command(&self, cmd: Command) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .map_err(|_| Error::Disconnected("transport I/O thread stopped".into()))?;
        self.waker.wake()?;
        Ok(())
    }

    /// Bind a listener on `addr` (port 0 selects a random free port) and
    /// hand it to the I/O thread. Returns the socket id and bound address.
    fn bind(
        &self,
        kind: SocketKind,
        addr: IpAddr,
        port: u16,
        events: crossbeam::channel::Sender<SocketEvent>,
    ) -> Result<(SocketId, SocketAddr)> {
        let requested = SocketAddr::new(addr, port);
        let std_listener = StdTcpListener::bind(requested)
            .map_err(|e| Error::Bind(format!("{}: {}", requested, e)))?;
        std_listener
            .set_nonblocking(true)
            .map_err(|e| Error::Bind(format!("{}: {}", requested, e)))?;
        let listener = TcpListener::from_std(std_listener);
        let local_addr = listener
            .local_addr()
            .map_err(|e| Error::Bind(e.to_string()))?;

        let socket = self.alloc_socket_id();
        self.send_command(Command::OpenListener {
            socket,
            kind,
            listener,
            events,
        })?;
        Ok((socket, local_addr))
    }

    /// Start a non-blocking connect and hand the stream to the I/O thread.
    fn connect(
        &self,
        kind: SocketKind,
        remote_addr: SocketAddr,
        events: crossbeam::channel::Sender<SocketEvent>,
    ) -> Result<SocketId> {
        let stream = TcpStream::connect(remote_addr)?;
        let socket = self.alloc_socket_id();
        self.send_command(Command::OpenStream {
            socket,
            kind,
            stream,
            remote_addr,
            events,
        })?;
        Ok(socket)
    }

    fn send(&self, socket: SocketId, peer: Option<PeerId>, parts: Message) -> Result<()> {
        self.send_command(Command::Send {
            socket,
            peer,
            parts,
        })
    }

    fn close_socket(&self, socket: SocketId) {
        let _ = self.send_command(Command::CloseSocket { socket });
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
        let _ = self.waker.wake();
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

// ============================================================================
// Endpoint URIs
// ============================================================================

/// Format a socket address as a `tcp://host:port` endpoint URI.
pub fn format_endpoint(addr: SocketAddr) -> String {
    format!("tcp://{}", addr)
}

/// Parse a `tcp://host:port` endpoint URI.
pub fn parse_endpoint(endpoint: &str) -> Result<SocketAddr> {
    let rest = endpoint
        .strip_prefix("tcp://")
        .ok_or_else(|| Error::Protocol(format!("unsupported endpoint scheme: {}", endpoint)))?;
    rest.parse()
        .map_err(|_| Error::Protocol(format!("invalid endpoint address: {}", endpoint)))
}

// ============================================================================
// Socket wrappers
// ============================================================================

/// Bound reply socket for the control channel.
pub struct RepSocket {
    ctx: Arc<Context>,
    id: SocketId,
    local_addr: SocketAddr,
}

impl RepSocket {
    /// Bind on `addr:port`; port 0 selects a random free port.
    pub fn bind(
        ctx: &Arc<Context>,
        addr: IpAddr,
        port: u16,
        events: crossbeam::channel::Sender<SocketEvent>,
    ) -> Result<Self> {
        let (id, local_addr) = ctx.bind(SocketKind::Rep, addr, port, events)?;
        Ok(Self {
            ctx: Arc::clone(ctx),
            id,
            local_addr,
        })
    }

    pub fn id(&self) -> SocketId {
        self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn endpoint(&self) -> String {
        format_endpoint(self.local_addr)
    }

    /// Send the reply for a request received from `peer`.
    pub fn reply(&self, peer: PeerId, parts: Message) -> Result<()> {
        self.ctx.send(self.id, Some(peer), parts)
    }
}

impl Drop for RepSocket {
    fn drop(&mut self) {
        self.ctx.close_socket(self.id);
    }
}

/// Bound publish socket for one device's depth channel.
pub struct PubSocket {
    ctx: Arc<Context>,
    id: SocketId,
    local_addr: SocketAddr,
}

impl PubSocket {
    /// Bind on `addr:port`; port 0 selects a random free port.
    pub fn bind(
        ctx: &Arc<Context>,
        addr: IpAddr,
        port: u16,
        events: crossbeam::channel::Sender<SocketEvent>,
    ) -> Result<Self> {
        let (id, local_addr) = ctx.bind(SocketKind::Pub, addr, port, events)?;
        Ok(Self {
            ctx: Arc::clone(ctx),
            id,
            local_addr,
        })
    }

    pub fn id(&self) -> SocketId {
        self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn endpoint(&self) -> String {
        format_endpoint(self.local_addr)
    }

    /// Fan a message out to every connected subscriber. Slow subscribers
    /// shed messages instead of stalling the publisher.
    pub fn publish(&self, parts: Message) -> Result<()> {
        self.ctx.send(self.id, None, parts)
    }
}

impl Drop for PubSocket {
    fn drop(&mut self) {
        self.ctx.close_socket(self.id);
    }
}

/// Connected request socket for the client side of the control channel.
pub struct ReqSocket {
    ctx: Arc<Context>,
    id: SocketId,
}

impl ReqSocket {
    /// Connect to a `tcp://host:port` control endpoint. Messages sent before
    /// the connection completes are queued in the I/O thread.
    pub fn connect(
        ctx: &Arc<Context>,
        endpoint: &str,
        events: crossbeam::channel::Sender<SocketEvent>,
    ) -> Result<Self> {
        let addr = parse_endpoint(endpoint)?;
        let id = ctx.connect(SocketKind::Req, addr, events)?;
        Ok(Self {
            ctx: Arc::clone(ctx),
            id,
        })
    }

    pub fn id(&self) -> SocketId {
        self.id
    }

    pub fn send(&self, parts: Message) -> Result<()> {
        self.ctx.send(self.id, None, parts)
    }
}

impl Drop for ReqSocket {
    fn drop(&mut self) {
        self.ctx.close_socket(self.id);
    }
}

/// Connected subscribe socket for one device's depth channel.
///
/// Subscribes with the empty topic filter: every published message is
/// delivered (subject to drop under congestion).
pub struct SubSocket {
    ctx: Arc<Context>,
    id: SocketId,
}

impl SubSocket {
    /// Connect to a `tcp://host:port` depth endpoint.
    pub fn connect(
        ctx: &Arc<Context>,
        endpoint: &str,
        events: crossbeam::channel::Sender<SocketEvent>,
    ) -> Result<Self> {
        let addr = parse_endpoint(endpoint)?;
        let id = ctx.connect(SocketKind::Sub, addr, events)?;
        Ok(Self {
            ctx: Arc::clone(ctx),
            id,
        })
    }

    pub fn id(&self) -> SocketId {
        self.id
    }
}

impl Drop for SubSocket {
    fn drop(&mut self) {
        self.ctx.close_socket(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::{unbounded, Receiver};
    use std::time::Duration;

    const RECV_TIMEOUT: Duration = Duration::from_secs(5);

    fn wait_for<F: Fn(&SocketEvent) -> bool>(
        rx: &Receiver<SocketEvent>,
        pred: F,
    ) -> SocketEvent {
        loop {
            let event = rx.recv_timeout(RECV_TIMEOUT).expect("event");
            if pred(&event) {
                return event;
            }
        }
    }

    #[test]
    fn test_endpoint_uri_roundtrip() {
        let addr: SocketAddr = "127.0.0.1:4099".parse().unwrap();
        let uri = format_endpoint(addr);
        assert_eq!(uri, "tcp://127.0.0.1:4099");
        assert_eq!(parse_endpoint(&uri).unwrap(), addr);
        assert!(parse_endpoint("udp://127.0.0.1:1").is_err());
        assert!(parse_endpoint("tcp://bogus").is_err());
    }

    #[test]
    fn test_req_rep_exchange() {
        let ctx = Context::new().unwrap();
        let (rep_tx, rep_rx) = unbounded();
        let (req_tx, req_rx) = unbounded();

        let rep = RepSocket::bind(&ctx, "127.0.0.1".parse().unwrap(), 0, rep_tx).unwrap();
        let req = ReqSocket::connect(&ctx, &rep.endpoint(), req_tx).unwrap();

        req.send(vec![b"hello".to_vec()]).unwrap();

        let (peer, parts) = match wait_for(&rep_rx, |e| matches!(e, SocketEvent::Message { .. }))
        {
            SocketEvent::Message { peer, parts, .. } => (peer, parts),
            _ => unreachable!(),
        };
        assert_eq!(parts, vec![b"hello".to_vec()]);

        rep.reply(peer, vec![b"world".to_vec()]).unwrap();
        match wait_for(&req_rx, |e| matches!(e, SocketEvent::Message { .. })) {
            SocketEvent::Message { parts, .. } => assert_eq!(parts, vec![b"world".to_vec()]),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_pub_sub_delivery() {
        let ctx = Context::new().unwrap();
        let (pub_tx, pub_rx) = unbounded();
        let (sub_tx, sub_rx) = unbounded();

        let publisher = PubSocket::bind(&ctx, "127.0.0.1".parse().unwrap(), 0, pub_tx).unwrap();
        let _subscriber = SubSocket::connect(&ctx, &publisher.endpoint(), sub_tx).unwrap();

        // Publish only after the subscriber is attached.
        wait_for(&pub_rx, |e| matches!(e, SocketEvent::Accepted { .. }));
        publisher.publish(vec![b"frame-1".to_vec()]).unwrap();

        match wait_for(&sub_rx, |e| matches!(e, SocketEvent::Message { .. })) {
            SocketEvent::Message { parts, .. } => assert_eq!(parts, vec![b"frame-1".to_vec()]),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_connect_to_dead_endpoint_reports_closed() {
        let ctx = Context::new().unwrap();

        // Grab a port that is free and then released.
        let probe = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let dead = probe.local_addr().unwrap();
        drop(probe);

        let (tx, rx) = unbounded();
        let _req = ReqSocket::connect(&ctx, &format_endpoint(dead), tx).unwrap();
        wait_for(&rx, |e| matches!(e, SocketEvent::Closed { peer: None, .. }));
    }

    #[test]
    fn test_isolated_contexts() {
        let a = Context::new().unwrap();
        let b = Context::new().unwrap();
        assert!(!Arc::ptr_eq(&a, &b));

        let shared = Context::instance().unwrap();
        let again = Context::instance().unwrap();
        assert!(Arc::ptr_eq(&shared, &again));
    }
}
