// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! I/O thread for the message transport.
//!
//! One dedicated thread per [`Context`](super::Context) multiplexes every
//! socket over a mio poll loop:
//!
//! ```text
//! +-------------------------------------------------------------+
//! |                        IoThread                             |
//! |  +-------------------------------------------------------+  |
//! |  |                    mio::Poll                          |  |
//! |  |  - Listeners (rep/pub binds, accept new peers)        |  |
//! |  |  - Streams (read/write framed messages)               |  |
//! |  |  - Waker (receive commands from owner threads)        |  |
//! |  +-------------------------------------------------------+  |
//! |                           |                                 |
//! |                           v                                 |
//! |        per-socket event channel -> owning event loop        |
//! +-------------------------------------------------------------+
//! ```
//!
//! Owners never touch the streams directly; they enqueue [`Command`]s and
//! consume [`SocketEvent`]s on the channel they registered the socket with.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, TryRecvError};
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};

use super::frame_codec::FrameCodec;
use super::{Message, PeerId, SocketId, SocketKind};

/// Token for the waker (command channel).
pub(super) const WAKER_TOKEN: Token = Token(0);

/// Starting token for listeners and connections.
const TOKEN_START: usize = 1;

/// Default poll timeout.
const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Maximum events to process per poll.
const MAX_EVENTS: usize = 128;

/// Messages queued per publish subscriber before new ones are dropped.
/// Depth frames are droppable by contract, so a slow subscriber sheds load
/// here instead of stalling the publisher.
pub const DEFAULT_PUB_QUEUE_LIMIT: usize = 16;

// ============================================================================
// Commands and events
// ============================================================================

/// Commands sent to the I/O thread.
pub(super) enum Command {
    /// Adopt a bound listener for a rep/pub socket.
    OpenListener {
        socket: SocketId,
        kind: SocketKind,
        listener: TcpListener,
        events: crossbeam::channel::Sender<SocketEvent>,
    },

    /// Adopt an in-progress outbound stream for a req/sub socket.
    OpenStream {
        socket: SocketId,
        kind: SocketKind,
        stream: TcpStream,
        remote_addr: SocketAddr,
        events: crossbeam::channel::Sender<SocketEvent>,
    },

    /// Send a message. `peer` routes a rep reply; `None` means the socket's
    /// natural destination (req: the server, pub: every subscriber).
    Send {
        socket: SocketId,
        peer: Option<PeerId>,
        parts: Message,
    },

    /// Close a socket and all of its connections.
    CloseSocket { socket: SocketId },

    /// Shutdown the I/O thread.
    Shutdown,
}

/// Events emitted by the I/O thread onto a socket's event channel.
#[derive(Debug)]
pub enum SocketEvent {
    /// Outbound connection established (req/sub).
    Connected { socket: SocketId },

    /// Inbound peer accepted (rep/pub).
    Accepted { socket: SocketId, peer: PeerId },

    /// Message received.
    Message {
        socket: SocketId,
        peer: PeerId,
        parts: Message,
    },

    /// A peer connection closed (`peer` set), or the socket's outbound
    /// connection was lost (`peer` is `None`).
    Closed {
        socket: SocketId,
        peer: Option<PeerId>,
        reason: String,
    },

    /// Socket-level I/O error that did not close a connection.
    IoError { socket: SocketId, error: String },
}

// ============================================================================
// Per-connection and per-socket state
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ConnState {
    Connecting,
    Connected,
}

struct Conn {
    stream: TcpStream,
    token: Token,
    peer: PeerId,
    remote_addr: SocketAddr,
    state: ConnState,
    codec: FrameCodec,
    /// Framed messages awaiting the wire.
    send_queue: VecDeque<Vec<u8>>,
    /// Offset into the queue head for partial writes.
    send_offset: usize,
}

impl Conn {
    /// Append a framed message, enforcing the queue cap for lossy sockets.
    /// Returns false when the message was shed.
    fn enqueue(&mut self, framed: Vec<u8>, limit: Option<usize>) -> bool {
        if let Some(limit) = limit {
            if self.send_queue.len() >= limit {
                return false;
            }
        }
        self.send_queue.push_back(framed);
        true
    }

    /// Write queued bytes until the queue drains or the kernel pushes back.
    fn flush(&mut self) -> io::Result<()> {
        while let Some(head) = self.send_queue.front() {
            match self.stream.write(&head[self.send_offset..]) {
                Ok(n) => {
                    self.send_offset += n;
                    if self.send_offset >= head.len() {
                        self.send_queue.pop_front();
                        self.send_offset = 0;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

struct SocketState {
    kind: SocketKind,
    events: crossbeam::channel::Sender<SocketEvent>,
    listener: Option<TcpListener>,
    listener_token: Option<Token>,
    conns: HashMap<PeerId, Conn>,
    next_peer: PeerId,
    /// Messages shed at publish sockets since creation.
    shed_count: u64,
    max_message_size: usize,
    pub_queue_limit: usize,
}

#[derive(Clone, Copy)]
enum TokenTarget {
    Listener(SocketId),
    Peer(SocketId, PeerId),
}

// ============================================================================
// I/O thread
// ============================================================================

/// I/O thread state and runner. Constructed by [`Context`](super::Context);
/// not part of the public API.
pub(super) struct IoThread {
    poll: Poll,
    cmd_rx: Receiver<Command>,
    sockets: HashMap<SocketId, SocketState>,
    tokens: HashMap<Token, TokenTarget>,
    next_token: usize,
    running: std::sync::Arc<AtomicBool>,
    max_message_size: usize,
    pub_queue_limit: usize,
}

impl IoThread {
    pub(super) fn new(
        poll: Poll,
        cmd_rx: Receiver<Command>,
        running: std::sync::Arc<AtomicBool>,
        max_message_size: usize,
        pub_queue_limit: usize,
    ) -> Self {
        Self {
            poll,
            cmd_rx,
            sockets: HashMap::new(),
            tokens: HashMap::new(),
            next_token: TOKEN_START,
            running,
            max_message_size,
            pub_queue_limit,
        }
    }

    /// Run the poll loop until shutdown.
    pub(super) fn run(mut self) {
        let mut events = Events::with_capacity(MAX_EVENTS);

        while self.running.load(Ordering::Relaxed) {
            if let Err(e) = self.poll.poll(&mut events, Some(DEFAULT_POLL_TIMEOUT)) {
                if e.kind() != io::ErrorKind::Interrupted {
                    log::error!("transport poll failed: {}", e);
                    break;
                }
                continue;
            }

            for event in events.iter() {
                match event.token() {
                    WAKER_TOKEN => self.handle_commands(),
                    token => {
                        let target = match self.tokens.get(&token) {
                            Some(t) => *t,
                            None => continue,
                        };
                        match target {
                            TokenTarget::Listener(socket) => self.handle_accept(socket),
                            TokenTarget::Peer(socket, peer) => {
                                if event.is_writable() {
                                    self.handle_writable(socket, peer);
                                }
                                if event.is_readable() {
                                    self.handle_readable(socket, peer);
                                }
                            }
                        }
                    }
                }
            }

            // Commands may arrive while poll slept through its timeout.
            self.handle_commands();
        }

        for (id, socket) in self.sockets.drain() {
            let _ = socket.events.send(SocketEvent::Closed {
                socket: id,
                peer: None,
                reason: "transport shutdown".into(),
            });
        }
    }

    fn alloc_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    fn handle_commands(&mut self) {
        loop {
            match self.cmd_rx.try_recv() {
                Ok(Command::OpenListener {
                    socket,
                    kind,
                    mut listener,
                    events,
                }) => {
                    let token = self.alloc_token();
                    if let Err(e) =
                        self.poll
                            .registry()
                            .register(&mut listener, token, Interest::READABLE)
                    {
                        let _ = events.send(SocketEvent::IoError {
                            socket,
                            error: format!("failed to register listener: {}", e),
                        });
                        continue;
                    }
                    self.tokens.insert(token, TokenTarget::Listener(socket));
                    self.sockets.insert(
                        socket,
                        SocketState {
                            kind,
                            events,
                            listener: Some(listener),
                            listener_token: Some(token),
                            conns: HashMap::new(),
                            next_peer: 1,
                            shed_count: 0,
                            max_message_size: self.max_message_size,
                            pub_queue_limit: self.pub_queue_limit,
                        },
                    );
                }
                Ok(Command::OpenStream {
                    socket,
                    kind,
                    mut stream,
                    remote_addr,
                    events,
                }) => {
                    let token = self.alloc_token();
                    if let Err(e) = self.poll.registry().register(
                        &mut stream,
                        token,
                        Interest::READABLE | Interest::WRITABLE,
                    ) {
                        let _ = events.send(SocketEvent::Closed {
                            socket,
                            peer: None,
                            reason: format!("failed to register stream: {}", e),
                        });
                        continue;
                    }
                    let _ = stream.set_nodelay(true);

                    let mut conns = HashMap::new();
                    conns.insert(
                        0,
                        Conn {
                            stream,
                            token,
                            peer: 0,
                            remote_addr,
                            state: ConnState::Connecting,
                            codec: FrameCodec::new(self.max_message_size),
                            send_queue: VecDeque::new(),
                            send_offset: 0,
                        },
                    );
                    self.tokens.insert(token, TokenTarget::Peer(socket, 0));
                    self.sockets.insert(
                        socket,
                        SocketState {
                            kind,
                            events,
                            listener: None,
                            listener_token: None,
                            conns,
                            next_peer: 1,
                            shed_count: 0,
                            max_message_size: self.max_message_size,
                            pub_queue_limit: self.pub_queue_limit,
                        },
                    );
                }
                Ok(Command::Send {
                    socket,
                    peer,
                    parts,
                }) => self.handle_send(socket, peer, &parts),
                Ok(Command::CloseSocket { socket }) => self.close_socket(socket),
                Ok(Command::Shutdown) => {
                    self.running.store(false, Ordering::Relaxed);
                    break;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.running.store(false, Ordering::Relaxed);
                    break;
                }
            }
        }
    }

    fn handle_accept(&mut self, socket_id: SocketId) {
        loop {
            // Re-borrow each iteration; accepted conns mutate the map.
            let listener = match self.sockets.get(&socket_id).and_then(|s| s.listener.as_ref()) {
                Some(l) => l,
                None => return,
            };

            match listener.accept() {
                Ok((mut stream, remote_addr)) => {
                    let token = self.alloc_token();
                    if let Err(e) = self.poll.registry().register(
                        &mut stream,
                        token,
                        Interest::READABLE | Interest::WRITABLE,
                    ) {
                        log::warn!("failed to register accepted peer {}: {}", remote_addr, e);
                        continue;
                    }
                    let _ = stream.set_nodelay(true);

                    let socket = match self.sockets.get_mut(&socket_id) {
                        Some(s) => s,
                        None => return,
                    };
                    let peer = socket.next_peer;
                    socket.next_peer += 1;

                    socket.conns.insert(
                        peer,
                        Conn {
                            stream,
                            token,
                            peer,
                            remote_addr,
                            state: ConnState::Connected,
                            codec: FrameCodec::new(socket.max_message_size),
                            send_queue: VecDeque::new(),
                            send_offset: 0,
                        },
                    );
                    self.tokens.insert(token, TokenTarget::Peer(socket_id, peer));

                    let _ = socket
                        .events
                        .send(SocketEvent::Accepted { socket: socket_id, peer });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    if let Some(socket) = self.sockets.get(&socket_id) {
                        let _ = socket.events.send(SocketEvent::IoError {
                            socket: socket_id,
                            error: format!("accept failed: {}", e),
                        });
                    }
                    break;
                }
            }
        }
    }

    fn handle_send(&mut self, socket_id: SocketId, peer: Option<PeerId>, parts: &Message) {
        let framed = FrameCodec::encode(parts);
        let socket = match self.sockets.get_mut(&socket_id) {
            Some(s) => s,
            None => return,
        };

        let mut failed: Vec<PeerId> = Vec::new();
        match (socket.kind, peer) {
            (SocketKind::Pub, None) => {
                let limit = socket.pub_queue_limit;
                for conn in socket.conns.values_mut() {
                    if conn.state != ConnState::Connected {
                        continue;
                    }
                    if !conn.enqueue(framed.clone(), Some(limit)) {
                        socket.shed_count += 1;
                        log::debug!(
                            "publish queue full for {}, shedding frame (total shed {})",
                            conn.remote_addr,
                            socket.shed_count
                        );
                        continue;
                    }
                    if conn.flush().is_err() {
                        failed.push(conn.peer);
                    }
                }
            }
            (_, Some(peer_id)) => {
                if let Some(conn) = socket.conns.get_mut(&peer_id) {
                    conn.enqueue(framed, None);
                    if conn.flush().is_err() {
                        failed.push(peer_id);
                    }
                }
                // A vanished peer gets no reply; the request died with it.
            }
            (_, None) => {
                // Req/sub sockets talk to their single outbound connection.
                // With the connection gone the message is dropped; the
                // caller's timeout machinery owns recovery.
                if let Some(conn) = socket.conns.get_mut(&0) {
                    conn.enqueue(framed, None);
                    if conn.state == ConnState::Connected && conn.flush().is_err() {
                        failed.push(0);
                    }
                }
            }
        }

        for peer_id in failed {
            self.close_conn(socket_id, peer_id, "write failed");
        }
    }

    fn handle_writable(&mut self, socket_id: SocketId, peer: PeerId) {
        let socket = match self.sockets.get_mut(&socket_id) {
            Some(s) => s,
            None => return,
        };
        let conn = match socket.conns.get_mut(&peer) {
            Some(c) => c,
            None => return,
        };

        if conn.state == ConnState::Connecting {
            // Non-blocking connect resolution: an error on the socket means
            // refusal, a valid peer address means established.
            match conn.stream.take_error() {
                Ok(Some(e)) => {
                    let reason = format!("connect failed: {}", e);
                    self.close_conn(socket_id, peer, &reason);
                    return;
                }
                Err(e) => {
                    let reason = format!("connect failed: {}", e);
                    self.close_conn(socket_id, peer, &reason);
                    return;
                }
                Ok(None) => {}
            }
            if conn.stream.peer_addr().is_ok() {
                conn.state = ConnState::Connected;
                let _ = socket
                    .events
                    .send(SocketEvent::Connected { socket: socket_id });
            } else {
                return;
            }
        }

        let conn = match self
            .sockets
            .get_mut(&socket_id)
            .and_then(|s| s.conns.get_mut(&peer))
        {
            Some(c) => c,
            None => return,
        };
        if conn.flush().is_err() {
            self.close_conn(socket_id, peer, "write failed");
        }
    }

    fn handle_readable(&mut self, socket_id: SocketId, peer: PeerId) {
        let socket = match self.sockets.get_mut(&socket_id) {
            Some(s) => s,
            None => return,
        };
        let conn = match socket.conns.get_mut(&peer) {
            Some(c) => c,
            None => return,
        };

        if conn.state == ConnState::Connecting {
            // A readable event can race the writable one on refused
            // connections; let the writable handler resolve it.
            return;
        }

        match conn.codec.read_from(&mut conn.stream) {
            Ok((messages, closed)) => {
                for parts in messages {
                    let _ = socket.events.send(SocketEvent::Message {
                        socket: socket_id,
                        peer,
                        parts,
                    });
                }
                if closed {
                    self.close_conn(socket_id, peer, "peer closed connection");
                }
            }
            Err(e) => {
                let reason = format!("read failed: {}", e);
                self.close_conn(socket_id, peer, &reason);
            }
        }
    }

    fn close_conn(&mut self, socket_id: SocketId, peer: PeerId, reason: &str) {
        let socket = match self.sockets.get_mut(&socket_id) {
            Some(s) => s,
            None => return,
        };
        if let Some(mut conn) = socket.conns.remove(&peer) {
            let _ = self.poll.registry().deregister(&mut conn.stream);
            self.tokens.remove(&conn.token);

            // For outbound (req/sub) sockets the single connection *is* the
            // socket, which the owner sees as peer None.
            let emitted_peer = match socket.kind {
                SocketKind::Req | SocketKind::Sub => None,
                SocketKind::Rep | SocketKind::Pub => Some(peer),
            };
            let _ = socket.events.send(SocketEvent::Closed {
                socket: socket_id,
                peer: emitted_peer,
                reason: reason.to_string(),
            });
        }
    }

    fn close_socket(&mut self, socket_id: SocketId) {
        if let Some(mut socket) = self.sockets.remove(&socket_id) {
            if let Some(mut listener) = socket.listener.take() {
                let _ = self.poll.registry().deregister(&mut listener);
            }
            if let Some(token) = socket.listener_token {
                self.tokens.remove(&token);
            }
            for (_, mut conn) in socket.conns.drain() {
                let _ = self.poll.registry().deregister(&mut conn.stream);
                self.tokens.remove(&conn.token);
            }
        }
    }
}
