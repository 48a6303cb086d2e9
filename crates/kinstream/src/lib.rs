// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # kinstream - Kinect v2 depth streaming fabric
//!
//! Streams Kinect v2 depth imagery from capture hosts to any number of
//! consumers on a local network. A capture host exposes its devices via a
//! discoverable service; a consumer discovers hosts, subscribes to a
//! device's depth stream, and receives compressed frames with bounded loss
//! under overload.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use kinstream::{MockKinect, Result, Server};
//!
//! fn main() -> Result<()> {
//!     let server = Server::builder().name("lab-kinect").build()?;
//!     server.add_kinect(Arc::new(MockKinect::new()))?;
//!     server.start()?;
//!     // Clients can now discover the server, `who` it, and subscribe to
//!     // its devices' depth endpoints.
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------------+
//! |                          Application                               |
//! |        Server / Client / ServerBrowser / MockKinect                |
//! +--------------------------------------------------------------------+
//! |                         Session Layer                              |
//! |  control dispatch | heartbeats | retries | depth subscriptions     |
//! +--------------------------------------------------------------------+
//! |           Pipeline              |          Discovery               |
//! |  worker pool | drop policy      |  advertise | browse | ServerInfo |
//! +--------------------------------------------------------------------+
//! |                     Transport Layer                                |
//! |  req/rep + pub/sub message sockets over TCP (mio I/O thread)       |
//! +--------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Server`] | Binds control and per-device depth endpoints, answers `ping`/`who` |
//! | [`Client`] | Supervises one control session, tracks devices, subscribes to depth |
//! | [`ServerBrowser`] | Watches the local network for stream servers |
//! | [`DepthCompressor`] | Back-pressured compression pipeline with frame shedding |
//! | [`MockKinect`] | Synthetic device for tests and demos |
//!
//! ## Delivery model
//!
//! The control channel is strict FIFO request/reply. The depth channel is
//! best-effort publish/subscribe: frames may be shed at the compression
//! pipeline or at a congested publish socket, and no sequencing or
//! retransmission is attempted. Component callbacks fire on the owning
//! event-loop thread; they must not block.

/// Stream client: session supervision, heartbeats, depth subscriptions.
pub mod client;
/// Depth compression pipeline and codec seam.
pub mod compress;
/// Local-network discovery: advertisement, browsing, responder seam.
pub mod discovery;
/// Error types.
pub mod error;
/// Depth device interface and frame types.
pub mod kinect;
/// Synthetic Kinect device.
pub mod mock;
/// Control-channel wire codec.
pub mod protocol;
/// Stream server: device registry, control dispatch, publish path.
pub mod server;
/// Message-oriented TCP transport (req/rep, pub/sub).
pub mod transport;

pub use client::{Client, ClientBuilder, ClientConfig, ClientListener};
pub use compress::{CompressedFrame, DepthCodec, DepthCompressor, JpegCodec, Lz4Codec};
pub use discovery::{
    BrowseObserver, BrowserListener, ServerBrowser, ServerInfo, ServiceRegistration,
    ServiceResponder, SERVICE_TYPE,
};
pub use error::{Error, Result};
pub use kinect::{DepthDevice, DepthFrame, FrameListener, FrameListenerId};
pub use mock::MockKinect;
pub use protocol::{EndpointType, MessageType, PROTOCOL_VERSION};
pub use server::{Server, ServerBuilder};
pub use transport::Context;
