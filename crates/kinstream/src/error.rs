// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types for kinstream operations.

use std::fmt;
use std::io;

/// Result type for kinstream operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur across the streaming fabric.
///
/// The server never propagates bad client input as an error: malformed or
/// unknown requests are answered with an `error` reply (code 400) and the
/// session continues. The client never panics on bad server output: it
/// either skips (unknown endpoint types) or disconnects (protocol version
/// mismatch).
#[derive(Debug)]
pub enum Error {
    // ========================================================================
    // Transport
    // ========================================================================
    /// I/O error with underlying cause.
    Io(io::Error),
    /// Failed to bind a socket to an address.
    Bind(String),
    /// The transport I/O thread or a component event loop is gone.
    Disconnected(String),

    // ========================================================================
    // Protocol
    // ========================================================================
    /// Inbound control message violated the framing rules (wrong part
    /// count, unknown tag byte, invalid JSON payload).
    MalformedMessage(String),
    /// Fatal protocol violation (version mismatch, wrong reply type).
    Protocol(String),

    // ========================================================================
    // Client session
    // ========================================================================
    /// No reply arrived within the per-attempt request timeout.
    Timeout,
    /// Operation requires a connected session.
    NotConnected,
    /// Stream operation referenced a device id the server never reported.
    UnknownDevice(String),

    // ========================================================================
    // Pipeline / discovery
    // ========================================================================
    /// Depth frame encoding failed. The frame is dropped and the pipeline
    /// continues; surfaced only from direct codec calls.
    Encode(String),
    /// Service registration or browsing failed.
    Discovery(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Bind(msg) => write!(f, "Bind failed: {}", msg),
            Error::Disconnected(msg) => write!(f, "Transport gone: {}", msg),
            Error::MalformedMessage(msg) => write!(f, "Malformed message: {}", msg),
            Error::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            Error::Timeout => write!(f, "Request timed out"),
            Error::NotConnected => write!(f, "Client is not connected"),
            Error::UnknownDevice(id) => write!(f, "Unknown device id: {}", id),
            Error::Encode(msg) => write!(f, "Depth frame encoding failed: {}", msg),
            Error::Discovery(msg) => write!(f, "Discovery error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::MalformedMessage(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        assert_eq!(Error::Timeout.to_string(), "Request timed out");
        assert_eq!(Error::NotConnected.to_string(), "Client is not connected");
        assert_eq!(
            Error::UnknownDevice("K1".into()).to_string(),
            "Unknown device id: K1"
        );
    }

    #[test]
    fn test_io_source_preserved() {
        let e: Error = io::Error::new(io::ErrorKind::ConnectionRefused, "nope").into();
        assert!(std::error::Error::source(&e).is_some());
    }
}
