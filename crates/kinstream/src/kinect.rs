// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Depth device interface.
//!
//! The frame source is an external collaborator: a driver producing raw
//! 16-bit depth rasters at ~30-70 Hz on its own capture thread. This module
//! defines the seam the server programs against, plus the listener registry
//! devices use to fan frames out.
//!
//! # Thread Safety
//!
//! Frame listeners are invoked on the device's capture thread. They must be
//! `Send + Sync`, must not block, and may only borrow the frame for the
//! duration of the call.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;

/// One raw depth frame, borrowed from the device for a single call.
///
/// `data` holds `width * height` samples in row-major order, millimetres.
#[derive(Clone, Copy, Debug)]
pub struct DepthFrame<'a> {
    /// Columns per row.
    pub width: usize,
    /// Rows.
    pub height: usize,
    /// Row-major 16-bit depth samples.
    pub data: &'a [u16],
}

impl<'a> DepthFrame<'a> {
    /// Wrap a raster, checking the buffer length against the shape.
    pub fn new(width: usize, height: usize, data: &'a [u16]) -> Option<Self> {
        if data.len() == width * height {
            Some(Self {
                width,
                height,
                data,
            })
        } else {
            None
        }
    }
}

/// Handle returned by [`DepthDevice::add_frame_listener`].
pub type FrameListenerId = u64;

/// Callback receiving depth frames on the device's capture thread.
pub type FrameListener = Arc<dyn Fn(&DepthFrame<'_>) + Send + Sync>;

/// A capture device exposing a depth stream.
///
/// Implementations carry a `device_id` that is stable for the lifetime of
/// the registration and unique within one server process.
pub trait DepthDevice: Send + Sync {
    /// Opaque stable identifier.
    fn device_id(&self) -> &str;

    /// Start capturing. Starting a running device is a no-op.
    fn start(&self) -> Result<()>;

    /// Stop capturing. Stopping a stopped device is a no-op.
    fn stop(&self);

    /// Subscribe to depth frames.
    fn add_frame_listener(&self, listener: FrameListener) -> FrameListenerId;

    /// Unsubscribe. Unknown ids are ignored.
    fn remove_frame_listener(&self, id: FrameListenerId);
}

/// Listener registry shared by device implementations.
///
/// Registration and emission may race; emission snapshots the listener set
/// so a callback can remove itself without deadlocking.
#[derive(Default)]
pub struct FrameSignal {
    listeners: Mutex<HashMap<FrameListenerId, FrameListener>>,
    next_id: AtomicU64,
}

impl FrameSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener and return its id.
    pub fn connect(&self, listener: FrameListener) -> FrameListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().insert(id, listener);
        id
    }

    /// Remove a listener; unknown ids are ignored.
    pub fn disconnect(&self, id: FrameListenerId) {
        self.listeners.lock().remove(&id);
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver one frame to every listener.
    pub fn emit(&self, frame: &DepthFrame<'_>) {
        let snapshot: Vec<FrameListener> = self.listeners.lock().values().cloned().collect();
        for listener in snapshot {
            listener(frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_frame_shape_validation() {
        let data = vec![0u16; 6];
        assert!(DepthFrame::new(3, 2, &data).is_some());
        assert!(DepthFrame::new(4, 2, &data).is_none());
    }

    #[test]
    fn test_signal_connect_emit_disconnect() {
        let signal = FrameSignal::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&count);
        let id = signal.connect(Arc::new(move |_f: &DepthFrame<'_>| {
            c.fetch_add(1, Ordering::Relaxed);
        }));

        let data = vec![1u16; 4];
        let frame = DepthFrame::new(2, 2, &data).unwrap();
        signal.emit(&frame);
        signal.emit(&frame);
        assert_eq!(count.load(Ordering::Relaxed), 2);

        signal.disconnect(id);
        signal.emit(&frame);
        assert_eq!(count.load(Ordering::Relaxed), 2);
        assert!(signal.is_empty());
    }
}
