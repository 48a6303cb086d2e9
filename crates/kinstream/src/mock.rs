// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Mock Kinect device for testing and demos.
//!
//! Renders a synthetic scene (a wall plane with a sphere swinging across it)
//! at Kinect v2 resolution on a dedicated capture thread, aiming for just
//! above 60 FPS like the real depth stream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::Result;
use crate::kinect::{DepthDevice, DepthFrame, FrameListener, FrameListenerId, FrameSignal};

/// Kinect v2 depth raster width.
pub const FRAME_WIDTH: usize = 1920;

/// Kinect v2 depth raster height.
pub const FRAME_HEIGHT: usize = 1080;

/// Target inter-frame interval, just above 60 FPS.
const FRAME_INTERVAL: Duration = Duration::from_micros(1_000_000 / 70);

/// Synthetic depth device.
///
/// Frames are delivered to listeners on the mock's capture thread. The
/// device is scoped: [`stop`](DepthDevice::stop) (or drop) joins the thread.
pub struct MockKinect {
    device_id: String,
    signal: Arc<FrameSignal>,
    should_stop: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl MockKinect {
    /// Create a mock with a random stable device id.
    pub fn new() -> Self {
        Self::with_device_id(format!("mock-kinect-{}", Uuid::new_v4()))
    }

    /// Create a mock with a caller-chosen device id (tests want stable ids).
    pub fn with_device_id(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            signal: Arc::new(FrameSignal::new()),
            should_stop: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
        }
    }
}

impl Default for MockKinect {
    fn default() -> Self {
        Self::new()
    }
}

impl DepthDevice for MockKinect {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn start(&self) -> Result<()> {
        let mut slot = self.thread.lock();
        if slot.is_some() {
            log::warn!("mock kinect {} already started", self.device_id);
            return Ok(());
        }

        self.should_stop.store(false, Ordering::Relaxed);
        let signal = Arc::clone(&self.signal);
        let should_stop = Arc::clone(&self.should_stop);

        let handle = std::thread::Builder::new()
            .name("mock-kinect".to_string())
            .spawn(move || capture_loop(&signal, &should_stop))?;
        *slot = Some(handle);
        Ok(())
    }

    fn stop(&self) {
        let handle = self.thread.lock().take();
        match handle {
            Some(handle) => {
                self.should_stop.store(true, Ordering::Relaxed);
                let _ = handle.join();
            }
            None => log::warn!("mock kinect {} already stopped", self.device_id),
        }
    }

    fn add_frame_listener(&self, listener: FrameListener) -> FrameListenerId {
        self.signal.connect(listener)
    }

    fn remove_frame_listener(&self, id: FrameListenerId) {
        self.signal.disconnect(id)
    }
}

impl Drop for MockKinect {
    fn drop(&mut self) {
        if self.thread.lock().is_some() {
            self.stop();
        }
    }
}

/// Static scene: a wall receding with row index and a sphere depth field
/// centred in the frame.
fn make_scene() -> (Vec<u16>, Vec<u16>) {
    let mut wall = vec![0u16; FRAME_WIDTH * FRAME_HEIGHT];
    let mut sphere = vec![0u16; FRAME_WIDTH * FRAME_HEIGHT];

    let cx = (FRAME_WIDTH / 2) as f64;
    let cy = (FRAME_HEIGHT / 2) as f64;

    for y in 0..FRAME_HEIGHT {
        for x in 0..FRAME_WIDTH {
            let i = y * FRAME_WIDTH + x;
            wall[i] = ((y >> 1) + 1000) as u16;
            let dx = x as f64 - cx;
            let dy = y as f64 - cy;
            sphere[i] = ((dx * dx + dy * dy).sqrt() + 500.0) as u16;
        }
    }
    (wall, sphere)
}

fn capture_loop(signal: &FrameSignal, should_stop: &AtomicBool) {
    let (wall, sphere) = make_scene();
    let mut frame = vec![0u16; FRAME_WIDTH * FRAME_HEIGHT];
    let started = Instant::now();

    while !should_stop.load(Ordering::Relaxed) {
        let then = Instant::now();

        // Swing the sphere horizontally across the wall.
        let phase = started.elapsed().as_secs_f64();
        let dx = (phase.sin() * 100.0) as isize;

        for y in 0..FRAME_HEIGHT {
            let row = y * FRAME_WIDTH;
            for x in 0..FRAME_WIDTH {
                let src_x =
                    (x as isize - dx).rem_euclid(FRAME_WIDTH as isize) as usize;
                frame[row + x] = wall[row + x].min(sphere[row + src_x]);
            }
        }

        let view = DepthFrame {
            width: FRAME_WIDTH,
            height: FRAME_HEIGHT,
            data: &frame,
        };
        signal.emit(&view);

        let elapsed = then.elapsed();
        if elapsed < FRAME_INTERVAL {
            std::thread::sleep(FRAME_INTERVAL - elapsed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_mock_emits_full_frames() {
        let kinect = MockKinect::with_device_id("K-test");
        let frames = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&frames);
        kinect.add_frame_listener(Arc::new(move |frame: &DepthFrame<'_>| {
            assert_eq!(frame.width, FRAME_WIDTH);
            assert_eq!(frame.height, FRAME_HEIGHT);
            assert_eq!(frame.data.len(), FRAME_WIDTH * FRAME_HEIGHT);
            counter.fetch_add(1, Ordering::Relaxed);
        }));

        kinect.start().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while frames.load(Ordering::Relaxed) == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        kinect.stop();

        assert!(frames.load(Ordering::Relaxed) > 0);
    }

    #[test]
    fn test_start_stop_idempotent() {
        let kinect = MockKinect::new();
        kinect.start().unwrap();
        kinect.start().unwrap();
        kinect.stop();
        kinect.stop();
    }

    #[test]
    fn test_scene_contains_wall_and_sphere() {
        let (wall, sphere) = make_scene();
        // Wall depth grows with row index; sphere is nearest at the centre.
        assert!(wall[0] < wall[(FRAME_HEIGHT - 1) * FRAME_WIDTH]);
        let centre = (FRAME_HEIGHT / 2) * FRAME_WIDTH + FRAME_WIDTH / 2;
        assert_eq!(sphere[centre], 500);
        assert!(sphere[0] > sphere[centre]);
    }
}
