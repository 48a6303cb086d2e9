// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared helpers for the integration suite.

#![allow(dead_code)]

use std::sync::Mutex;
use std::time::{Duration, Instant};

use kinstream::{ClientListener, CompressedFrame};

/// Default deadline for asynchronous expectations.
pub const WAIT: Duration = Duration::from_secs(10);

/// Initialise test logging; safe to call from every test.
pub fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Poll `pred` until it holds or `deadline` passes.
pub fn wait_until(deadline: Duration, pred: impl Fn() -> bool) -> bool {
    let end = Instant::now() + deadline;
    loop {
        if pred() {
            return true;
        }
        if Instant::now() >= end {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// One observed client callback.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientEvent {
    Connect,
    Disconnect,
    AddKinect(String),
    RemoveKinect(String),
}

/// Client listener that records callbacks and depth frames.
#[derive(Default)]
pub struct RecordingClient {
    events: Mutex<Vec<ClientEvent>>,
    frames: Mutex<Vec<(String, CompressedFrame)>>,
}

impl RecordingClient {
    pub fn events(&self) -> Vec<ClientEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, event: &ClientEvent) -> usize {
        self.events().iter().filter(|e| *e == event).count()
    }

    pub fn frames(&self) -> Vec<(String, CompressedFrame)> {
        self.frames.lock().unwrap().clone()
    }

    pub fn frame_count(&self) -> usize {
        self.frames.lock().unwrap().len()
    }
}

impl ClientListener for RecordingClient {
    fn on_connect(&self) {
        self.events.lock().unwrap().push(ClientEvent::Connect);
    }

    fn on_disconnect(&self) {
        self.events.lock().unwrap().push(ClientEvent::Disconnect);
    }

    fn on_add_kinect(&self, device_id: &str) {
        self.events
            .lock()
            .unwrap()
            .push(ClientEvent::AddKinect(device_id.to_string()));
    }

    fn on_remove_kinect(&self, device_id: &str) {
        self.events
            .lock()
            .unwrap()
            .push(ClientEvent::RemoveKinect(device_id.to_string()));
    }

    fn on_depth_frame(&self, device_id: &str, frame: &CompressedFrame) {
        self.frames
            .lock()
            .unwrap()
            .push((device_id.to_string(), frame.clone()));
    }
}
