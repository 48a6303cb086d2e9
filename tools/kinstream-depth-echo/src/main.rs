// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! kinstream-depth-echo - subscribe to a depth stream and report traffic.
//!
//! Connects to a server's control endpoint, waits for its device set,
//! enables depth frames for one device, and prints a line per second with
//! frame and byte rates.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kinstream::{Client, ClientListener, CompressedFrame};

/// Echo compressed depth traffic from a stream server
#[derive(Parser, Debug)]
#[command(name = "kinstream-depth-echo")]
#[command(about = "Subscribe to a depth stream and report frame rates")]
struct Args {
    /// Control endpoint, e.g. tcp://192.168.0.10:45123
    endpoint: String,

    /// Device id to subscribe to (default: first reported device)
    #[arg(short, long)]
    device: Option<String>,

    /// Seconds to run (0 = until interrupted)
    #[arg(short, long, default_value = "0")]
    seconds: u64,
}

#[derive(Default)]
struct TrafficCounter {
    frames: AtomicU64,
    bytes: AtomicU64,
}

impl ClientListener for TrafficCounter {
    fn on_depth_frame(&self, _device_id: &str, frame: &CompressedFrame) {
        self.frames.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(frame.data.len() as u64, Ordering::Relaxed);
    }

    fn on_disconnect(&self) {
        log::warn!("server connection lost");
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let counter = Arc::new(TrafficCounter::default());
    let client = Client::builder(&args.endpoint)
        .listener(counter.clone())
        .connect_immediately()
        .build()?;

    // Wait for the identity exchange to surface the device set.
    let device = loop {
        if let Some(device) = args
            .device
            .clone()
            .or_else(|| client.kinect_ids().into_iter().next())
        {
            if client.kinect_ids().contains(&device) {
                break device;
            }
        }
        if !client.is_connected() {
            return Err("server disconnected before reporting a device".into());
        }
        std::thread::sleep(Duration::from_millis(50));
    };

    client.enable_depth_frames(&device)?;
    log::info!(
        "streaming depth from \"{}\" on {}",
        device,
        client.server_name().unwrap_or_else(|| "?".into())
    );

    let running = Arc::new(AtomicBool::new(true));
    let stop = Arc::clone(&running);
    ctrlc::set_handler(move || stop.store(false, Ordering::Relaxed))?;

    let mut elapsed = 0u64;
    let mut last_frames = 0u64;
    let mut last_bytes = 0u64;
    while running.load(Ordering::Relaxed) && (args.seconds == 0 || elapsed < args.seconds) {
        std::thread::sleep(Duration::from_secs(1));
        elapsed += 1;

        let frames = counter.frames.load(Ordering::Relaxed);
        let bytes = counter.bytes.load(Ordering::Relaxed);
        println!(
            "{:>4}s  {:>4} fps  {:>8.1} KiB/s",
            elapsed,
            frames - last_frames,
            (bytes - last_bytes) as f64 / 1024.0,
        );
        last_frames = frames;
        last_bytes = bytes;
    }

    client.disconnect()?;
    Ok(())
}
