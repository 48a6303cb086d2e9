// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! kinstream-mock-server - serve a synthetic depth stream.
//!
//! Starts a stream server with one mock Kinect attached and keeps serving
//! until interrupted. Point `kinstream-ping` or `kinstream-depth-echo` at
//! the printed control endpoint.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kinstream::{DepthDevice, EndpointType, Lz4Codec, MockKinect, Server};

/// Serve a synthetic Kinect v2 depth stream
#[derive(Parser, Debug)]
#[command(name = "kinstream-mock-server")]
#[command(about = "Serve a synthetic Kinect v2 depth stream")]
struct Args {
    /// Human-readable server name (default: "Kinect2 <uuid>")
    #[arg(short, long)]
    name: Option<String>,

    /// Bind address
    #[arg(short, long, default_value = "127.0.0.1")]
    address: IpAddr,

    /// Device id for the mock kinect
    #[arg(short, long, default_value = "mock-0")]
    device_id: String,

    /// Use the lossless LZ4 codec instead of JPEG
    #[arg(long)]
    lossless: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut builder = Server::builder().address(args.address);
    if let Some(name) = args.name {
        builder = builder.name(name);
    }
    if args.lossless {
        builder = builder.codec(Arc::new(Lz4Codec));
    }
    let server = builder.build()?;

    let kinect = Arc::new(MockKinect::with_device_id(args.device_id));
    server.add_kinect(kinect.clone())?;
    kinect.start()?;
    server.start()?;

    let endpoints = server.endpoints();
    let control = endpoints
        .get(&EndpointType::Control)
        .map(String::as_str)
        .unwrap_or("<unbound>");
    log::info!("server \"{}\" listening on {}", server.name(), control);
    println!("control endpoint: {}", control);

    let running = Arc::new(AtomicBool::new(true));
    let stop = Arc::clone(&running);
    ctrlc::set_handler(move || stop.store(false, Ordering::Relaxed))?;

    while running.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(100));
    }

    log::info!("shutting down");
    kinect.stop();
    server.stop()?;
    Ok(())
}
