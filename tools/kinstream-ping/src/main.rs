// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! kinstream-ping - measure control-channel round-trip time.

use std::sync::mpsc::channel;
use std::time::{Duration, Instant};

use clap::Parser;
use kinstream::Client;

/// Ping a stream server's control endpoint
#[derive(Parser, Debug)]
#[command(name = "kinstream-ping")]
#[command(about = "Measure control round-trip time to a stream server")]
struct Args {
    /// Control endpoint, e.g. tcp://192.168.0.10:45123
    endpoint: String,

    /// Number of pings to send
    #[arg(short = 'n', long, default_value = "10")]
    count: u32,

    /// Per-request timeout in milliseconds
    #[arg(short, long, default_value = "500")]
    timeout_ms: u64,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let client = Client::builder(&args.endpoint)
        .request_timeout(Duration::from_millis(args.timeout_ms))
        .connect_immediately()
        .build()?;

    let mut rtts = Vec::with_capacity(args.count as usize);
    for seq in 0..args.count {
        let (tx, rx) = channel();
        let sent = Instant::now();
        client.ping(move || {
            let _ = tx.send(sent.elapsed());
        })?;

        match rx.recv_timeout(Duration::from_millis(args.timeout_ms * 4)) {
            Ok(rtt) => {
                println!("pong {}: {:.2} ms", seq, rtt.as_secs_f64() * 1000.0);
                rtts.push(rtt);
            }
            Err(_) => println!("pong {}: timed out", seq),
        }
    }

    if !rtts.is_empty() {
        let total: Duration = rtts.iter().sum();
        let mean = total / rtts.len() as u32;
        println!(
            "{}/{} pongs, mean rtt {:.2} ms (server \"{}\")",
            rtts.len(),
            args.count,
            mean.as_secs_f64() * 1000.0,
            client.server_name().unwrap_or_else(|| "?".into()),
        );
    }

    client.disconnect()?;
    Ok(())
}
