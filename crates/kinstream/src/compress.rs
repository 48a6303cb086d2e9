// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Back-pressured depth compression pipeline.
//!
//! Raw depth frames arrive on the capture thread at up to ~70 Hz; image
//! encoding is CPU-bound. The pipeline decouples the two with a worker pool
//! behind a bounded queue:
//!
//! ```text
//! capture thread          worker pool              owning event loop
//!      |                       |                          |
//!  submit() --try_send--> encode_frame() --send--> compressed inbox
//!      |                       |
//!      +--(queue full: frame dropped, coalesced warning)--+
//! ```
//!
//! At most `max_in_flight` frames are outstanding (submitted but not yet
//! emitted); the default is `cpu_count + 1`. New frames beyond the limit are
//! dropped silently with one warning per [`DROP_WARN_EVERY`] drops: depth
//! frames are droppable by contract, so overload sheds instead of stalling
//! the capture thread.
//!
//! Compressed output is emitted on the channel supplied at construction,
//! never on the worker that produced it, so consumers keep single-threaded
//! access to their own state.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::kinect::DepthFrame;

/// One coalesced overload warning per this many dropped frames.
pub const DROP_WARN_EVERY: u64 = 10;

/// One self-describing compressed depth frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompressedFrame {
    /// Opaque encoded bytes, delivered as-is to subscribers.
    pub data: Vec<u8>,
}

// ============================================================================
// Codec seam
// ============================================================================

/// Converts one raw depth raster into one compressed buffer.
///
/// Implementations run on pipeline worker threads.
pub trait DepthCodec: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Encode `width * height` row-major samples.
    fn encode_frame(&self, width: usize, height: usize, data: &[u16]) -> Result<Vec<u8>>;
}

/// Range-compress a depth raster to 8 bits per sample.
///
/// Kinect v2 reports millimetres with ~4096 mm of useful range, so the top 8
/// bits of the 12-bit range survive a right-shift by 4; nearer-field
/// saturation and out-of-range readings clip.
pub fn pack_depth_to_8bit(data: &[u16], out: &mut Vec<u8>) {
    out.clear();
    out.reserve(data.len());
    out.extend(data.iter().map(|&s| (s >> 4) as u8));
}

/// Lossy codec: 8-bit range compression followed by baseline JPEG at
/// default quality. This is the default server codec.
#[derive(Clone, Copy, Debug, Default)]
pub struct JpegCodec;

impl DepthCodec for JpegCodec {
    fn name(&self) -> &'static str {
        "jpeg"
    }

    fn encode_frame(&self, width: usize, height: usize, data: &[u16]) -> Result<Vec<u8>> {
        let mut raster = Vec::new();
        pack_depth_to_8bit(data, &mut raster);

        let mut out = Vec::new();
        let mut encoder = image::codecs::jpeg::JpegEncoder::new(&mut out);
        encoder
            .encode(
                &raster,
                width as u32,
                height as u32,
                image::ExtendedColorType::L8,
            )
            .map_err(|e| Error::Encode(e.to_string()))?;
        Ok(out)
    }
}

/// Lossless codec: LZ4 over the raw little-endian 16-bit samples, with the
/// uncompressed size prepended so the buffer is self-describing.
#[derive(Clone, Copy, Debug, Default)]
pub struct Lz4Codec;

impl DepthCodec for Lz4Codec {
    fn name(&self) -> &'static str {
        "lz4"
    }

    fn encode_frame(&self, _width: usize, _height: usize, data: &[u16]) -> Result<Vec<u8>> {
        let mut raw = Vec::with_capacity(data.len() * 2);
        for sample in data {
            raw.extend_from_slice(&sample.to_le_bytes());
        }
        Ok(lz4_flex::compress_prepend_size(&raw))
    }
}

// ============================================================================
// Pipeline
// ============================================================================

struct Job {
    width: usize,
    height: usize,
    raw: Vec<u16>,
}

/// Asynchronous depth compression pipeline.
///
/// Construction spawns the worker pool; dropping the pipeline drains it. The
/// output sender is supplied by the owner, typically the inbox of its event
/// loop.
pub struct DepthCompressor {
    input_tx: Option<Sender<Job>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: usize,
    dropped: AtomicU64,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl DepthCompressor {
    /// Create a pipeline with the default worker count (`cpu_count + 1`).
    pub fn new(codec: Arc<dyn DepthCodec>, output: Sender<CompressedFrame>) -> Self {
        Self::with_workers(codec, output, default_worker_count())
    }

    /// Create a pipeline with an explicit worker count. `max_in_flight`
    /// equals the worker count.
    pub fn with_workers(
        codec: Arc<dyn DepthCodec>,
        output: Sender<CompressedFrame>,
        workers: usize,
    ) -> Self {
        let workers = workers.max(1);
        let (input_tx, input_rx) = bounded::<Job>(workers);
        let in_flight = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::with_capacity(workers);
        for n in 0..workers {
            let codec = Arc::clone(&codec);
            let input_rx: Receiver<Job> = input_rx.clone();
            let output = output.clone();
            let in_flight = Arc::clone(&in_flight);

            let handle = std::thread::Builder::new()
                .name(format!("depth-compress-{}", n))
                .spawn(move || worker_loop(&*codec, &input_rx, &output, &in_flight));
            match handle {
                Ok(h) => handles.push(h),
                Err(e) => log::error!("failed to spawn compression worker: {}", e),
            }
        }

        Self {
            input_tx: Some(input_tx),
            in_flight,
            max_in_flight: workers,
            dropped: AtomicU64::new(0),
            workers: Mutex::new(handles),
        }
    }

    /// Submit one frame. The frame is borrowed only for this call; the raw
    /// buffer is copied before the call returns. Saturation drops the frame.
    pub fn submit(&self, frame: &DepthFrame<'_>) {
        let input_tx = match self.input_tx.as_ref() {
            Some(tx) => tx,
            None => return,
        };

        // Reserve an in-flight slot before copying anything.
        let mut current = self.in_flight.load(Ordering::Acquire);
        loop {
            if current >= self.max_in_flight {
                self.note_dropped();
                return;
            }
            match self.in_flight.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }

        let job = Job {
            width: frame.width,
            height: frame.height,
            raw: frame.data.to_vec(),
        };
        match input_tx.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.in_flight.fetch_sub(1, Ordering::AcqRel);
                self.note_dropped();
            }
            Err(TrySendError::Disconnected(_)) => {
                self.in_flight.fetch_sub(1, Ordering::AcqRel);
                log::error!("compression worker pool is gone, frame discarded");
            }
        }
    }

    /// Frames currently outstanding (submitted but not yet emitted).
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Upper bound on outstanding frames.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    /// Frames shed under overload since creation.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn note_dropped(&self) {
        let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        if total % DROP_WARN_EVERY == 0 {
            log::warn!(
                "depth compression overloaded: {} frames dropped so far",
                total
            );
        }
    }
}

impl Drop for DepthCompressor {
    fn drop(&mut self) {
        // Disconnect the input so workers drain and exit.
        self.input_tx.take();
        for handle in self.workers.lock().drain(..) {
            let _ = handle.join();
        }
    }
}

fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1)
        + 1
}

fn worker_loop(
    codec: &dyn DepthCodec,
    input_rx: &Receiver<Job>,
    output: &Sender<CompressedFrame>,
    in_flight: &AtomicUsize,
) {
    for job in input_rx.iter() {
        match codec.encode_frame(job.width, job.height, &job.raw) {
            Ok(data) => {
                in_flight.fetch_sub(1, Ordering::AcqRel);
                if output.send(CompressedFrame { data }).is_err() {
                    // Owner dropped its inbox; nothing left to emit to.
                    return;
                }
            }
            Err(e) => {
                in_flight.fetch_sub(1, Ordering::AcqRel);
                log::warn!("{} codec failed, frame discarded: {}", codec.name(), e);
            }
        }
    }
}
