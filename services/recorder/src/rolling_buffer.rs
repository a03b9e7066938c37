//! Fixed-duration ring of recently captured video.
//!
//! The capture source appends encoded access units while the recorder is
//! idle. When an alert starts the ring is drained into the pre-roll file:
//! the frames are snapshotted under a short lock (payloads are reference
//! counted, so this is cheap), the ring is reset, and the file is written
//! outside the lock. Writers are never blocked on disk I/O.

use crate::h264;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// One encoded access unit.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    /// Encoded payload, annex-B framed
    pub data: Bytes,

    /// Presentation time relative to the start of capture
    pub pts: Duration,

    /// Whether decoding can begin at this frame
    pub sync: bool,
}

impl VideoFrame {
    pub fn new(data: Bytes, pts: Duration, sync: bool) -> Self {
        Self { data, pts, sync }
    }

    /// Build a frame from an annex-B access unit, detecting the sync flag
    /// from the NAL units it carries.
    pub fn from_annex_b(data: Bytes, pts: Duration) -> Self {
        let sync = h264::is_sync_point(&data);
        Self { data, pts, sync }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Result of draining the ring into a file.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DrainOutcome {
    /// Frames written to the destination
    pub frames_written: usize,

    /// Bytes written to the destination
    pub bytes_written: u64,

    /// Frames discarded because they preceded the first sync frame
    pub frames_skipped: usize,
}

impl DrainOutcome {
    pub fn is_empty(&self) -> bool {
        self.frames_written == 0
    }
}

/// Ring statistics.
#[derive(Debug, Default, Clone)]
pub struct BufferStats {
    pub frames_pushed: u64,
    pub frames_evicted: u64,
    pub drains: u64,
}

#[derive(Debug, Default)]
struct Ring {
    frames: VecDeque<VideoFrame>,
    bytes: usize,
    stats: BufferStats,
}

impl Ring {
    fn span(&self) -> Duration {
        match (self.frames.front(), self.frames.back()) {
            (Some(oldest), Some(newest)) => newest.pts.saturating_sub(oldest.pts),
            _ => Duration::ZERO,
        }
    }

    fn evict_oldest(&mut self) {
        if let Some(frame) = self.frames.pop_front() {
            self.bytes -= frame.len();
            self.stats.frames_evicted += 1;
        }
    }

    fn clear(&mut self) {
        self.frames.clear();
        self.bytes = 0;
    }
}

/// Shared handle to the rolling buffer.
///
/// Cloning yields another handle to the same ring; the capture sink holds one
/// and the capture session holds the other.
#[derive(Debug, Clone)]
pub struct RollingBuffer {
    inner: Arc<Mutex<Ring>>,
    window: Duration,
    max_bytes: usize,
}

impl RollingBuffer {
    /// Create a ring retaining `window` worth of video, bounded by
    /// `max_bytes` (0 = bounded by duration only).
    pub fn new(window: Duration, max_bytes: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Ring::default())),
            window,
            max_bytes,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Append a frame, overwriting the oldest data past the window.
    pub fn push(&self, frame: VideoFrame) {
        let mut ring = self.inner.lock();
        ring.bytes += frame.len();
        ring.frames.push_back(frame);
        ring.stats.frames_pushed += 1;

        while ring.frames.len() > 1 && ring.span() > self.window {
            ring.evict_oldest();
        }
        while self.max_bytes > 0 && ring.frames.len() > 1 && ring.bytes > self.max_bytes {
            ring.evict_oldest();
        }
    }

    /// Drop everything retained so far.
    pub fn reset(&self) {
        self.inner.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().frames.is_empty()
    }

    /// Bytes currently retained.
    pub fn byte_len(&self) -> usize {
        self.inner.lock().bytes
    }

    /// Time span between the oldest and newest retained frames.
    pub fn retained(&self) -> Duration {
        self.inner.lock().span()
    }

    pub fn stats(&self) -> BufferStats {
        self.inner.lock().stats.clone()
    }

    /// Take the retained frames from the first sync frame onward and reset
    /// the ring. Frames pushed after this call land in the fresh ring.
    fn take_from_sync(&self) -> (Vec<VideoFrame>, usize) {
        let mut ring = self.inner.lock();
        let skipped = ring
            .frames
            .iter()
            .position(|f| f.sync)
            .unwrap_or(ring.frames.len());
        let frames: Vec<VideoFrame> = ring.frames.iter().skip(skipped).cloned().collect();
        ring.clear();
        ring.stats.drains += 1;
        (frames, skipped)
    }

    /// Write the retained video, starting at the first sync frame, to
    /// `destination` and reset the ring.
    ///
    /// The destination is always created (or truncated). Draining an empty
    /// ring yields an empty file and an empty outcome.
    pub fn drain_to_file(&self, destination: &Path) -> io::Result<DrainOutcome> {
        let (frames, skipped) = self.take_from_sync();

        if skipped > 0 {
            if frames.is_empty() {
                warn!(
                    frames_skipped = skipped,
                    "No sync frame in rolling buffer, pre-roll will be empty"
                );
            } else {
                debug!(frames_skipped = skipped, "Skipped frames preceding first sync frame");
            }
        }

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(destination)?;
        let mut writer = BufWriter::new(file);

        let mut outcome = DrainOutcome {
            frames_skipped: skipped,
            ..Default::default()
        };
        for frame in &frames {
            writer.write_all(&frame.data)?;
            outcome.frames_written += 1;
            outcome.bytes_written += frame.len() as u64;
        }

        let file: File = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;

        debug!(
            path = %destination.display(),
            frames = outcome.frames_written,
            bytes = outcome.bytes_written,
            "Rolling buffer drained"
        );

        Ok(outcome)
    }
}
