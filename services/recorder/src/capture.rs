//! Capture session: ownership of the camera and its recording targets.
//!
//! A [`CaptureSource`] pushes encoded frames into whatever [`FrameSink`] is
//! currently installed. The session switches that sink between the rolling
//! buffer and files. Sinks are swapped inside a [`SinkSlot`] under the same
//! lock the source holds while delivering a frame, so a split never loses or
//! duplicates a frame: frame n-1 ends in the old target, frame n begins in the
//! new one.

use crate::config::CameraConfig;
use crate::rolling_buffer::{DrainOutcome, RollingBuffer, VideoFrame};
use backoff::{backoff::Backoff, ExponentialBackoff};
use bytes::Bytes;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Errors that can occur during capture operations.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("Capture device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Failed to open recording target {path}: {source}")]
    Target {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to write still image {path}: {source}")]
    StillWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to close recording target {target}: {source}")]
    Finish {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("Rolling buffer drain failed: {0}")]
    Drain(#[source] io::Error),

    #[error("Maximum device open attempts exceeded")]
    MaxOpenAttemptsExceeded,
}

impl CaptureError {
    /// Whether the camera itself is gone, as opposed to a storage problem.
    pub fn is_device_failure(&self) -> bool {
        matches!(
            self,
            CaptureError::DeviceUnavailable(_) | CaptureError::MaxOpenAttemptsExceeded
        )
    }
}

/// Destination for encoded frames.
pub trait FrameSink: Send {
    fn write_frame(&mut self, frame: &VideoFrame) -> io::Result<()>;

    /// Flush and close the target. Called once when the sink is replaced.
    fn finish(&mut self) -> io::Result<()>;

    fn describe(&self) -> String;
}

/// Sink mirroring frames into the rolling buffer.
pub struct BufferSink {
    buffer: RollingBuffer,
}

impl BufferSink {
    pub fn new(buffer: RollingBuffer) -> Self {
        Self { buffer }
    }
}

impl FrameSink for BufferSink {
    fn write_frame(&mut self, frame: &VideoFrame) -> io::Result<()> {
        self.buffer.push(frame.clone());
        Ok(())
    }

    fn finish(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn describe(&self) -> String {
        "rolling-buffer".to_string()
    }
}

/// Sink appending frames to a file.
pub struct FileSink {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    bytes_written: u64,
}

impl FileSink {
    /// Create (or truncate) the file at `path`.
    pub fn create(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: Some(BufWriter::new(file)),
            bytes_written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}

impl FrameSink for FileSink {
    fn write_frame(&mut self, frame: &VideoFrame) -> io::Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "file sink already finished"))?;
        writer.write_all(&frame.data)?;
        self.bytes_written += frame.len() as u64;
        Ok(())
    }

    fn finish(&mut self) -> io::Result<()> {
        if let Some(writer) = self.writer.take() {
            let file = writer.into_inner().map_err(|e| e.into_error())?;
            file.sync_all()?;
        }
        Ok(())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

impl Drop for FileSink {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            warn!(path = %self.path.display(), error = %e, "Failed to close recording file");
        }
    }
}

/// Slot holding the sink a capture source currently writes into.
///
/// Sources call [`SinkSlot::deliver`] from their capture thread; the session
/// calls [`SinkSlot::replace`]. Both take the same lock, which makes a sink
/// switch atomic with respect to frame boundaries.
#[derive(Clone, Default)]
pub struct SinkSlot {
    inner: Arc<Mutex<Option<Box<dyn FrameSink>>>>,
    frames_delivered: Arc<AtomicU64>,
    frames_discarded: Arc<AtomicU64>,
    write_errors: Arc<AtomicU64>,
}

impl SinkSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand one frame to the installed sink. Frames arriving while no sink is
    /// installed are discarded.
    pub fn deliver(&self, frame: &VideoFrame) {
        let mut slot = self.inner.lock();
        match slot.as_mut() {
            Some(sink) => match sink.write_frame(frame) {
                Ok(()) => {
                    self.frames_delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    let errors = self.write_errors.fetch_add(1, Ordering::Relaxed);
                    // Log the first failure and then every hundredth.
                    if errors % 100 == 0 {
                        error!(target_sink = %sink.describe(), error = %e, "Frame write failed");
                    }
                }
            },
            None => {
                self.frames_discarded.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Install `next` (or nothing) and finish the previous sink.
    ///
    /// The swap always happens. A [`CaptureError::Finish`] means the new sink
    /// is installed but the previous one could not be flushed.
    pub fn replace(&self, next: Option<Box<dyn FrameSink>>) -> Result<(), CaptureError> {
        let previous = {
            let mut slot = self.inner.lock();
            std::mem::replace(&mut *slot, next)
        };

        match previous {
            Some(mut sink) => {
                let target = sink.describe();
                debug!(previous = %target, "Recording target switched");
                sink.finish()
                    .map_err(|source| CaptureError::Finish { target, source })
            }
            None => Ok(()),
        }
    }

    pub fn is_recording(&self) -> bool {
        self.inner.lock().is_some()
    }

    pub fn stats(&self) -> SinkStats {
        SinkStats {
            frames_delivered: self.frames_delivered.load(Ordering::Relaxed),
            frames_discarded: self.frames_discarded.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
        }
    }
}

/// Frame delivery counters.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SinkStats {
    pub frames_delivered: u64,
    pub frames_discarded: u64,
    pub write_errors: u64,
}

/// Source of independent still frames (JPEG encoded).
pub trait StillSource: Send {
    fn grab_still(&mut self) -> Result<Bytes, CaptureError>;
}

/// Capability contract of a camera.
pub trait CaptureSource: Send {
    /// Bring the device up. Called before any recording command.
    fn open(&mut self) -> Result<(), CaptureError>;

    /// Whether the device is still delivering frames.
    fn is_available(&self) -> bool;

    fn capture_still_frame(&mut self) -> Result<Bytes, CaptureError>;

    fn start_recording(&mut self, sink: Box<dyn FrameSink>) -> Result<(), CaptureError>;

    /// Switch the running recording to `sink` at the next frame boundary.
    fn split_recording(&mut self, sink: Box<dyn FrameSink>) -> Result<(), CaptureError>;

    fn stop_recording(&mut self) -> Result<(), CaptureError>;

    /// An independent still tap, for consumers outside the capture session.
    fn still_source(&self) -> Option<Box<dyn StillSource>> {
        None
    }

    /// Release the device.
    fn close(&mut self) {}
}

/// A still frame saved to disk.
#[derive(Debug, Clone)]
pub struct StillImage {
    pub path: PathBuf,
    pub size_bytes: usize,
}

/// Where the camera is currently recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordingTarget {
    Stopped,
    Buffer,
    File(PathBuf),
}

/// Owns the capture source and the rolling buffer it mirrors into.
pub struct CaptureSession {
    source: Box<dyn CaptureSource>,
    buffer: RollingBuffer,
    target: RecordingTarget,
}

impl CaptureSession {
    pub fn new(source: Box<dyn CaptureSource>, buffer: RollingBuffer) -> Self {
        Self {
            source,
            buffer,
            target: RecordingTarget::Stopped,
        }
    }

    /// Open the device with exponential backoff, then start mirroring into
    /// the rolling buffer.
    pub async fn open_with_retry(&mut self, config: &CameraConfig) -> Result<(), CaptureError> {
        let mut backoff = ExponentialBackoff {
            initial_interval: config.reconnect_base_delay(),
            max_interval: config.reconnect_max_delay(),
            max_elapsed_time: None,
            ..Default::default()
        };

        let mut attempts = 0u32;
        loop {
            match self.source.open() {
                Ok(()) => {
                    info!(attempts = attempts + 1, "Capture device opened");
                    break;
                }
                Err(e) => {
                    attempts += 1;
                    if config.max_open_attempts > 0 && attempts >= config.max_open_attempts {
                        error!(attempts = attempts, error = %e, "Giving up on capture device");
                        return Err(CaptureError::MaxOpenAttemptsExceeded);
                    }

                    match backoff.next_backoff() {
                        Some(delay) => {
                            warn!(
                                attempt = attempts,
                                delay_ms = delay.as_millis() as u64,
                                error = %e,
                                "Capture device open failed, retrying"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        None => backoff.reset(),
                    }
                }
            }
        }

        self.begin_continuous_capture()
    }

    pub fn buffer(&self) -> &RollingBuffer {
        &self.buffer
    }

    pub fn target(&self) -> &RecordingTarget {
        &self.target
    }

    pub fn is_available(&self) -> bool {
        self.source.is_available()
    }

    fn ensure_available(&self) -> Result<(), CaptureError> {
        if self.source.is_available() {
            Ok(())
        } else {
            Err(CaptureError::DeviceUnavailable(
                "capture source stopped delivering frames".to_string(),
            ))
        }
    }

    /// Start mirroring the camera into the rolling buffer.
    pub fn begin_continuous_capture(&mut self) -> Result<(), CaptureError> {
        self.ensure_available()?;
        self.buffer.reset();
        let switched = self
            .source
            .start_recording(Box::new(BufferSink::new(self.buffer.clone())));
        self.record_switch(switched, RecordingTarget::Buffer)?;
        info!(window_secs = self.buffer.window().as_secs(), "Continuous capture started");
        Ok(())
    }

    /// Redirect the running recording into a new file at `path`.
    pub fn split_to(&mut self, path: &Path) -> Result<(), CaptureError> {
        self.ensure_available()?;
        let sink = FileSink::create(path).map_err(|source| CaptureError::Target {
            path: path.to_path_buf(),
            source,
        })?;
        let switched = self.source.split_recording(Box::new(sink));
        self.record_switch(switched, RecordingTarget::File(path.to_path_buf()))?;
        debug!(path = %path.display(), "Recording split to file");
        Ok(())
    }

    /// Close the current file target and resume mirroring into a freshly
    /// reset rolling buffer.
    pub fn resume_into_buffer(&mut self) -> Result<(), CaptureError> {
        self.ensure_available()?;
        self.buffer.reset();
        let switched = self
            .source
            .split_recording(Box::new(BufferSink::new(self.buffer.clone())));
        self.record_switch(switched, RecordingTarget::Buffer)?;
        debug!("Recording resumed into rolling buffer");
        Ok(())
    }

    /// Track the installed target. A finish failure still means the new sink
    /// is in place.
    fn record_switch(
        &mut self,
        switched: Result<(), CaptureError>,
        next: RecordingTarget,
    ) -> Result<(), CaptureError> {
        match switched {
            Ok(()) => {
                self.target = next;
                Ok(())
            }
            Err(err @ CaptureError::Finish { .. }) => {
                warn!(error = %err, "Previous recording target did not close cleanly");
                self.target = next;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Detach whatever target is installed, closing an open file. Works even
    /// when the device is gone.
    pub fn release_target(&mut self) {
        if let Err(e) = self.source.stop_recording() {
            warn!(error = %e, "Failed to release recording target");
        }
        self.target = RecordingTarget::Stopped;
    }

    /// One attempt to bring a lost device back into continuous capture.
    pub fn reopen(&mut self) -> Result<(), CaptureError> {
        self.source.open()?;
        self.begin_continuous_capture()
    }

    /// Write the rolling buffer, from its first sync frame, to `path`.
    pub fn drain_buffer_to(&self, path: &Path) -> Result<DrainOutcome, CaptureError> {
        self.buffer.drain_to_file(path).map_err(CaptureError::Drain)
    }

    /// Capture a single still frame and save it to `path`.
    pub fn capture_still(&mut self, path: &Path) -> Result<StillImage, CaptureError> {
        self.ensure_available()?;
        let jpeg = self.source.capture_still_frame()?;
        std::fs::write(path, &jpeg).map_err(|source| CaptureError::StillWrite {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), size_bytes = jpeg.len(), "Still image saved");
        Ok(StillImage {
            path: path.to_path_buf(),
            size_bytes: jpeg.len(),
        })
    }

    /// An independent still tap for motion sensing.
    pub fn still_source(&self) -> Option<Box<dyn StillSource>> {
        self.source.still_source()
    }

    /// Stop recording and release the device.
    pub fn shutdown(&mut self) {
        if let Err(e) = self.source.stop_recording() {
            warn!(error = %e, "Failed to stop recording cleanly");
        }
        self.source.close();
        self.target = RecordingTarget::Stopped;
        info!("Capture session closed");
    }
}
