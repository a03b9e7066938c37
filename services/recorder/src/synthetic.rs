//! Built-in capture devices that need no hardware.
//!
//! The synthetic camera emits an H.264-shaped annex-B stream (SPS + PPS + IDR
//! once per second, P slices in between) at the configured frame rate, and
//! renders JPEG stills of a static scene. The microphone produces a quiet
//! tone in real time.

use crate::audio::{AudioError, AudioFormat, AudioInput, AudioStream};
use crate::capture::{CaptureError, CaptureSource, FrameSink, SinkSlot, StillSource};
use crate::config::{AudioConfig, CameraConfig};
use crate::rolling_buffer::VideoFrame;
use bytes::{BufMut, Bytes, BytesMut};
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, Rgb, RgbImage};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const SPS: [u8; 12] = [
    0x00, 0x00, 0x00, 0x01, 0x67, 0x42, 0xC0, 0x1F, 0x8C, 0x8D, 0x40, 0x50,
];
const PPS: [u8; 8] = [0x00, 0x00, 0x00, 0x01, 0x68, 0xCE, 0x3C, 0x80];
const IDR_HEADER: [u8; 5] = [0x00, 0x00, 0x00, 0x01, 0x65];
const P_HEADER: [u8; 5] = [0x00, 0x00, 0x00, 0x01, 0x41];

/// Knobs shared between a synthetic camera and the code driving it.
#[derive(Debug, Clone, Default)]
pub struct SyntheticControls {
    unavailable: Arc<AtomicBool>,
    scene: Arc<AtomicU32>,
}

impl SyntheticControls {
    /// Simulate the device disappearing (or coming back).
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Move the object in the rendered scene, so consecutive stills differ.
    pub fn nudge_scene(&self) {
        self.scene.fetch_add(1, Ordering::SeqCst);
    }

    fn is_available(&self) -> bool {
        !self.unavailable.load(Ordering::SeqCst)
    }
}

/// Build one access unit. Every `gop`-th frame is a sync point.
pub fn synthetic_access_unit(index: u64, gop: u64, payload_len: usize) -> Bytes {
    let sync = index % gop.max(1) == 0;
    let payload_len = if sync { payload_len * 4 } else { payload_len };
    let mut au = BytesMut::with_capacity(SPS.len() + PPS.len() + 5 + payload_len);
    if sync {
        au.put_slice(&SPS);
        au.put_slice(&PPS);
        au.put_slice(&IDR_HEADER);
    } else {
        au.put_slice(&P_HEADER);
    }
    // High bit set, so the payload never forms a start code.
    let fill = 0x80 | (index as u8 & 0x7F);
    au.put_bytes(fill, payload_len);
    au.freeze()
}

fn render_still(width: u32, height: u32, scene: u32) -> Result<Bytes, CaptureError> {
    let block = (width / 8).max(1);
    let block_x = (scene * block) % width.max(1);
    let image = RgbImage::from_fn(width, height, |x, y| {
        if x >= block_x && x < block_x + block && y < height / 3 {
            Rgb([250, 250, 250])
        } else {
            let shade = (y * 160 / height.max(1)) as u8;
            Rgb([shade / 2, 40 + shade, shade / 3])
        }
    });

    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, 80)
        .encode(image.as_raw(), width, height, ExtendedColorType::Rgb8)
        .map_err(|e| CaptureError::DeviceUnavailable(format!("still encoding failed: {e}")))?;
    Ok(Bytes::from(out))
}

/// Stills tap of a synthetic camera.
pub struct SyntheticStills {
    width: u32,
    height: u32,
    controls: SyntheticControls,
}

impl StillSource for SyntheticStills {
    fn grab_still(&mut self) -> Result<Bytes, CaptureError> {
        if !self.controls.is_available() {
            return Err(CaptureError::DeviceUnavailable("synthetic camera offline".to_string()));
        }
        render_still(
            self.width,
            self.height,
            self.controls.scene.load(Ordering::SeqCst),
        )
    }
}

/// Camera generating frames on a background thread.
pub struct SyntheticCamera {
    width: u32,
    height: u32,
    framerate: u32,
    frame_bytes: usize,
    slot: SinkSlot,
    controls: SyntheticControls,
    running: Arc<AtomicBool>,
    frames_generated: Arc<AtomicU64>,
    thread: Option<JoinHandle<()>>,
}

impl SyntheticCamera {
    pub fn new(config: &CameraConfig) -> Self {
        let framerate = config.framerate.max(1);
        let frame_bytes = (config.bitrate_kbps as usize * 1000 / 8 / framerate as usize).max(16);
        Self {
            width: config.width,
            height: config.height,
            framerate,
            frame_bytes,
            slot: SinkSlot::new(),
            controls: SyntheticControls::default(),
            running: Arc::new(AtomicBool::new(false)),
            frames_generated: Arc::new(AtomicU64::new(0)),
            thread: None,
        }
    }

    pub fn controls(&self) -> SyntheticControls {
        self.controls.clone()
    }

    pub fn slot(&self) -> &SinkSlot {
        &self.slot
    }

    pub fn frames_generated(&self) -> u64 {
        self.frames_generated.load(Ordering::Relaxed)
    }

    fn spawn_generator(&mut self) -> Result<(), CaptureError> {
        let slot = self.slot.clone();
        let running = self.running.clone();
        let controls = self.controls.clone();
        let generated = self.frames_generated.clone();
        let frame_interval = Duration::from_secs(1) / self.framerate;
        let gop = self.framerate as u64;
        let frame_bytes = self.frame_bytes;

        running.store(true, Ordering::SeqCst);
        let handle = std::thread::Builder::new()
            .name("synthetic-camera".to_string())
            .spawn(move || {
                let started = Instant::now();
                let mut index = 0u64;
                while running.load(Ordering::SeqCst) {
                    if controls.is_available() {
                        let pts = frame_interval * index as u32;
                        let data = synthetic_access_unit(index, gop, frame_bytes);
                        slot.deliver(&VideoFrame::from_annex_b(data, pts));
                        generated.fetch_add(1, Ordering::Relaxed);
                        index += 1;
                    }

                    let next = started + frame_interval * (index as u32 + 1);
                    let now = Instant::now();
                    std::thread::sleep(if next > now { next - now } else { frame_interval });
                }
                debug!(frames = index, "Synthetic camera generator stopped");
            })
            .map_err(|e| CaptureError::DeviceUnavailable(format!("failed to spawn generator: {e}")))?;
        self.thread = Some(handle);
        Ok(())
    }

    fn install(&mut self, sink: Option<Box<dyn FrameSink>>) -> Result<(), CaptureError> {
        self.slot.replace(sink)
    }
}

impl CaptureSource for SyntheticCamera {
    fn open(&mut self) -> Result<(), CaptureError> {
        if !self.controls.is_available() {
            return Err(CaptureError::DeviceUnavailable("synthetic camera offline".to_string()));
        }
        if self.thread.is_none() {
            self.spawn_generator()?;
            info!(
                width = self.width,
                height = self.height,
                framerate = self.framerate,
                "Synthetic camera opened"
            );
        }
        Ok(())
    }

    fn is_available(&self) -> bool {
        self.thread.is_some() && self.controls.is_available()
    }

    fn capture_still_frame(&mut self) -> Result<Bytes, CaptureError> {
        self.still_source()
            .ok_or_else(|| CaptureError::DeviceUnavailable("no still tap".to_string()))?
            .grab_still()
    }

    fn start_recording(&mut self, sink: Box<dyn FrameSink>) -> Result<(), CaptureError> {
        self.install(Some(sink))
    }

    fn split_recording(&mut self, sink: Box<dyn FrameSink>) -> Result<(), CaptureError> {
        self.install(Some(sink))
    }

    fn stop_recording(&mut self) -> Result<(), CaptureError> {
        self.install(None)
    }

    fn still_source(&self) -> Option<Box<dyn StillSource>> {
        Some(Box::new(SyntheticStills {
            width: self.width,
            height: self.height,
            controls: self.controls.clone(),
        }))
    }

    fn close(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                warn!("Synthetic camera generator panicked");
            }
        }
    }
}

impl Drop for SyntheticCamera {
    fn drop(&mut self) {
        self.close();
    }
}

/// Microphone producing a quiet 440 Hz tone.
#[derive(Debug, Clone)]
pub struct SyntheticMicrophone {
    format: AudioFormat,
    available: Arc<AtomicBool>,
}

impl SyntheticMicrophone {
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            format: AudioFormat {
                sample_rate: config.sample_rate.max(1),
                channels: config.channels.max(1),
            },
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }
}

impl AudioInput for SyntheticMicrophone {
    fn open(&self) -> Result<Box<dyn AudioStream>, AudioError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(AudioError::Device("synthetic microphone offline".to_string()));
        }
        Ok(Box::new(ToneStream {
            format: self.format,
            started: Instant::now(),
            frames_emitted: 0,
        }))
    }
}

struct ToneStream {
    format: AudioFormat,
    started: Instant,
    frames_emitted: u64,
}

impl AudioStream for ToneStream {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn read(&mut self, buf: &mut [i16]) -> Result<usize, AudioError> {
        let channels = self.format.channels as usize;
        let frames = buf.len() / channels;
        if frames == 0 {
            return Ok(0);
        }

        // Pace to real time.
        let due = Duration::from_secs_f64(
            (self.frames_emitted + frames as u64) as f64 / self.format.sample_rate as f64,
        );
        let elapsed = self.started.elapsed();
        if due > elapsed {
            std::thread::sleep(due - elapsed);
        }

        let rate = self.format.sample_rate as f64;
        for frame in 0..frames {
            let t = (self.frames_emitted + frame as u64) as f64 / rate;
            let sample = ((t * 440.0 * std::f64::consts::TAU).sin() * 2000.0) as i16;
            for channel in 0..channels {
                buf[frame * channels + channel] = sample;
            }
        }
        self.frames_emitted += frames as u64;
        Ok(frames * channels)
    }
}
