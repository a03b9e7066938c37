//! GStreamer capture devices.
//!
//! The camera pipeline tees the raw feed into an H.264 encoder (annex-B,
//! one access unit per buffer, SPS/PPS repeated on every keyframe) and a
//! low-rate JPEG branch used for stills. Encoded buffers go straight into the
//! [`SinkSlot`], so target switches happen on access unit boundaries.

use crate::audio::{AudioError, AudioFormat, AudioInput, AudioStream};
use crate::capture::{CaptureError, CaptureSource, FrameSink, SinkSlot, StillSource};
use crate::config::{AudioConfig, CameraConfig};
use crate::rolling_buffer::VideoFrame;
use bytes::Bytes;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const STATE_CHANGE_TIMEOUT_SECS: u64 = 10;

fn init() -> Result<(), String> {
    gst::init().map_err(|e| e.to_string())
}

/// Build the camera pipeline description.
pub fn camera_pipeline_string(config: &CameraConfig) -> String {
    format!(
        "{source} ! videoconvert ! videoscale \
         ! video/x-raw,width={width},height={height},framerate={fps}/1 \
         ! tee name=t \
         t. ! queue ! x264enc tune=zerolatency speed-preset=ultrafast bitrate={bitrate} key-int-max={fps} \
         ! h264parse config-interval=-1 \
         ! video/x-h264,stream-format=byte-stream,alignment=au \
         ! appsink name=video emit-signals=true sync=false \
         t. ! queue leaky=downstream max-size-buffers=1 ! videorate \
         ! video/x-raw,framerate=2/1 ! jpegenc \
         ! appsink name=still sync=false max-buffers=1 drop=true",
        source = config.source_element,
        width = config.width,
        height = config.height,
        fps = config.framerate,
        bitrate = config.bitrate_kbps,
    )
}

/// Build the microphone pipeline description.
pub fn microphone_pipeline_string(config: &AudioConfig) -> String {
    format!(
        "{source} ! audioconvert ! audioresample \
         ! audio/x-raw,format=S16LE,layout=interleaved,rate={rate},channels={channels} \
         ! appsink name=sink sync=false max-buffers=50",
        source = config.source_element,
        rate = config.sample_rate,
        channels = config.channels,
    )
}

fn launch(description: &str) -> Result<gst::Pipeline, String> {
    gst::parse::launch(description)
        .map_err(|e| e.to_string())?
        .downcast::<gst::Pipeline>()
        .map_err(|_| "Failed to cast to Pipeline".to_string())
}

fn app_sink(pipeline: &gst::Pipeline, name: &str) -> Result<gst_app::AppSink, String> {
    pipeline
        .by_name(name)
        .ok_or_else(|| format!("appsink '{name}' not found"))?
        .downcast::<gst_app::AppSink>()
        .map_err(|_| format!("'{name}' is not an appsink"))
}

fn start_pipeline(pipeline: &gst::Pipeline) -> Result<(), String> {
    pipeline
        .set_state(gst::State::Playing)
        .map_err(|e| e.to_string())?;
    let (result, _state, _pending) =
        pipeline.state(gst::ClockTime::from_seconds(STATE_CHANGE_TIMEOUT_SECS));
    if result.is_err() {
        let _ = pipeline.set_state(gst::State::Null);
        return Err("Timeout waiting for pipeline to start".to_string());
    }
    Ok(())
}

/// Watch the bus and clear `alive` on error or end of stream.
fn spawn_bus_monitor(pipeline: &gst::Pipeline, alive: Arc<AtomicBool>, running: Arc<AtomicBool>) {
    let Some(bus) = pipeline.bus() else {
        return;
    };

    let spawned = std::thread::Builder::new()
        .name("gst-bus".to_string())
        .spawn(move || {
            while running.load(Ordering::SeqCst) {
                let Some(msg) = bus.timed_pop(gst::ClockTime::from_mseconds(100)) else {
                    continue;
                };
                match msg.view() {
                    gst::MessageView::Error(err) => {
                        error!(
                            error = %err.error(),
                            debug = ?err.debug(),
                            "GStreamer pipeline error"
                        );
                        alive.store(false, Ordering::SeqCst);
                        break;
                    }
                    gst::MessageView::Eos(_) => {
                        info!("End of stream");
                        alive.store(false, Ordering::SeqCst);
                        break;
                    }
                    gst::MessageView::Warning(w) => {
                        warn!(warning = %w.error(), "GStreamer warning");
                    }
                    _ => {}
                }
            }
        });

    if let Err(e) = spawned {
        warn!(error = %e, "Failed to spawn bus monitor");
    }
}

/// JPEG tap on the camera pipeline.
pub struct GstStills {
    sink: gst_app::AppSink,
    alive: Arc<AtomicBool>,
    timeout: Duration,
}

impl StillSource for GstStills {
    fn grab_still(&mut self) -> Result<Bytes, CaptureError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(CaptureError::DeviceUnavailable("camera pipeline stopped".to_string()));
        }
        let timeout = gst::ClockTime::from_mseconds(self.timeout.as_millis() as u64);
        let sample = self.sink.try_pull_sample(timeout).ok_or_else(|| {
            CaptureError::DeviceUnavailable("no still frame before timeout".to_string())
        })?;
        let buffer = sample
            .buffer()
            .ok_or_else(|| CaptureError::DeviceUnavailable("still sample without buffer".to_string()))?;
        let map = buffer
            .map_readable()
            .map_err(|_| CaptureError::DeviceUnavailable("still buffer not readable".to_string()))?;
        Ok(Bytes::copy_from_slice(map.as_slice()))
    }
}

/// Camera driven by a GStreamer pipeline.
pub struct GstCamera {
    config: CameraConfig,
    pipeline: Option<gst::Pipeline>,
    still_sink: Option<gst_app::AppSink>,
    slot: SinkSlot,
    alive: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    access_units: Arc<AtomicU64>,
}

impl GstCamera {
    pub fn new(config: &CameraConfig) -> Result<Self, CaptureError> {
        init().map_err(|e| CaptureError::DeviceUnavailable(format!("GStreamer init failed: {e}")))?;
        Ok(Self {
            config: config.clone(),
            pipeline: None,
            still_sink: None,
            slot: SinkSlot::new(),
            alive: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
            access_units: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn access_units(&self) -> u64 {
        self.access_units.load(Ordering::Relaxed)
    }

    fn configure_video_sink(&self, sink: &gst_app::AppSink) {
        let slot = self.slot.clone();
        let running = self.running.clone();
        let counter = self.access_units.clone();

        sink.set_callbacks(
            gst_app::AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    if !running.load(Ordering::SeqCst) {
                        return Err(gst::FlowError::Eos);
                    }
                    let sample = sink.pull_sample().map_err(|_| gst::FlowError::Error)?;
                    let buffer = sample.buffer().ok_or(gst::FlowError::Error)?;
                    let map = buffer.map_readable().map_err(|_| gst::FlowError::Error)?;
                    let pts = buffer
                        .pts()
                        .map(|t| Duration::from_nanos(t.nseconds()))
                        .unwrap_or_default();

                    let frame = VideoFrame::from_annex_b(Bytes::copy_from_slice(map.as_slice()), pts);
                    slot.deliver(&frame);
                    counter.fetch_add(1, Ordering::Relaxed);
                    Ok(gst::FlowSuccess::Ok)
                })
                .build(),
        );
    }

    fn install(&mut self, sink: Option<Box<dyn FrameSink>>) -> Result<(), CaptureError> {
        self.slot.replace(sink)
    }
}

impl CaptureSource for GstCamera {
    fn open(&mut self) -> Result<(), CaptureError> {
        if self.pipeline.is_some() && self.alive.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.close();

        let description = camera_pipeline_string(&self.config);
        debug!(pipeline = %description, "Creating camera pipeline");
        let pipeline = launch(&description).map_err(CaptureError::DeviceUnavailable)?;
        let video_sink = app_sink(&pipeline, "video").map_err(CaptureError::DeviceUnavailable)?;
        let still_sink = app_sink(&pipeline, "still").map_err(CaptureError::DeviceUnavailable)?;

        self.running.store(true, Ordering::SeqCst);
        self.configure_video_sink(&video_sink);
        if let Err(e) = start_pipeline(&pipeline) {
            self.running.store(false, Ordering::SeqCst);
            return Err(CaptureError::DeviceUnavailable(e));
        }

        self.alive.store(true, Ordering::SeqCst);
        spawn_bus_monitor(&pipeline, self.alive.clone(), self.running.clone());
        self.pipeline = Some(pipeline);
        self.still_sink = Some(still_sink);
        info!(source = %self.config.source_element, "Camera pipeline started");
        Ok(())
    }

    fn is_available(&self) -> bool {
        self.pipeline.is_some() && self.alive.load(Ordering::SeqCst)
    }

    fn capture_still_frame(&mut self) -> Result<Bytes, CaptureError> {
        self.still_source()
            .ok_or_else(|| CaptureError::DeviceUnavailable("camera not open".to_string()))?
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
        self.still_sink.as_ref().map(|sink| {
            Box::new(GstStills {
                sink: sink.clone(),
                alive: self.alive.clone(),
                timeout: self.config.still_timeout(),
            }) as Box<dyn StillSource>
        })
    }

    fn close(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.alive.store(false, Ordering::SeqCst);
        self.still_sink = None;
        if let Some(pipeline) = self.pipeline.take() {
            let _ = pipeline.set_state(gst::State::Null);
            info!("Camera pipeline stopped");
        }
    }
}

impl Drop for GstCamera {
    fn drop(&mut self) {
        self.close();
    }
}

/// Microphone driven by a GStreamer pipeline.
#[derive(Debug, Clone)]
pub struct GstMicrophone {
    config: AudioConfig,
}

impl GstMicrophone {
    pub fn new(config: &AudioConfig) -> Result<Self, AudioError> {
        init().map_err(|e| AudioError::Device(format!("GStreamer init failed: {e}")))?;
        Ok(Self {
            config: config.clone(),
        })
    }
}

impl AudioInput for GstMicrophone {
    fn open(&self) -> Result<Box<dyn AudioStream>, AudioError> {
        let description = microphone_pipeline_string(&self.config);
        debug!(pipeline = %description, "Creating microphone pipeline");
        let pipeline = launch(&description).map_err(AudioError::Device)?;
        let sink = app_sink(&pipeline, "sink").map_err(AudioError::Device)?;
        start_pipeline(&pipeline).map_err(AudioError::Device)?;

        Ok(Box::new(GstAudioStream {
            pipeline,
            sink,
            format: AudioFormat {
                sample_rate: self.config.sample_rate,
                channels: self.config.channels,
            },
            pending: Vec::new(),
        }))
    }
}

struct GstAudioStream {
    pipeline: gst::Pipeline,
    sink: gst_app::AppSink,
    format: AudioFormat,
    pending: Vec<i16>,
}

impl AudioStream for GstAudioStream {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn read(&mut self, buf: &mut [i16]) -> Result<usize, AudioError> {
        if self.pending.is_empty() {
            match self.sink.try_pull_sample(gst::ClockTime::from_mseconds(100)) {
                Some(sample) => {
                    let buffer = sample
                        .buffer()
                        .ok_or_else(|| AudioError::Device("sample without buffer".to_string()))?;
                    let map = buffer
                        .map_readable()
                        .map_err(|_| AudioError::Device("buffer not readable".to_string()))?;
                    self.pending.extend(
                        map.as_slice()
                            .chunks_exact(2)
                            .map(|b| i16::from_le_bytes([b[0], b[1]])),
                    );
                }
                None if self.sink.is_eos() => {
                    return Err(AudioError::Device("microphone stream ended".to_string()));
                }
                None => return Ok(0),
            }
        }

        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

impl Drop for GstAudioStream {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}
