//! Motion signal sources.
//!
//! Every sensor runs on its own task and reports through a bounded channel.
//! When the controller falls behind, extra events are dropped and counted;
//! one queued event is as good as many, since motion only refreshes an
//! active alert.

use crate::capture::{CaptureError, StillSource};
use crate::config::MotionConfig;
use image::imageops::FilterType;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Errors that can occur in motion sensors.
#[derive(Debug, Error)]
pub enum MotionError {
    #[error("GPIO error on {path}: {source}")]
    Gpio {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to install signal handler: {0}")]
    Signal(#[source] io::Error),

    #[error("Still capture failed: {0}")]
    Still(#[from] CaptureError),

    #[error("Failed to decode still: {0}")]
    Decode(#[from] image::ImageError),

    #[error("Sensor task failed: {0}")]
    Task(String),
}

/// A single motion detection.
#[derive(Debug, Clone, Copy)]
pub struct MotionEvent {
    pub at: Instant,
    /// Name of the sensor that raised the event
    pub sensor: &'static str,
}

/// Sending half of the motion channel.
#[derive(Debug, Clone)]
pub struct MotionTrigger {
    tx: mpsc::Sender<MotionEvent>,
    dropped: Arc<AtomicU64>,
}

impl MotionTrigger {
    /// Queue a motion event without blocking. Returns false if the event was
    /// dropped.
    pub fn fire(&self, sensor: &'static str) -> bool {
        let event = MotionEvent {
            at: Instant::now(),
            sensor,
        };
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Events dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Create the bounded motion channel.
pub fn motion_channel(capacity: usize) -> (MotionTrigger, mpsc::Receiver<MotionEvent>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        MotionTrigger {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        },
        rx,
    )
}

/// Something that detects motion.
pub trait MotionSensor: Send {
    fn name(&self) -> &'static str;

    /// Run the sensor until `cancel` fires.
    fn start(
        self: Box<Self>,
        trigger: MotionTrigger,
        cancel: CancellationToken,
    ) -> JoinHandle<Result<(), MotionError>>;
}

// ---------------------------------------------------------------------------
// GPIO passive infrared sensor
// ---------------------------------------------------------------------------

const GPIO_POLL_TIMEOUT_MS: i32 = 500;
const GPIO_EXPORT_WAIT: Duration = Duration::from_secs(1);

/// A sysfs GPIO input configured for rising-edge interrupts.
pub struct GpioPin {
    root: PathBuf,
    pin: u32,
    value: File,
    exported_here: bool,
}

impl GpioPin {
    /// Export `pin` under `root` (normally `/sys/class/gpio`) as an input
    /// that interrupts on rising edges.
    pub fn export(root: &Path, pin: u32) -> Result<Self, MotionError> {
        let pin_dir = root.join(format!("gpio{pin}"));
        let mut exported_here = false;

        if !pin_dir.exists() {
            write_attr(&root.join("export"), &pin.to_string())?;
            exported_here = true;

            let deadline = std::time::Instant::now() + GPIO_EXPORT_WAIT;
            while !pin_dir.exists() {
                if std::time::Instant::now() >= deadline {
                    return Err(MotionError::Gpio {
                        path: pin_dir,
                        source: io::Error::new(io::ErrorKind::TimedOut, "pin was not exported"),
                    });
                }
                std::thread::sleep(Duration::from_millis(50));
            }
        }

        write_attr(&pin_dir.join("direction"), "in")?;
        write_attr(&pin_dir.join("edge"), "rising")?;

        let value_path = pin_dir.join("value");
        let value = File::open(&value_path).map_err(|source| MotionError::Gpio {
            path: value_path,
            source,
        })?;

        info!(pin = pin, "GPIO pin exported for rising-edge interrupts");
        Ok(Self {
            root: root.to_path_buf(),
            pin,
            value,
            exported_here,
        })
    }

    /// Current logic level.
    pub fn read_level(&mut self) -> io::Result<bool> {
        let mut buf = [0u8; 2];
        self.value.seek(SeekFrom::Start(0))?;
        let n = self.value.read(&mut buf)?;
        Ok(n > 0 && buf[0] == b'1')
    }

    /// Wait up to `timeout_ms` for an edge. Returns true if one occurred.
    #[cfg(unix)]
    fn wait_edge(&mut self, timeout_ms: i32) -> io::Result<bool> {
        use std::os::unix::io::AsRawFd;

        let mut pollfd = libc::pollfd {
            fd: self.value.as_raw_fd(),
            events: libc::POLLPRI | libc::POLLERR,
            revents: 0,
        };
        let result = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
        if result < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(err);
        }
        if result == 0 {
            return Ok(false);
        }
        // Reading the value acknowledges the interrupt.
        self.read_level()?;
        Ok(pollfd.revents & libc::POLLPRI != 0)
    }

    #[cfg(not(unix))]
    fn wait_edge(&mut self, timeout_ms: i32) -> io::Result<bool> {
        std::thread::sleep(Duration::from_millis(timeout_ms as u64));
        Ok(false)
    }
}

impl Drop for GpioPin {
    fn drop(&mut self) {
        if self.exported_here {
            if let Err(e) = write_attr(&self.root.join("unexport"), &self.pin.to_string()) {
                debug!(pin = self.pin, error = %e, "Failed to unexport GPIO pin");
            }
        }
    }
}

fn write_attr(path: &Path, value: &str) -> Result<(), MotionError> {
    let gpio_err = |source| MotionError::Gpio {
        path: path.to_path_buf(),
        source,
    };
    let mut file = OpenOptions::new().write(true).open(path).map_err(gpio_err)?;
    file.write_all(value.as_bytes()).map_err(gpio_err)
}

/// PIR sensor wired to a GPIO pin.
pub struct GpioPirSensor {
    root: PathBuf,
    pin: u32,
    settle: Duration,
}

impl GpioPirSensor {
    pub fn new(config: &MotionConfig) -> Self {
        Self {
            root: config.gpio_root.clone(),
            pin: config.gpio_pin,
            settle: config.settle(),
        }
    }
}

impl MotionSensor for GpioPirSensor {
    fn name(&self) -> &'static str {
        "gpio"
    }

    fn start(
        self: Box<Self>,
        trigger: MotionTrigger,
        cancel: CancellationToken,
    ) -> JoinHandle<Result<(), MotionError>> {
        tokio::task::spawn_blocking(move || {
            let mut pin = GpioPin::export(&self.root, self.pin)?;

            // PIR modules report garbage while they power up.
            let settled_at = std::time::Instant::now() + self.settle;
            while std::time::Instant::now() < settled_at {
                if cancel.is_cancelled() {
                    return Ok(());
                }
                std::thread::sleep(Duration::from_millis(100));
            }

            let value_path = self.root.join(format!("gpio{}", self.pin)).join("value");
            pin.read_level().map_err(|source| MotionError::Gpio {
                path: value_path.clone(),
                source,
            })?;
            info!(pin = self.pin, "PIR sensor armed");

            while !cancel.is_cancelled() {
                match pin.wait_edge(GPIO_POLL_TIMEOUT_MS) {
                    Ok(true) => {
                        debug!(pin = self.pin, "PIR rising edge");
                        trigger.fire("gpio");
                    }
                    Ok(false) => {}
                    Err(source) => {
                        error!(pin = self.pin, error = %source, "GPIO poll failed");
                        return Err(MotionError::Gpio {
                            path: value_path,
                            source,
                        });
                    }
                }
            }
            Ok(())
        })
    }
}

// ---------------------------------------------------------------------------
// Frame difference
// ---------------------------------------------------------------------------

/// Compares consecutive downscaled green channels.
#[derive(Debug, Clone)]
pub struct FrameDiffDetector {
    previous: Option<Vec<u8>>,
    pixel_threshold: u8,
    changed_pixels: u32,
}

impl FrameDiffDetector {
    pub fn new(pixel_threshold: u8, changed_pixels: u32) -> Self {
        Self {
            previous: None,
            pixel_threshold,
            changed_pixels,
        }
    }

    /// Feed the next sample. Returns true if it differs enough from the
    /// previous one. The first sample never reports motion.
    pub fn observe(&mut self, sample: Vec<u8>) -> bool {
        let motion = match &self.previous {
            Some(previous) if previous.len() == sample.len() => {
                count_changed(previous, &sample, self.pixel_threshold) > self.changed_pixels
            }
            _ => false,
        };
        self.previous = Some(sample);
        motion
    }
}

fn count_changed(a: &[u8], b: &[u8], threshold: u8) -> u32 {
    a.iter()
        .zip(b)
        .filter(|(x, y)| x.abs_diff(**y) > threshold)
        .count() as u32
}

/// Decode a JPEG still and reduce it to the green channel at `width`x`height`.
pub fn green_channel_sample(jpeg: &[u8], width: u32, height: u32) -> Result<Vec<u8>, MotionError> {
    let image = image::load_from_memory(jpeg)?;
    let small = image.resize_exact(width, height, FilterType::Triangle).to_rgb8();
    Ok(small.pixels().map(|p| p[1]).collect())
}

/// Pixel-difference motion detection on periodic stills.
pub struct FrameDiffSensor {
    source: Box<dyn StillSource>,
    interval: Duration,
    detector: FrameDiffDetector,
    sample_width: u32,
    sample_height: u32,
}

impl FrameDiffSensor {
    pub fn new(source: Box<dyn StillSource>, config: &MotionConfig) -> Self {
        Self {
            source,
            interval: config.frame_diff_interval(),
            detector: FrameDiffDetector::new(config.pixel_threshold, config.changed_pixels),
            sample_width: config.sample_width,
            sample_height: config.sample_height,
        }
    }
}

impl MotionSensor for FrameDiffSensor {
    fn name(&self) -> &'static str {
        "frame_diff"
    }

    fn start(
        self: Box<Self>,
        trigger: MotionTrigger,
        cancel: CancellationToken,
    ) -> JoinHandle<Result<(), MotionError>> {
        let FrameDiffSensor {
            mut source,
            interval,
            mut detector,
            sample_width,
            sample_height,
        } = *self;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut consecutive_failures = 0u32;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let (returned, sample) = tokio::task::spawn_blocking(move || {
                    let sample = source
                        .grab_still()
                        .map_err(MotionError::from)
                        .and_then(|jpeg| green_channel_sample(&jpeg, sample_width, sample_height));
                    (source, sample)
                })
                .await
                .map_err(|e| MotionError::Task(e.to_string()))?;
                source = returned;

                match sample {
                    Ok(green) => {
                        consecutive_failures = 0;
                        if detector.observe(green) {
                            debug!("Frame difference above threshold");
                            trigger.fire("frame_diff");
                        }
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        if consecutive_failures == 1 || consecutive_failures % 30 == 0 {
                            warn!(
                                error = %e,
                                consecutive_failures = consecutive_failures,
                                "Frame difference sample failed"
                            );
                        }
                    }
                }
            }
            Ok(())
        })
    }
}

// ---------------------------------------------------------------------------
// SIGUSR1
// ---------------------------------------------------------------------------

/// Raises a motion event whenever the process receives SIGUSR1.
#[cfg(unix)]
pub struct SignalSensor {
    signal: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl SignalSensor {
    /// Install the handler. Must be called inside the runtime.
    pub fn new() -> Result<Self, MotionError> {
        use tokio::signal::unix::{signal, SignalKind};
        let signal = signal(SignalKind::user_defined1()).map_err(MotionError::Signal)?;
        Ok(Self { signal })
    }
}

#[cfg(unix)]
impl MotionSensor for SignalSensor {
    fn name(&self) -> &'static str {
        "signal"
    }

    fn start(
        self: Box<Self>,
        trigger: MotionTrigger,
        cancel: CancellationToken,
    ) -> JoinHandle<Result<(), MotionError>> {
        let mut signal = self.signal;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = signal.recv() => {
                        if received.is_none() {
                            break;
                        }
                        debug!("SIGUSR1 received");
                        trigger.fire("signal");
                    }
                }
            }
            Ok(())
        })
    }
}

/// Check that the sysfs GPIO tree is present.
pub fn gpio_available(root: &Path) -> bool {
    fs::metadata(root.join("export")).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use image::codecs::jpeg::JpegEncoder;
    use image::{ExtendedColorType, Rgb, RgbImage};
    use tempfile::tempdir;

    fn create_test_jpeg(green: u8) -> Bytes {
        let image = RgbImage::from_pixel(200, 150, Rgb([0, green, 0]));
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, 90)
            .encode(image.as_raw(), 200, 150, ExtendedColorType::Rgb8)
            .unwrap();
        Bytes::from(out)
    }

    struct AlternatingStills {
        frames: Vec<Bytes>,
        next: usize,
    }

    impl StillSource for AlternatingStills {
        fn grab_still(&mut self) -> Result<Bytes, CaptureError> {
            let frame = self.frames[self.next % self.frames.len()].clone();
            self.next += 1;
            Ok(frame)
        }
    }

    #[tokio::test]
    async fn test_channel_drops_when_full() {
        let (trigger, mut rx) = motion_channel(2);
        assert!(trigger.fire("test"));
        assert!(trigger.fire("test"));
        assert!(!trigger.fire("test"));
        assert_eq!(trigger.dropped(), 1);

        assert_eq!(rx.recv().await.unwrap().sensor, "test");
        assert!(trigger.fire("test"));
    }

    #[test]
    fn test_fire_after_receiver_dropped() {
        let (trigger, rx) = motion_channel(1);
        drop(rx);
        assert!(!trigger.fire("test"));
        assert_eq!(trigger.dropped(), 0);
    }

    #[test]
    fn test_detector_thresholds() {
        let mut detector = FrameDiffDetector::new(10, 20);
        let base = vec![100u8; 7500];
        assert!(!detector.observe(base.clone()));
        assert!(!detector.observe(base.clone()));

        // Exactly 20 changed pixels is not motion.
        let mut twenty = base.clone();
        twenty[..20].iter_mut().for_each(|p| *p = 150);
        assert!(!detector.observe(twenty));

        let mut twenty_one = base.clone();
        twenty_one[..21].iter_mut().for_each(|p| *p = 150);
        detector.observe(base.clone());
        assert!(detector.observe(twenty_one));

        // A difference of exactly the threshold does not count.
        let mut subtle = base.clone();
        subtle.iter_mut().for_each(|p| *p = 110);
        detector.observe(base);
        assert!(!detector.observe(subtle));
    }

    #[test]
    fn test_green_channel_sample() {
        let sample = green_channel_sample(&create_test_jpeg(128), 100, 75).unwrap();
        assert_eq!(sample.len(), 7500);
        assert!(sample.iter().all(|g| g.abs_diff(128) < 8));
    }

    #[test]
    fn test_green_channel_sample_rejects_garbage() {
        let err = green_channel_sample(b"not a jpeg", 100, 75).unwrap_err();
        assert!(matches!(err, MotionError::Decode(_)));
    }

    #[tokio::test]
    async fn test_frame_diff_sensor_reports_change() {
        let source = AlternatingStills {
            frames: vec![create_test_jpeg(20), create_test_jpeg(220)],
            next: 0,
        };
        let config = MotionConfig {
            frame_diff_interval_ms: 10,
            ..Default::default()
        };
        let (trigger, mut rx) = motion_channel(4);
        let cancel = CancellationToken::new();

        let handle = Box::new(FrameDiffSensor::new(Box::new(source), &config))
            .start(trigger, cancel.clone());

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.sensor, "frame_diff");

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[test]
    fn test_gpio_export_configures_existing_pin() {
        let dir = tempdir().unwrap();
        let pin_dir = dir.path().join("gpio7");
        fs::create_dir(&pin_dir).unwrap();
        for attr in ["direction", "edge", "value"] {
            fs::write(pin_dir.join(attr), "").unwrap();
        }
        fs::write(pin_dir.join("value"), "1\n").unwrap();

        let mut pin = GpioPin::export(dir.path(), 7).unwrap();
        assert_eq!(fs::read_to_string(pin_dir.join("direction")).unwrap(), "in");
        assert_eq!(fs::read_to_string(pin_dir.join("edge")).unwrap(), "rising");
        assert!(pin.read_level().unwrap());
    }

    #[test]
    fn test_gpio_export_times_out_without_sysfs() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("export"), "").unwrap();

        let err = GpioPin::export(dir.path(), 7).err().unwrap();
        assert!(matches!(err, MotionError::Gpio { .. }));
        assert!(gpio_available(dir.path()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_signal_sensor_fires_on_sigusr1() {
        let sensor = SignalSensor::new().unwrap();
        let (trigger, mut rx) = motion_channel(4);
        let cancel = CancellationToken::new();
        let handle = Box::new(sensor).start(trigger, cancel.clone());

        unsafe {
            libc::raise(libc::SIGUSR1);
        }

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.sensor, "signal");

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }
}
