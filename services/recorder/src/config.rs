//! Configuration management for the recorder service.
//!
//! This module handles loading and validating configuration from environment
//! variables and configuration files.

use crate::clock::WallClock;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the recorder service.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecorderConfig {
    /// Camera and rolling buffer configuration
    #[serde(default)]
    pub camera: CameraConfig,

    /// Motion signal configuration
    #[serde(default)]
    pub motion: MotionConfig,

    /// Alert lifecycle timing
    #[serde(default)]
    pub alert: AlertConfig,

    /// Daily check-in notification
    #[serde(default)]
    pub checkin: CheckInConfig,

    /// Session storage layout
    #[serde(default)]
    pub storage: StorageConfig,

    /// Audio sidecar configuration
    #[serde(default)]
    pub audio: AudioConfig,

    /// Notification delivery
    #[serde(default)]
    pub notifier: NotifierConfig,

    /// Wall-clock time zone for directory names and the check-in hour
    #[serde(default)]
    pub clock: ClockConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Capture backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureBackend {
    /// Built-in generator, no hardware required
    #[default]
    Synthetic,
    /// GStreamer pipeline (requires the `gstreamer` feature)
    Gstreamer,
}

/// Camera configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    #[serde(default)]
    pub backend: CaptureBackend,

    /// GStreamer source element, e.g. "v4l2src device=/dev/video0" or "libcamerasrc"
    #[serde(default = "default_video_source_element")]
    pub source_element: String,

    #[serde(default = "default_width")]
    pub width: u32,

    #[serde(default = "default_height")]
    pub height: u32,

    /// Frames per second
    #[serde(default = "default_framerate")]
    pub framerate: u32,

    /// Encoder bitrate in kbit/s
    #[serde(default = "default_bitrate_kbps")]
    pub bitrate_kbps: u32,

    /// Seconds of video retained in the rolling buffer
    #[serde(default = "default_buffer_seconds")]
    pub buffer_seconds: u64,

    /// Upper bound on rolling buffer size in bytes (0 = duration only)
    #[serde(default)]
    pub buffer_max_bytes: usize,

    /// Settle time after the device opens before motion is accepted
    #[serde(default = "default_warmup_secs")]
    pub warmup_secs: u64,

    /// Maximum number of open attempts at startup (0 = infinite)
    #[serde(default = "default_max_open_attempts")]
    pub max_open_attempts: u32,

    /// Base delay between open attempts in milliseconds
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,

    /// Maximum delay between open attempts in milliseconds
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,

    /// How long to wait for a still frame before declaring the device gone
    #[serde(default = "default_still_timeout_ms")]
    pub still_timeout_ms: u64,
}

/// Motion signal source selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotionSourceKind {
    /// Passive infrared sensor on a GPIO pin
    #[default]
    Gpio,
    /// Pixel difference between consecutive stills
    FrameDiff,
    /// SIGUSR1 raises a motion event
    Signal,
}

/// Motion signal configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MotionConfig {
    #[serde(default)]
    pub source: MotionSourceKind,

    /// Capacity of the motion event queue
    #[serde(default = "default_motion_queue_size")]
    pub queue_size: usize,

    /// GPIO pin number (BCM numbering)
    #[serde(default = "default_gpio_pin")]
    pub gpio_pin: u32,

    /// Root of the sysfs GPIO tree
    #[serde(default = "default_gpio_root")]
    pub gpio_root: PathBuf,

    /// Settle time after exporting the pin before edges are trusted
    #[serde(default = "default_settle_secs")]
    pub settle_secs: u64,

    /// Interval between frame-difference samples in milliseconds
    #[serde(default = "default_frame_diff_interval_ms")]
    pub frame_diff_interval_ms: u64,

    /// Minimum green-channel difference for a pixel to count as changed
    #[serde(default = "default_pixel_threshold")]
    pub pixel_threshold: u8,

    /// Number of changed pixels above which motion is reported
    #[serde(default = "default_changed_pixels")]
    pub changed_pixels: u32,

    /// Sample size the stills are reduced to before comparison
    #[serde(default = "default_sample_width")]
    pub sample_width: u32,

    #[serde(default = "default_sample_height")]
    pub sample_height: u32,
}

/// Alert lifecycle timing.
#[derive(Debug, Clone, Deserialize)]
pub struct AlertConfig {
    /// Seconds without motion before an alert ends
    #[serde(default = "default_quiet_threshold_secs")]
    pub quiet_threshold_secs: u64,

    /// Interval of the periodic quiet/check-in poll
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

/// Daily check-in configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckInConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Local hour (0-23) during which the check-in fires
    #[serde(default = "default_checkin_hour")]
    pub hour: u32,
}

/// Session storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Root directory for alert sessions
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,

    /// Container extension for video artifacts
    #[serde(default = "default_video_extension")]
    pub video_extension: String,

    /// Chunk size used when splicing pre-roll and post-roll
    #[serde(default = "default_splice_chunk_bytes")]
    pub splice_chunk_bytes: usize,
}

/// Audio sidecar configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AudioConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub backend: CaptureBackend,

    /// GStreamer source element, e.g. "alsasrc device=hw:1"
    #[serde(default = "default_audio_source_element")]
    pub source_element: String,

    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    #[serde(default = "default_channels")]
    pub channels: u16,

    /// Duration of one read from the microphone in milliseconds
    #[serde(default = "default_read_chunk_ms")]
    pub read_chunk_ms: u32,

    /// How often the WAV header is rewritten with current sizes
    #[serde(default = "default_header_refresh_ms")]
    pub header_refresh_ms: u64,
}

/// Notification delivery backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifierKind {
    /// Write notifications to the log only
    #[default]
    Log,
    /// HTTP multipart POST
    Webhook,
    /// SMTP with STARTTLS
    Email,
}

/// Notification configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct NotifierConfig {
    #[serde(default)]
    pub kind: NotifierKind,

    /// Endpoint for the webhook notifier
    #[serde(default)]
    pub webhook_url: Option<String>,

    /// Request timeout in seconds
    #[serde(default = "default_notify_timeout_secs")]
    pub timeout_secs: u64,

    /// SMTP relay for the email notifier
    #[serde(default)]
    pub smtp_host: Option<String>,

    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,

    #[serde(default)]
    pub smtp_username: Option<String>,

    #[serde(default)]
    pub smtp_password: Option<String>,

    /// Sender mailbox, e.g. "Vigil <vigil@example.com>"
    #[serde(default)]
    pub email_from: Option<String>,

    #[serde(default)]
    pub recipients: Vec<String>,

    #[serde(default = "default_activated_subject")]
    pub activated_subject: String,

    #[serde(default = "default_deactivated_subject")]
    pub deactivated_subject: String,

    #[serde(default = "default_checkin_subject")]
    pub checkin_subject: String,

    #[serde(default = "default_fault_subject")]
    pub fault_subject: String,
}

/// Wall-clock configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClockConfig {
    /// IANA zone name, e.g. "America/New_York". The system zone when unset.
    #[serde(default)]
    pub timezone: Option<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_true() -> bool {
    true
}
fn default_video_source_element() -> String {
    "v4l2src device=/dev/video0".to_string()
}
fn default_width() -> u32 {
    1280
}
fn default_height() -> u32 {
    720
}
fn default_framerate() -> u32 {
    30
}
fn default_bitrate_kbps() -> u32 {
    4000
}
fn default_buffer_seconds() -> u64 {
    5
}
fn default_warmup_secs() -> u64 {
    2
}
fn default_max_open_attempts() -> u32 {
    0
}
fn default_reconnect_base_delay_ms() -> u64 {
    1000
}
fn default_reconnect_max_delay_ms() -> u64 {
    30000
}
fn default_still_timeout_ms() -> u64 {
    2000
}
fn default_motion_queue_size() -> usize {
    32
}
fn default_gpio_pin() -> u32 {
    7
}
fn default_gpio_root() -> PathBuf {
    PathBuf::from("/sys/class/gpio")
}
fn default_settle_secs() -> u64 {
    2
}
fn default_frame_diff_interval_ms() -> u64 {
    2000
}
fn default_pixel_threshold() -> u8 {
    10
}
fn default_changed_pixels() -> u32 {
    20
}
fn default_sample_width() -> u32 {
    100
}
fn default_sample_height() -> u32 {
    75
}
fn default_quiet_threshold_secs() -> u64 {
    30
}
fn default_poll_interval_secs() -> u64 {
    15
}
fn default_checkin_hour() -> u32 {
    12
}
fn default_root_dir() -> PathBuf {
    PathBuf::from("/var/lib/vigil/alerts")
}
fn default_video_extension() -> String {
    "h264".to_string()
}
fn default_splice_chunk_bytes() -> usize {
    64 * 1024
}
fn default_audio_source_element() -> String {
    "autoaudiosrc".to_string()
}
fn default_sample_rate() -> u32 {
    16000
}
fn default_channels() -> u16 {
    1
}
fn default_read_chunk_ms() -> u32 {
    20
}
fn default_header_refresh_ms() -> u64 {
    1000
}
fn default_smtp_port() -> u16 {
    587
}
fn default_notify_timeout_secs() -> u64 {
    10
}
fn default_activated_subject() -> String {
    "Alert Activated".to_string()
}
fn default_deactivated_subject() -> String {
    "Alert Deactivated".to_string()
}
fn default_checkin_subject() -> String {
    "Checking In".to_string()
}
fn default_fault_subject() -> String {
    "Alert Fault".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            backend: CaptureBackend::default(),
            source_element: default_video_source_element(),
            width: default_width(),
            height: default_height(),
            framerate: default_framerate(),
            bitrate_kbps: default_bitrate_kbps(),
            buffer_seconds: default_buffer_seconds(),
            buffer_max_bytes: 0,
            warmup_secs: default_warmup_secs(),
            max_open_attempts: default_max_open_attempts(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            still_timeout_ms: default_still_timeout_ms(),
        }
    }
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            source: MotionSourceKind::default(),
            queue_size: default_motion_queue_size(),
            gpio_pin: default_gpio_pin(),
            gpio_root: default_gpio_root(),
            settle_secs: default_settle_secs(),
            frame_diff_interval_ms: default_frame_diff_interval_ms(),
            pixel_threshold: default_pixel_threshold(),
            changed_pixels: default_changed_pixels(),
            sample_width: default_sample_width(),
            sample_height: default_sample_height(),
        }
    }
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            quiet_threshold_secs: default_quiet_threshold_secs(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

impl Default for CheckInConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            hour: default_checkin_hour(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            video_extension: default_video_extension(),
            splice_chunk_bytes: default_splice_chunk_bytes(),
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            backend: CaptureBackend::default(),
            source_element: default_audio_source_element(),
            sample_rate: default_sample_rate(),
            channels: default_channels(),
            read_chunk_ms: default_read_chunk_ms(),
            header_refresh_ms: default_header_refresh_ms(),
        }
    }
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            kind: NotifierKind::default(),
            webhook_url: None,
            smtp_host: None,
            smtp_port: default_smtp_port(),
            smtp_username: None,
            smtp_password: None,
            email_from: None,
            recipients: Vec::new(),
            timeout_secs: default_notify_timeout_secs(),
            activated_subject: default_activated_subject(),
            deactivated_subject: default_deactivated_subject(),
            checkin_subject: default_checkin_subject(),
            fault_subject: default_fault_subject(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl RecorderConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default config file (config/default.toml)
    /// 2. Environment-specific config (config/{env}.toml)
    /// 3. Environment variables (prefixed with VIGIL_)
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // e.g. VIGIL_ALERT__QUIET_THRESHOLD_SECS=60
            .add_source(
                Environment::with_prefix("VIGIL")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Create configuration from environment variables only.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(
                Environment::with_prefix("VIGIL")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.camera.framerate == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "camera.framerate".to_string(),
                message: "Framerate must be greater than 0".to_string(),
            });
        }

        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "camera.width/height".to_string(),
                message: "Dimensions must be greater than 0".to_string(),
            });
        }

        if self.camera.buffer_seconds == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "camera.buffer_seconds".to_string(),
                message: "Rolling buffer must hold at least one second".to_string(),
            });
        }

        if self.alert.poll_interval_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "alert.poll_interval_secs".to_string(),
                message: "Poll interval must be greater than 0".to_string(),
            });
        }

        if self.alert.quiet_threshold_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "alert.quiet_threshold_secs".to_string(),
                message: "Quiet threshold must be greater than 0".to_string(),
            });
        }

        if self.checkin.hour > 23 {
            return Err(ConfigValidationError::InvalidValue {
                field: "checkin.hour".to_string(),
                message: "Hour must be between 0 and 23".to_string(),
            });
        }

        if self.motion.queue_size == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "motion.queue_size".to_string(),
                message: "Queue size must be greater than 0".to_string(),
            });
        }

        if self.motion.source == MotionSourceKind::FrameDiff
            && (self.motion.sample_width == 0 || self.motion.sample_height == 0)
        {
            return Err(ConfigValidationError::InvalidValue {
                field: "motion.sample_width/height".to_string(),
                message: "Sample dimensions must be greater than 0".to_string(),
            });
        }

        if self.storage.root_dir.as_os_str().is_empty() {
            return Err(ConfigValidationError::MissingField(
                "storage.root_dir".to_string(),
            ));
        }

        if self.storage.video_extension.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "storage.video_extension".to_string(),
            ));
        }

        if self.storage.splice_chunk_bytes == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "storage.splice_chunk_bytes".to_string(),
                message: "Chunk size must be greater than 0".to_string(),
            });
        }

        if self.audio.enabled {
            if self.audio.sample_rate == 0 {
                return Err(ConfigValidationError::InvalidValue {
                    field: "audio.sample_rate".to_string(),
                    message: "Sample rate must be greater than 0".to_string(),
                });
            }
            if !(1..=2).contains(&self.audio.channels) {
                return Err(ConfigValidationError::InvalidValue {
                    field: "audio.channels".to_string(),
                    message: "Only mono and stereo are supported".to_string(),
                });
            }
            if self.audio.read_chunk_ms == 0 {
                return Err(ConfigValidationError::InvalidValue {
                    field: "audio.read_chunk_ms".to_string(),
                    message: "Read chunk must be greater than 0".to_string(),
                });
            }
        }

        if self.notifier.kind == NotifierKind::Webhook {
            match self.notifier.webhook_url.as_deref() {
                None | Some("") => {
                    return Err(ConfigValidationError::MissingField(
                        "notifier.webhook_url".to_string(),
                    ));
                }
                Some(url) if !url.starts_with("http://") && !url.starts_with("https://") => {
                    return Err(ConfigValidationError::InvalidValue {
                        field: "notifier.webhook_url".to_string(),
                        message: "URL must start with http:// or https://".to_string(),
                    });
                }
                Some(_) => {}
            }
        }

        if self.notifier.kind == NotifierKind::Email {
            if self.notifier.smtp_host.as_deref().map_or(true, str::is_empty) {
                return Err(ConfigValidationError::MissingField(
                    "notifier.smtp_host".to_string(),
                ));
            }
            if self.notifier.email_from.as_deref().map_or(true, str::is_empty) {
                return Err(ConfigValidationError::MissingField(
                    "notifier.email_from".to_string(),
                ));
            }
            if self.notifier.recipients.is_empty() {
                return Err(ConfigValidationError::MissingField(
                    "notifier.recipients".to_string(),
                ));
            }
            if self.notifier.smtp_username.is_some() != self.notifier.smtp_password.is_some() {
                return Err(ConfigValidationError::InvalidValue {
                    field: "notifier.smtp_username/smtp_password".to_string(),
                    message: "Username and password must be set together".to_string(),
                });
            }
        }

        self.clock.wall_clock()?;

        Ok(())
    }
}

impl ClockConfig {
    /// Resolve the configured zone.
    pub fn wall_clock(&self) -> Result<WallClock, ConfigValidationError> {
        match self.timezone.as_deref() {
            None | Some("") => Ok(WallClock::System),
            Some(name) => WallClock::named(name).map_err(|message| {
                ConfigValidationError::InvalidValue {
                    field: "clock.timezone".to_string(),
                    message,
                }
            }),
        }
    }
}

impl CameraConfig {
    /// Retention window of the rolling buffer.
    pub fn buffer_window(&self) -> Duration {
        Duration::from_secs(self.buffer_seconds)
    }

    pub fn warmup(&self) -> Duration {
        Duration::from_secs(self.warmup_secs)
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }

    pub fn still_timeout(&self) -> Duration {
        Duration::from_millis(self.still_timeout_ms)
    }
}

impl MotionConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_secs(self.settle_secs)
    }

    pub fn frame_diff_interval(&self) -> Duration {
        Duration::from_millis(self.frame_diff_interval_ms)
    }
}

impl AlertConfig {
    pub fn quiet_threshold(&self) -> Duration {
        Duration::from_secs(self.quiet_threshold_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

impl AudioConfig {
    pub fn header_refresh(&self) -> Duration {
        Duration::from_millis(self.header_refresh_ms)
    }

    /// Interleaved samples in one read chunk.
    pub fn chunk_samples(&self) -> usize {
        (self.sample_rate as usize * self.read_chunk_ms as usize / 1000) * self.channels as usize
    }
}

impl NotifierConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
