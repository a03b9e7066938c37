//! Vigil recorder service.
//!
//! Watches a camera continuously, and on motion records an alert: pre-roll
//! from the rolling buffer, post-roll until the scene is quiet, stills at both
//! ends, optional audio, and operator notifications.
//!
//! # Architecture
//!
//! ```text
//! MotionSensor -> Controller -> AlertStateMachine -> CaptureSession (camera)
//! ```
//!
//! # Configuration
//!
//! Configuration is loaded from:
//! 1. Configuration files (config/default.toml, config/{env}.toml)
//! 2. Environment variables (prefixed with VIGIL_)
//!
//! See `config.rs` for detailed configuration options.

use anyhow::Context;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use vigil_recorder::alert::{AlertSettings, AlertStateMachine};
use vigil_recorder::audio::AudioInput;
use vigil_recorder::capture::{CaptureSession, CaptureSource};
use vigil_recorder::config::{self, CaptureBackend, MotionSourceKind, RecorderConfig};
use vigil_recorder::controller::Controller;
use vigil_recorder::motion::{self, FrameDiffSensor, GpioPirSensor, MotionSensor, MotionTrigger};
use vigil_recorder::notifier;
use vigil_recorder::rolling_buffer::RollingBuffer;
use vigil_recorder::storage::{DatedDirectoryAllocator, StatvfsDiskSpace};
use vigil_recorder::synthetic::{SyntheticCamera, SyntheticMicrophone};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = load_config()?;

    // Initialize logging
    init_logging(&config.logging)?;

    info!(
        service = "vigil-recorder",
        version = env!("CARGO_PKG_VERSION"),
        root = %config.storage.root_dir.display(),
        "Starting recorder"
    );

    config.validate()?;

    match run(config).await {
        Ok(()) => {
            info!("Recorder stopped");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Recorder failed");
            Err(e)
        }
    }
}

/// Load configuration, falling back to the environment alone.
fn load_config() -> anyhow::Result<RecorderConfig> {
    let config = RecorderConfig::load().or_else(|e| {
        warn!(error = %e, "Failed to load config from files, trying environment");
        RecorderConfig::from_env()
    })?;

    Ok(config)
}

/// Initialize the tracing/logging subsystem.
fn init_logging(config: &config::LoggingConfig) -> anyhow::Result<()> {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("vigil_recorder={}", level).parse()?)
        .add_directive("gstreamer=warn".parse()?)
        .add_directive("reqwest=info".parse()?);

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer().pretty()).init();
    }

    Ok(())
}

async fn run(config: RecorderConfig) -> anyhow::Result<()> {
    std::fs::create_dir_all(&config.storage.root_dir).with_context(|| {
        format!(
            "failed to create storage root {}",
            config.storage.root_dir.display()
        )
    })?;

    // Camera
    let camera = build_camera(&config)?;
    let buffer = RollingBuffer::new(
        config.camera.buffer_window(),
        config.camera.buffer_max_bytes,
    );
    let mut session = CaptureSession::new(camera, buffer);
    info!(backend = ?config.camera.backend, "Opening capture device...");
    session
        .open_with_retry(&config.camera)
        .await
        .context("capture device never became available")?;

    // Give the sensor time to settle before the buffer counts as pre-roll.
    tokio::time::sleep(config.camera.warmup()).await;
    let still_source = session.still_source();
    let capture = Arc::new(Mutex::new(session));

    // Notifications and storage
    let notifier = notifier::from_config(&config.notifier).context("invalid notifier configuration")?;
    let allocator = Arc::new(DatedDirectoryAllocator::new(
        &config.storage.root_dir,
        config.storage.video_extension.clone(),
    ));
    let disk = Arc::new(StatvfsDiskSpace::new(&config.storage.root_dir));

    let mut alert = AlertStateMachine::new(
        capture,
        allocator,
        notifier.clone(),
        AlertSettings::from_config(&config),
    );
    if config.audio.enabled {
        alert = alert.with_audio(build_microphone(&config)?);
    }

    // Motion
    let cancel = CancellationToken::new();
    let (trigger, motion_rx) = motion::motion_channel(config.motion.queue_size);
    let sensor = build_sensor(&config, still_source)?;
    info!(sensor = sensor.name(), "Starting motion sensor");
    let sensor_handle = sensor.start(trigger.clone(), cancel.child_token());

    let mut controller = Controller::new(alert, disk, notifier, &config);

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            info!("Initiating graceful shutdown...");
            cancel.cancel();
        }
    });

    controller.run(motion_rx, cancel.clone()).await;

    // Stop the sensor if the loop ended for any other reason.
    cancel.cancel();
    match sensor_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "Motion sensor stopped with error"),
        Err(e) => warn!(error = %e, "Motion sensor task failed"),
    }

    log_final_stats(&controller, &trigger);

    info!("Shutdown complete");
    Ok(())
}

fn build_camera(config: &RecorderConfig) -> anyhow::Result<Box<dyn CaptureSource>> {
    match config.camera.backend {
        CaptureBackend::Synthetic => Ok(Box::new(SyntheticCamera::new(&config.camera))),
        #[cfg(feature = "gstreamer")]
        CaptureBackend::Gstreamer => {
            let camera = vigil_recorder::gst::GstCamera::new(&config.camera)
                .context("failed to initialise GStreamer camera")?;
            Ok(Box::new(camera))
        }
        #[cfg(not(feature = "gstreamer"))]
        CaptureBackend::Gstreamer => {
            anyhow::bail!("camera backend 'gstreamer' requires the gstreamer feature")
        }
    }
}

fn build_microphone(config: &RecorderConfig) -> anyhow::Result<Arc<dyn AudioInput>> {
    match config.audio.backend {
        CaptureBackend::Synthetic => Ok(Arc::new(SyntheticMicrophone::new(&config.audio))),
        #[cfg(feature = "gstreamer")]
        CaptureBackend::Gstreamer => {
            let microphone = vigil_recorder::gst::GstMicrophone::new(&config.audio)
                .context("failed to initialise GStreamer microphone")?;
            Ok(Arc::new(microphone))
        }
        #[cfg(not(feature = "gstreamer"))]
        CaptureBackend::Gstreamer => {
            anyhow::bail!("audio backend 'gstreamer' requires the gstreamer feature")
        }
    }
}

fn build_sensor(
    config: &RecorderConfig,
    still_source: Option<Box<dyn vigil_recorder::capture::StillSource>>,
) -> anyhow::Result<Box<dyn MotionSensor>> {
    match config.motion.source {
        MotionSourceKind::Gpio => {
            if !motion::gpio_available(&config.motion.gpio_root) {
                warn!(
                    root = %config.motion.gpio_root.display(),
                    "GPIO sysfs tree not found, sensor will fail to export"
                );
            }
            Ok(Box::new(GpioPirSensor::new(&config.motion)))
        }
        MotionSourceKind::FrameDiff => {
            let stills = still_source.context("capture backend has no still tap for frame_diff")?;
            Ok(Box::new(FrameDiffSensor::new(stills, &config.motion)))
        }
        #[cfg(unix)]
        MotionSourceKind::Signal => {
            let sensor = motion::SignalSensor::new().context("failed to install SIGUSR1 handler")?;
            Ok(Box::new(sensor))
        }
        #[cfg(not(unix))]
        MotionSourceKind::Signal => anyhow::bail!("signal motion source needs a unix platform"),
    }
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

/// Log final statistics on shutdown.
fn log_final_stats(controller: &Controller, trigger: &MotionTrigger) {
    info!("=== Final Statistics ===");

    let alert = controller.alert_stats();
    info!(
        activations = alert.activations,
        deactivations = alert.deactivations,
        emergency_deactivations = alert.emergency_deactivations,
        aborted_activations = alert.aborted_activations,
        motion_events = alert.motion_events,
        motion_events_dropped = trigger.dropped(),
        notifications_failed = alert.notifications_failed,
        "Alert final stats"
    );

    let buffer = controller.buffer_stats();
    let loop_stats = controller.stats();
    info!(
        frames_mirrored = buffer.frames_pushed,
        frames_evicted = buffer.frames_evicted,
        drains = buffer.drains,
        ticks = loop_stats.ticks,
        check_ins = loop_stats.check_ins,
        "Capture final stats"
    );
}
