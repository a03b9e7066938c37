//! The control loop.
//!
//! A single task owns the [`AlertStateMachine`] and drives it from two
//! inputs: motion events from the bounded channel and a fixed polling tick.
//! The tick runs the quiet check, the daily check-in and capture recovery.
//! The select is biased towards shutdown, then the tick, so a motion flood
//! can delay a quiet check by at most one polling interval. Each tick first
//! drains motion that is already queued.

use crate::alert::{AlertError, AlertStateMachine, AlertStats, Transition};
use crate::clock::WallClock;
use crate::config::RecorderConfig;
use crate::motion::MotionEvent;
use crate::notifier::{AlertEvent, Notifier, Subjects};
use crate::rolling_buffer::BufferStats;
use crate::storage::DiskSpace;
use chrono::{NaiveDate, NaiveDateTime, Timelike};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Fires once per day, on the first poll that falls in the designated hour.
#[derive(Debug, Clone)]
pub struct CheckInSchedule {
    hour: u32,
    last_fired: Option<NaiveDate>,
}

impl CheckInSchedule {
    pub fn new(hour: u32) -> Self {
        Self {
            hour,
            last_fired: None,
        }
    }

    pub fn hour(&self) -> u32 {
        self.hour
    }

    /// Returns true when a check-in is due at `now`, and records it.
    pub fn poll(&mut self, now: NaiveDateTime) -> bool {
        let today = now.date();
        if now.hour() != self.hour || self.last_fired == Some(today) {
            return false;
        }
        self.last_fired = Some(today);
        true
    }
}

/// Loop counters.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ControllerStats {
    pub ticks: u64,
    pub check_ins: u64,
    pub failed_transitions: u64,
}

pub struct Controller {
    alert: AlertStateMachine,
    disk: Arc<dyn DiskSpace>,
    notifier: Arc<dyn Notifier>,
    subjects: Subjects,
    poll_interval: Duration,
    check_in: Option<CheckInSchedule>,
    clock: WallClock,
    check_in_task: Option<JoinHandle<()>>,
    stats: ControllerStats,
}

impl Controller {
    pub fn new(
        alert: AlertStateMachine,
        disk: Arc<dyn DiskSpace>,
        notifier: Arc<dyn Notifier>,
        config: &RecorderConfig,
    ) -> Self {
        let check_in = config
            .checkin
            .enabled
            .then(|| CheckInSchedule::new(config.checkin.hour));

        Self {
            alert,
            disk,
            notifier,
            subjects: Subjects::from_config(&config.notifier),
            poll_interval: config.alert.poll_interval(),
            check_in,
            clock: config.clock.wall_clock().unwrap_or_default(),
            check_in_task: None,
            stats: ControllerStats::default(),
        }
    }

    pub fn alert(&self) -> &AlertStateMachine {
        &self.alert
    }

    pub fn alert_stats(&self) -> AlertStats {
        self.alert.stats()
    }

    pub fn buffer_stats(&self) -> BufferStats {
        self.alert.capture().lock().buffer().stats()
    }

    pub fn stats(&self) -> ControllerStats {
        self.stats.clone()
    }

    /// Run until `cancel` fires, then end any active alert and release the
    /// camera.
    pub async fn run(&mut self, mut motion_rx: mpsc::Receiver<MotionEvent>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.poll_interval, self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut motion_open = true;

        info!(
            poll_interval_secs = self.poll_interval.as_secs_f64(),
            check_in_hour = self.check_in.as_ref().map(|c| c.hour()),
            "Control loop started"
        );

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!("Control loop cancelled");
                    break;
                }
                _ = ticker.tick() => {
                    self.on_tick(&mut motion_rx).await;
                }
                event = motion_rx.recv(), if motion_open => {
                    match event {
                        Some(event) => self.on_motion(event).await,
                        None => {
                            warn!("Motion channel closed, continuing without motion input");
                            motion_open = false;
                        }
                    }
                }
            }
        }

        self.shutdown().await;
    }

    async fn on_motion(&mut self, event: MotionEvent) {
        match self.alert.on_motion(event).await {
            Ok(Transition::Activated) => info!(sensor = event.sensor, "Motion started alert"),
            Ok(_) => {}
            Err(e) => self.record_failure("activation", &e),
        }
    }

    async fn on_tick(&mut self, motion_rx: &mut mpsc::Receiver<MotionEvent>) {
        self.stats.ticks += 1;

        // Motion queued behind a long turn must refresh the alert before the
        // quiet check can end it.
        while let Ok(event) = motion_rx.try_recv() {
            self.on_motion(event).await;
        }

        match self.alert.check_quiet(Instant::now()).await {
            Ok(Transition::Deactivated) => info!("Quiet threshold reached, alert ended"),
            Ok(_) => {}
            Err(e) => self.record_failure("deactivation", &e),
        }

        if !self.alert.recover_capture().await {
            debug!("Capture still offline");
        }

        let now = self.clock.now();
        if self.check_in.as_mut().is_some_and(|schedule| schedule.poll(now)) {
            self.start_check_in();
        }
    }

    fn record_failure(&mut self, phase: &'static str, err: &AlertError) {
        self.stats.failed_transitions += 1;
        warn!(phase = phase, error = %err, "Alert transition failed, state machine is idle");
    }

    /// Report free space without blocking the loop. A check-in still in
    /// flight from an earlier poll is left alone.
    fn start_check_in(&mut self) {
        if self.check_in_task.as_ref().is_some_and(|task| !task.is_finished()) {
            warn!("Previous check-in still running, skipping");
            return;
        }
        self.stats.check_ins += 1;

        let disk = self.disk.clone();
        let notifier = self.notifier.clone();
        let subjects = self.subjects.clone();
        self.check_in_task = Some(tokio::spawn(async move {
            let body = match tokio::task::spawn_blocking(move || disk.free_space()).await {
                Ok(Ok(usage)) => usage.summary(),
                Ok(Err(e)) => {
                    warn!(error = %e, "Disk space query failed");
                    format!("Disk space unavailable: {e}")
                }
                Err(e) => {
                    warn!(error = %e, "Disk space task failed");
                    "Disk space unavailable".to_string()
                }
            };

            let notification = subjects.notification(AlertEvent::CheckIn, body, None);
            match notifier.notify(&notification).await {
                Ok(()) => info!(body = %notification.body, "Checked in"),
                Err(e) => {
                    let err = AlertError::from(e);
                    warn!(error = %err, "Check-in failed");
                }
            }
        }));
    }

    async fn shutdown(&mut self) {
        if let Err(e) = self.alert.finish().await {
            warn!(error = %e, "Active alert did not end cleanly");
        }

        if let Some(task) = self.check_in_task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Check-in task failed");
            }
        }

        let capture = self.alert.capture().clone();
        if let Err(e) = tokio::task::spawn_blocking(move || capture.lock().shutdown()).await {
            warn!(error = %e, "Capture shutdown task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::AlertSettings;
    use crate::capture::{CaptureSession, RecordingTarget};
    use crate::config::CameraConfig;
    use crate::motion::motion_channel;
    use crate::notifier::testing::RecordingNotifier;
    use crate::rolling_buffer::RollingBuffer;
    use crate::storage::{DatedDirectoryAllocator, DiskUsage, MockDiskSpace, StorageError};
    use crate::synthetic::SyntheticCamera;
    use chrono::NaiveTime;
    use parking_lot::Mutex;
    use std::path::PathBuf;
    use tempfile::{tempdir, TempDir};
    use tokio_test::assert_ok;

    fn at(day: u32, hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, day)
            .unwrap()
            .and_time(NaiveTime::from_hms_opt(hour, minute, 0).unwrap())
    }

    fn create_test_config() -> RecorderConfig {
        let mut config = RecorderConfig::default();
        config.camera = CameraConfig {
            width: 160,
            height: 120,
            framerate: 10,
            bitrate_kbps: 200,
            ..CameraConfig::default()
        };
        config.checkin.enabled = false;
        config
    }

    fn create_test_controller(
        config: &RecorderConfig,
        poll_interval: Duration,
        quiet_threshold: Duration,
        disk: MockDiskSpace,
        notifier: Arc<RecordingNotifier>,
    ) -> (Controller, TempDir) {
        let dir = tempdir().unwrap();
        let mut session = CaptureSession::new(
            Box::new(SyntheticCamera::new(&config.camera)),
            RollingBuffer::new(config.camera.buffer_window(), 0),
        );
        session.reopen().unwrap();

        let alert = AlertStateMachine::new(
            Arc::new(Mutex::new(session)),
            Arc::new(DatedDirectoryAllocator::new(dir.path(), "h264")),
            notifier.clone(),
            AlertSettings {
                quiet_threshold,
                ..AlertSettings::from_config(config)
            },
        );

        let mut controller = Controller::new(alert, Arc::new(disk), notifier, config);
        controller.poll_interval = poll_interval;
        (controller, dir)
    }

    fn videos_under(root: &std::path::Path) -> Vec<PathBuf> {
        let mut found = Vec::new();
        let mut stack = vec![root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            for entry in std::fs::read_dir(&dir).unwrap() {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    stack.push(path);
                } else if path.file_name().is_some_and(|n| n == "video.h264") {
                    found.push(path);
                }
            }
        }
        found
    }

    #[test]
    fn test_scenario_d_check_in_once_per_day() {
        let mut schedule = CheckInSchedule::new(12);

        assert!(!schedule.poll(at(1, 11, 59)));
        assert!(schedule.poll(at(1, 12, 0)));
        for minute in [0, 15, 30, 45, 59] {
            assert!(!schedule.poll(at(1, 12, minute)));
        }
        assert!(!schedule.poll(at(1, 13, 0)));
        assert!(!schedule.poll(at(2, 11, 45)));
        assert!(schedule.poll(at(2, 12, 30)));
        assert!(!schedule.poll(at(2, 12, 45)));
    }

    #[test]
    fn test_check_in_missed_hour_waits_for_next_day() {
        let mut schedule = CheckInSchedule::new(12);
        assert!(!schedule.poll(at(1, 13, 0)));
        assert!(!schedule.poll(at(1, 23, 59)));
        assert!(schedule.poll(at(2, 12, 0)));
    }

    #[tokio::test]
    async fn test_check_in_follows_config() {
        let mut config = create_test_config();
        let (controller, _dir) = create_test_controller(
            &config,
            Duration::from_secs(1),
            Duration::from_secs(30),
            MockDiskSpace::new(),
            Arc::new(RecordingNotifier::default()),
        );
        assert!(controller.check_in.is_none());

        config.checkin.enabled = true;
        config.checkin.hour = 7;
        let (controller, _dir) = create_test_controller(
            &config,
            Duration::from_secs(1),
            Duration::from_secs(30),
            MockDiskSpace::new(),
            Arc::new(RecordingNotifier::default()),
        );
        assert_eq!(controller.check_in.as_ref().map(|c| c.hour()), Some(7));
    }

    #[tokio::test]
    async fn test_check_in_reports_free_space() {
        let config = create_test_config();
        let mut disk = MockDiskSpace::new();
        disk.expect_free_space().times(1).returning(|| {
            Ok(DiskUsage {
                total_bytes: 32_000_000_000,
                available_bytes: 12_346_000_000,
            })
        });
        let notifier = Arc::new(RecordingNotifier::default());
        let (mut controller, _dir) = create_test_controller(
            &config,
            Duration::from_secs(1),
            Duration::from_secs(30),
            disk,
            notifier.clone(),
        );

        controller.start_check_in();
        assert_ok!(controller.check_in_task.take().unwrap().await);

        let sent = notifier.sent.lock().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].event, AlertEvent::CheckIn);
        assert_eq!(sent[0].subject, "Checking In");
        assert_eq!(sent[0].body, "12.35Gb Free of 32.00Gb Total");
        assert_eq!(controller.stats().check_ins, 1);
    }

    #[tokio::test]
    async fn test_check_in_survives_disk_and_notifier_failure() {
        let config = create_test_config();
        let mut disk = MockDiskSpace::new();
        disk.expect_free_space()
            .returning(|| Err(StorageError::Exhausted(PathBuf::from("/nowhere"))));
        let notifier = Arc::new(RecordingNotifier::failing());
        let (mut controller, _dir) = create_test_controller(
            &config,
            Duration::from_secs(1),
            Duration::from_secs(30),
            disk,
            notifier.clone(),
        );

        controller.start_check_in();
        assert_ok!(controller.check_in_task.take().unwrap().await);

        let sent = notifier.sent.lock().clone();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].body.starts_with("Disk space unavailable"));
        assert!(!controller.alert().is_active());
    }

    #[tokio::test]
    async fn test_loop_activates_and_deactivates() {
        let config = create_test_config();
        let notifier = Arc::new(RecordingNotifier::default());
        let (mut controller, dir) = create_test_controller(
            &config,
            Duration::from_millis(20),
            Duration::from_millis(150),
            MockDiskSpace::new(),
            notifier.clone(),
        );
        let (trigger, motion_rx) = motion_channel(8);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                controller.run(motion_rx, cancel).await;
                controller
            }
        });

        // Let the buffer collect a sync frame first.
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert!(trigger.fire("test"));
        tokio::time::sleep(Duration::from_millis(600)).await;
        cancel.cancel();
        let controller = handle.await.unwrap();

        let stats = controller.alert_stats();
        assert_eq!(stats.activations, 1);
        assert_eq!(stats.deactivations, 1);
        assert!(controller.stats().ticks > 0);
        assert_eq!(
            notifier.events(),
            vec![AlertEvent::Activated, AlertEvent::Deactivated]
        );

        let videos = videos_under(dir.path());
        assert_eq!(videos.len(), 1);
        assert!(std::fs::metadata(&videos[0]).unwrap().len() > 0);
    }

    #[tokio::test]
    async fn test_shutdown_ends_active_alert() {
        let config = create_test_config();
        let notifier = Arc::new(RecordingNotifier::default());
        let (mut controller, dir) = create_test_controller(
            &config,
            Duration::from_millis(20),
            Duration::from_secs(600),
            MockDiskSpace::new(),
            notifier.clone(),
        );
        let (trigger, motion_rx) = motion_channel(8);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                controller.run(motion_rx, cancel).await;
                controller
            }
        });

        tokio::time::sleep(Duration::from_millis(1200)).await;
        trigger.fire("test");
        trigger.fire("test");
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!handle.is_finished());
        cancel.cancel();
        let controller = handle.await.unwrap();

        let stats = controller.alert_stats();
        assert_eq!(stats.activations, 1);
        assert_eq!(stats.motion_events, 2);
        assert_eq!(stats.deactivations, 1);
        assert!(!controller.alert().is_active());
        assert_eq!(videos_under(dir.path()).len(), 1);
        assert_eq!(
            *controller.alert().capture().lock().target(),
            RecordingTarget::Stopped
        );
    }

    #[tokio::test]
    async fn test_tick_applies_queued_motion_before_quiet_check() {
        let config = create_test_config();
        let (mut controller, dir) = create_test_controller(
            &config,
            Duration::from_secs(1),
            Duration::from_millis(50),
            MockDiskSpace::new(),
            Arc::new(RecordingNotifier::default()),
        );
        let (trigger, mut motion_rx) = motion_channel(8);

        controller
            .on_motion(MotionEvent {
                at: Instant::now(),
                sensor: "test",
            })
            .await;
        assert!(controller.alert().is_active());

        // Past the threshold, with fresh motion waiting in the channel.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(trigger.fire("test"));
        controller.on_tick(&mut motion_rx).await;

        let stats = controller.alert_stats();
        assert!(controller.alert().is_active());
        assert_eq!(stats.motion_events, 2);
        assert_eq!(stats.activations, 1);
        assert_eq!(stats.deactivations, 0);

        controller.shutdown().await;
        assert_eq!(controller.alert_stats().deactivations, 1);
        assert_eq!(videos_under(dir.path()).len(), 1);
    }

    #[tokio::test]
    async fn test_closed_motion_channel_keeps_loop_running() {
        let config = create_test_config();
        let (mut controller, _dir) = create_test_controller(
            &config,
            Duration::from_millis(20),
            Duration::from_secs(30),
            MockDiskSpace::new(),
            Arc::new(RecordingNotifier::default()),
        );
        let (trigger, motion_rx) = motion_channel(1);
        drop(trigger);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                controller.run(motion_rx, cancel).await;
                controller
            }
        });

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!handle.is_finished());
        cancel.cancel();
        let controller = handle.await.unwrap();
        assert!(controller.stats().ticks >= 2);
    }
}
