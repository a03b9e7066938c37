//! Alert lifecycle.
//!
//! The state machine is either idle or tracking exactly one [`AlertSession`].
//! Motion while idle starts a session: recording is split into the post-roll
//! file first, then the rolling buffer is drained into the pre-roll, so no
//! frame falls between the two. Motion while active only refreshes the
//! session. A periodic quiet check ends the session once no motion has been
//! seen for the quiet threshold, and splices pre-roll and post-roll into the
//! final video.
//!
//! Every failure inside activation or deactivation returns the machine to
//! idle. Capture and storage failures trigger a salvage pass (resume the
//! buffer, splice whatever exists) and a single fault notification.

use crate::audio::{AudioInput, AudioSidecar, SidecarSettings};
use crate::capture::{CaptureError, CaptureSession, RecordingTarget, StillImage};
use crate::clock::WallClock;
use crate::config::RecorderConfig;
use crate::motion::MotionEvent;
use crate::notifier::{notify_best_effort, AlertEvent, Notification, Notifier, NotifyError, Subjects};
use crate::rolling_buffer::DrainOutcome;
use crate::splicer::{MediaSplicer, SpliceError, SpliceJob, SpliceReport};
use crate::storage::{SessionLocation, StorageAllocator, StorageError};
use chrono::NaiveDateTime;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Capture session shared with blocking workers.
pub type SharedCapture = Arc<Mutex<CaptureSession>>;

/// Errors surfaced at the state machine boundary.
#[derive(Debug, Error)]
pub enum AlertError {
    #[error("Capture device unavailable: {0}")]
    DeviceUnavailable(#[source] CaptureError),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Notification failed: {0}")]
    NotificationFailure(#[from] NotifyError),

    #[error("Splice incomplete: {0}")]
    SpliceIncomplete(#[source] SpliceError),
}

impl From<CaptureError> for AlertError {
    fn from(e: CaptureError) -> Self {
        if e.is_device_failure() {
            AlertError::DeviceUnavailable(e)
        } else {
            AlertError::StorageUnavailable(Box::new(e))
        }
    }
}

impl From<StorageError> for AlertError {
    fn from(e: StorageError) -> Self {
        AlertError::StorageUnavailable(Box::new(e))
    }
}

impl From<SpliceError> for AlertError {
    fn from(e: SpliceError) -> Self {
        match e {
            SpliceError::Incomplete { .. } => AlertError::SpliceIncomplete(e),
            other => AlertError::StorageUnavailable(Box::new(other)),
        }
    }
}

/// Outcome of feeding an input to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Idle to active
    Activated,
    /// Motion while active
    Refreshed,
    /// Active to idle after the quiet threshold
    Deactivated,
    /// Nothing changed
    Unchanged,
}

/// One activation to deactivation cycle.
pub struct AlertSession {
    id: Uuid,
    started_at: NaiveDateTime,
    location: SessionLocation,
    last_motion: Instant,
    audio: Option<AudioSidecar>,
}

impl AlertSession {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn started_at(&self) -> NaiveDateTime {
        self.started_at
    }

    pub fn location(&self) -> &SessionLocation {
        &self.location
    }

    pub fn last_motion(&self) -> Instant {
        self.last_motion
    }

    pub fn has_audio(&self) -> bool {
        self.audio.is_some()
    }
}

enum AlertState {
    Idle,
    Active(AlertSession),
}

/// Lifecycle counters.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AlertStats {
    pub motion_events: u64,
    pub activations: u64,
    pub deactivations: u64,
    pub emergency_deactivations: u64,
    pub aborted_activations: u64,
    pub notifications_failed: u64,
}

/// Tunables of the state machine.
#[derive(Debug, Clone)]
pub struct AlertSettings {
    pub quiet_threshold: Duration,
    pub subjects: Subjects,
    pub splice_chunk_bytes: usize,
    pub audio: SidecarSettings,
    pub clock: WallClock,
}

impl AlertSettings {
    pub fn from_config(config: &RecorderConfig) -> Self {
        Self {
            quiet_threshold: config.alert.quiet_threshold(),
            subjects: Subjects::from_config(&config.notifier),
            splice_chunk_bytes: config.storage.splice_chunk_bytes,
            audio: SidecarSettings {
                chunk_samples: config.audio.chunk_samples(),
                header_refresh: config.audio.header_refresh(),
            },
            // Rejected by validate(); fall back to the host zone here.
            clock: config.clock.wall_clock().unwrap_or_default(),
        }
    }
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self::from_config(&RecorderConfig::default())
    }
}

pub struct AlertStateMachine {
    capture: SharedCapture,
    allocator: Arc<dyn StorageAllocator>,
    notifier: Arc<dyn Notifier>,
    audio: Option<Arc<dyn AudioInput>>,
    splicer: MediaSplicer,
    settings: AlertSettings,
    state: AlertState,
    stats: AlertStats,
}

impl AlertStateMachine {
    pub fn new(
        capture: SharedCapture,
        allocator: Arc<dyn StorageAllocator>,
        notifier: Arc<dyn Notifier>,
        settings: AlertSettings,
    ) -> Self {
        Self {
            capture,
            allocator,
            notifier,
            audio: None,
            splicer: MediaSplicer::new(settings.splice_chunk_bytes),
            settings,
            state: AlertState::Idle,
            stats: AlertStats::default(),
        }
    }

    /// Record audio alongside every alert.
    pub fn with_audio(mut self, input: Arc<dyn AudioInput>) -> Self {
        self.audio = Some(input);
        self
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, AlertState::Active(_))
    }

    pub fn session(&self) -> Option<&AlertSession> {
        match &self.state {
            AlertState::Active(session) => Some(session),
            AlertState::Idle => None,
        }
    }

    pub fn stats(&self) -> AlertStats {
        self.stats.clone()
    }

    pub fn capture(&self) -> &SharedCapture {
        &self.capture
    }

    /// Handle one motion event.
    pub async fn on_motion(&mut self, event: MotionEvent) -> Result<Transition, AlertError> {
        self.stats.motion_events += 1;

        if let AlertState::Active(session) = &mut self.state {
            if event.at > session.last_motion {
                session.last_motion = event.at;
            }
            debug!(session_id = %session.id, sensor = event.sensor, "Motion refreshed active alert");
            return Ok(Transition::Refreshed);
        }

        self.activate(event).await
    }

    /// Periodic check. Ends the active session once `now` is at least the
    /// quiet threshold past the last motion, or immediately if the camera has
    /// gone away.
    pub async fn check_quiet(&mut self, now: Instant) -> Result<Transition, AlertError> {
        let (device_ok, quiet) = match &self.state {
            AlertState::Idle => return Ok(Transition::Unchanged),
            AlertState::Active(session) => (
                self.capture.lock().is_available(),
                now.saturating_duration_since(session.last_motion) >= self.settings.quiet_threshold,
            ),
        };
        if device_ok && !quiet {
            return Ok(Transition::Unchanged);
        }

        let AlertState::Active(session) = std::mem::replace(&mut self.state, AlertState::Idle) else {
            return Ok(Transition::Unchanged);
        };

        if device_ok {
            self.deactivate(session).await
        } else {
            let err = AlertError::DeviceUnavailable(CaptureError::DeviceUnavailable(
                "capture device lost during alert".to_string(),
            ));
            self.emergency_deactivate(session, err).await
        }
    }

    /// End any active session regardless of the quiet threshold.
    pub async fn finish(&mut self) -> Result<Transition, AlertError> {
        match std::mem::replace(&mut self.state, AlertState::Idle) {
            AlertState::Idle => Ok(Transition::Unchanged),
            AlertState::Active(session) => {
                info!(session_id = %session.id, "Ending active alert for shutdown");
                self.deactivate(session).await
            }
        }
    }

    /// While idle, try once to bring a lost camera back into continuous
    /// capture. Returns whether capture is running.
    pub async fn recover_capture(&mut self) -> bool {
        if self.is_active() {
            return true;
        }
        let healthy = {
            let capture = self.capture.lock();
            capture.is_available() && *capture.target() != RecordingTarget::Stopped
        };
        if healthy {
            return true;
        }

        match self.with_capture(|capture| capture.reopen()).await {
            Ok(()) => {
                info!("Capture device recovered");
                true
            }
            Err(e) => {
                debug!(error = %e, "Capture device still unavailable");
                false
            }
        }
    }

    #[instrument(skip(self, event), fields(sensor = event.sensor))]
    async fn activate(&mut self, event: MotionEvent) -> Result<Transition, AlertError> {
        let id = Uuid::new_v4();
        let started_at = self.settings.clock.now();

        let location = match self.allocator.allocate(started_at) {
            Ok(location) => location,
            Err(e) => return Err(self.abort_activation(id, None, e.into()).await),
        };
        info!(session_id = %id, path = %location.dir().display(), "Alert activating");

        let drained = match self.begin_recording(&location).await {
            Ok(drained) => drained,
            Err(err) => return Err(self.abort_activation(id, Some(location), err).await),
        };
        debug!(
            session_id = %id,
            pre_roll_frames = drained.frames_written,
            pre_roll_bytes = drained.bytes_written,
            "Pre-roll saved"
        );

        let still = match self.capture_still(location.activated_still()).await {
            Ok(still) => still,
            Err(err) => return Err(self.abort_activation(id, Some(location), err).await),
        };

        let notification = self.settings.subjects.notification(
            AlertEvent::Activated,
            format!("Alert activated at {}", started_at.format("%Y-%m-%d %H:%M:%S")),
            Some(still.path),
        );
        self.notify(&notification).await;

        let audio = self.audio.as_ref().map(|input| {
            AudioSidecar::start(input.clone(), location.audio(), self.settings.audio.clone())
        });

        self.state = AlertState::Active(AlertSession {
            id,
            started_at,
            location,
            last_motion: event.at,
            audio,
        });
        self.stats.activations += 1;
        info!(session_id = %id, "Alert active");
        Ok(Transition::Activated)
    }

    #[instrument(skip_all, fields(session_id = %session.id))]
    async fn deactivate(&mut self, session: AlertSession) -> Result<Transition, AlertError> {
        if let Err(err) = self
            .with_capture(|capture| capture.resume_into_buffer())
            .await
            .map_err(AlertError::from)
        {
            return self.emergency_deactivate(session, err).await;
        }

        let AlertSession {
            id,
            started_at,
            location,
            audio,
            ..
        } = session;

        if let Some(audio) = audio {
            stop_audio(id, audio).await;
        }

        let spliced = self.splice(&location).await;
        if let Err(e) = &spliced {
            warn!(session_id = %id, error = %e, "Alert video incomplete, partial output kept");
        }

        // The video is already saved; a missing closing still only drops the
        // attachment.
        let still = match self.capture_still(location.deactivated_still()).await {
            Ok(still) => Some(still.path),
            Err(err) => {
                warn!(session_id = %id, error = %err, "Deactivation still failed");
                None
            }
        };

        let elapsed = (self.settings.clock.now() - started_at).num_seconds().max(0);
        let body = match still {
            Some(_) => format!("Alert deactivated after {elapsed}s"),
            None => format!("Alert deactivated after {elapsed}s (no closing still)"),
        };
        let notification =
            self.settings
                .subjects
                .notification(AlertEvent::Deactivated, body, still);
        self.notify(&notification).await;

        self.stats.deactivations += 1;
        info!(session_id = %id, duration_secs = elapsed, "Alert deactivated");
        spliced.map(|_| Transition::Deactivated)
    }

    async fn emergency_deactivate(
        &mut self,
        session: AlertSession,
        err: AlertError,
    ) -> Result<Transition, AlertError> {
        error!(session_id = %session.id, error = %err, "Emergency deactivation");
        let AlertSession {
            id, location, audio, ..
        } = session;
        self.salvage(id, &location, audio).await;
        self.stats.emergency_deactivations += 1;
        self.report_fault(&err).await;
        Err(err)
    }

    async fn abort_activation(
        &mut self,
        id: Uuid,
        location: Option<SessionLocation>,
        err: AlertError,
    ) -> AlertError {
        error!(session_id = %id, error = %err, "Alert activation failed");
        if let Some(location) = location {
            self.salvage(id, &location, None).await;
        }
        self.stats.aborted_activations += 1;
        self.report_fault(&err).await;
        err
    }

    /// Keep what can be kept after a failure: stop audio, get the camera
    /// back into the buffer (or at least close the post-roll file), and
    /// splice whatever media exists.
    async fn salvage(&self, id: Uuid, location: &SessionLocation, audio: Option<AudioSidecar>) {
        if let Some(audio) = audio {
            stop_audio(id, audio).await;
        }

        if let Err(e) = self.with_capture(|capture| capture.resume_into_buffer()).await {
            warn!(session_id = %id, error = %e, "Could not resume rolling buffer");
            let released = self
                .with_capture(|capture| {
                    capture.release_target();
                    Ok(())
                })
                .await;
            if let Err(e) = released {
                warn!(session_id = %id, error = %e, "Could not release recording target");
            }
        }

        match self.splice(location).await {
            Ok(report) => info!(
                session_id = %id,
                bytes = report.total_bytes(),
                "Partial alert video saved"
            ),
            Err(e) => warn!(session_id = %id, error = %e, "Partial alert video incomplete"),
        }
    }

    async fn begin_recording(&self, location: &SessionLocation) -> Result<DrainOutcome, AlertError> {
        let post_roll = location.post_roll();
        let pre_roll = location.pre_roll();
        self.with_capture(move |capture| {
            capture.split_to(&post_roll)?;
            capture.drain_buffer_to(&pre_roll)
        })
        .await
        .map_err(AlertError::from)
    }

    async fn capture_still(&self, path: PathBuf) -> Result<StillImage, AlertError> {
        self.with_capture(move |capture| capture.capture_still(&path))
            .await
            .map_err(AlertError::from)
    }

    async fn splice(&self, location: &SessionLocation) -> Result<SpliceReport, AlertError> {
        let splicer = self.splicer.clone();
        let job = SpliceJob::new(location.pre_roll(), location.post_roll(), location.video());
        tokio::task::spawn_blocking(move || splicer.splice(job))
            .await
            .map_err(|e| AlertError::StorageUnavailable(Box::new(e)))?
            .map_err(AlertError::from)
    }

    /// Run a capture operation on a blocking worker.
    async fn with_capture<T, F>(&self, op: F) -> Result<T, CaptureError>
    where
        F: FnOnce(&mut CaptureSession) -> Result<T, CaptureError> + Send + 'static,
        T: Send + 'static,
    {
        let capture = self.capture.clone();
        tokio::task::spawn_blocking(move || op(&mut capture.lock()))
            .await
            .map_err(|e| CaptureError::DeviceUnavailable(format!("capture task failed: {e}")))?
    }

    async fn notify(&mut self, notification: &Notification) -> bool {
        let delivered = notify_best_effort(self.notifier.as_ref(), notification).await;
        if !delivered {
            self.stats.notifications_failed += 1;
        }
        delivered
    }

    async fn report_fault(&mut self, err: &AlertError) {
        let notification = self
            .settings
            .subjects
            .notification(AlertEvent::Fault, err.to_string(), None);
        self.notify(&notification).await;
    }
}

async fn stop_audio(id: Uuid, audio: AudioSidecar) {
    match audio.stop().await {
        Ok(summary) => debug!(
            session_id = %id,
            samples = summary.samples,
            discarded = summary.discarded,
            "Audio sidecar joined"
        ),
        Err(e) => warn!(session_id = %id, error = %e, "Audio sidecar failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{AudioFormat, AudioStream};
    use crate::capture::{CaptureSource, FrameSink, SinkSlot};
    use crate::notifier::testing::RecordingNotifier;
    use crate::rolling_buffer::{RollingBuffer, VideoFrame};
    use crate::storage::DatedDirectoryAllocator;
    use bytes::Bytes;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::{tempdir, TempDir};

    /// Camera whose frames are delivered by the test.
    struct FakeCamera {
        slot: SinkSlot,
        available: Arc<AtomicBool>,
        still_fails: Arc<AtomicBool>,
    }

    impl CaptureSource for FakeCamera {
        fn open(&mut self) -> Result<(), CaptureError> {
            if self.available.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(CaptureError::DeviceUnavailable("offline".to_string()))
            }
        }

        fn is_available(&self) -> bool {
            self.available.load(Ordering::SeqCst)
        }

        fn capture_still_frame(&mut self) -> Result<Bytes, CaptureError> {
            if self.still_fails.load(Ordering::SeqCst) {
                self.available.store(false, Ordering::SeqCst);
                return Err(CaptureError::DeviceUnavailable("sensor timeout".to_string()));
            }
            Ok(Bytes::from_static(b"\xFF\xD8still\xFF\xD9"))
        }

        fn start_recording(&mut self, sink: Box<dyn FrameSink>) -> Result<(), CaptureError> {
            self.slot.replace(Some(sink))
        }

        fn split_recording(&mut self, sink: Box<dyn FrameSink>) -> Result<(), CaptureError> {
            self.start_recording(sink)
        }

        fn stop_recording(&mut self) -> Result<(), CaptureError> {
            self.slot.replace(None)
        }
    }

    struct ToneInput;

    struct ToneStream;

    impl AudioInput for ToneInput {
        fn open(&self) -> Result<Box<dyn AudioStream>, crate::audio::AudioError> {
            Ok(Box::new(ToneStream))
        }
    }

    impl AudioStream for ToneStream {
        fn format(&self) -> AudioFormat {
            AudioFormat {
                sample_rate: 8000,
                channels: 1,
            }
        }

        fn read(&mut self, buf: &mut [i16]) -> Result<usize, crate::audio::AudioError> {
            std::thread::sleep(Duration::from_millis(2));
            buf.fill(100);
            Ok(buf.len())
        }
    }

    struct Rig {
        _dir: TempDir,
        root: PathBuf,
        machine: AlertStateMachine,
        slot: SinkSlot,
        available: Arc<AtomicBool>,
        still_fails: Arc<AtomicBool>,
        notifier: Arc<RecordingNotifier>,
    }

    fn create_test_rig(notifier: RecordingNotifier) -> Rig {
        create_rig_with_audio(notifier, None)
    }

    fn create_rig_with_audio(notifier: RecordingNotifier, audio: Option<Arc<dyn AudioInput>>) -> Rig {
        let dir = tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let slot = SinkSlot::new();
        let available = Arc::new(AtomicBool::new(true));
        let still_fails = Arc::new(AtomicBool::new(false));
        let camera = FakeCamera {
            slot: slot.clone(),
            available: available.clone(),
            still_fails: still_fails.clone(),
        };

        let mut session = CaptureSession::new(
            Box::new(camera),
            RollingBuffer::new(Duration::from_secs(5), 0),
        );
        session.begin_continuous_capture().unwrap();

        let notifier = Arc::new(notifier);
        let mut machine = AlertStateMachine::new(
            Arc::new(Mutex::new(session)),
            Arc::new(DatedDirectoryAllocator::new(&root, "h264")),
            notifier.clone(),
            AlertSettings {
                quiet_threshold: Duration::from_secs(30),
                ..Default::default()
            },
        );
        if let Some(input) = audio {
            machine = machine.with_audio(input);
        }

        Rig {
            _dir: dir,
            root,
            machine,
            slot,
            available,
            still_fails,
            notifier,
        }
    }

    fn frame(tag: u8, sync: bool) -> VideoFrame {
        VideoFrame::new(Bytes::from(vec![tag; 8]), Duration::from_millis(tag as u64 * 40), sync)
    }

    fn motion_at(at: Instant) -> MotionEvent {
        MotionEvent { at, sensor: "test" }
    }

    fn session_dirs(root: &Path) -> Vec<PathBuf> {
        let mut dirs = Vec::new();
        let mut stack = vec![root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            for entry in std::fs::read_dir(&dir).unwrap() {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    if ["alertActivated.jpeg", "before.h264", "video.h264"]
                        .iter()
                        .any(|name| path.join(name).exists())
                    {
                        dirs.push(path.clone());
                    }
                    stack.push(path);
                }
            }
        }
        dirs
    }

    #[tokio::test]
    async fn test_scenario_a_quiet_alert_produces_spliced_video() {
        let mut rig = create_test_rig(RecordingNotifier::default());
        rig.slot.deliver(&frame(1, false));
        rig.slot.deliver(&frame(2, true));
        rig.slot.deliver(&frame(3, false));

        let t0 = Instant::now();
        assert_eq!(
            rig.machine.on_motion(motion_at(t0)).await.unwrap(),
            Transition::Activated
        );
        let location = rig.machine.session().unwrap().location().clone();

        rig.slot.deliver(&frame(4, false));
        rig.slot.deliver(&frame(5, true));

        // Polled every 15 s; the 30 s poll is the first to see the threshold.
        assert_eq!(
            rig.machine.check_quiet(t0 + Duration::from_secs(15)).await.unwrap(),
            Transition::Unchanged
        );
        assert_eq!(
            rig.machine.check_quiet(t0 + Duration::from_secs(30)).await.unwrap(),
            Transition::Deactivated
        );
        assert!(!rig.machine.is_active());

        let video = std::fs::read(location.video()).unwrap();
        let expected: Vec<u8> = [2u8, 3, 4, 5].iter().flat_map(|t| vec![*t; 8]).collect();
        assert_eq!(video, expected);
        assert!(!location.pre_roll().exists());
        assert!(!location.post_roll().exists());
        assert!(location.activated_still().exists());
        assert!(location.deactivated_still().exists());
        assert_eq!(
            rig.notifier.events(),
            vec![AlertEvent::Activated, AlertEvent::Deactivated]
        );

        // Mirroring resumed into a fresh buffer.
        rig.slot.deliver(&frame(6, true));
        assert_eq!(rig.machine.capture().lock().buffer().len(), 1);
    }

    #[tokio::test]
    async fn test_scenario_b_motion_refreshes_quiet_window() {
        let mut rig = create_test_rig(RecordingNotifier::default());
        rig.slot.deliver(&frame(1, true));

        let t0 = Instant::now();
        rig.machine.on_motion(motion_at(t0)).await.unwrap();
        assert_eq!(
            rig.machine
                .on_motion(motion_at(t0 + Duration::from_secs(20)))
                .await
                .unwrap(),
            Transition::Refreshed
        );

        for secs in [30, 45] {
            assert_eq!(
                rig.machine.check_quiet(t0 + Duration::from_secs(secs)).await.unwrap(),
                Transition::Unchanged
            );
        }
        assert_eq!(
            rig.machine.check_quiet(t0 + Duration::from_secs(50)).await.unwrap(),
            Transition::Deactivated
        );

        let stats = rig.machine.stats();
        assert_eq!(stats.activations, 1);
        assert_eq!(stats.deactivations, 1);
        assert_eq!(stats.motion_events, 2);
        assert_eq!(session_dirs(&rig.root).len(), 1);
    }

    #[tokio::test]
    async fn test_stale_motion_does_not_move_last_motion_back() {
        let mut rig = create_test_rig(RecordingNotifier::default());
        let t0 = Instant::now();
        rig.machine
            .on_motion(motion_at(t0 + Duration::from_secs(10)))
            .await
            .unwrap();
        rig.machine.on_motion(motion_at(t0)).await.unwrap();

        assert_eq!(
            rig.machine.session().unwrap().last_motion(),
            t0 + Duration::from_secs(10)
        );
    }

    #[tokio::test]
    async fn test_scenario_c_device_failure_mid_activation() {
        let mut rig = create_test_rig(RecordingNotifier::default());
        rig.slot.deliver(&frame(1, true));
        rig.slot.deliver(&frame(2, false));
        rig.still_fails.store(true, Ordering::SeqCst);

        let err = rig.machine.on_motion(motion_at(Instant::now())).await.unwrap_err();
        assert!(matches!(err, AlertError::DeviceUnavailable(_)));
        assert!(!rig.machine.is_active());
        assert!(rig.machine.session().is_none());

        // One operator notification attempt, and it is the fault.
        assert_eq!(rig.notifier.events(), vec![AlertEvent::Fault]);
        assert_eq!(rig.machine.stats().aborted_activations, 1);
        assert_eq!(rig.machine.stats().activations, 0);

        // The pre-roll that was already drained is kept as the video.
        let dirs = session_dirs(&rig.root);
        assert_eq!(dirs.len(), 1);
        let video = std::fs::read(dirs[0].join("video.h264")).unwrap();
        assert_eq!(video, [vec![1u8; 8], vec![2u8; 8]].concat());

        // A later quiet check has nothing to do.
        assert_eq!(
            rig.machine.check_quiet(Instant::now()).await.unwrap(),
            Transition::Unchanged
        );
    }

    #[tokio::test]
    async fn test_closing_still_failure_still_deactivates() {
        let mut rig = create_test_rig(RecordingNotifier::default());
        rig.slot.deliver(&frame(1, true));

        let t0 = Instant::now();
        rig.machine.on_motion(motion_at(t0)).await.unwrap();
        let location = rig.machine.session().unwrap().location().clone();
        rig.slot.deliver(&frame(2, false));
        rig.still_fails.store(true, Ordering::SeqCst);

        assert_eq!(
            rig.machine.check_quiet(t0 + Duration::from_secs(30)).await.unwrap(),
            Transition::Deactivated
        );
        assert!(!rig.machine.is_active());
        assert_eq!(
            rig.notifier.events(),
            vec![AlertEvent::Activated, AlertEvent::Deactivated]
        );
        let sent = rig.notifier.sent.lock().clone();
        assert!(sent[1].attachment.is_none());

        let stats = rig.machine.stats();
        assert_eq!(stats.deactivations, 1);
        assert_eq!(stats.emergency_deactivations, 0);
        let video = std::fs::read(location.video()).unwrap();
        assert_eq!(video, [vec![1u8; 8], vec![2u8; 8]].concat());
        assert!(!location.deactivated_still().exists());
    }

    /// Slice NAL headers in annex-B data, each followed by the frame's fill
    /// byte.
    fn synthetic_frame_indices(data: &[u8]) -> Vec<u8> {
        data.windows(6)
            .filter(|w| w[..4] == [0, 0, 0, 1] && (w[4] == 0x65 || w[4] == 0x41))
            .map(|w| w[5] & 0x7F)
            .collect()
    }

    #[tokio::test]
    async fn test_live_camera_split_keeps_every_frame() {
        use crate::config::CameraConfig;
        use crate::synthetic::SyntheticCamera;

        let dir = tempdir().unwrap();
        let camera = SyntheticCamera::new(&CameraConfig {
            width: 160,
            height: 120,
            framerate: 200,
            bitrate_kbps: 2000,
            ..CameraConfig::default()
        });
        let mut session = CaptureSession::new(
            Box::new(camera),
            RollingBuffer::new(Duration::from_secs(5), 0),
        );
        session.reopen().unwrap();

        let notifier = Arc::new(RecordingNotifier::default());
        let mut machine = AlertStateMachine::new(
            Arc::new(Mutex::new(session)),
            Arc::new(DatedDirectoryAllocator::new(dir.path(), "h264")),
            notifier,
            AlertSettings {
                quiet_threshold: Duration::from_secs(30),
                ..Default::default()
            },
        );

        tokio::time::sleep(Duration::from_millis(300)).await;
        machine.on_motion(motion_at(Instant::now())).await.unwrap();
        let location = machine.session().unwrap().location().clone();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(
            machine
                .check_quiet(Instant::now() + Duration::from_secs(30))
                .await
                .unwrap(),
            Transition::Deactivated
        );
        machine.capture().lock().shutdown();

        let video = std::fs::read(location.video()).unwrap();
        let indices = synthetic_frame_indices(&video);
        assert!(indices.len() > 60, "only {} frames recorded", indices.len());
        assert_eq!(indices[0], 0);
        for w in indices.windows(2) {
            assert_eq!(w[1], (w[0] + 1) & 0x7F, "gap in {indices:?}");
        }
    }

    #[tokio::test]
    async fn test_storage_failure_aborts_activation() {
        let mut rig = create_test_rig(RecordingNotifier::default());
        let blocker = rig.root.join("blocked");
        std::fs::write(&blocker, b"x").unwrap();
        rig.machine.allocator = Arc::new(DatedDirectoryAllocator::new(&blocker, "h264"));

        let err = rig.machine.on_motion(motion_at(Instant::now())).await.unwrap_err();
        assert!(matches!(err, AlertError::StorageUnavailable(_)));
        assert!(!rig.machine.is_active());
        assert_eq!(rig.notifier.events(), vec![AlertEvent::Fault]);
    }

    #[tokio::test]
    async fn test_device_lost_while_active_forces_emergency_deactivation() {
        let mut rig = create_test_rig(RecordingNotifier::default());
        rig.slot.deliver(&frame(1, true));
        let t0 = Instant::now();
        rig.machine.on_motion(motion_at(t0)).await.unwrap();
        let location = rig.machine.session().unwrap().location().clone();

        rig.slot.deliver(&frame(2, false));
        rig.available.store(false, Ordering::SeqCst);

        let err = rig
            .machine
            .check_quiet(t0 + Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, AlertError::DeviceUnavailable(_)));
        assert!(!rig.machine.is_active());
        assert_eq!(rig.machine.stats().emergency_deactivations, 1);
        assert_eq!(
            rig.notifier.events(),
            vec![AlertEvent::Activated, AlertEvent::Fault]
        );

        // The post-roll was closed and spliced behind the pre-roll.
        let video = std::fs::read(location.video()).unwrap();
        assert_eq!(video, [vec![1u8; 8], vec![2u8; 8]].concat());

        // Recovery while idle once the device is back.
        assert!(!rig.machine.recover_capture().await);
        rig.available.store(true, Ordering::SeqCst);
        assert!(rig.machine.recover_capture().await);
    }

    #[tokio::test]
    async fn test_notification_failure_does_not_block_alert() {
        let mut rig = create_test_rig(RecordingNotifier::failing());
        rig.slot.deliver(&frame(1, true));

        let t0 = Instant::now();
        assert_eq!(
            rig.machine.on_motion(motion_at(t0)).await.unwrap(),
            Transition::Activated
        );
        assert_eq!(
            rig.machine.check_quiet(t0 + Duration::from_secs(30)).await.unwrap(),
            Transition::Deactivated
        );
        assert_eq!(rig.machine.stats().notifications_failed, 2);
    }

    #[tokio::test]
    async fn test_audio_sidecar_bound_to_session() {
        let mut rig = create_rig_with_audio(RecordingNotifier::default(), Some(Arc::new(ToneInput)));
        rig.slot.deliver(&frame(1, true));

        let t0 = Instant::now();
        rig.machine.on_motion(motion_at(t0)).await.unwrap();
        assert!(rig.machine.session().unwrap().has_audio());
        let location = rig.machine.session().unwrap().location().clone();

        tokio::time::sleep(Duration::from_millis(30)).await;
        rig.machine.finish().await.unwrap();

        let audio = std::fs::read(location.audio()).unwrap();
        assert!(audio.len() > 44);
        assert_eq!(&audio[0..4], b"RIFF");
        assert!(!rig.machine.is_active());
    }

    #[tokio::test]
    async fn test_finish_when_idle_is_noop() {
        let mut rig = create_test_rig(RecordingNotifier::default());
        assert_eq!(rig.machine.finish().await.unwrap(), Transition::Unchanged);
        assert!(rig.notifier.events().is_empty());
    }
}
