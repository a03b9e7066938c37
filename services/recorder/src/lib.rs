//! Motion-triggered camera recorder.
//!
//! The camera runs continuously into a short [`rolling_buffer::RollingBuffer`].
//! When a motion sensor fires, the recording is split into a post-roll file,
//! the buffer is saved as pre-roll, a still is captured and an operator is
//! notified. Once the scene has been quiet long enough the two halves are
//! spliced into one video and a closing still and notification follow.
//!
//! ```text
//! MotionSensor -> mpsc -> Controller -> AlertStateMachine -> CaptureSession
//!                             |                 |-> MediaSplicer
//!                             |                 |-> AudioSidecar
//!                             +-> check-in      +-> Notifier
//! ```

pub mod alert;
pub mod audio;
pub mod capture;
pub mod clock;
pub mod config;
pub mod controller;
#[cfg(feature = "gstreamer")]
pub mod gst;
pub mod h264;
pub mod motion;
pub mod notifier;
pub mod rolling_buffer;
pub mod splicer;
pub mod storage;
pub mod synthetic;

pub use alert::{AlertError, AlertSettings, AlertStateMachine, AlertStats, SharedCapture, Transition};
pub use capture::{CaptureError, CaptureSession, CaptureSource};
pub use config::RecorderConfig;
pub use controller::{CheckInSchedule, Controller};
pub use rolling_buffer::{RollingBuffer, VideoFrame};
pub use splicer::{MediaSplicer, SpliceJob};
