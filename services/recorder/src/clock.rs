//! Wall-clock time for directory names, notification bodies and the
//! daily check-in.
//!
//! Quiet-threshold arithmetic stays on `tokio::time::Instant`; only
//! human-facing times go through [`WallClock`].

use chrono::{DateTime, Local, NaiveDateTime, Utc};
use chrono_tz::Tz;

/// Source of local wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WallClock {
    /// The host's configured zone
    #[default]
    System,
    /// A fixed IANA zone, independent of the host setting
    Zone(Tz),
}

impl WallClock {
    /// Look up an IANA zone name such as "Europe/Berlin".
    pub fn named(name: &str) -> Result<Self, String> {
        name.parse::<Tz>().map(WallClock::Zone).map_err(|e| e.to_string())
    }

    /// Current local time.
    pub fn now(&self) -> NaiveDateTime {
        self.at(Utc::now())
    }

    /// Local time for a UTC instant.
    pub fn at(&self, instant: DateTime<Utc>) -> NaiveDateTime {
        match self {
            WallClock::System => instant.with_timezone(&Local).naive_local(),
            WallClock::Zone(tz) => instant.with_timezone(tz).naive_local(),
        }
    }
}
