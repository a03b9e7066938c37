//! Session storage: where alert artifacts live and how much room is left.

use chrono::{Datelike, NaiveDateTime, Timelike};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

const GIGABYTE: f64 = 1_000_000_000.0;

/// Errors that can occur while provisioning or inspecting storage.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to provision session directory {path}: {source}")]
    Provision {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to query disk space for {path}: {source}")]
    DiskSpace {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Gave up allocating a unique session directory under {0}")]
    Exhausted(PathBuf),
}

/// Directory of one alert session and the fixed names of its artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionLocation {
    dir: PathBuf,
    video_extension: String,
}

impl SessionLocation {
    pub fn new(dir: impl Into<PathBuf>, video_extension: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            video_extension: video_extension.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn activated_still(&self) -> PathBuf {
        self.dir.join("alertActivated.jpeg")
    }

    pub fn deactivated_still(&self) -> PathBuf {
        self.dir.join("alertDeactivated.jpeg")
    }

    /// Final spliced video.
    pub fn video(&self) -> PathBuf {
        self.dir.join(format!("video.{}", self.video_extension))
    }

    pub fn pre_roll(&self) -> PathBuf {
        self.dir.join(format!("before.{}", self.video_extension))
    }

    pub fn post_roll(&self) -> PathBuf {
        self.dir.join(format!("after.{}", self.video_extension))
    }

    pub fn audio(&self) -> PathBuf {
        self.dir.join("audio.wav")
    }
}

/// Provides an existing, writable directory per alert session.
pub trait StorageAllocator: Send + Sync {
    /// Called exactly once per session.
    fn allocate(&self, timestamp: NaiveDateTime) -> Result<SessionLocation, StorageError>;
}

/// Lays sessions out as `<root>/YYYY/MM/DD/HHMMSS`, adding a `-N` suffix
/// when a directory for the same second already exists.
#[derive(Debug, Clone)]
pub struct DatedDirectoryAllocator {
    root: PathBuf,
    video_extension: String,
    max_suffix: u32,
}

impl DatedDirectoryAllocator {
    pub fn new(root: impl Into<PathBuf>, video_extension: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            video_extension: video_extension.into(),
            max_suffix: 1000,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn day_dir(&self, timestamp: &NaiveDateTime) -> PathBuf {
        self.root
            .join(format!("{:04}", timestamp.year()))
            .join(format!("{:02}", timestamp.month()))
            .join(format!("{:02}", timestamp.day()))
    }
}

impl StorageAllocator for DatedDirectoryAllocator {
    fn allocate(&self, timestamp: NaiveDateTime) -> Result<SessionLocation, StorageError> {
        let day = self.day_dir(&timestamp);
        fs::create_dir_all(&day).map_err(|source| StorageError::Provision {
            path: day.clone(),
            source,
        })?;

        let stem = format!(
            "{:02}{:02}{:02}",
            timestamp.hour(),
            timestamp.minute(),
            timestamp.second()
        );

        for suffix in 0..=self.max_suffix {
            let name = if suffix == 0 {
                stem.clone()
            } else {
                format!("{stem}-{suffix}")
            };
            let dir = day.join(name);
            match fs::create_dir(&dir) {
                Ok(()) => {
                    info!(path = %dir.display(), "Session directory allocated");
                    return Ok(SessionLocation::new(dir, self.video_extension.clone()));
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    debug!(path = %dir.display(), "Session directory exists, trying next suffix");
                }
                Err(source) => return Err(StorageError::Provision { path: dir, source }),
            }
        }

        Err(StorageError::Exhausted(day))
    }
}

/// Capacity of the filesystem holding the session root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskUsage {
    pub total_bytes: u64,
    pub available_bytes: u64,
}

impl DiskUsage {
    pub fn total_gb(&self) -> f64 {
        self.total_bytes as f64 / GIGABYTE
    }

    pub fn available_gb(&self) -> f64 {
        self.available_bytes as f64 / GIGABYTE
    }

    /// Human readable summary used as the check-in body.
    pub fn summary(&self) -> String {
        format!(
            "{:.2}Gb Free of {:.2}Gb Total",
            self.available_gb(),
            self.total_gb()
        )
    }
}

/// Disk space inspection, used only by the daily check-in.
#[cfg_attr(test, mockall::automock)]
pub trait DiskSpace: Send + Sync {
    fn free_space(&self) -> Result<DiskUsage, StorageError>;
}

/// `statvfs(3)` on a path inside the target filesystem.
#[derive(Debug, Clone)]
pub struct StatvfsDiskSpace {
    path: PathBuf,
}

impl StatvfsDiskSpace {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl DiskSpace for StatvfsDiskSpace {
    #[cfg(unix)]
    fn free_space(&self) -> Result<DiskUsage, StorageError> {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let disk_err = |source: io::Error| StorageError::DiskSpace {
            path: self.path.clone(),
            source,
        };
        let c_path = CString::new(self.path.as_os_str().as_bytes())
            .map_err(|e| disk_err(io::Error::new(io::ErrorKind::InvalidInput, e)))?;

        unsafe {
            let mut stat: libc::statvfs = std::mem::zeroed();
            if libc::statvfs(c_path.as_ptr(), &mut stat) != 0 {
                return Err(disk_err(io::Error::last_os_error()));
            }
            #[allow(clippy::unnecessary_cast)]
            let usage = DiskUsage {
                total_bytes: stat.f_blocks as u64 * stat.f_frsize as u64,
                available_bytes: stat.f_bavail as u64 * stat.f_frsize as u64,
            };
            Ok(usage)
        }
    }

    #[cfg(not(unix))]
    fn free_space(&self) -> Result<DiskUsage, StorageError> {
        Err(StorageError::DiskSpace {
            path: self.path.clone(),
            source: io::Error::new(io::ErrorKind::Unsupported, "statvfs unavailable"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::tempdir;

    fn create_test_timestamp() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 9)
            .unwrap()
            .and_hms_opt(7, 5, 4)
            .unwrap()
    }

    #[test]
    fn test_dated_layout() {
        let dir = tempdir().unwrap();
        let allocator = DatedDirectoryAllocator::new(dir.path(), "h264");

        let location = allocator.allocate(create_test_timestamp()).unwrap();
        assert_eq!(location.dir(), dir.path().join("2024/03/09/070504"));
        assert!(location.dir().is_dir());
        assert_eq!(location.video(), location.dir().join("video.h264"));
        assert_eq!(location.pre_roll(), location.dir().join("before.h264"));
        assert_eq!(location.post_roll(), location.dir().join("after.h264"));
        assert_eq!(
            location.activated_still(),
            location.dir().join("alertActivated.jpeg")
        );
    }

    #[test]
    fn test_same_second_gets_unique_directory() {
        let dir = tempdir().unwrap();
        let allocator = DatedDirectoryAllocator::new(dir.path(), "h264");

        let first = allocator.allocate(create_test_timestamp()).unwrap();
        let second = allocator.allocate(create_test_timestamp()).unwrap();
        let third = allocator.allocate(create_test_timestamp()).unwrap();

        assert_ne!(first.dir(), second.dir());
        assert!(second.dir().ends_with("070504-1"));
        assert!(third.dir().ends_with("070504-2"));
    }

    #[test]
    fn test_unwritable_root() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, b"x").unwrap();
        let allocator = DatedDirectoryAllocator::new(&blocker, "h264");

        let err = allocator.allocate(create_test_timestamp()).unwrap_err();
        assert!(matches!(err, StorageError::Provision { .. }));
    }

    #[test]
    fn test_usage_summary() {
        let usage = DiskUsage {
            total_bytes: 32_000_000_000,
            available_bytes: 12_346_000_000,
        };
        assert_eq!(usage.summary(), "12.35Gb Free of 32.00Gb Total");
    }

    #[cfg(unix)]
    #[test]
    fn test_statvfs_reports_capacity() {
        let dir = tempdir().unwrap();
        let usage = StatvfsDiskSpace::new(dir.path()).free_space().unwrap();
        assert!(usage.total_bytes > 0);
        assert!(usage.available_bytes <= usage.total_bytes);
    }

    #[test]
    fn test_statvfs_missing_path() {
        let usage = StatvfsDiskSpace::new("/definitely/not/here").free_space();
        assert!(usage.is_err());
    }
}
