//! Joins the pre-roll and post-roll recordings of an alert into one file.
//!
//! Both inputs are raw annex-B streams and the pre-roll already begins at a
//! sync point, so the output is simply `pre ++ post`. Inputs are deleted only
//! after every byte has been copied and the destination synced.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Errors that can occur while splicing.
#[derive(Debug, Error)]
pub enum SpliceError {
    #[error("Failed to open splice destination {path}: {source}")]
    Destination {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to write splice destination {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Some input was missing or could not be read to the end. Whatever was
    /// available has been written to the destination and the inputs are kept.
    #[error("Splice incomplete for {destination}: {bytes_written} bytes written, incomplete inputs {incomplete:?}")]
    Incomplete {
        destination: PathBuf,
        bytes_written: u64,
        incomplete: Vec<PathBuf>,
    },
}

/// Pre-roll, post-roll and destination for one alert. Consumed by
/// [`MediaSplicer::splice`].
#[derive(Debug, Clone)]
pub struct SpliceJob {
    pub pre_roll: PathBuf,
    pub post_roll: PathBuf,
    pub destination: PathBuf,
}

impl SpliceJob {
    pub fn new(
        pre_roll: impl Into<PathBuf>,
        post_roll: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
    ) -> Self {
        Self {
            pre_roll: pre_roll.into(),
            post_roll: post_roll.into(),
            destination: destination.into(),
        }
    }
}

/// Outcome of a complete splice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpliceReport {
    pub destination: PathBuf,
    pub pre_roll_bytes: u64,
    pub post_roll_bytes: u64,
}

impl SpliceReport {
    pub fn total_bytes(&self) -> u64 {
        self.pre_roll_bytes + self.post_roll_bytes
    }
}

enum CopyResult {
    Complete(u64),
    Short { copied: u64 },
}

/// Chunked file concatenation.
#[derive(Debug, Clone)]
pub struct MediaSplicer {
    chunk_size: usize,
}

impl Default for MediaSplicer {
    fn default() -> Self {
        Self::new(64 * 1024)
    }
}

impl MediaSplicer {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    /// Write `pre_roll ++ post_roll` to the destination, overwriting it, and
    /// remove both inputs once the copy is verified.
    ///
    /// A missing or short input does not stop the splice: the remaining data
    /// is still written and [`SpliceError::Incomplete`] is returned with the
    /// inputs left in place. If neither input exists the destination is not
    /// created.
    #[instrument(skip(self, job), fields(destination = %job.destination.display()))]
    pub fn splice(&self, job: SpliceJob) -> Result<SpliceReport, SpliceError> {
        let SpliceJob {
            pre_roll,
            post_roll,
            destination,
        } = job;

        if !pre_roll.exists() && !post_roll.exists() {
            warn!("Neither pre-roll nor post-roll exists, nothing to splice");
            return Err(SpliceError::Incomplete {
                destination,
                bytes_written: 0,
                incomplete: vec![pre_roll, post_roll],
            });
        }

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&destination)
            .map_err(|source| SpliceError::Destination {
                path: destination.clone(),
                source,
            })?;
        let mut writer = BufWriter::with_capacity(self.chunk_size, file);
        let mut chunk = vec![0u8; self.chunk_size];

        let mut incomplete = Vec::new();
        let mut copied = [0u64; 2];
        for (index, input) in [&pre_roll, &post_roll].into_iter().enumerate() {
            match self.append(input, &mut writer, &mut chunk, &destination)? {
                CopyResult::Complete(n) => copied[index] = n,
                CopyResult::Short { copied: n } => {
                    copied[index] = n;
                    incomplete.push(input.clone());
                }
            }
        }

        let write_err = |source: io::Error| SpliceError::Write {
            path: destination.clone(),
            source,
        };
        let file: File = writer
            .into_inner()
            .map_err(|e| write_err(e.into_error()))?;
        file.sync_all().map_err(write_err)?;

        let bytes_written = copied[0] + copied[1];
        if !incomplete.is_empty() {
            warn!(
                bytes_written = bytes_written,
                incomplete = ?incomplete,
                "Splice incomplete, inputs kept"
            );
            return Err(SpliceError::Incomplete {
                destination,
                bytes_written,
                incomplete,
            });
        }

        for input in [&pre_roll, &post_roll] {
            if let Err(e) = fs::remove_file(input) {
                warn!(path = %input.display(), error = %e, "Failed to remove splice input");
            }
        }

        info!(
            pre_roll_bytes = copied[0],
            post_roll_bytes = copied[1],
            "Splice complete"
        );

        Ok(SpliceReport {
            destination,
            pre_roll_bytes: copied[0],
            post_roll_bytes: copied[1],
        })
    }

    /// Copy `input` onto `writer`. Read-side problems yield a short copy;
    /// write-side problems are errors.
    fn append<W: Write>(
        &self,
        input: &Path,
        writer: &mut W,
        chunk: &mut [u8],
        destination: &Path,
    ) -> Result<CopyResult, SpliceError> {
        let (mut file, expected) = match File::open(input).and_then(|f| {
            let len = f.metadata()?.len();
            Ok((f, len))
        }) {
            Ok(opened) => opened,
            Err(e) => {
                warn!(path = %input.display(), error = %e, "Splice input unavailable");
                return Ok(CopyResult::Short { copied: 0 });
            }
        };

        let mut copied = 0u64;
        loop {
            let n = match file.read(chunk) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(path = %input.display(), copied = copied, error = %e, "Splice input read failed");
                    return Ok(CopyResult::Short { copied });
                }
            };
            writer
                .write_all(&chunk[..n])
                .map_err(|source| SpliceError::Write {
                    path: destination.to_path_buf(),
                    source,
                })?;
            copied += n as u64;
        }

        if copied < expected {
            warn!(
                path = %input.display(),
                copied = copied,
                expected = expected,
                "Splice input shorter than its metadata"
            );
            return Ok(CopyResult::Short { copied });
        }

        debug!(path = %input.display(), bytes = copied, "Splice input copied");
        Ok(CopyResult::Complete(copied))
    }
}
