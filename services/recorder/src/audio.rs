//! Audio sidecar: records the microphone to a WAV file while an alert is
//! active.
//!
//! The recording runs on a blocking worker and stops when its cancellation
//! token fires. The WAV header is rewritten with the current sizes at a fixed
//! interval and again on drop, so a file cut short by a crash still plays up
//! to the last refresh.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const WAV_HEADER_LEN: u64 = 44;
const BITS_PER_SAMPLE: u16 = 16;

/// Errors that can occur during audio capture.
#[derive(Debug, Error)]
pub enum AudioError {
    #[error("Audio device error: {0}")]
    Device(String),

    #[error("Audio file error for {path}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Audio task failed: {0}")]
    Task(String),
}

/// PCM layout of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFormat {
    fn bytes_per_second(&self) -> u64 {
        self.sample_rate as u64 * self.channels as u64 * (BITS_PER_SAMPLE / 8) as u64
    }
}

/// Microphone factory. One stream is opened per alert.
pub trait AudioInput: Send + Sync {
    fn open(&self) -> Result<Box<dyn AudioStream>, AudioError>;
}

/// An open microphone delivering interleaved signed 16-bit samples.
pub trait AudioStream: Send {
    fn format(&self) -> AudioFormat;

    /// Block until samples are available or a short timeout passes. Returns
    /// the number of samples written into `buf`, possibly zero.
    fn read(&mut self, buf: &mut [i16]) -> Result<usize, AudioError>;
}

/// Streaming 16-bit PCM WAV writer.
pub struct WavWriter {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    format: AudioFormat,
    data_bytes: u64,
}

impl WavWriter {
    pub fn create(path: &Path, format: AudioFormat) -> io::Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(&header_bytes(format, 0))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: Some(writer),
            format,
            data_bytes: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn samples_written(&self) -> u64 {
        self.data_bytes / (BITS_PER_SAMPLE / 8) as u64
    }

    pub fn duration(&self) -> Duration {
        let rate = self.format.bytes_per_second();
        if rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.data_bytes as f64 / rate as f64)
    }

    pub fn write_samples(&mut self, samples: &[i16]) -> io::Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "wav writer already finalized"))?;
        let mut raw = Vec::with_capacity(samples.len() * 2);
        for sample in samples {
            raw.extend_from_slice(&sample.to_le_bytes());
        }
        writer.write_all(&raw)?;
        self.data_bytes += raw.len() as u64;
        Ok(())
    }

    /// Rewrite the RIFF and data chunk sizes with the bytes written so far.
    pub fn refresh_header(&mut self) -> io::Result<()> {
        let data_bytes = self.data_bytes;
        let format = self.format;
        let Some(writer) = self.writer.as_mut() else {
            return Ok(());
        };
        writer.flush()?;
        let file = writer.get_mut();
        patch_sizes(file, format, data_bytes)?;
        file.seek(SeekFrom::End(0))?;
        Ok(())
    }

    /// Write the final header and sync the file. Returns samples written.
    pub fn finalize(mut self) -> io::Result<u64> {
        self.close()?;
        Ok(self.samples_written())
    }

    fn close(&mut self) -> io::Result<()> {
        if let Some(writer) = self.writer.take() {
            let mut file = writer.into_inner().map_err(|e| e.into_error())?;
            patch_sizes(&mut file, self.format, self.data_bytes)?;
            file.sync_all()?;
        }
        Ok(())
    }
}

impl Drop for WavWriter {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(path = %self.path.display(), error = %e, "Failed to finalize WAV header");
        }
    }
}

fn header_bytes(format: AudioFormat, data_bytes: u64) -> [u8; WAV_HEADER_LEN as usize] {
    let data_len = data_bytes.min(u32::MAX as u64 - 36) as u32;
    let block_align = format.channels * (BITS_PER_SAMPLE / 8);
    let byte_rate = format.sample_rate * block_align as u32;

    let mut header = [0u8; WAV_HEADER_LEN as usize];
    header[0..4].copy_from_slice(b"RIFF");
    header[4..8].copy_from_slice(&(36 + data_len).to_le_bytes());
    header[8..12].copy_from_slice(b"WAVE");
    header[12..16].copy_from_slice(b"fmt ");
    header[16..20].copy_from_slice(&16u32.to_le_bytes());
    header[20..22].copy_from_slice(&1u16.to_le_bytes()); // PCM
    header[22..24].copy_from_slice(&format.channels.to_le_bytes());
    header[24..28].copy_from_slice(&format.sample_rate.to_le_bytes());
    header[28..32].copy_from_slice(&byte_rate.to_le_bytes());
    header[32..34].copy_from_slice(&block_align.to_le_bytes());
    header[34..36].copy_from_slice(&BITS_PER_SAMPLE.to_le_bytes());
    header[36..40].copy_from_slice(b"data");
    header[40..44].copy_from_slice(&data_len.to_le_bytes());
    header
}

fn patch_sizes(file: &mut File, format: AudioFormat, data_bytes: u64) -> io::Result<()> {
    let header = header_bytes(format, data_bytes);
    file.seek(SeekFrom::Start(4))?;
    file.write_all(&header[4..8])?;
    file.seek(SeekFrom::Start(40))?;
    file.write_all(&header[40..44])?;
    Ok(())
}

/// Result of a finished audio recording.
#[derive(Debug, Clone)]
pub struct AudioSummary {
    pub path: PathBuf,
    pub samples: u64,
    pub duration: Duration,
    /// The file held no samples and was removed
    pub discarded: bool,
}

/// Settings for one sidecar run.
#[derive(Debug, Clone)]
pub struct SidecarSettings {
    /// Interleaved samples per read
    pub chunk_samples: usize,
    pub header_refresh: Duration,
}

impl Default for SidecarSettings {
    fn default() -> Self {
        Self {
            chunk_samples: 320,
            header_refresh: Duration::from_secs(1),
        }
    }
}

/// Background audio recording bound to one alert session.
pub struct AudioSidecar {
    path: PathBuf,
    cancel: CancellationToken,
    handle: JoinHandle<Result<AudioSummary, AudioError>>,
}

impl AudioSidecar {
    /// Start recording `input` into `path` on a blocking worker.
    pub fn start(input: Arc<dyn AudioInput>, path: PathBuf, settings: SidecarSettings) -> Self {
        let cancel = CancellationToken::new();
        let handle = {
            let cancel = cancel.clone();
            let path = path.clone();
            tokio::task::spawn_blocking(move || record(input.as_ref(), &path, &settings, &cancel))
        };
        info!(path = %path.display(), "Audio sidecar started");
        Self {
            path,
            cancel,
            handle,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancel the recording and wait for the worker to close the file.
    pub async fn stop(self) -> Result<AudioSummary, AudioError> {
        self.cancel.cancel();
        match self.handle.await {
            Ok(result) => result,
            Err(e) => Err(AudioError::Task(e.to_string())),
        }
    }
}

fn record(
    input: &dyn AudioInput,
    path: &Path,
    settings: &SidecarSettings,
    cancel: &CancellationToken,
) -> Result<AudioSummary, AudioError> {
    let mut stream = input.open()?;
    let format = stream.format();
    let file_err = |source: io::Error| AudioError::File {
        path: path.to_path_buf(),
        source,
    };

    let mut wav = WavWriter::create(path, format).map_err(file_err)?;
    let mut buf = vec![0i16; settings.chunk_samples.max(1)];
    let mut last_refresh = Instant::now();

    debug!(
        sample_rate = format.sample_rate,
        channels = format.channels,
        "Audio stream opened"
    );

    let mut failure = None;
    while !cancel.is_cancelled() {
        match stream.read(&mut buf) {
            Ok(0) => {}
            Ok(n) => {
                if let Err(e) = wav.write_samples(&buf[..n]) {
                    failure = Some(file_err(e));
                    break;
                }
            }
            Err(e) => {
                error!(error = %e, "Audio stream failed, closing sidecar file");
                failure = Some(e);
                break;
            }
        }

        if last_refresh.elapsed() >= settings.header_refresh {
            if let Err(e) = wav.refresh_header() {
                warn!(error = %e, "Failed to refresh WAV header");
            }
            last_refresh = Instant::now();
        }
    }

    let duration = wav.duration();
    let samples = wav.finalize().map_err(file_err)?;
    if let Some(e) = failure {
        return Err(e);
    }

    let discarded = samples == 0;
    if discarded {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove empty audio file");
        }
    }

    info!(
        path = %path.display(),
        samples = samples,
        duration_ms = duration.as_millis() as u64,
        discarded = discarded,
        "Audio sidecar stopped"
    );

    Ok(AudioSummary {
        path: path.to_path_buf(),
        samples,
        duration,
        discarded,
    })
}
