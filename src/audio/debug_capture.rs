//! Optional WAV tap of each session's resampled audio
//!
//! Config-gated debugging aid: when enabled, every 16 kHz mono frame that
//! goes to the backend is also written to a timestamped WAV file under the
//! data directory, keeping only the most recent few sessions. Write errors
//! are logged and disable the tap for the rest of the session.

use std::fs;
use std::path::PathBuf;

use hound::{WavSpec, WavWriter};

use super::resampler::TARGET_SAMPLE_RATE;

/// Sessions kept on disk before the oldest is removed.
pub const DEFAULT_KEEP: usize = 10;

/// Factory for per-session WAV taps.
#[derive(Debug, Clone)]
pub struct DebugCapture {
    dir: PathBuf,
    keep: usize,
}

impl DebugCapture {
    pub fn new(keep: usize) -> Self {
        let dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("talkey")
            .join("sessions");
        Self { dir, keep }
    }

    #[cfg(test)]
    fn with_dir(dir: PathBuf, keep: usize) -> Self {
        Self { dir, keep }
    }

    /// Open the tap for one session. Returns None (logged) when the file
    /// cannot be created; the session proceeds without a tap.
    pub fn begin(&self) -> Option<SessionWav> {
        if let Err(e) = fs::create_dir_all(&self.dir) {
            log::warn!("Cannot create session audio dir {:?}: {}", self.dir, e);
            return None;
        }

        if let Err(e) = cleanup_old(&self.dir, self.keep.saturating_sub(1)) {
            log::debug!("Session audio cleanup failed: {}", e);
        }

        let filename = format!("{}.wav", chrono::Local::now().format("%Y%m%d_%H%M%S%.3f"));
        let path = self.dir.join(filename);

        let spec = WavSpec {
            channels: 1,
            sample_rate: TARGET_SAMPLE_RATE,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        match WavWriter::create(&path, spec) {
            Ok(writer) => {
                log::info!("Session audio tap: {:?}", path);
                Some(SessionWav {
                    writer: Some(writer),
                    path,
                })
            }
            Err(e) => {
                log::warn!("Cannot create session WAV {:?}: {}", path, e);
                None
            }
        }
    }
}

/// Writer for one session's resampled audio.
pub struct SessionWav {
    writer: Option<WavWriter<std::io::BufWriter<fs::File>>>,
    path: PathBuf,
}

impl SessionWav {
    pub fn write(&mut self, samples: &[i16]) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        for &sample in samples {
            if let Err(e) = writer.write_sample(sample) {
                log::warn!("Session WAV write failed, tap disabled: {}", e);
                self.writer = None;
                return;
            }
        }
    }

    pub fn finish(mut self) {
        if let Some(writer) = self.writer.take() {
            if let Err(e) = writer.finalize() {
                log::warn!("Session WAV finalize failed: {}", e);
            } else {
                log::debug!("Session audio written: {:?}", self.path);
            }
        }
    }
}

impl Drop for SessionWav {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.take() {
            let _ = writer.finalize();
        }
    }
}

/// Remove the oldest WAVs beyond `keep`.
fn cleanup_old(dir: &PathBuf, keep: usize) -> std::io::Result<usize> {
    let mut entries: Vec<_> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.path()
                .extension()
                .map(|ext| ext == "wav")
                .unwrap_or(false)
        })
        .collect();

    if entries.len() <= keep {
        return Ok(0);
    }

    entries.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());

    let to_delete = entries.len() - keep;
    let mut deleted = 0;
    for entry in entries.into_iter().take(to_delete) {
        if fs::remove_file(entry.path()).is_ok() {
            log::debug!("Removed old session audio: {:?}", entry.path());
            deleted += 1;
        }
    }
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tap_writes_a_wav_file() {
        let dir = tempfile::tempdir().unwrap();
        let capture = DebugCapture::with_dir(dir.path().to_path_buf(), 5);

        let mut wav = capture.begin().unwrap();
        wav.write(&[0i16; 320]);
        wav.write(&[100i16; 320]);
        wav.finish();

        let files: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn old_sessions_are_pruned() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..4 {
            let path = dir.path().join(format!("old_{}.wav", i));
            fs::write(&path, b"not really a wav").unwrap();
        }

        cleanup_old(&dir.path().to_path_buf(), 2).unwrap();
        let files: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(files.len(), 2);
    }
}
