//! Conversion of native-format frames to the backend audio format
//!
//! Every backend consumes mono 16-bit PCM at 16 kHz, delivered in fixed
//! 20 ms frames. The resampler takes whatever the device produces, mixes it
//! down to mono, rate-converts with rubato when needed, and emits i16 frames.
//! A change of input format mid-session rebuilds the converter transparently.
//! Conversion failures drop the frame with a log line; they never end the
//! session.

use rubato::{FftFixedIn, Resampler};

use super::capture::{AudioFrame, InputFormat};

/// Fixed target format shared by all backends.
pub const TARGET_SAMPLE_RATE: u32 = 16_000;

/// Samples per emitted frame: 20 ms at 16 kHz.
pub const FRAME_SAMPLES: usize = 320;

/// Input chunk size fed to rubato per process call.
const RESAMPLER_CHUNK: usize = 1024;

/// Stateful converter from arbitrary `AudioFrame`s to fixed 20 ms i16 frames.
pub struct FrameResampler {
    format: Option<InputFormat>,
    converter: Option<FftFixedIn<f32>>,
    /// Converter construction failed for the current format; frames are
    /// dropped until the format changes.
    broken: bool,
    in_buf: Vec<f32>,
    pending: Vec<f32>,
}

impl FrameResampler {
    pub fn new() -> Self {
        Self {
            format: None,
            converter: None,
            broken: false,
            in_buf: Vec::with_capacity(RESAMPLER_CHUNK),
            pending: Vec::with_capacity(FRAME_SAMPLES),
        }
    }

    /// Convert one captured frame, handing each completed 320-sample i16
    /// frame to `emit`.
    pub fn push(&mut self, frame: &AudioFrame, emit: &mut impl FnMut(Vec<i16>)) {
        let format = InputFormat {
            sample_rate: frame.sample_rate,
            channels: frame.channels,
        };
        if self.format != Some(format) {
            self.rebuild(format);
        }
        if self.broken {
            log::debug!("Resampler unavailable for {:?}; frame dropped", format);
            return;
        }

        let mono = mixdown(&frame.samples, frame.channels);

        if self.converter.is_none() {
            // Already at the target rate
            self.emit_frames(&mono, emit);
            return;
        }

        let mut src: &[f32] = &mono;
        while !src.is_empty() {
            let space = RESAMPLER_CHUNK - self.in_buf.len();
            let take = space.min(src.len());
            self.in_buf.extend_from_slice(&src[..take]);
            src = &src[take..];

            if self.in_buf.len() == RESAMPLER_CHUNK {
                let converted = self
                    .converter
                    .as_mut()
                    .expect("converter present when rate differs")
                    .process(&[&self.in_buf[..]], None);
                self.in_buf.clear();
                match converted {
                    Ok(mut out) => {
                        let out = out.swap_remove(0);
                        self.emit_frames(&out, emit);
                    }
                    Err(e) => log::warn!("Sample rate conversion failed; chunk dropped: {}", e),
                }
            }
        }
    }

    /// Flush buffered input and any partial frame (zero-padded) at session
    /// end.
    pub fn finish(&mut self, emit: &mut impl FnMut(Vec<i16>)) {
        if self.converter.is_some() && !self.in_buf.is_empty() {
            self.in_buf.resize(RESAMPLER_CHUNK, 0.0);
            let converted = self
                .converter
                .as_mut()
                .expect("checked above")
                .process(&[&self.in_buf[..]], None);
            self.in_buf.clear();
            match converted {
                Ok(mut out) => {
                    let out = out.swap_remove(0);
                    self.emit_frames(&out, emit);
                }
                Err(e) => log::warn!("Final conversion failed; tail dropped: {}", e),
            }
        }

        if !self.pending.is_empty() {
            self.pending.resize(FRAME_SAMPLES, 0.0);
            let frame: Vec<i16> = self.pending.iter().map(|&s| to_i16(s)).collect();
            emit(frame);
            self.pending.clear();
        }
    }

    fn rebuild(&mut self, format: InputFormat) {
        if let Some(old) = self.format {
            log::info!("Input format changed {:?} -> {:?}; rebuilding converter", old, format);
        }
        self.format = Some(format);
        self.in_buf.clear();
        self.broken = false;

        if format.sample_rate == TARGET_SAMPLE_RATE {
            self.converter = None;
            return;
        }

        match FftFixedIn::<f32>::new(
            format.sample_rate as usize,
            TARGET_SAMPLE_RATE as usize,
            RESAMPLER_CHUNK,
            1,
            1,
        ) {
            Ok(converter) => self.converter = Some(converter),
            Err(e) => {
                log::warn!(
                    "Cannot convert {} Hz to {} Hz: {}; audio will be dropped",
                    format.sample_rate,
                    TARGET_SAMPLE_RATE,
                    e
                );
                self.converter = None;
                self.broken = true;
            }
        }
    }

    fn emit_frames(&mut self, mut data: &[f32], emit: &mut impl FnMut(Vec<i16>)) {
        while !data.is_empty() {
            let space = FRAME_SAMPLES - self.pending.len();
            let take = space.min(data.len());
            self.pending.extend_from_slice(&data[..take]);
            data = &data[take..];

            if self.pending.len() == FRAME_SAMPLES {
                let frame: Vec<i16> = self.pending.iter().map(|&s| to_i16(s)).collect();
                emit(frame);
                self.pending.clear();
            }
        }
    }
}

impl Default for FrameResampler {
    fn default() -> Self {
        Self::new()
    }
}

/// Average across interleaved channels.
fn mixdown(samples: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    let channels = channels as usize;
    samples
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

fn to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}
