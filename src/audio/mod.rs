//! Microphone capture and format conversion
//!
//! `capture` owns the device and produces native-format frames; `resampler`
//! turns them into the fixed 16 kHz mono i16 frames every backend consumes.

pub mod capture;
pub mod debug_capture;
pub mod resampler;

pub use capture::{AudioError, AudioFrame, AudioInput, CaptureConfig, CpalInput, InputFormat};
pub use debug_capture::{DebugCapture, SessionWav};
pub use resampler::{FrameResampler, FRAME_SAMPLES, TARGET_SAMPLE_RATE};
