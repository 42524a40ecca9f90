//! Microphone capture via CPAL
//!
//! `CpalInput` owns the input device on a dedicated audio thread (cpal streams
//! are not Send) and hands raw frames to exactly one consumer through a
//! bounded channel. The stream callback only converts samples and calls
//! `try_send`; a full channel drops the frame rather than blocking the
//! real-time thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, SampleFormat, SampleRate, Stream, StreamConfig};
use tokio::sync::mpsc;

use super::resampler::TARGET_SAMPLE_RATE;

/// Errors that can occur while acquiring or running the microphone.
#[derive(Debug, Clone)]
pub enum AudioError {
    /// No usable input device exists
    DeviceUnavailable,
    /// The device offers no format we can capture
    NoSupportedConfig,
    StreamFailed(String),
}

impl std::fmt::Display for AudioError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AudioError::DeviceUnavailable => write!(f, "No audio input device found"),
            AudioError::NoSupportedConfig => write!(f, "No supported audio configuration"),
            AudioError::StreamFailed(e) => write!(f, "Audio stream failed: {}", e),
        }
    }
}

impl std::error::Error for AudioError {}

/// One buffer of raw PCM from the device, in its native format.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

/// The format the device is actually capturing at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

/// Port for the microphone so the orchestrator and tests stay
/// device-independent.
///
/// `start` acquires the device and begins emitting frames on `frames`;
/// `stop` releases it and invalidates the in-flight tap immediately, so no
/// frame is delivered after it returns. Both are idempotent in the sense that
/// a stop without a start, or a second stop, is a no-op.
pub trait AudioInput: Send {
    fn start(&mut self, frames: mpsc::Sender<AudioFrame>) -> Result<InputFormat, AudioError>;
    fn stop(&mut self);
}

/// Capture options.
#[derive(Debug, Clone, Default)]
pub struct CaptureConfig {
    /// Configured device name; falls back to the default device when absent
    /// or not found.
    pub device_name: Option<String>,
    /// Capture at the device's own format when it cannot do 16 kHz mono
    /// (the resampler converts downstream). When false, such devices are
    /// rejected with `NoSupportedConfig`.
    pub allow_passthrough: bool,
}

enum CaptureCmd {
    Start {
        frames: mpsc::Sender<AudioFrame>,
        live: Arc<AtomicBool>,
        reply: std_mpsc::Sender<Result<InputFormat, AudioError>>,
    },
    Stop,
    Shutdown,
}

/// Microphone input backed by a dedicated capture thread.
pub struct CpalInput {
    cmd_tx: std_mpsc::Sender<CaptureCmd>,
    live: Option<Arc<AtomicBool>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl CpalInput {
    pub fn new(config: CaptureConfig) -> Self {
        let (cmd_tx, cmd_rx) = std_mpsc::channel();
        let thread = thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || capture_thread_main(config, cmd_rx))
            .expect("failed to spawn audio capture thread");

        Self {
            cmd_tx,
            live: None,
            thread: Some(thread),
        }
    }
}

impl AudioInput for CpalInput {
    fn start(&mut self, frames: mpsc::Sender<AudioFrame>) -> Result<InputFormat, AudioError> {
        let live = Arc::new(AtomicBool::new(true));
        let (reply_tx, reply_rx) = std_mpsc::channel();

        self.cmd_tx
            .send(CaptureCmd::Start {
                frames,
                live: Arc::clone(&live),
                reply: reply_tx,
            })
            .map_err(|_| AudioError::StreamFailed("capture thread not running".to_string()))?;

        let format = reply_rx
            .recv()
            .map_err(|_| AudioError::StreamFailed("capture thread did not respond".to_string()))??;

        self.live = Some(live);
        Ok(format)
    }

    fn stop(&mut self) {
        // Flip the tap flag first so the callback delivers nothing more even
        // before the thread gets around to dropping the stream.
        if let Some(live) = self.live.take() {
            live.store(false, Ordering::SeqCst);
            let _ = self.cmd_tx.send(CaptureCmd::Stop);
        }
    }
}

impl Drop for CpalInput {
    fn drop(&mut self) {
        self.stop();
        let _ = self.cmd_tx.send(CaptureCmd::Shutdown);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

/// The capture thread owns the (non-Send) cpal stream.
fn capture_thread_main(config: CaptureConfig, cmd_rx: std_mpsc::Receiver<CaptureCmd>) {
    let mut stream: Option<Stream> = None;

    while let Ok(cmd) = cmd_rx.recv() {
        match cmd {
            CaptureCmd::Start {
                frames,
                live,
                reply,
            } => {
                // Restarting without a stop releases the previous stream
                stream.take();
                let result = open_stream(&config, frames, live).map(|(s, format)| {
                    stream = Some(s);
                    format
                });
                let _ = reply.send(result);
            }
            CaptureCmd::Stop => {
                stream.take();
            }
            CaptureCmd::Shutdown => break,
        }
    }
    log::debug!("Audio capture thread exiting");
}

fn open_stream(
    config: &CaptureConfig,
    frames: mpsc::Sender<AudioFrame>,
    live: Arc<AtomicBool>,
) -> Result<(Stream, InputFormat), AudioError> {
    let device = pick_device(config.device_name.as_deref())?;
    log::info!(
        "Using audio input device: {}",
        device.name().unwrap_or_else(|_| "Unknown".to_string())
    );

    let (stream_config, sample_format) = pick_format(&device, config.allow_passthrough)?;
    let format = InputFormat {
        sample_rate: stream_config.sample_rate.0,
        channels: stream_config.channels,
    };

    if format.sample_rate != TARGET_SAMPLE_RATE || format.channels != 1 {
        log::info!(
            "Device capturing at {} Hz / {} ch; converting to {} Hz mono downstream",
            format.sample_rate,
            format.channels,
            TARGET_SAMPLE_RATE
        );
    } else {
        log::info!("Device capturing at {} Hz mono", format.sample_rate);
    }

    let stream = match sample_format {
        SampleFormat::I16 => build_stream::<i16>(&device, &stream_config, format, frames, live),
        SampleFormat::U16 => build_stream::<u16>(&device, &stream_config, format, frames, live),
        SampleFormat::F32 => build_stream::<f32>(&device, &stream_config, format, frames, live),
        other => {
            log::warn!("Unsupported sample format {:?}", other);
            Err(AudioError::NoSupportedConfig)
        }
    }?;

    stream
        .play()
        .map_err(|e| AudioError::StreamFailed(e.to_string()))?;

    Ok((stream, format))
}

fn pick_device(configured: Option<&str>) -> Result<Device, AudioError> {
    let host = cpal::default_host();

    if let Some(name) = configured {
        let devices = host
            .input_devices()
            .map_err(|_| AudioError::DeviceUnavailable)?;
        for device in devices {
            if device.name().map(|n| n == name).unwrap_or(false) {
                return Ok(device);
            }
        }
        log::warn!("Input device {:?} not found; using default", name);
    }

    host.default_input_device()
        .ok_or(AudioError::DeviceUnavailable)
}

/// Prefer a config matching the 16 kHz mono target; otherwise fall back to
/// the device default when pass-through is allowed.
fn pick_format(
    device: &Device,
    allow_passthrough: bool,
) -> Result<(StreamConfig, SampleFormat), AudioError> {
    if let Ok(supported) = device.supported_input_configs() {
        for range in supported {
            if range.channels() == 1
                && range.min_sample_rate().0 <= TARGET_SAMPLE_RATE
                && range.max_sample_rate().0 >= TARGET_SAMPLE_RATE
                && matches!(
                    range.sample_format(),
                    SampleFormat::I16 | SampleFormat::U16 | SampleFormat::F32
                )
            {
                let cfg = range.with_sample_rate(SampleRate(TARGET_SAMPLE_RATE));
                let sample_format = cfg.sample_format();
                return Ok((cfg.into(), sample_format));
            }
        }
    }

    if !allow_passthrough {
        return Err(AudioError::NoSupportedConfig);
    }

    let default = device
        .default_input_config()
        .map_err(|_| AudioError::NoSupportedConfig)?;
    log::warn!(
        "Device cannot capture 16 kHz mono natively; passing through {} Hz / {} ch",
        default.sample_rate().0,
        default.channels()
    );
    let sample_format = default.sample_format();
    Ok((default.into(), sample_format))
}

fn build_stream<T>(
    device: &Device,
    config: &StreamConfig,
    format: InputFormat,
    frames: mpsc::Sender<AudioFrame>,
    live: Arc<AtomicBool>,
) -> Result<Stream, AudioError>
where
    T: cpal::SizedSample + Send + 'static,
    f32: FromSample<T>,
{
    let err_fn = |err| log::error!("Audio stream error: {}", err);
    let mut dropped: u64 = 0;

    let stream = device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                if !live.load(Ordering::SeqCst) {
                    return;
                }

                let samples: Vec<f32> = data.iter().map(|&s| f32::from_sample(s)).collect();
                let frame = AudioFrame {
                    samples,
                    sample_rate: format.sample_rate,
                    channels: format.channels,
                };

                if frames.try_send(frame).is_err() {
                    dropped += 1;
                    if dropped % 256 == 1 {
                        log::warn!("Frame channel full; {} frame(s) dropped so far", dropped);
                    }
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| AudioError::StreamFailed(e.to_string()))?;

    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_error_display() {
        assert_eq!(
            AudioError::DeviceUnavailable.to_string(),
            "No audio input device found"
        );
        assert!(AudioError::StreamFailed("busy".to_string())
            .to_string()
            .contains("busy"));
    }

    #[test]
    fn stop_without_start_is_a_no_op() {
        let mut input = CpalInput::new(CaptureConfig::default());
        input.stop();
        input.stop();
    }
}
