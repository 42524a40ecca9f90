//! whisper.cpp speech engine
//!
//! Production `SpeechEngine` for the local backend, backed by whisper-rs.
//! The context is loaded once and shared; each decode gets its own state.

use std::path::Path;
use std::sync::Arc;

use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

use super::local::{EngineError, SpeechEngine};

pub struct WhisperEngine {
    context: Option<Arc<WhisperContext>>,
    language: Option<String>,
    threads: i32,
}

impl WhisperEngine {
    /// Load a ggml model from disk.
    pub fn load(model_path: &Path, language: Option<String>) -> Result<Self, EngineError> {
        let path = model_path
            .to_str()
            .ok_or_else(|| EngineError::Decode("model path is not valid UTF-8".to_string()))?;

        log::info!("Loading whisper model from {:?}", model_path);
        let context = WhisperContext::new_with_params(path, WhisperContextParameters::default())
            .map_err(|e| EngineError::Decode(format!("failed to load model: {}", e)))?;

        let threads = std::thread::available_parallelism()
            .map(|p| std::cmp::max(1, p.get() as i32 - 1))
            .unwrap_or(1);

        Ok(Self {
            context: Some(Arc::new(context)),
            language,
            threads,
        })
    }

    /// An engine with no model; `is_ready()` reports false and the backend
    /// refuses to start.
    pub fn unloaded() -> Self {
        Self {
            context: None,
            language: None,
            threads: 1,
        }
    }

    /// whisper expects f32 samples in [-1, 1]
    fn convert_samples(samples: &[i16]) -> Vec<f32> {
        samples.iter().map(|&s| s as f32 / 32768.0).collect()
    }
}

impl SpeechEngine for WhisperEngine {
    fn is_ready(&self) -> bool {
        self.context.is_some()
    }

    fn transcribe(&self, samples: &[i16]) -> Result<String, EngineError> {
        let ctx = self.context.as_ref().ok_or(EngineError::NotReady)?;

        if samples.is_empty() {
            return Ok(String::new());
        }

        let audio = Self::convert_samples(samples);

        let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
        params.set_n_threads(self.threads);
        params.set_print_progress(false);
        params.set_print_realtime(false);
        params.set_print_timestamps(false);
        params.set_suppress_non_speech_tokens(true);
        if let Some(ref lang) = self.language {
            params.set_language(Some(lang));
        }

        let mut state = ctx
            .create_state()
            .map_err(|e| EngineError::Decode(format!("failed to create state: {}", e)))?;

        state
            .full(params, &audio)
            .map_err(|e| EngineError::Decode(format!("inference failed: {}", e)))?;

        let num_segments = state
            .full_n_segments()
            .map_err(|e| EngineError::Decode(format!("failed to read segments: {}", e)))?;

        let mut text = String::new();
        for i in 0..num_segments {
            if let Ok(segment) = state.full_get_segment_text(i) {
                text.push_str(&segment);
            }
        }

        Ok(text.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unloaded_engine_is_not_ready() {
        let engine = WhisperEngine::unloaded();
        assert!(!engine.is_ready());
        assert!(matches!(
            engine.transcribe(&[0i16; 320]),
            Err(EngineError::NotReady)
        ));
    }

    #[test]
    fn sample_conversion_range() {
        let converted = WhisperEngine::convert_samples(&[0, i16::MAX, i16::MIN]);
        assert_eq!(converted[0], 0.0);
        assert!((converted[1] - 0.99997).abs() < 0.001);
        assert_eq!(converted[2], -1.0);
    }
}
