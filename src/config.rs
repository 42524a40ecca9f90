//! Application configuration
//!
//! JSON file at `<config dir>/talkey/config.json`, loaded leniently (missing
//! or unparseable files fall back to defaults) and saved atomically via a
//! temp file + rename.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::backend::{BackendKind, RemoteConfig};
use crate::hotkey::KeyCombo;

const CONFIG_FILE_NAME: &str = "config.json";

/// The push-to-talk combination as stored on disk. The literal key uses the
/// evdev name, e.g. `"KEY_SPACE"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ComboConfig {
    pub ctrl: bool,
    pub alt: bool,
    pub shift: bool,
    pub meta: bool,
    pub key: Option<String>,
}

impl Default for ComboConfig {
    fn default() -> Self {
        Self {
            ctrl: true,
            alt: true,
            shift: false,
            meta: false,
            key: Some("KEY_SPACE".to_string()),
        }
    }
}

impl ComboConfig {
    /// Resolve to a monitorable combo. An unknown key name is dropped with a
    /// warning; if that leaves the combo empty, the default takes over.
    pub fn to_combo(&self) -> KeyCombo {
        let key = self
            .key
            .as_deref()
            .and_then(|name| match name.parse::<evdev::Key>() {
                Ok(key) => Some(key),
                Err(_) => {
                    log::warn!("Unknown key name {:?} in combo config; ignoring", name);
                    None
                }
            });

        let combo = KeyCombo {
            ctrl: self.ctrl,
            alt: self.alt,
            shift: self.shift,
            meta: self.meta,
            key,
        };

        if combo.is_valid() {
            combo
        } else {
            log::warn!("Configured combo is empty; using the default");
            KeyCombo::default_push_to_talk()
        }
    }
}

/// On-device recognizer settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalModelConfig {
    /// Path to the ggml model file. Absent means the local provider cannot
    /// start.
    pub model_path: Option<PathBuf>,
    pub language: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Which transcription provider new sessions use.
    pub provider: BackendKind,

    pub combo: ComboConfig,
    pub remote: RemoteConfig,
    pub local: LocalModelConfig,

    /// Configured input device name; default device when absent.
    pub input_device: Option<String>,

    /// Capture at the device's native format when it cannot do 16 kHz mono.
    pub allow_passthrough: bool,

    /// Forwarded to the TextSink with every dispatch.
    pub auto_submit: bool,

    /// Keep the combo's literal key from reaching other applications while
    /// held.
    pub suppress_combo_keys: bool,

    /// Write each session's resampled audio to a WAV file for debugging.
    pub debug_capture: bool,
    pub debug_capture_keep: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            provider: BackendKind::Remote,
            combo: ComboConfig::default(),
            remote: RemoteConfig::default(),
            local: LocalModelConfig::default(),
            input_device: None,
            allow_passthrough: true,
            auto_submit: false,
            suppress_combo_keys: true,
            debug_capture: false,
            debug_capture_keep: crate::audio::debug_capture::DEFAULT_KEEP,
        }
    }
}

impl AppConfig {
    /// Load from the default location; any failure falls back to defaults.
    pub fn load() -> Self {
        match config_path() {
            Ok(path) => Self::load_from(&path),
            Err(e) => {
                log::warn!("Config: {}", e);
                Self::default()
            }
        }
    }

    fn load_from(path: &PathBuf) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<AppConfig>(&contents) {
                Ok(config) => config,
                Err(e) => {
                    log::warn!("Config: failed to parse {:?}: {}", path, e);
                    Self::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                log::warn!("Config: failed to read {:?}: {}", path, e);
                Self::default()
            }
        }
    }

    pub fn save(&self) -> Result<(), String> {
        self.save_to(&config_path()?)
    }

    fn save_to(&self, path: &PathBuf) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create config directory {:?}: {}", parent, e))?;
        }

        let contents = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Serialize config: {}", e))?;

        // Write to a temp file in the same directory, then rename, so a
        // crash mid-write never leaves a corrupt config behind.
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &contents)
            .map_err(|e| format!("Write temp config {:?}: {}", tmp_path, e))?;

        std::fs::rename(&tmp_path, path)
            .map_err(|e| format!("Rename temp config {:?} to {:?}: {}", tmp_path, path, e))?;
        Ok(())
    }
}

fn config_path() -> Result<PathBuf, String> {
    let dir = dirs::config_dir().ok_or_else(|| "Could not determine config directory".to_string())?;
    Ok(dir.join("talkey").join(CONFIG_FILE_NAME))
}
