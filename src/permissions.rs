//! OS permission gates
//!
//! The orchestrator consults these before opening a session; the monitor
//! needs the accessibility gate just to run. How the user grants them
//! (groups, prompts, settings panels) is outside the core.

use std::path::PathBuf;

/// Boolean gates the session preflight checks.
pub trait PermissionProvider: Send + Sync {
    fn microphone_granted(&self) -> bool;
    /// Only required for the on-device provider.
    fn speech_granted(&self) -> bool;
    /// Required to read global key events at all.
    fn accessibility_granted(&self) -> bool;
}

/// Gate checks against the actual system: device presence for the
/// microphone, readable input devices for accessibility, a present model
/// file for on-device speech.
pub struct SystemPermissions {
    model_path: Option<PathBuf>,
}

impl SystemPermissions {
    pub fn new(model_path: Option<PathBuf>) -> Self {
        Self { model_path }
    }
}

impl PermissionProvider for SystemPermissions {
    fn microphone_granted(&self) -> bool {
        use cpal::traits::HostTrait;
        cpal::default_host().default_input_device().is_some()
    }

    fn speech_granted(&self) -> bool {
        self.model_path.as_ref().map_or(false, |p| p.exists())
    }

    fn accessibility_granted(&self) -> bool {
        !crate::hotkey::find_keyboards().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speech_gate_tracks_model_presence() {
        let missing = SystemPermissions::new(Some(PathBuf::from("/nonexistent/model.bin")));
        assert!(!missing.speech_granted());

        let none = SystemPermissions::new(None);
        assert!(!none.speech_granted());

        let file = tempfile::NamedTempFile::new().unwrap();
        let present = SystemPermissions::new(Some(file.path().to_path_buf()));
        assert!(present.speech_granted());
    }
}
