//! Global push-to-talk combo detection via evdev
//!
//! Reads keyboard events directly from /dev/input/event* devices, bypassing
//! compositor-level input isolation, and emits edge events when the
//! configured combination is held down or let go. When the combo contains a
//! literal key, that key's events are kept from reaching other applications
//! by grabbing the device and re-emitting everything else through a virtual
//! device.
//!
//! # Requirements
//! - User must be in the `input` group: `sudo usermod -aG input $USER`
//! - Log out and back in after adding to group

mod detector;
pub mod manager;

pub use detector::{ComboEdge, ComboTracker, KeyVerdict};
pub use manager::{check_permissions, find_keyboards, ComboMonitor};

use evdev::Key;

/// A push-to-talk combination: required modifiers plus, optionally, one
/// literal key. The combo engages while all required keys are held at once.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyCombo {
    pub ctrl: bool,
    pub alt: bool,
    pub shift: bool,
    pub meta: bool,
    pub key: Option<Key>,
}

impl KeyCombo {
    /// Default combo: Ctrl+Alt+Space
    pub fn default_push_to_talk() -> Self {
        Self {
            ctrl: true,
            alt: true,
            shift: false,
            meta: false,
            key: Some(Key::KEY_SPACE),
        }
    }

    /// A combo with nothing required would be engaged permanently.
    pub fn is_valid(&self) -> bool {
        self.ctrl || self.alt || self.shift || self.meta || self.key.is_some()
    }
}

impl std::fmt::Display for KeyCombo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut parts: Vec<String> = Vec::new();
        if self.ctrl {
            parts.push("Ctrl".to_string());
        }
        if self.alt {
            parts.push("Alt".to_string());
        }
        if self.shift {
            parts.push("Shift".to_string());
        }
        if self.meta {
            parts.push("Meta".to_string());
        }
        if let Some(key) = self.key {
            let name = format!("{:?}", key);
            parts.push(name.trim_start_matches("KEY_").to_string());
        }
        write!(f, "{}", parts.join("+"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combo_display() {
        assert_eq!(KeyCombo::default_push_to_talk().to_string(), "Ctrl+Alt+SPACE");

        let modifiers_only = KeyCombo {
            ctrl: true,
            alt: false,
            shift: false,
            meta: true,
            key: None,
        };
        assert_eq!(modifiers_only.to_string(), "Ctrl+Meta");
    }

    #[test]
    fn empty_combo_is_invalid() {
        let empty = KeyCombo {
            ctrl: false,
            alt: false,
            shift: false,
            meta: false,
            key: None,
        };
        assert!(!empty.is_valid());
        assert!(KeyCombo::default_push_to_talk().is_valid());
    }
}
