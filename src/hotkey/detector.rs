//! Combo edge detection with modifier state tracking
//!
//! Modifier keys and the combo's literal key arrive as independent events, so
//! the tracker keeps per-key state and recomputes "all required keys held" on
//! every relevant event. Edges fire exactly once per engagement; repeated
//! events while already engaged are no-ops.

use evdev::Key;

use super::KeyCombo;

/// Tracks the current state of modifier keys
#[derive(Debug, Default)]
struct ModifierState {
    left_ctrl: bool,
    right_ctrl: bool,
    left_alt: bool,
    right_alt: bool,
    left_shift: bool,
    right_shift: bool,
    left_meta: bool,
    right_meta: bool,
}

impl ModifierState {
    fn update(&mut self, key: Key, pressed: bool) {
        match key {
            Key::KEY_LEFTCTRL => self.left_ctrl = pressed,
            Key::KEY_RIGHTCTRL => self.right_ctrl = pressed,
            Key::KEY_LEFTALT => self.left_alt = pressed,
            Key::KEY_RIGHTALT => self.right_alt = pressed,
            Key::KEY_LEFTSHIFT => self.left_shift = pressed,
            Key::KEY_RIGHTSHIFT => self.right_shift = pressed,
            Key::KEY_LEFTMETA => self.left_meta = pressed,
            Key::KEY_RIGHTMETA => self.right_meta = pressed,
            _ => {}
        }
    }

    fn ctrl(&self) -> bool {
        self.left_ctrl || self.right_ctrl
    }

    fn alt(&self) -> bool {
        self.left_alt || self.right_alt
    }

    fn shift(&self) -> bool {
        self.left_shift || self.right_shift
    }

    fn meta(&self) -> bool {
        self.left_meta || self.right_meta
    }
}

/// Combo state change produced by one key event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComboEdge {
    /// All required keys just became held
    Engaged,
    /// A required key was released while engaged
    Released,
}

/// What to do with the event that was just processed.
///
/// `Suppress` is only ever returned for the combo's literal key; modifiers
/// and unrelated keys always pass through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyVerdict {
    Forward,
    Suppress,
}

/// Per-device combo tracker.
pub struct ComboTracker {
    combo: KeyCombo,
    modifiers: ModifierState,
    literal_held: bool,
    engaged: bool,
}

impl ComboTracker {
    pub fn new(combo: KeyCombo) -> Self {
        Self {
            combo,
            modifiers: ModifierState::default(),
            literal_held: false,
            engaged: false,
        }
    }

    pub fn is_engaged(&self) -> bool {
        self.engaged
    }

    /// Process one key event.
    ///
    /// `value`: 0 = released, 1 = pressed, 2 = repeat. Repeats never change
    /// state and never fire edges, but the literal key's repeats are still
    /// suppressed while the combo is engaged.
    pub fn process(&mut self, key: Key, value: i32) -> (Option<ComboEdge>, KeyVerdict) {
        if value != 2 {
            let pressed = value == 1;
            self.modifiers.update(key, pressed);
            if Some(key) == self.combo.key {
                self.literal_held = pressed;
            }
        }

        let held = self.all_required_held();
        let edge = if held && !self.engaged {
            self.engaged = true;
            Some(ComboEdge::Engaged)
        } else if !held && self.engaged {
            self.engaged = false;
            Some(ComboEdge::Released)
        } else {
            None
        };

        // The literal key is suppressed while the combo is engaged, including
        // the press that completes it and the release that breaks it.
        let verdict = if Some(key) == self.combo.key && (self.engaged || edge.is_some()) {
            KeyVerdict::Suppress
        } else {
            KeyVerdict::Forward
        };

        (edge, verdict)
    }

    fn all_required_held(&self) -> bool {
        (!self.combo.ctrl || self.modifiers.ctrl())
            && (!self.combo.alt || self.modifiers.alt())
            && (!self.combo.shift || self.modifiers.shift())
            && (!self.combo.meta || self.modifiers.meta())
            && (self.combo.key.is_none() || self.literal_held)
    }
}
