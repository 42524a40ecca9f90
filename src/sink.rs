//! Text delivery
//!
//! The core hands its final transcript to a `TextSink` and does not care how
//! the text reaches the target application. The shipped sink copies to the
//! clipboard; typing/paste synthesis belongs to external integrations.

/// How the sink delivered the text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMethod {
    Typed,
    Pasted,
    Clipboard,
}

#[derive(Debug, Clone)]
pub enum SinkError {
    /// The delivery mechanism is not available on this system
    Unavailable(String),
    Failed(String),
}

impl std::fmt::Display for SinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SinkError::Unavailable(e) => write!(f, "Text sink unavailable: {}", e),
            SinkError::Failed(e) => write!(f, "Text delivery failed: {}", e),
        }
    }
}

impl std::error::Error for SinkError {}

/// Consumer of the session's final text.
///
/// Called off the control loop; a sink may block (clipboard ownership,
/// keystroke pacing) without holding up the next session.
pub trait TextSink: Send + Sync {
    fn dispatch(&self, text: &str, auto_submit: bool) -> Result<DispatchMethod, SinkError>;
}

/// Clipboard delivery via arboard.
#[derive(Debug, Default)]
pub struct ClipboardSink;

impl ClipboardSink {
    pub fn new() -> Self {
        Self
    }
}

impl TextSink for ClipboardSink {
    fn dispatch(&self, text: &str, auto_submit: bool) -> Result<DispatchMethod, SinkError> {
        let mut clipboard =
            arboard::Clipboard::new().map_err(|e| SinkError::Unavailable(e.to_string()))?;

        clipboard
            .set_text(text.to_string())
            .map_err(|e| SinkError::Failed(e.to_string()))?;

        log::info!("Copied {} chars to clipboard", text.chars().count());

        if auto_submit {
            // A clipboard cannot press Enter for the user
            log::debug!("Auto-submit requested but the clipboard sink cannot submit");
        }

        // On Linux/X11 the clipboard dies with its owner; hold it until
        // another application takes ownership.
        #[cfg(target_os = "linux")]
        {
            use std::time::{Duration, Instant};
            let start = Instant::now();
            let timeout = Duration::from_secs(30);

            while start.elapsed() < timeout {
                std::thread::sleep(Duration::from_millis(100));
                match clipboard.get_text() {
                    Ok(current) if current == text => {}
                    _ => {
                        log::debug!("Clipboard ownership transferred");
                        break;
                    }
                }
            }
        }

        Ok(DispatchMethod::Clipboard)
    }
}
