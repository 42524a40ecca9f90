//! Streaming API credential storage
//!
//! The credential lives in the OS's native secret storage (libsecret /
//! Keychain / Credential Manager), with an environment variable fallback for
//! development. Absence is reported at session start, never a crash.
//!
//! Never log the key value.

use keyring::Entry;

const SERVICE_NAME: &str = "talkey";
const API_KEY_NAME: &str = "streaming-api-key";
const API_KEY_ENV: &str = "TALKEY_API_KEY";

/// Source of the remote provider's API credential.
pub trait CredentialProvider: Send + Sync {
    /// The streaming API key, if configured.
    fn api_key(&self) -> Option<String>;
}

/// System keyring with `TALKEY_API_KEY` environment fallback.
#[derive(Debug, Default)]
pub struct KeyringCredentials;

impl KeyringCredentials {
    pub fn new() -> Self {
        Self
    }

    /// Store the API key in the keyring. Pass None to delete it.
    pub fn set_api_key(key: Option<&str>) -> Result<(), String> {
        let entry = Entry::new(SERVICE_NAME, API_KEY_NAME)
            .map_err(|e| format!("Failed to create keyring entry: {}", e))?;

        match key {
            Some(k) if !k.is_empty() => {
                entry
                    .set_password(k)
                    .map_err(|e| format!("Failed to store API key: {}", e))?;
                log::info!("Stored new streaming API key");
            }
            _ => match entry.delete_credential() {
                Ok(()) => log::info!("Deleted streaming API key"),
                Err(keyring::Error::NoEntry) => {}
                Err(e) => return Err(format!("Failed to delete API key: {}", e)),
            },
        }

        Ok(())
    }

    fn from_keyring(&self) -> Option<String> {
        let entry = match Entry::new(SERVICE_NAME, API_KEY_NAME) {
            Ok(e) => e,
            Err(e) => {
                log::warn!("Failed to create keyring entry: {}", e);
                return None;
            }
        };

        match entry.get_password() {
            Ok(key) if !key.is_empty() => Some(key),
            Ok(_) => None,
            Err(keyring::Error::NoEntry) => None,
            Err(e) => {
                log::warn!("Failed to read API key from keyring: {}", e);
                None
            }
        }
    }
}

impl CredentialProvider for KeyringCredentials {
    fn api_key(&self) -> Option<String> {
        if let Some(key) = self.from_keyring() {
            return Some(key);
        }
        match std::env::var(API_KEY_ENV) {
            Ok(key) if !key.is_empty() => {
                log::debug!("Using API key from {}", API_KEY_ENV);
                Some(key)
            }
            _ => None,
        }
    }
}

/// Returns a masked version of the key for display (e.g., "sk-...abc123").
pub fn masked(key: &str) -> String {
    if key.len() <= 8 {
        "*".repeat(key.len())
    } else {
        format!("{}...{}", &key[..3], &key[key.len() - 6..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masking_never_reveals_the_middle() {
        assert_eq!(masked("short"), "*****");
        let m = masked("sk-abcdefghijklmnop");
        assert!(m.starts_with("sk-"));
        assert!(m.contains("..."));
        assert!(!m.contains("defghij"));
    }
}
