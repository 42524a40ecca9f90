//! talkey - push-to-talk dictation
//!
//! Hold a key combo, speak, release; the transcript lands on the text sink.
//! The crate wires four independent event sources - a global combo monitor,
//! the microphone, a pluggable transcription backend, and a text sink - into
//! one race-free session driven by a single control-plane loop.

pub mod audio;
pub mod backend;
pub mod config;
pub mod credentials;
pub mod hotkey;
pub mod orchestrator;
pub mod permissions;
pub mod sink;
pub mod state_machine;

pub use config::AppConfig;
pub use orchestrator::{Orchestrator, OrchestratorHandle};
pub use state_machine::{ControlEvent, SessionState};

use std::sync::Arc;

use audio::{CaptureConfig, CpalInput, DebugCapture};
use backend::{
    BackendKind, LocalBackend, RemoteBackend, RemoteConfig, SpeechEngine, TranscriptionBackend,
    WhisperEngine,
};
use credentials::{CredentialProvider, KeyringCredentials};
use hotkey::ComboMonitor;
use orchestrator::{BackendFactory, Deps, Options, Timeouts};
use permissions::{PermissionProvider, SystemPermissions};
use sink::{ClipboardSink, TextSink};

/// Production backend factory: the remote provider reads the credential at
/// session start, the local provider shares one loaded speech engine.
struct ProviderFactory {
    remote: RemoteConfig,
    credentials: Arc<dyn CredentialProvider>,
    engine: Arc<dyn SpeechEngine>,
}

impl BackendFactory for ProviderFactory {
    fn create(&self, kind: BackendKind) -> Box<dyn TranscriptionBackend> {
        match kind {
            BackendKind::Remote => Box::new(RemoteBackend::new(
                self.remote.clone(),
                self.credentials.api_key(),
            )),
            BackendKind::Local => Box::new(LocalBackend::new(Arc::clone(&self.engine))),
        }
    }
}

/// The WebSocket backend needs a process-wide TLS crypto provider.
fn init_rustls_crypto_provider() {
    if rustls::crypto::CryptoProvider::get_default().is_some() {
        return;
    }

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        log::warn!("rustls CryptoProvider was already installed");
    }
}

/// The assembled application: configuration plus the production
/// collaborators.
pub struct App {
    config: AppConfig,
}

impl App {
    pub fn new(config: AppConfig) -> Self {
        Self { config }
    }

    /// Run until Ctrl-C.
    pub async fn run(self) -> Result<(), String> {
        init_rustls_crypto_provider();

        let config = self.config;
        let combo = config.combo.to_combo();

        let credentials: Arc<dyn CredentialProvider> = Arc::new(KeyringCredentials::new());
        let permissions: Arc<dyn PermissionProvider> =
            Arc::new(SystemPermissions::new(config.local.model_path.clone()));
        let sink: Arc<dyn TextSink> = Arc::new(ClipboardSink::new());

        let engine: Arc<dyn SpeechEngine> = match &config.local.model_path {
            Some(path) => match WhisperEngine::load(path, config.local.language.clone()) {
                Ok(engine) => Arc::new(engine),
                Err(e) => {
                    log::warn!("Speech model failed to load ({}); local provider unavailable", e);
                    Arc::new(WhisperEngine::unloaded())
                }
            },
            None => {
                log::info!("No speech model configured; local provider unavailable");
                Arc::new(WhisperEngine::unloaded())
            }
        };

        let capture = Box::new(CpalInput::new(CaptureConfig {
            device_name: config.input_device.clone(),
            allow_passthrough: config.allow_passthrough,
        }));

        let factory = Box::new(ProviderFactory {
            remote: config.remote.clone(),
            credentials: Arc::clone(&credentials),
            engine,
        });

        let options = Options {
            provider: config.provider,
            auto_submit: config.auto_submit,
            timeouts: Timeouts::default(),
            debug_capture: config
                .debug_capture
                .then(|| DebugCapture::new(config.debug_capture_keep)),
        };

        let (orchestrator, handle) = Orchestrator::new(
            Deps {
                capture,
                factory,
                permissions,
                credentials,
                sink,
            },
            options,
        );

        let control_loop = tokio::spawn(orchestrator.run());

        let monitor =
            ComboMonitor::start(handle.sender(), combo.clone(), config.suppress_combo_keys)?;

        log::info!("talkey ready; hold {} to dictate", combo);

        tokio::signal::ctrl_c()
            .await
            .map_err(|e| format!("Failed to listen for shutdown signal: {}", e))?;
        log::info!("Interrupt received; shutting down");

        monitor.stop();
        handle.send(ControlEvent::Shutdown).await;
        let _ = control_loop.await;

        Ok(())
    }
}
