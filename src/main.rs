use talkey::{App, AppConfig};

#[tokio::main]
async fn main() {
    // Load .env file if present (for development convenience)
    // Silently ignore if not found - production uses system env vars
    let _ = dotenvy::dotenv();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = AppConfig::load();
    if let Err(e) = App::new(config).run().await {
        log::error!("{}", e);
        std::process::exit(1);
    }
}
