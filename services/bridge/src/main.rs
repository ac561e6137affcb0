use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::fmt::time::ChronoLocal;
use voicebridge::config::Config;
use voicebridge::credentials;
use voicebridge::routes::{self, AppState};
use voicebridge::session::GeminiLive;

#[derive(Parser)]
#[command(about = "Telephony <-> Gemini Live media relay")]
struct Cli {
    /// Override the port the HTTP listener binds to.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut config = Config::from_env().context("Failed to load application configuration")?;

    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(ChronoLocal::rfc_3339())
        .init();

    let args = Cli::parse();
    if let Some(port) = args.port {
        config.port = port;
    }

    // The AI transport reads its credential from the environment; it must be
    // in place before the listener accepts the first call.
    credentials::provision_from_env().context("Failed to provision service credential")?;

    let sessions = Arc::new(GeminiLive::new(config.gemini_config()));
    let addr = format!("{}:{}", config.host, config.port);
    let app = routes::router(AppState::new(config, sessions));

    tracing::info!("Starting relay server, listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
