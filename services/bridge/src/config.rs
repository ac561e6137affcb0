//! Application Configuration Module
//!
//! Centralizes the configuration for the relay service. Settings are loaded
//! from environment variables into a single struct that is shared through the
//! application state.

use crate::twilio::TWILIO_API_BASE;
use secrecy::{ExposeSecret, SecretString};
use std::env;
use tracing::Level;

/// Holds all configuration loaded from the environment.
#[derive(Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Public base URL of this service, as reachable by the telephony
    /// provider (webhooks and the media-stream socket are derived from it).
    pub public_url: String,
    pub twilio_account_sid: String,
    pub twilio_auth_token: SecretString,
    pub twilio_from_number: String,
    pub twilio_api_base: String,
    pub gemini_api_key: SecretString,
    pub gemini_model: String,
    pub log_level: Level,
}

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for {name}: {value}")]
    InvalidVar { name: &'static str, value: String },
    #[error("Invalid log level provided for RUST_LOG: {0}")]
    InvalidLogLevel(String),
}

fn require(name: &'static str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::MissingVar(name.to_string()))
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    // *   `HOST` / `PORT`: (Optional) listener address. Defaults to 0.0.0.0:8000.
    // *   `PUBLIC_URL`: (Optional) public base URL of this deployment.
    // *   `TWILIO_ACCOUNT_SID` / `TWILIO_AUTH_TOKEN` / `TWILIO_PHONE_NUMBER`: telephony credentials. Required.
    // *   `GEMINI_API_KEY`: key for the Gemini Live API. Required.
    // *   `GEMINI_MODEL`: (Optional) the speech model to use.
    // *   `RUST_LOG`: (Optional) the logging level. Defaults to "INFO".
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file. Useful for local development, ignored if missing.
        dotenvy::dotenv().ok();

        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port_str = env::var("PORT").unwrap_or_else(|_| "8000".to_string());
        let port = port_str.parse::<u16>().map_err(|_| ConfigError::InvalidVar {
            name: "PORT",
            value: port_str,
        })?;

        let public_url = env::var("PUBLIC_URL")
            .unwrap_or_else(|_| "https://your-ngrok-id.ngrok-free.app".to_string());

        let twilio_account_sid = require("TWILIO_ACCOUNT_SID")?;
        let twilio_auth_token = SecretString::from(require("TWILIO_AUTH_TOKEN")?);
        let twilio_from_number = require("TWILIO_PHONE_NUMBER")?;
        let twilio_api_base =
            env::var("TWILIO_API_BASE").unwrap_or_else(|_| TWILIO_API_BASE.to_string());

        let gemini_api_key = SecretString::from(require("GEMINI_API_KEY")?);
        let gemini_model =
            env::var("GEMINI_MODEL").unwrap_or_else(|_| "gemini-2.0-flash-exp".to_string());

        // Configure logging level from RUST_LOG, with a sensible default.
        let log_level_str = env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str
            .parse::<Level>()
            .map_err(|_| ConfigError::InvalidLogLevel(log_level_str))?;

        Ok(Self {
            host,
            port,
            public_url,
            twilio_account_sid,
            twilio_auth_token,
            twilio_from_number,
            twilio_api_base,
            gemini_api_key,
            gemini_model,
            log_level,
        })
    }

    /// WebSocket URL the provider should open the media stream against.
    pub fn stream_url(&self) -> String {
        let base = self.public_url.trim_end_matches('/');
        let base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        format!("{base}/twilio-audio")
    }

    /// URL the provider posts stream status callbacks to.
    pub fn callback_url(&self) -> String {
        format!("{}/twilio-callback", self.public_url.trim_end_matches('/'))
    }

    /// URL the provider fetches the connection document from.
    pub fn voice_url(&self) -> String {
        format!("{}/voice", self.public_url.trim_end_matches('/'))
    }

    /// Client configuration for the speech session, derived from this config.
    pub fn gemini_config(&self) -> gemini_live::Config {
        let model = if self.gemini_model.starts_with("models/") {
            self.gemini_model.clone()
        } else {
            format!("models/{}", self.gemini_model)
        };
        gemini_live::Config::builder()
            .with_api_key(self.gemini_api_key.expose_secret())
            .with_model(&model)
            .build()
    }
}
