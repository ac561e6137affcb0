//! Startup provisioning of the service credential used by the AI transport.
//!
//! The credential arrives base64-encoded in an environment variable (the way
//! container platforms inject secrets), is decoded to a file, and the file
//! path is exported for the transport to pick up.

use base64::{Engine as _, engine::general_purpose};
use std::path::{Path, PathBuf};

pub const SERVICE_ACCOUNT_B64: &str = "GOOGLE_SERVICE_ACCOUNT_BASE64";
pub const APPLICATION_CREDENTIALS: &str = "GOOGLE_APPLICATION_CREDENTIALS";

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("Missing environment variable: {0}")]
    MissingVar(&'static str),
    #[error("service credential is not valid base64: {0}")]
    InvalidEncoding(#[from] base64::DecodeError),
    #[error("failed to write service credential file: {0}")]
    Io(#[from] std::io::Error),
}

/// Decodes the credential into the system temp directory and exports its
/// path. Must complete before the first AI session opens; a failure here is
/// fatal at startup.
pub fn provision_from_env() -> Result<PathBuf, CredentialError> {
    provision_into(&std::env::temp_dir())
}

pub fn provision_into(dir: &Path) -> Result<PathBuf, CredentialError> {
    let encoded = std::env::var(SERVICE_ACCOUNT_B64)
        .map_err(|_| CredentialError::MissingVar(SERVICE_ACCOUNT_B64))?;
    let decoded = general_purpose::STANDARD.decode(encoded.trim().as_bytes())?;

    let path = dir.join("service_account.json");
    std::fs::write(&path, &decoded)?;

    // Safety: runs once during startup, before any worker task exists.
    unsafe { std::env::set_var(APPLICATION_CREDENTIALS, &path) };
    tracing::info!("service credential provisioned at {}", path.display());
    Ok(path)
}
