//! LLM API key lookup: one reserved keyring entry. Absence is
//! surfaced as a specific error the engine can turn into an actionable
//! message rather than a generic auth failure.

use opperator_core::{Error, Result};

const SERVICE: &str = "opperator";
const ACCOUNT: &str = "anthropic-api-key";

pub fn load_api_key() -> Result<String> {
    if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
        return Ok(key);
    }

    let entry = keyring::Entry::new(SERVICE, ACCOUNT)
        .map_err(|e| Error::SecretNotFound(format!("keyring entry creation failed: {e}")))?;

    entry
        .get_password()
        .map_err(|_| Error::SecretNotFound(format!("no API key stored under {SERVICE}/{ACCOUNT}")))
}

pub fn store_api_key(key: &str) -> Result<()> {
    let entry = keyring::Entry::new(SERVICE, ACCOUNT)
        .map_err(|e| Error::SecretNotFound(format!("keyring entry creation failed: {e}")))?;
    entry
        .set_password(key)
        .map_err(|e| Error::Internal(format!("failed to store API key: {e}")))
}
