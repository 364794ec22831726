use anyhow::{Context, Result};
use keyring::Entry;
use std::path::PathBuf;

use crate::api::{DEFAULT_LANGUAGE, DEFAULT_LLM_API_URL, DEFAULT_MODEL};
use crate::bible::DEFAULT_BIBLE_API_URL;

const KEYRING_SERVICE: &str = "biblechat";

// Application configuration, resolved once at startup.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub bible_api_key: String,
    pub bible_api_url: String,
    pub llm_api_key: String,
    pub llm_api_url: String,
    pub llm_model: String,
    /// ISO 639-1 code the assistant should reply in.
    pub language: String,
    pub database_path: PathBuf,
}

impl AppConfig {
    /// Builds the configuration from environment variables, with API keys
    /// falling back to the OS keyring.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            bible_api_key: get_api_key("bible", "BIBLE_API_KEY")?,
            bible_api_url: env_or("BIBLE_API_URL", DEFAULT_BIBLE_API_URL),
            llm_api_key: get_api_key("llm", "LLM_API_KEY")?,
            llm_api_url: env_or("LLM_API_URL", DEFAULT_LLM_API_URL),
            llm_model: env_or("LLM_MODEL", DEFAULT_MODEL),
            language: env_or("BIBLECHAT_LANG", DEFAULT_LANGUAGE),
            database_path: database_path(),
        })
    }
}

fn env_or(var: &str, default: &str) -> String {
    std::env::var(var)
        .ok()
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn database_path() -> PathBuf {
    if let Ok(path) = std::env::var("BIBLECHAT_DB") {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("biblechat")
        .join("biblechat.sqlite")
}

/// Retrieves the API key for `name`: the environment variable wins, then
/// the OS keyring is consulted.
pub fn get_api_key(name: &str, env_var: &str) -> Result<String> {
    if let Ok(key) = std::env::var(env_var) {
        if !key.is_empty() {
            log::debug!("Using API key for '{}' from {}", name, env_var);
            return Ok(key);
        }
    }

    let entry =
        Entry::new(KEYRING_SERVICE, name).context("Failed to create keyring entry")?;
    log::debug!("Retrieving API key for '{}' from keyring", name);
    entry.get_password().context(format!(
        "No API key for '{}'. Set {} or store one in the OS keyring.",
        name, env_var
    ))
}

/// Stores an API key in the OS keyring for later retrieval.
pub fn set_api_key_in_keyring(name: &str, api_key: &str) -> Result<()> {
    let entry = Entry::new(KEYRING_SERVICE, name)
        .context("Failed to create keyring entry for setting password")?;
    log::info!("Setting API key in keyring for '{}'", name);
    entry.set_password(api_key).context(format!(
        "Failed to set API key in keyring for '{}'",
        name
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_or_prefers_set_non_empty_values() {
        std::env::set_var("BIBLECHAT_TEST_ENV_OR", "configured");
        assert_eq!(env_or("BIBLECHAT_TEST_ENV_OR", "default"), "configured");
        std::env::remove_var("BIBLECHAT_TEST_ENV_OR");

        assert_eq!(env_or("BIBLECHAT_TEST_ENV_OR_UNSET", "default"), "default");

        std::env::set_var("BIBLECHAT_TEST_ENV_OR_EMPTY", "");
        assert_eq!(env_or("BIBLECHAT_TEST_ENV_OR_EMPTY", "default"), "default");
        std::env::remove_var("BIBLECHAT_TEST_ENV_OR_EMPTY");
    }

    #[test]
    fn database_path_honors_override() {
        std::env::set_var("BIBLECHAT_DB", "/tmp/biblechat-test.sqlite");
        assert_eq!(
            database_path(),
            PathBuf::from("/tmp/biblechat-test.sqlite")
        );
        std::env::remove_var("BIBLECHAT_DB");
    }
}
