use anyhow::{Context, Result};
use colored::*;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use crate::engine::DEFAULT_MAX_DEPTH;
use crate::fetch::DEFAULT_MAX_CONCURRENT_FETCHES;

// ============================================================================
// Configuration
// ============================================================================

const KEYRING_SERVICE: &str = "vetscript";
pub(crate) const KEYRING_SENTINEL: &str = "keyring";
pub(crate) const OLLAMA_NO_KEY: &str = "ollama-no-key";
pub(crate) const API_KEY_ENV: &str = "VETSCRIPT_API_KEY";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Config {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) azure_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) azure_deployment: Option<String>,
    /// Known-script registry file; defaults to ~/.vetscript/known_scripts.json
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) registry_path: Option<PathBuf>,
    #[serde(default = "default_max_depth")]
    pub(crate) max_depth: usize,
    #[serde(default = "default_max_concurrent_fetches")]
    pub(crate) max_concurrent_fetches: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) log_level: Option<String>,
}

fn default_max_depth() -> usize {
    DEFAULT_MAX_DEPTH
}

fn default_max_concurrent_fetches() -> usize {
    DEFAULT_MAX_CONCURRENT_FETCHES
}

impl Default for Config {
    fn default() -> Self {
        Self {
            provider: None,
            api_key: None,
            model: None,
            azure_endpoint: None,
            azure_deployment: None,
            registry_path: None,
            max_depth: DEFAULT_MAX_DEPTH,
            max_concurrent_fetches: DEFAULT_MAX_CONCURRENT_FETCHES,
            log_level: None,
        }
    }
}

impl Config {
    pub(crate) fn config_dir() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Could not find home directory")?;
        Ok(home.join(".vetscript"))
    }

    pub(crate) fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load the config file; a missing file yields defaults.
    pub(crate) fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub(crate) fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub(crate) fn registry_path(&self) -> Result<PathBuf> {
        match &self.registry_path {
            Some(path) => Ok(path.clone()),
            None => crate::registry::KnownScriptRegistry::default_path(),
        }
    }

    /// Resolve the API key: env var, then keyring sentinel, then plaintext.
    pub(crate) fn resolve_api_key(&self, provider: &str) -> Result<String> {
        if let Ok(key) = std::env::var(API_KEY_ENV) {
            if !key.is_empty() {
                return Ok(key);
            }
        }

        match self.api_key.as_deref() {
            Some(KEYRING_SENTINEL) => load_api_key_keyring(provider).with_context(|| {
                format!(
                    "API key is stored in OS keyring but could not be loaded. \
                     Set {} or run 'vetscript login' again",
                    API_KEY_ENV
                )
            }),
            Some(key) if !key.is_empty() => {
                if key != OLLAMA_NO_KEY && keyring::Entry::new(KEYRING_SERVICE, provider).is_ok() {
                    eprintln!(
                        "{} API key is stored in plaintext config file. \
                         Run '{}' to migrate to the OS keyring, or set {} env var.",
                        "⚠".yellow(),
                        "vetscript login".green().bold(),
                        API_KEY_ENV.cyan()
                    );
                }
                Ok(key.to_string())
            }
            _ => anyhow::bail!(
                "No API key configured. Run {} or set {} (or use --offline).",
                "vetscript login".green().bold(),
                API_KEY_ENV
            ),
        }
    }

    pub(crate) fn save(&self) -> Result<()> {
        let dir = Self::config_dir()?;
        let content = toml::to_string_pretty(self)?;
        write_private_file(&dir, &Self::config_path()?, content.as_bytes())
    }
}

/// Atomic write of a file only the owner can read, in a directory only the
/// owner can enter.
pub(crate) fn write_private_file(dir: &Path, path: &Path, content: &[u8]) -> Result<()> {
    fs::create_dir_all(dir)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;

        let mut temp_file = NamedTempFile::new_in(dir)?;
        // Permissions before content
        fs::set_permissions(temp_file.path(), fs::Permissions::from_mode(0o600))?;
        temp_file.write_all(content)?;
        temp_file
            .persist(path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
    }

    #[cfg(not(unix))]
    {
        let mut temp_file = NamedTempFile::new_in(dir)?;
        temp_file.write_all(content)?;
        temp_file
            .persist(path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        eprintln!(
            "{} File permissions are not restricted on this platform. Consider using the {} environment variable instead.",
            "⚠".yellow(),
            API_KEY_ENV
        );
    }

    Ok(())
}

pub(crate) fn store_api_key_keyring(provider: &str, key: &str) -> Result<()> {
    let entry = keyring::Entry::new(KEYRING_SERVICE, provider).context("Failed to create keyring entry")?;
    entry
        .set_password(key)
        .context("Failed to store API key in OS keyring")?;
    Ok(())
}

pub(crate) fn load_api_key_keyring(provider: &str) -> Result<String> {
    let entry = keyring::Entry::new(KEYRING_SERVICE, provider).context("Failed to create keyring entry")?;
    entry
        .get_password()
        .context("Failed to load API key from OS keyring")
}
