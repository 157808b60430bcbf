use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use crate::config::Config;
use crate::validate::normalize_url;

// ============================================================================
// Known Script Registry (url -> expected sha256)
// ============================================================================

/// One pinned script as stored on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct KnownScript {
    pub(crate) url: String,
    pub(crate) hash: String,
}

/// Read-only lookup table of known-good script digests.
///
/// The persisted form is an ordered JSON list; lookups go through a map keyed
/// by normalised URL. Later entries for the same URL win.
#[derive(Debug, Clone, Default)]
pub(crate) struct KnownScriptRegistry {
    entries: Vec<KnownScript>,
    index: HashMap<String, String>,
}

impl KnownScriptRegistry {
    pub(crate) fn default_path() -> Result<PathBuf> {
        Ok(Config::config_dir()?.join("known_scripts.json"))
    }

    pub(crate) fn from_entries(entries: Vec<KnownScript>) -> Result<Self> {
        let mut registry = Self::default();
        for entry in entries {
            registry.insert(entry)?;
        }
        Ok(registry)
    }

    /// Load from disk. A missing or blank file is an empty registry; a
    /// malformed one is an error.
    pub(crate) fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no registry file, starting empty");
            return Ok(Self::default());
        }
        let data = fs::read_to_string(path)
            .with_context(|| format!("Failed to read registry {}", path.display()))?;
        if data.trim().is_empty() {
            return Ok(Self::default());
        }
        let entries: Vec<KnownScript> = serde_json::from_str(&data)
            .with_context(|| format!("Failed to parse registry {}", path.display()))?;
        let registry = Self::from_entries(entries)
            .with_context(|| format!("Invalid entry in registry {}", path.display()))?;
        tracing::debug!(entries = registry.len(), path = %path.display(), "loaded registry");
        Ok(registry)
    }

    /// Atomic write: temp file in the same directory, then rename.
    pub(crate) fn save(&self, path: &Path) -> Result<()> {
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)?;

        let data = serde_json::to_string_pretty(&self.entries)?;
        let mut temp_file = NamedTempFile::new_in(dir)?;
        temp_file.write_all(data.as_bytes())?;
        temp_file.write_all(b"\n")?;
        temp_file
            .persist(path)
            .with_context(|| format!("Failed to write registry {}", path.display()))?;
        Ok(())
    }

    pub(crate) fn len(&self) -> usize {
        self.index.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub(crate) fn entries(&self) -> &[KnownScript] {
        &self.entries
    }

    /// Expected digest for a URL, lowercase hex.
    pub(crate) fn expected_digest(&self, url: &str) -> Option<&str> {
        let key = normalize_url(url)?;
        self.index.get(&key).map(String::as_str)
    }

    pub(crate) fn insert(&mut self, entry: KnownScript) -> Result<()> {
        let key = normalize_url(&entry.url)
            .with_context(|| format!("Invalid registry URL: {}", entry.url))?;
        let hash = normalize_digest(&entry.hash)
            .with_context(|| format!("Invalid sha256 digest for {}", entry.url))?;

        self.entries.retain(|e| normalize_url(&e.url).as_deref() != Some(key.as_str()));
        self.entries.push(KnownScript {
            url: key.clone(),
            hash: hash.clone(),
        });
        self.index.insert(key, hash);
        Ok(())
    }

    pub(crate) fn remove(&mut self, url: &str) -> bool {
        let Some(key) = normalize_url(url) else {
            return false;
        };
        self.entries.retain(|e| normalize_url(&e.url).as_deref() != Some(key.as_str()));
        self.index.remove(&key).is_some()
    }
}

/// Lowercase a 64-char hex SHA-256; `None` if it is not one.
pub(crate) fn normalize_digest(hash: &str) -> Option<String> {
    let hash = hash.trim();
    if hash.len() == 64 && hash.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(hash.to_ascii_lowercase())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH_A: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";
    const HASH_B: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    fn entry(url: &str, hash: &str) -> KnownScript {
        KnownScript {
            url: url.to_string(),
            hash: hash.to_string(),
        }
    }

    #[test]
    fn test_lookup_normalizes_url_and_case() {
        let registry = KnownScriptRegistry::from_entries(vec![entry(
            "https://Get.Example.com/install.sh",
            &HASH_A.to_uppercase(),
        )])
        .unwrap();
        assert_eq!(
            registry.expected_digest("https://get.example.com/install.sh"),
            Some(HASH_A)
        );
        assert!(registry.expected_digest("https://get.example.com/other.sh").is_none());
    }

    #[test]
    fn test_later_duplicate_wins() {
        let registry = KnownScriptRegistry::from_entries(vec![
            entry("https://a.example/x.sh", HASH_A),
            entry("https://a.example/x.sh", HASH_B),
        ])
        .unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.entries().len(), 1);
        assert_eq!(registry.expected_digest("https://a.example/x.sh"), Some(HASH_B));
    }

    #[test]
    fn test_rejects_bad_entries() {
        assert!(KnownScriptRegistry::from_entries(vec![entry("not a url", HASH_A)]).is_err());
        assert!(
            KnownScriptRegistry::from_entries(vec![entry("https://a.example/x.sh", "abc123")])
                .is_err()
        );
    }

    #[test]
    fn test_normalize_digest() {
        assert_eq!(normalize_digest(&format!(" {} ", HASH_A.to_uppercase())).as_deref(), Some(HASH_A));
        assert!(normalize_digest("zz").is_none());
        assert!(normalize_digest(&"g".repeat(64)).is_none());
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let registry = KnownScriptRegistry::load(&dir.path().join("none.json")).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_load_malformed_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(KnownScriptRegistry::load(&path).is_err());
    }

    #[test]
    fn test_save_and_load_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("known.json");
        let mut registry = KnownScriptRegistry::default();
        registry.insert(entry("https://b.example/x.sh", HASH_B)).unwrap();
        registry.insert(entry("https://a.example/x.sh", HASH_A)).unwrap();
        registry.save(&path).unwrap();

        let loaded = KnownScriptRegistry::load(&path).unwrap();
        let urls: Vec<&str> = loaded.entries().iter().map(|e| e.url.as_str()).collect();
        assert_eq!(urls, vec!["https://b.example/x.sh", "https://a.example/x.sh"]);
    }

    #[test]
    fn test_remove() {
        let mut registry =
            KnownScriptRegistry::from_entries(vec![entry("https://a.example/x.sh", HASH_A)]).unwrap();
        assert!(registry.remove("https://a.example/x.sh"));
        assert!(!registry.remove("https://a.example/x.sh"));
        assert!(registry.is_empty());
        assert!(registry.entries().is_empty());
    }

    #[test]
    fn test_persisted_form_is_url_hash_list() {
        let json = format!(r#"[{{"url":"https://a.example/x.sh","hash":"{}"}}]"#, HASH_A);
        let entries: Vec<KnownScript> = serde_json::from_str(&json).unwrap();
        assert_eq!(entries[0].hash, HASH_A);
    }
}
