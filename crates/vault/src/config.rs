//! Vault settings
//!
//! Stored as JSON at `~/.config/mailvault/settings.json`; the location
//! can be overridden through the environment for tests and scripted
//! runs. Every field is optional so the CLI can override any of them.
//! The access token also comes from the environment; interactive OAuth
//! stays outside this crate behind the `TokenProvider` seam.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::exec::DEFAULT_WORKERS;

/// Environment variable carrying the OAuth access token
pub const TOKEN_ENV: &str = "MAILVAULT_ACCESS_TOKEN";

/// Environment variable overriding the settings file location
pub const SETTINGS_ENV: &str = "MAILVAULT_SETTINGS";

/// Resolve the settings file location: the environment override wins,
/// otherwise the platform config directory.
pub fn settings_path() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os(SETTINGS_ENV) {
        return Some(PathBuf::from(path));
    }
    dirs::config_dir().map(|dir| dir.join("mailvault").join("settings.json"))
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VaultSettings {
    /// Account to back up when the CLI does not name one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Archive root directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,
    /// Worker pool width for per-item fan-out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,
    /// Default recency window for quick sync, in days.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quick_sync_days: Option<u32>,
}

impl VaultSettings {
    /// Load settings from the resolved location, or defaults when no
    /// settings file exists yet.
    pub fn load() -> Result<Self> {
        match settings_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse settings file: {}", path.display()))
    }

    pub fn save(&self) -> Result<()> {
        let path = settings_path().context("Could not determine settings location")?;
        self.save_to(&path)
    }

    /// Write via a temp file and rename, so an interrupted save never
    /// leaves a truncated settings file behind.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let parent = path.parent().context("Settings path has no parent")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create settings directory: {}", parent.display()))?;

        let temp = path.with_extension("tmp");
        let content = serde_json::to_string_pretty(self)?;
        fs::write(&temp, content)
            .with_context(|| format!("Failed to write settings file: {}", temp.display()))?;
        fs::rename(&temp, path)
            .with_context(|| format!("Failed to move settings into place: {}", path.display()))?;
        Ok(())
    }

    /// Archive root with the built-in fallback applied.
    pub fn root_or_default(&self) -> PathBuf {
        self.root.clone().unwrap_or_else(|| PathBuf::from("backup"))
    }

    pub fn workers_or_default(&self) -> usize {
        self.workers.unwrap_or(DEFAULT_WORKERS)
    }
}

/// Read the access token from the environment.
pub fn token_from_env() -> Result<String> {
    std::env::var(TOKEN_ENV).with_context(|| format!("{TOKEN_ENV} environment variable not set"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let settings = VaultSettings::default();
        assert_eq!(settings.root_or_default(), PathBuf::from("backup"));
        assert_eq!(settings.workers_or_default(), DEFAULT_WORKERS);
        assert!(settings.quick_sync_days.is_none());
    }

    #[test]
    fn test_partial_settings_json() {
        let settings: VaultSettings =
            serde_json::from_str(r#"{ "email": "a@example.com", "workers": 3 }"#).unwrap();
        assert_eq!(settings.email.as_deref(), Some("a@example.com"));
        assert_eq!(settings.workers_or_default(), 3);
        assert_eq!(settings.root_or_default(), PathBuf::from("backup"));
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("conf").join("settings.json");

        let settings = VaultSettings {
            email: Some("a@example.com".into()),
            root: Some(PathBuf::from("/srv/archive")),
            workers: Some(3),
            quick_sync_days: None,
        };
        settings.save_to(&path).unwrap();

        // nothing half-written left next to the file
        assert!(!path.with_extension("tmp").exists());

        let loaded = VaultSettings::load_from(&path).unwrap();
        assert_eq!(loaded.email.as_deref(), Some("a@example.com"));
        assert_eq!(loaded.root, Some(PathBuf::from("/srv/archive")));
        assert_eq!(loaded.workers, Some(3));
    }

    #[test]
    fn test_load_from_malformed_file_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "not json").unwrap();
        assert!(VaultSettings::load_from(&path).is_err());
    }
}
