//! Optional on-disk defaults for the `chunkrun` CLI.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Persisted defaults. Every field is optional; command-line flags win.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Settings {
    /// Worker pool size.
    #[serde(default)]
    pub workers: Option<usize>,
    /// Team size used for each chunk.
    #[serde(default)]
    pub team_size: Option<usize>,
    /// `tracing` filter directive used when `RUST_LOG` is unset.
    #[serde(default)]
    pub log_filter: Option<String>,
    /// Progress sampling period in milliseconds.
    #[serde(default)]
    pub progress_tick_ms: Option<u64>,
}

impl Settings {
    /// Drop values that cannot be used (zero counts, blank filters).
    pub fn normalize(&mut self) {
        if self.workers == Some(0) {
            self.workers = None;
        }
        if self.team_size == Some(0) {
            self.team_size = None;
        }
        if self.progress_tick_ms == Some(0) {
            self.progress_tick_ms = None;
        }

        self.log_filter = self.log_filter.as_ref().map(|s| s.trim().to_string());
        if matches!(self.log_filter.as_deref(), Some(s) if s.is_empty()) {
            self.log_filter = None;
        }
    }
}

fn xdg_config_home() -> anyhow::Result<PathBuf> {
    if let Some(dir) = std::env::var_os("XDG_CONFIG_HOME") {
        let dir = PathBuf::from(dir);
        if dir.as_os_str().is_empty() {
            anyhow::bail!("XDG_CONFIG_HOME is set but empty");
        }
        return Ok(dir);
    }

    let home = std::env::var_os("HOME").ok_or_else(|| anyhow::anyhow!("HOME is not set"))?;
    let home = PathBuf::from(home);
    if home.as_os_str().is_empty() {
        anyhow::bail!("HOME is set but empty");
    }
    Ok(home.join(".config"))
}

/// Default settings location (`$XDG_CONFIG_HOME/chunkrun/config.json`).
pub fn settings_path() -> anyhow::Result<PathBuf> {
    Ok(xdg_config_home()?.join("chunkrun").join("config.json"))
}

/// Load settings from the default location. A missing file yields `None`.
pub fn load_settings() -> anyhow::Result<Option<Settings>> {
    load_settings_from(&settings_path()?)
}

/// Load settings from `path`. A missing file yields `None`.
pub fn load_settings_from(path: &Path) -> anyhow::Result<Option<Settings>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)?;
    let mut settings: Settings = serde_json::from_str(&raw)?;
    settings.normalize();
    Ok(Some(settings))
}

/// Save settings to the default location.
pub fn save_settings(settings: &Settings) -> anyhow::Result<()> {
    save_settings_to(&settings_path()?, settings)
}

/// Save settings to `path`, replacing it atomically.
pub fn save_settings_to(path: &Path, settings: &Settings) -> anyhow::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("invalid settings path: {}", path.display()))?;
    std::fs::create_dir_all(dir)?;

    let mut settings = settings.clone();
    settings.normalize();

    let json = serde_json::to_string_pretty(&settings)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}
