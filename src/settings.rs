//! Persisted supervisor settings — the host-facing key-value store.

use std::{fs, io::Write, path::Path};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Compiled default ports; negotiation starts from these when the settings
/// file has no persisted values.
pub const DEFAULT_DEBUG_PORT: u16 = 9222;
pub const DEFAULT_CONTROL_PORT: u16 = 9224;
pub const DEFAULT_AGENT_PORT: u16 = 9225;
pub const DEFAULT_EXTENSION_PORT: u16 = 9226;

/// Settings persisted between host runs. Ports are written back after each
/// negotiation so restarts prefer the same values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Debug-protocol socket port.
    #[serde(default = "default_debug_port")]
    pub debug_port: u16,
    /// Control/health HTTP port.
    #[serde(default = "default_control_port")]
    pub control_port: u16,
    /// Agent port.
    #[serde(default = "default_agent_port")]
    pub agent_port: u16,
    /// Extension integration port.
    #[serde(default = "default_extension_port")]
    pub extension_port: u16,
    /// Whether the HTTP-exposed secondary protocol is active inside the
    /// running companion.
    #[serde(default = "default_true")]
    pub control_feature_enabled: bool,
    /// One-shot restart request; reset once the restart has been handled.
    #[serde(default)]
    pub restart_requested: bool,
    /// Stable install identifier sent in the init handshake. Generated on
    /// first load.
    #[serde(default)]
    pub install_id: String,
}

fn default_debug_port() -> u16 {
    DEFAULT_DEBUG_PORT
}

fn default_control_port() -> u16 {
    DEFAULT_CONTROL_PORT
}

fn default_agent_port() -> u16 {
    DEFAULT_AGENT_PORT
}

fn default_extension_port() -> u16 {
    DEFAULT_EXTENSION_PORT
}

fn default_true() -> bool {
    true
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            debug_port: DEFAULT_DEBUG_PORT,
            control_port: DEFAULT_CONTROL_PORT,
            agent_port: DEFAULT_AGENT_PORT,
            extension_port: DEFAULT_EXTENSION_PORT,
            control_feature_enabled: true,
            restart_requested: false,
            install_id: String::new(),
        }
    }
}

/// Load settings, falling back to defaults when the file is missing or
/// unreadable — configuration problems are never fatal. Generates and
/// persists the install id the first time around.
pub fn load(path: &Path) -> ServerSettings {
    let mut settings = match fs::read_to_string(path) {
        Ok(raw) => match toml::from_str(&raw) {
            Ok(settings) => settings,
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "settings file unreadable, using defaults"
                );
                ServerSettings::default()
            }
        },
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => ServerSettings::default(),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "failed to read settings, using defaults");
            ServerSettings::default()
        }
    };

    if settings.install_id.is_empty() {
        settings.install_id = uuid::Uuid::new_v4().to_string();
        if let Err(err) = save(path, &settings) {
            warn!(error = %err, "failed to persist generated install id");
        }
    }

    settings
}

/// Atomically persist settings (write temp file, fsync, rename over).
pub fn save(path: &Path, settings: &ServerSettings) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let temp_path = path.with_extension(format!("toml.tmp.{}", std::process::id()));
    let contents = toml::to_string_pretty(settings).context("failed to serialize settings")?;

    {
        let mut file = fs::File::create(&temp_path)
            .with_context(|| format!("failed to create {}", temp_path.display()))?;
        file.write_all(contents.as_bytes())
            .with_context(|| format!("failed to write {}", temp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("failed to sync {}", temp_path.display()))?;
    }

    fs::rename(&temp_path, path).with_context(|| {
        format!(
            "failed to replace settings {} from {}",
            path.display(),
            temp_path.display()
        )
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn missing_file_yields_defaults_with_install_id() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("settings.toml");

        let settings = load(&path);
        assert_eq!(settings.debug_port, DEFAULT_DEBUG_PORT);
        assert_eq!(settings.control_port, DEFAULT_CONTROL_PORT);
        assert!(settings.control_feature_enabled);
        assert!(!settings.restart_requested);
        assert!(!settings.install_id.is_empty());
        assert!(path.exists(), "install id generation persists the file");
    }

    #[test]
    fn install_id_is_stable_across_loads() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("settings.toml");

        let first = load(&path);
        let second = load(&path);
        assert_eq!(first.install_id, second.install_id);
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("settings.toml");

        let mut settings = ServerSettings::default();
        settings.debug_port = 9001;
        settings.control_port = 9002;
        settings.agent_port = 9003;
        settings.extension_port = 9004;
        settings.control_feature_enabled = false;
        settings.install_id = "fixed-id".to_string();
        save(&path, &settings).expect("save");

        let loaded = load(&path);
        assert_eq!(loaded, settings);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("settings.toml");
        fs::write(&path, "debug_port = 9100\ninstall_id = \"abc\"\n").expect("write");

        let settings = load(&path);
        assert_eq!(settings.debug_port, 9100);
        assert_eq!(settings.control_port, DEFAULT_CONTROL_PORT);
        assert!(settings.control_feature_enabled);
        assert_eq!(settings.install_id, "abc");
    }

    #[test]
    fn garbage_file_yields_defaults() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("settings.toml");
        fs::write(&path, "{ not toml").expect("write");

        let settings = load(&path);
        assert_eq!(settings.debug_port, DEFAULT_DEBUG_PORT);
    }
}
