//! Per-user filesystem layout for the supervisor and the companion server.

use std::{
    env,
    path::{Path, PathBuf},
};

use shellexpand::tilde;

/// Base directory for supervisor state: ~/.config/sidecard
pub fn base_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config/sidecard")
}

/// Default settings file inside the base directory.
pub fn default_settings_path() -> PathBuf {
    base_dir().join("settings.toml")
}

/// Execution directory handed to the companion server. Holds the singleton
/// lock file and the companion's log files.
pub fn execution_dir() -> PathBuf {
    base_dir().join("run")
}

/// Default resources layout: the companion ships next to the host binary
/// under `sidecar-server/resources`.
pub fn default_resources_dir() -> Option<PathBuf> {
    let exe = env::current_exe().ok()?;
    Some(exe.parent()?.join("sidecar-server").join("resources"))
}

/// Companion server executable inside a resources directory.
pub fn server_executable(resources_dir: &Path) -> PathBuf {
    let mut path = resources_dir.join("bin").join("sidecar-server");
    if cfg!(windows) {
        path.set_extension("exe");
    }
    path
}

/// Expand `~` and environment variables in user-supplied paths.
pub fn expand_path(raw: &str) -> PathBuf {
    let tilde_expanded = tilde(raw).into_owned();
    let env_expanded = match shellexpand::env(&tilde_expanded) {
        Ok(val) => val.into_owned(),
        Err(_) => tilde_expanded,
    };
    PathBuf::from(env_expanded)
}
