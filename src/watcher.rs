//! Settings-file change notifications.
//!
//! The settings file can be rewritten by settings UIs or by hand while the
//! supervisor is running. A dedicated watcher thread reloads it on change,
//! diffs the actionable flags against the last snapshot, and hands the
//! changes to a callback — the callback forwards them onto the supervisor
//! channel, so state is only ever touched on the control sequence.

use std::{
    path::{Path, PathBuf},
    sync::mpsc::{self, Receiver, Sender},
    thread,
    time::Duration,
};

use anyhow::{Context, Result};
use notify::RecursiveMode;
use notify_debouncer_mini::new_debouncer;
use tracing::{info, warn};

use crate::settings::{self, ServerSettings};

/// Actionable settings changes the supervisor reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsChange {
    FeatureEnabled(bool),
    RestartRequested,
}

/// Owns the watcher thread; dropping it shuts the thread down.
pub struct SettingsWatcher {
    shutdown: Option<Sender<()>>,
    join: Option<thread::JoinHandle<()>>,
}

impl SettingsWatcher {
    pub fn spawn(
        path: PathBuf,
        on_change: impl Fn(SettingsChange) + Send + 'static,
    ) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            if let Err(err) = run_watcher(&path, shutdown_rx, on_change) {
                tracing::error!(?err, "settings watcher exited with error");
            }
        });

        Ok(Self {
            shutdown: Some(shutdown_tx),
            join: Some(handle),
        })
    }
}

impl Drop for SettingsWatcher {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.join.take() {
            let _ = handle.join();
        }
    }
}

fn run_watcher(
    path: &Path,
    shutdown: Receiver<()>,
    on_change: impl Fn(SettingsChange),
) -> Result<()> {
    // Watch the parent directory: atomic saves replace the file by rename,
    // which would silently detach a watch on the file itself.
    let dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create {}", dir.display()))?;

    let mut last = settings::load(path);

    let (event_tx, event_rx) = mpsc::channel();
    let mut debouncer = new_debouncer(Duration::from_millis(250), event_tx)
        .context("failed to initialize settings watcher")?;
    debouncer
        .watcher()
        .watch(&dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("failed to watch {}", dir.display()))?;

    info!(path = %path.display(), "settings watcher started");

    loop {
        if shutdown.try_recv().is_ok() {
            break;
        }

        match event_rx.recv_timeout(Duration::from_millis(200)) {
            Ok(Ok(events)) => {
                let touched = events.iter().any(|event| {
                    event.path == path || event.path.file_name() == path.file_name()
                });
                if !touched {
                    continue;
                }

                let next = settings::load(path);
                for change in diff_changes(&last, &next) {
                    info!(?change, "settings change detected");
                    on_change(change);
                }
                last = next;
            }
            Ok(Err(err)) => {
                warn!(error = %err, "settings watcher error");
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    info!("settings watcher stopped");
    Ok(())
}

/// Flag-level diff between two settings snapshots. Port edits are ignored —
/// they only apply at the next negotiation. The restart flag fires on its
/// rising edge only.
fn diff_changes(prev: &ServerSettings, next: &ServerSettings) -> Vec<SettingsChange> {
    let mut changes = Vec::new();

    if next.control_feature_enabled != prev.control_feature_enabled {
        changes.push(SettingsChange::FeatureEnabled(next.control_feature_enabled));
    }
    if next.restart_requested && !prev.restart_requested {
        changes.push(SettingsChange::RestartRequested);
    }

    changes
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use tempfile::TempDir;

    use super::*;

    #[test]
    fn diff_reports_feature_flag_edges() {
        let prev = ServerSettings::default();
        let mut next = prev.clone();
        next.control_feature_enabled = false;

        assert_eq!(
            diff_changes(&prev, &next),
            vec![SettingsChange::FeatureEnabled(false)]
        );
        assert!(diff_changes(&next, &next).is_empty());
    }

    #[test]
    fn diff_reports_restart_rising_edge_only() {
        let prev = ServerSettings::default();
        let mut next = prev.clone();
        next.restart_requested = true;

        assert_eq!(
            diff_changes(&prev, &next),
            vec![SettingsChange::RestartRequested]
        );
        // Falling edge (the supervisor resetting the flag) is not a change.
        assert!(diff_changes(&next, &prev).is_empty());
    }

    #[test]
    fn diff_ignores_port_only_edits() {
        let prev = ServerSettings::default();
        let mut next = prev.clone();
        next.debug_port += 1;
        next.control_port += 1;

        assert!(diff_changes(&prev, &next).is_empty());
    }

    #[test]
    fn watcher_reports_file_edits() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("settings.toml");

        let mut initial = ServerSettings::default();
        initial.install_id = "watched".to_string();
        settings::save(&path, &initial).expect("seed settings");

        let (tx, rx) = mpsc::channel();
        let watcher = SettingsWatcher::spawn(path.clone(), move |change| {
            let _ = tx.send(change);
        })
        .expect("spawn watcher");

        // Give the debouncer a moment to arm before editing.
        thread::sleep(Duration::from_millis(300));

        let mut edited = initial.clone();
        edited.restart_requested = true;
        settings::save(&path, &edited).expect("edit settings");

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut seen = None;
        while Instant::now() < deadline {
            if let Ok(change) = rx.recv_timeout(Duration::from_millis(100)) {
                seen = Some(change);
                break;
            }
        }
        assert_eq!(seen, Some(SettingsChange::RestartRequested));

        drop(watcher);
    }
}
