use anyhow::Result;
use clap::Parser;
use sidecard::{
    cli::Cli,
    init_tracing,
    supervisor::{Supervisor, SupervisorConfig},
    watcher::{SettingsChange, SettingsWatcher},
};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let settings_path = cli.settings_path();

    let cfg = SupervisorConfig::new(settings_path.clone(), cli.overrides());
    let (handle, join) = Supervisor::spawn(cfg);
    handle.start();

    let watcher = SettingsWatcher::spawn(settings_path, {
        let handle = handle.clone();
        move |change| match change {
            SettingsChange::FeatureEnabled(enabled) => handle.set_feature_enabled(enabled),
            SettingsChange::RestartRequested => handle.request_restart(),
        }
    })?;

    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    handle.stop().await;
    drop(watcher);
    drop(handle);
    let _ = join.await;

    Ok(())
}
