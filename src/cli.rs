use std::path::PathBuf;

use clap::Parser;

use crate::{paths, supervisor::Overrides};

/// Command line interface for the sidecar supervisor.
#[derive(Parser, Debug)]
#[command(
    name = "sidecard",
    version = version_with_build_time(),
    about = "Supervisor for the local sidecar server"
)]
pub struct Cli {
    /// Override the debug-protocol socket port (skips negotiation).
    #[arg(long)]
    pub debug_port: Option<u16>,

    /// Override the control/health HTTP port (implies enabling the control
    /// feature).
    #[arg(long)]
    pub control_port: Option<u16>,

    /// Override the agent port.
    #[arg(long)]
    pub agent_port: Option<u16>,

    /// Override the extension integration port.
    #[arg(long)]
    pub extension_port: Option<u16>,

    /// Use this resources directory instead of the bundled layout.
    #[arg(long)]
    pub resources_dir: Option<String>,

    /// Alternate settings file.
    #[arg(long)]
    pub settings: Option<String>,

    /// Resolve and persist ports but do not launch the companion server.
    #[arg(long)]
    pub disable_server: bool,
}

impl Cli {
    pub fn overrides(&self) -> Overrides {
        Overrides {
            debug_port: self.debug_port,
            control_port: self.control_port,
            agent_port: self.agent_port,
            extension_port: self.extension_port,
            resources_dir: self
                .resources_dir
                .as_deref()
                .map(paths::expand_path),
            disabled: self.disable_server,
        }
    }

    pub fn settings_path(&self) -> PathBuf {
        self.settings
            .as_deref()
            .map(paths::expand_path)
            .unwrap_or_else(paths::default_settings_path)
    }
}

/// Returns version string with relative build time (e.g., "0.1.0 (built 5m ago)")
fn version_with_build_time() -> &'static str {
    use std::sync::OnceLock;
    static VERSION: OnceLock<String> = OnceLock::new();

    // Include the generated timestamp file to force recompilation when it changes
    const BUILD_TIMESTAMP_STR: &str =
        include_str!(concat!(env!("OUT_DIR"), "/build_timestamp.txt"));

    VERSION.get_or_init(|| {
        let version = env!("CARGO_PKG_VERSION");
        let build_timestamp: u64 = BUILD_TIMESTAMP_STR.trim().parse().unwrap_or(0);

        if build_timestamp == 0 {
            return version.to_string();
        }

        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let elapsed = now.saturating_sub(build_timestamp);
        let relative = format_relative_time(elapsed);

        format!("{version} (built {relative})")
    })
}

fn format_relative_time(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s ago", seconds)
    } else if seconds < 3600 {
        format!("{}m ago", seconds / 60)
    } else if seconds < 86400 {
        format!("{}h ago", seconds / 3600)
    } else {
        format!("{}d ago", seconds / 86400)
    }
}
