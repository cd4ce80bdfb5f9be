pub mod cli;
pub mod control;
pub mod launcher;
pub mod listener;
pub mod lock;
pub mod paths;
pub mod ports;
pub mod settings;
pub mod supervisor;
pub mod watcher;

/// Initialize tracing with a default filter if `RUST_LOG` is unset.
pub fn init_tracing() {
    let default_filter = "sidecard=info";
    let filter_layer = std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.to_string());

    tracing_subscriber::fmt()
        .with_env_filter(filter_layer)
        .with_target(false)
        .compact()
        .init();
}
