use std::env;
use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

fn main() {
    // Stamp the build time so the CLI version string can show it.
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs();

    let out_dir = env::var("OUT_DIR").unwrap();
    let dest_path = Path::new(&out_dir).join("build_timestamp.txt");
    fs::write(&dest_path, timestamp.to_string()).unwrap();

    // No rerun-if-changed: the script runs on every build on purpose.
}
