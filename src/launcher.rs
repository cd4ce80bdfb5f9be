//! Spawning and force-killing the companion server process.

use std::{
    fs::{self, File, OpenOptions},
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
};

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use crate::ports::PortSet;

/// Everything needed to spawn the companion server.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub exe_path: PathBuf,
    pub resources_dir: PathBuf,
    pub execution_dir: PathBuf,
    pub ports: PortSet,
}

/// Spawn the companion server process.
///
/// Blocking (existence checks, directory creation, the spawn syscall); run
/// on a background worker. Returns `None` when any precondition or the
/// spawn itself fails — the caller unwinds the start sequence on `None`.
pub fn launch(req: &LaunchRequest) -> Option<Child> {
    if !req.exe_path.exists() {
        error!(
            path = %req.exe_path.display(),
            "companion server executable not found"
        );
        return None;
    }

    if req.execution_dir.as_os_str().is_empty() {
        error!("execution directory path is empty");
        return None;
    }

    if let Err(err) = fs::create_dir_all(&req.execution_dir) {
        error!(
            path = %req.execution_dir.display(),
            error = %err,
            "failed to create execution directory"
        );
        return None;
    }

    let (stdout, stderr) = match open_log_files(&req.execution_dir) {
        Ok(files) => files,
        Err(err) => {
            error!(error = %err, "failed to open companion log files");
            return None;
        }
    };

    let mut cmd = Command::new(&req.exe_path);
    cmd.arg("--debug-port")
        .arg(req.ports.debug.to_string())
        .arg("--control-port")
        .arg(req.ports.control.to_string())
        .arg("--agent-port")
        .arg(req.ports.agent.to_string())
        .arg("--extension-port")
        .arg(req.ports.extension.to_string())
        .arg("--resources-dir")
        .arg(&req.resources_dir)
        .arg("--execution-dir")
        .arg(&req.execution_dir);

    cmd.stdin(Stdio::null()).stdout(stdout).stderr(stderr);

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    match cmd.spawn() {
        Ok(child) => {
            info!(
                pid = child.id(),
                exe = %req.exe_path.display(),
                "companion server launched"
            );
            Some(child)
        }
        Err(err) => {
            error!(
                exe = %req.exe_path.display(),
                error = %err,
                "failed to spawn companion server"
            );
            None
        }
    }
}

/// Force-kill (SIGKILL-equivalent, no graceful-shutdown grace) and reap.
/// Blocking; run on a background worker.
pub fn kill_and_wait(child: &mut Child) {
    let pid = child.id();
    info!(pid, "force killing companion server process");

    if let Err(err) = child.kill() {
        warn!(pid, error = %err, "failed to kill companion process");
    }

    match child.wait() {
        Ok(status) => info!(pid, %status, "companion process reaped"),
        Err(err) => warn!(pid, error = %err, "failed to reap companion process"),
    }
}

/// Companion stdout/stderr go to append-mode log files under the execution
/// directory.
fn open_log_files(execution_dir: &Path) -> Result<(File, File)> {
    let log_dir = execution_dir.join("logs");
    fs::create_dir_all(&log_dir)
        .with_context(|| format!("failed to create {}", log_dir.display()))?;

    let stdout_log = log_dir.join("stdout.log");
    let stderr_log = log_dir.join("stderr.log");

    let stdout = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&stdout_log)
        .with_context(|| format!("failed to open {}", stdout_log.display()))?;
    let stderr = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&stderr_log)
        .with_context(|| format!("failed to open {}", stderr_log.display()))?;

    Ok((stdout, stderr))
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn test_ports() -> PortSet {
        PortSet {
            debug: 9001,
            control: 9002,
            agent: 9003,
            extension: 9004,
        }
    }

    #[test]
    fn missing_executable_yields_no_handle() {
        let dir = TempDir::new().expect("tempdir");
        let req = LaunchRequest {
            exe_path: dir.path().join("does-not-exist"),
            resources_dir: dir.path().to_path_buf(),
            execution_dir: dir.path().join("run"),
            ports: test_ports(),
        };
        assert!(launch(&req).is_none());
        assert!(
            !req.execution_dir.exists(),
            "preflight must fail before directory creation"
        );
    }

    #[test]
    fn empty_execution_dir_yields_no_handle() {
        let dir = TempDir::new().expect("tempdir");
        let exe = dir.path().join("server");
        fs::write(&exe, "").expect("touch exe");

        let req = LaunchRequest {
            exe_path: exe,
            resources_dir: dir.path().to_path_buf(),
            execution_dir: PathBuf::new(),
            ports: test_ports(),
        };
        assert!(launch(&req).is_none());
    }

    #[cfg(unix)]
    #[test]
    fn stub_server_receives_port_arguments() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().expect("tempdir");
        let exe = dir.path().join("server.sh");
        let argv_file = dir.path().join("argv.txt");
        fs::write(
            &exe,
            format!("#!/bin/sh\nprintf '%s\\n' \"$@\" > {}\n", argv_file.display()),
        )
        .expect("write stub");
        fs::set_permissions(&exe, fs::Permissions::from_mode(0o755)).expect("chmod");

        let req = LaunchRequest {
            exe_path: exe,
            resources_dir: dir.path().join("res"),
            execution_dir: dir.path().join("run"),
            ports: test_ports(),
        };

        let mut child = launch(&req).expect("stub should spawn");
        let status = child.wait().expect("wait");
        assert!(status.success());

        let argv = fs::read_to_string(&argv_file).expect("argv recorded");
        let args: Vec<&str> = argv.lines().collect();
        assert!(args.contains(&"--debug-port"));
        assert!(args.contains(&"9001"));
        assert!(args.contains(&"--control-port"));
        assert!(args.contains(&"9002"));
        assert!(args.contains(&"--agent-port"));
        assert!(args.contains(&"9003"));
        assert!(args.contains(&"--extension-port"));
        assert!(args.contains(&"9004"));

        assert!(req.execution_dir.join("logs").join("stdout.log").exists());
    }

    #[cfg(unix)]
    #[test]
    fn kill_and_wait_reaps_a_long_runner() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().expect("tempdir");
        let exe = dir.path().join("server.sh");
        fs::write(&exe, "#!/bin/sh\nexec sleep 30\n").expect("write stub");
        fs::set_permissions(&exe, fs::Permissions::from_mode(0o755)).expect("chmod");

        let req = LaunchRequest {
            exe_path: exe,
            resources_dir: dir.path().join("res"),
            execution_dir: dir.path().join("run"),
            ports: test_ports(),
        };

        let mut child = launch(&req).expect("stub should spawn");
        kill_and_wait(&mut child);
        let status = child.try_wait().expect("try_wait after reap");
        assert!(status.is_some(), "process must be gone after kill_and_wait");
    }
}
