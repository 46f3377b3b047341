//! Daemon lifecycle control: PID file management and start/stop/status.
//!
//! `start` re-executes the current binary with `--daemon` and detached stdio,
//! then records the child PID. `status` probes the recorded PID with signal 0
//! (a live process answers without being disturbed). The PID file lives at
//! `/var/run/sentinel/sentinel.pid`.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{bail, Context, Result};

pub const PID_FILE: &str = "/var/run/sentinel/sentinel.pid";
pub const LOG_FILE: &str = "/var/log/sentinel/sentinel.log";

fn pid_file() -> PathBuf {
    PathBuf::from(PID_FILE)
}

/// Fork the daemon process and record its PID.
pub fn start(binary: &Path, config_path: &Path, log_level: &str) -> Result<()> {
    if is_running(&pid_file()) {
        bail!("daemon already running");
    }

    let child = Command::new(binary)
        .arg("--daemon")
        .arg("--config")
        .arg(config_path)
        .arg("--log-level")
        .arg(log_level)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| format!("failed to spawn {}", binary.display()))?;

    let path = pid_file();
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    if let Err(e) = std::fs::write(&path, child.id().to_string()) {
        // Without a PID file the daemon is unmanageable; undo the spawn.
        unsafe { libc::kill(child.id() as libc::pid_t, libc::SIGKILL) };
        return Err(e).with_context(|| format!("failed to write PID file {}", path.display()));
    }

    tracing::info!(pid = child.id(), "daemon started");
    Ok(())
}

/// Stop the daemon recorded in the PID file.
pub fn stop() -> Result<()> {
    let path = pid_file();
    let pid = read_pid(&path)?;

    if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
        bail!("failed to signal PID {}", pid);
    }

    let _ = std::fs::remove_file(&path);
    tracing::info!(pid, "daemon stopped");
    Ok(())
}

/// Stop (ignoring a dead daemon) then start.
pub fn restart(binary: &Path, config_path: &Path, log_level: &str) -> Result<()> {
    let _ = stop();
    start(binary, config_path, log_level)
}

/// Print whether the daemon is running.
pub fn status() -> Result<()> {
    let path = pid_file();
    if is_running(&path) {
        let pid = read_pid(&path)?;
        println!("Daemon is running with PID {}", pid);
    } else {
        println!("Daemon is not running");
    }
    Ok(())
}

/// Signal-0 probe: true when the PID file points at a live process.
fn is_running(pid_path: &Path) -> bool {
    match read_pid(pid_path) {
        Ok(pid) => unsafe { libc::kill(pid, 0) == 0 },
        Err(_) => false,
    }
}

fn read_pid(path: &Path) -> Result<libc::pid_t> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read PID file {}", path.display()))?;
    raw.trim()
        .parse::<libc::pid_t>()
        .with_context(|| format!("malformed PID file {}", path.display()))
}
