//! PID file handling — refuse to start while another instance is live,
//! clean up stale files from crashed runs.

use std::path::Path;

use anyhow::bail;
use tracing::info;

pub fn check_pid_file(path: &Path) -> anyhow::Result<()> {
    let Ok(raw) = std::fs::read_to_string(path) else {
        return Ok(());
    };
    match raw.trim().parse::<i32>() {
        Ok(pid) if process_alive(pid) => {
            bail!("another instance is running (PID {pid})");
        }
        _ => {
            info!("stale PID file found, removing");
            let _ = std::fs::remove_file(path);
            Ok(())
        }
    }
}

pub fn write_pid_file(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, std::process::id().to_string())
}

pub fn remove_pid_file(path: &Path) {
    let _ = std::fs::remove_file(path);
}

/// Signal 0 probes liveness without touching the process.
fn process_alive(pid: i32) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}
