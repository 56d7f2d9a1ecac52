//! Control FIFO reader.
//!
//! A named pipe at a fixed state-dir path; each line is one JSON control
//! object. Malformed lines are logged and dropped — pipe input can never
//! crash the daemon.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::dispatch::{parse_control, Ingress};

/// Create the FIFO (mode 0600), replacing any stale file.
pub fn create_fifo(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| std::io::Error::other("path contains NUL"))?;
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

pub fn remove_fifo(path: &Path) {
    let _ = std::fs::remove_file(path);
}

/// Read JSON control lines from the FIFO until the task is aborted.
///
/// Opening a FIFO read-only blocks until a writer connects; tokio's
/// `File::open` does that on the blocking pool, so the loop itself stays
/// async-friendly.
pub async fn run_reader(path: PathBuf, tx: mpsc::Sender<Ingress>) {
    info!(path = %path.display(), "control FIFO ready");
    loop {
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, "FIFO open failed");
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                continue;
            }
        };

        let mut data = String::new();
        if let Err(e) = file.read_to_string(&mut data).await {
            error!(error = %e, "FIFO read failed");
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            continue;
        }

        for line in data.lines().filter(|l| !l.trim().is_empty()) {
            let value: serde_json::Value = match serde_json::from_str(line) {
                Ok(v) => v,
                Err(_) => {
                    warn!(line = %line.chars().take(200).collect::<String>(),
                          "invalid JSON from FIFO");
                    continue;
                }
            };
            if let Some(req) = parse_control(&value) {
                if tx.send(Ingress::Control(req)).await.is_err() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_fifo_replaces_stale_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.pipe");
        std::fs::write(&path, "stale").unwrap();
        create_fifo(&path).unwrap();

        let meta = std::fs::metadata(&path).unwrap();
        use std::os::unix::fs::FileTypeExt;
        assert!(meta.file_type().is_fifo());

        remove_fifo(&path);
        assert!(!path.exists());
    }
}
