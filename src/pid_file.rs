use anyhow::{bail, Context};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fs;
use std::path::{Path, PathBuf};

/// Records the server's PID for `stop`, `status` and `reload`; removed again on drop
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn create(path: &Path) -> anyhow::Result<Self> {
        if let Some(pid) = running_pid(path) {
            bail!("Server is already running with PID {}", pid);
        }

        fs::write(path, format!("{}\n", std::process::id()))
            .with_context(|| format!("Failed to write PID file at '{}'", path.display()))?;

        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            log::warn!("Failed to remove PID file at '{}': {}", self.path.display(), e);
        }
    }
}

fn read_pid(path: &Path) -> Option<i32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn is_alive(pid: i32) -> bool {
    // Signal 0 only checks that the process exists and may be signalled
    pid > 0 && kill(Pid::from_raw(pid), None).is_ok()
}

/// The PID of the running server, or `None` if the file is missing or stale
pub fn running_pid(path: &Path) -> Option<i32> {
    read_pid(path).filter(|pid| is_alive(*pid))
}

/// Sends `signal` to the running server and returns its PID
pub fn signal(path: &Path, signal: Signal) -> anyhow::Result<i32> {
    let Some(pid) = running_pid(path) else {
        bail!("No process (PID file '{}')", path.display());
    };

    kill(Pid::from_raw(pid), signal)
        .with_context(|| format!("Failed to send {} to PID {}", signal, pid))?;
    Ok(pid)
}

/// Waits for `pid` to exit, polling every 100ms up to `attempts` times
pub async fn wait_for_exit(pid: i32, attempts: u32) -> bool {
    for _ in 0..attempts {
        if !is_alive(pid) {
            return true;
        }
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
    !is_alive(pid)
}
