//! Forced port reclamation: discover whatever process holds a port and send
//! it a kill signal. This is the escalation fallback when a graceful close
//! does not free the port in time, and the recovery path for stale servers
//! left behind by a previous run.
//!
//! The capability sits behind a trait so the lifecycle manager can be
//! exercised in tests without killing anything real. The OS implementation
//! is selected at compile time; no shell pipelines are templated together.

use std::future::Future;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Capability to forcibly free a TCP port
pub trait PortReclaimer: Send + Sync {
    /// Discover the processes listening on `port` and terminate them.
    /// Succeeding means the signals were delivered (or nobody was found),
    /// not that the port is free — callers re-probe after a settle delay.
    fn force_free_port(&self, port: u16) -> impl Future<Output = anyhow::Result<()>> + Send;
}

/// The real, platform-specific reclaimer
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemReclaimer;

impl PortReclaimer for SystemReclaimer {
    async fn force_free_port(&self, port: u16) -> anyhow::Result<()> {
        let pids = discover_listener_pids(port).await?;
        if pids.is_empty() {
            debug!(port, "No listener process found to reclaim");
            return Ok(());
        }

        let own_pid = std::process::id();
        for pid in pids {
            if pid == own_pid {
                // One of our own listeners; killing the whole process to
                // free a single port would be worse than the conflict
                warn!(port, pid, "Listener on port belongs to this process, skipping kill");
                continue;
            }
            info!(port, pid, "Force-terminating process holding port");
            terminate_pid(pid).await?;
        }

        Ok(())
    }
}

/// Find PIDs of processes listening on `port`
#[cfg(unix)]
async fn discover_listener_pids(port: u16) -> anyhow::Result<Vec<u32>> {
    // lsof -t prints bare PIDs; it exits non-zero when nothing matches,
    // which is not an error here
    let output = match Command::new("lsof")
        .args(["-t", "-i", &format!("TCP:{}", port), "-s", "TCP:LISTEN"])
        .output()
        .await
    {
        Ok(output) => output,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            // Without lsof we cannot discover the holder; report nothing
            // found so the caller's re-probe decides the outcome
            warn!(port, "lsof not available, cannot discover port holder");
            return Ok(Vec::new());
        }
        Err(e) => return Err(e.into()),
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout
        .lines()
        .filter_map(|line| line.trim().parse::<u32>().ok())
        .collect())
}

#[cfg(windows)]
async fn discover_listener_pids(port: u16) -> anyhow::Result<Vec<u32>> {
    let output = Command::new("netstat").args(["-a", "-n", "-o"]).output().await?;

    let needle = format!(":{}", port);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut pids = Vec::new();
    for line in stdout.lines() {
        if !line.contains("LISTENING") {
            continue;
        }
        let mut columns = line.split_whitespace();
        let local_addr = match columns.nth(1) {
            Some(addr) => addr,
            None => continue,
        };
        if !local_addr.ends_with(&needle) {
            continue;
        }
        if let Some(pid) = columns.last().and_then(|c| c.parse::<u32>().ok()) {
            pids.push(pid);
        }
    }
    pids.dedup();
    Ok(pids)
}

#[cfg(unix)]
async fn terminate_pid(pid: u32) -> anyhow::Result<()> {
    let result = unsafe { libc::kill(pid as i32, libc::SIGKILL) };
    if result != 0 {
        let err = std::io::Error::last_os_error();
        // The process may have exited between discovery and kill
        if err.raw_os_error() == Some(libc::ESRCH) {
            debug!(pid, "Process already gone before kill");
            return Ok(());
        }
        return Err(anyhow::anyhow!("failed to kill pid {}: {}", pid, err));
    }
    Ok(())
}

#[cfg(windows)]
async fn terminate_pid(pid: u32) -> anyhow::Result<()> {
    let status = Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .status()
        .await?;
    if !status.success() {
        return Err(anyhow::anyhow!("taskkill failed for pid {}", pid));
    }
    Ok(())
}
