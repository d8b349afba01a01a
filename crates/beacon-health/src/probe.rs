//! Health probe trait and the shell command probe.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use futures_util::FutureExt;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

pub use futures_util::future::BoxFuture;

/// Result of a single health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The check succeeded.
    Healthy,
    /// The check ran and reported failure.
    Unhealthy,
    /// The check could not be run or did not finish in time.
    Failed,
}

impl ProbeResult {
    pub fn is_healthy(self) -> bool {
        self == ProbeResult::Healthy
    }
}

/// Executes one health check descriptor.
pub trait HealthProbe: Send + Sync {
    fn run<'a>(&'a self, check: &'a str) -> BoxFuture<'a, ProbeResult>;
}

/// Runs the check as a shell command. Exit status 0 means healthy.
#[derive(Debug, Clone)]
pub struct CommandProbe {
    timeout: Duration,
}

impl CommandProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn execute(&self, check: &str) -> ProbeResult {
        if check.trim().is_empty() {
            warn!("empty health check command");
            return ProbeResult::Failed;
        }

        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(check)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        // The shell leads its own group so a timeout reaches everything it
        // started.
        #[cfg(unix)]
        command.process_group(0);
        let child = command.spawn();
        let mut child = match child {
            Ok(child) => child,
            Err(e) => {
                warn!(check, error = %e, "failed to spawn health check");
                return ProbeResult::Failed;
            }
        };

        match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(Ok(status)) => classify(check, status),
            Ok(Err(e)) => {
                warn!(check, error = %e, "failed to wait for health check");
                ProbeResult::Failed
            }
            Err(_) => {
                warn!(check, timeout_ms = self.timeout.as_millis() as u64, "health check timed out");
                kill_process_group(&mut child).await;
                ProbeResult::Failed
            }
        }
    }
}

impl HealthProbe for CommandProbe {
    fn run<'a>(&'a self, check: &'a str) -> BoxFuture<'a, ProbeResult> {
        self.execute(check).boxed()
    }
}

/// Kill the check's whole process group, then reap the shell.
#[cfg(unix)]
async fn kill_process_group(child: &mut Child) {
    if let Some(pid) = child.id() {
        // SAFETY: killpg takes no pointers; a group that already exited
        // only yields ESRCH.
        let rc = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
        if rc != 0 {
            debug!(pid, error = %std::io::Error::last_os_error(), "killpg failed");
        }
    }
    let _ = child.kill().await;
}

#[cfg(not(unix))]
async fn kill_process_group(child: &mut Child) {
    let _ = child.kill().await;
}

fn classify(check: &str, status: ExitStatus) -> ProbeResult {
    if status.success() {
        ProbeResult::Healthy
    } else {
        debug!(check, code = ?status.code(), "health check reported failure");
        ProbeResult::Unhealthy
    }
}
