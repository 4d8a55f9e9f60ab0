// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Registry of external query processes.
//
// Host queries shell out to helper processes. Every child is registered here
// while it runs so that shutdown can reach it: a graceful termination request
// first, then a forced kill once the grace period expires.

use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use printwatch_core::error::{PrintwatchError, Result};

/// Default time a child gets between the graceful request and the kill.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(1);

/// Captured output of a finished child.
#[derive(Debug, Clone)]
pub struct CapturedOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

/// Tracks running helper processes.
pub struct ProcessRegistry {
    running: Mutex<HashMap<u64, CancellationToken>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    grace: Duration,
}

impl Default for ProcessRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_GRACE)
    }
}

enum Outcome {
    Finished(std::io::Result<(Vec<u8>, Vec<u8>, ExitStatus)>),
    TimedOut,
    Cancelled,
}

impl ProcessRegistry {
    pub fn new(grace: Duration) -> Self {
        Self {
            running: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            grace,
        }
    }

    /// Number of children currently registered.
    pub fn active(&self) -> usize {
        self.running.lock().map(|m| m.len()).unwrap_or(0)
    }

    /// Spawn `command`, capture its output and wait at most `timeout`.
    ///
    /// A child that overruns the timeout is killed outright. A child that is
    /// still running when the registry shuts down is asked to stop first.
    pub async fn run(&self, mut command: Command, timeout: Duration) -> Result<CapturedOutput> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PrintwatchError::QueryFailure("agent is shutting down".into()));
        }

        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| PrintwatchError::QueryFailure(format!("spawn helper: {e}")))?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        if let Ok(mut running) = self.running.lock() {
            running.insert(id, token.clone());
        }
        debug!(id, pid = child.id(), "helper process started");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let outcome = {
            let io = async {
                let (out, err, status) =
                    tokio::join!(read_all(stdout), read_all(stderr), child.wait());
                Ok::<_, std::io::Error>((out?, err?, status?))
            };
            tokio::select! {
                res = io => Outcome::Finished(res),
                _ = tokio::time::sleep(timeout) => Outcome::TimedOut,
                _ = token.cancelled() => Outcome::Cancelled,
            }
        };

        let result = match outcome {
            Outcome::Finished(Ok((stdout, stderr, status))) => Ok(CapturedOutput {
                status,
                stdout: String::from_utf8_lossy(&stdout).into_owned(),
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
            }),
            Outcome::Finished(Err(e)) => Err(PrintwatchError::QueryFailure(format!(
                "helper I/O: {e}"
            ))),
            Outcome::TimedOut => {
                warn!(id, timeout_ms = timeout.as_millis() as u64, "helper timed out, killing");
                force_kill(&mut child).await;
                Err(PrintwatchError::QueryFailure(format!(
                    "helper timed out after {}ms",
                    timeout.as_millis()
                )))
            }
            Outcome::Cancelled => {
                terminate(&mut child, self.grace).await;
                Err(PrintwatchError::QueryFailure("helper cancelled by shutdown".into()))
            }
        };

        if let Ok(mut running) = self.running.lock() {
            running.remove(&id);
        }
        result
    }

    /// Stop accepting new children and terminate the running ones.
    ///
    /// Returns once every child has been reaped or `deadline` has passed.
    pub async fn terminate_all(&self, deadline: Duration) {
        self.closed.store(true, Ordering::Release);

        let tokens: Vec<CancellationToken> = match self.running.lock() {
            Ok(running) => running.values().cloned().collect(),
            Err(_) => Vec::new(),
        };
        if tokens.is_empty() {
            return;
        }
        info!(count = tokens.len(), "terminating helper processes");
        for token in tokens {
            token.cancel();
        }

        let wait = async {
            while self.active() > 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        };
        if tokio::time::timeout(deadline, wait).await.is_err() {
            warn!(remaining = self.active(), "helper processes outlived shutdown deadline");
        }
    }
}

async fn read_all<R: AsyncRead + Unpin>(pipe: Option<R>) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

/// Graceful request, then a kill once `grace` has passed.
async fn terminate(child: &mut Child, grace: Duration) {
    if let Some(pid) = child.id() {
        request_stop(pid);
    }
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => debug!(?status, "helper exited after stop request"),
        Ok(Err(e)) => warn!(error = %e, "waiting for helper failed"),
        Err(_) => {
            warn!(grace_ms = grace.as_millis() as u64, "helper ignored stop request, killing");
            force_kill(child).await;
        }
    }
}

async fn force_kill(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        warn!(error = %e, "failed to kill helper");
        return;
    }
    let _ = child.wait().await;
}

#[cfg(unix)]
fn request_stop(pid: u32) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) only sends a signal. The pid belongs to a child this
    // registry spawned and has not reaped yet, so it cannot have been reused.
    if unsafe { libc::kill(raw, libc::SIGTERM) } != 0 {
        debug!(pid, error = %std::io::Error::last_os_error(), "SIGTERM not delivered");
    }
}

#[cfg(not(unix))]
fn request_stop(pid: u32) {
    // Windows has no graceful signal for console children; the kill after
    // the grace period does the work.
    debug!(pid, "no graceful stop available on this platform");
}
