// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Ordered, bounded shutdown of every subsystem.

use std::future::Future;
use std::time::Duration;

use tracing::{error, info, warn};

use printwatch_core::error::Result;

use crate::http::HttpServer;
use crate::services::agent_services::AgentServices;

/// Hard bound on the whole sequence.
pub const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

const TASK_DRAIN: Duration = Duration::from_secs(2);
const COUNTER_STOP: Duration = Duration::from_millis(500);
const PROCESS_DEADLINE: Duration = Duration::from_millis(1500);
const CLOUD_DEADLINE: Duration = Duration::from_secs(2);
const HTTP_GRACE: Duration = Duration::from_secs(2);
/// Added to each step's own deadline before the step is abandoned.
const STEP_SLACK: Duration = Duration::from_millis(250);

const STEPS: [Duration; 5] = [TASK_DRAIN, COUNTER_STOP, PROCESS_DEADLINE, CLOUD_DEADLINE, HTTP_GRACE];

/// Longest the steps can take together, slack included. Must fit inside
/// `SHUTDOWN_DEADLINE` so the listener always gets its turn.
fn worst_case() -> Duration {
    STEPS.iter().map(|d| *d + STEP_SLACK).sum()
}

/// Stop everything in order. Returns false if the sequence had to be cut
/// short or another shutdown was already running.
pub async fn graceful_shutdown(svc: &AgentServices, http: Option<HttpServer>, reason: &str) -> bool {
    if !svc.mark_shutting_down() {
        warn!(reason, "shutdown already in progress");
        return false;
    }
    info!(reason, budget = ?worst_case(), "graceful shutdown started");

    match tokio::time::timeout(SHUTDOWN_DEADLINE, run_steps(svc, http)).await {
        Ok(()) => {
            info!("graceful shutdown complete");
            true
        }
        Err(_) => {
            error!(deadline = ?SHUTDOWN_DEADLINE, "shutdown overran its deadline, forcing exit");
            false
        }
    }
}

async fn run_steps(svc: &AgentServices, http: Option<HttpServer>) {
    step("scheduled tasks", TASK_DRAIN, async {
        let aborted = svc.tasks().shutdown(TASK_DRAIN).await;
        if aborted > 0 {
            warn!(aborted, "scheduled tasks aborted");
        }
        Ok(())
    })
    .await;

    step("page counter", COUNTER_STOP, async {
        svc.counter().stop().await;
        Ok(())
    })
    .await;

    step("helper processes", PROCESS_DEADLINE, async {
        svc.processes().terminate_all(PROCESS_DEADLINE).await;
        Ok(())
    })
    .await;

    if let Some(cloud) = svc.cloud() {
        step("cloud channel", CLOUD_DEADLINE, async {
            cloud.close(CLOUD_DEADLINE).await;
            Ok(())
        })
        .await;
    }

    if let Some(http) = http {
        step("http listener", HTTP_GRACE, http.stop(HTTP_GRACE)).await;
    }
}

/// Run one step. Failures and overruns are logged and never stop the
/// sequence.
async fn step<F>(name: &'static str, deadline: Duration, fut: F)
where
    F: Future<Output = Result<()>>,
{
    match tokio::time::timeout(deadline + STEP_SLACK, fut).await {
        Ok(Ok(())) => info!(step = name, "stopped"),
        Ok(Err(e)) => error!(step = name, error = %e, "shutdown step failed, continuing"),
        Err(_) => warn!(step = name, "shutdown step timed out, continuing"),
    }
}
