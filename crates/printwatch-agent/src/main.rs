// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Printwatch agent entry point.
//
// Watches the printers visible to this host, counts printed pages, reads
// consumable levels and keeps the fleet backend informed over a persistent
// channel. A small HTTP facade serves the same data locally.

mod http;
mod services;
mod shutdown;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{Level, error, info, warn};
use tracing_subscriber::EnvFilter;

use printwatch_core::AgentConfig;
use printwatch_core::error::Result;

use crate::http::HttpServer;
use crate::services::agent_services::{AgentServices, load_or_create_config};
use crate::services::data_dir::data_dir;
use crate::shutdown::graceful_shutdown;

/// Printwatch printer fleet agent
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port for the local HTTP facade (overrides HTTP_PORT and config.json)
    #[arg(short, long)]
    port: Option<u16>,

    /// Directory holding config.json and the page store
    #[arg(long, env = "PRINTWATCH_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Run without the cloud uplink
    #[arg(long)]
    no_cloud: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Why the agent is stopping.
enum Stop {
    Signal(&'static str),
    Fault(String),
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(&args.log_level);

    info!(version = env!("CARGO_PKG_VERSION"), "printwatch agent starting");

    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "agent failed to start");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = match log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        };
        EnvFilter::from_default_env().add_directive(level.into())
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Defaults, then config.json, then environment, then flags.
fn layered_config(args: &Args, dir: &Path) -> Result<AgentConfig> {
    let mut config = load_or_create_config(dir);
    config.apply_env(|key| std::env::var(key).ok());
    if let Some(port) = args.port {
        config.http_port = port;
    }
    if args.no_cloud {
        config.cloud_enabled = false;
    }
    config.validate()?;
    Ok(config)
}

async fn run(args: Args) -> Result<ExitCode> {
    let dir = data_dir(args.data_dir.as_deref())?;
    let config = layered_config(&args, &dir)?;
    info!(
        agent_id = %config.agent_id,
        agent_name = %config.agent_name,
        cloud = config.cloud_enabled,
        port = config.http_port,
        "configuration loaded"
    );

    let port = config.http_port;
    let svc = AgentServices::init(config, dir).await?;
    let mut faults = svc.tasks().take_faults();

    let http = HttpServer::bind(svc.clone(), SocketAddr::from(([0, 0, 0, 0], port))).await?;
    svc.start_background();
    info!(addr = %http.local_addr(), "agent running, press Ctrl+C to stop");

    let stop = tokio::select! {
        name = stop_signal() => Stop::Signal(name),
        task = next_fault(&mut faults) => Stop::Fault(task),
    };

    let (reason, failed) = match &stop {
        Stop::Signal(name) => {
            info!(signal = name, "stop requested");
            (format!("received {name}"), false)
        }
        Stop::Fault(task) => {
            error!(task = %task, "background task failed");
            (format!("task {task} panicked"), true)
        }
    };

    let clean = graceful_shutdown(&svc, Some(http), &reason).await;
    Ok(if failed || !clean {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

#[cfg(unix)]
async fn stop_signal() -> &'static str {
    use tokio::signal::unix::{SignalKind, signal};

    match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => "SIGTERM",
                _ = sigint.recv() => "SIGINT",
            }
        }
        _ => {
            warn!("failed to install signal handlers, falling back to ctrl-c");
            ctrl_c().await
        }
    }
}

#[cfg(not(unix))]
async fn stop_signal() -> &'static str {
    ctrl_c().await
}

async fn ctrl_c() -> &'static str {
    match tokio::signal::ctrl_c().await {
        Ok(()) => "ctrl-c",
        Err(e) => {
            warn!(error = %e, "ctrl-c handler unavailable");
            std::future::pending().await
        }
    }
}

async fn next_fault(faults: &mut Option<UnboundedReceiver<String>>) -> String {
    if let Some(rx) = faults {
        if let Some(task) = rx.recv().await {
            return task;
        }
    }
    std::future::pending().await
}
