// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Agent configuration.
//
// Values are layered: built-in defaults, then `config.json` in the data
// directory, then environment variables, then command-line flags. The core
// only ever reads the result.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{PrintwatchError, Result};

/// Default backend endpoint for the cloud uplink.
pub const DEFAULT_CLOUD_WS_URL: &str = "ws://localhost:3001/ws/agent";

/// Longest accepted period for any recurring task (one week).
pub const MAX_PERIOD_MS: u64 = 7 * 24 * 60 * 60 * 1000;

/// Longest accepted page-history retention (100 years).
pub const MAX_RETENTION_DAYS: u32 = 36_500;

/// Persistent agent settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    // -- Identity --
    pub agent_id: String,
    pub agent_name: String,
    pub company_name: String,
    pub location: String,

    // -- Cloud uplink --
    /// Whether the cloud connector is started at all.
    pub cloud_enabled: bool,
    pub cloud_ws_url: String,
    /// Bearer token sent on the upgrade request.
    pub agent_token: String,
    pub heartbeat_interval_ms: u64,
    pub report_push_interval_ms: u64,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    /// Drop the channel after this many heartbeat intervals without any
    /// inbound frame. `None` keeps transport close/error as the only signal.
    pub liveness_timeout_heartbeats: Option<u32>,

    // -- Local surface --
    pub http_port: u16,

    // -- Monitoring --
    pub ink_check_interval_ms: u64,
    pub job_poll_interval_ms: u64,
    pub telemetry_cache_ttl_ms: u64,
    pub inter_device_delay_ms: u64,
    /// Days of per-day page history kept in the page store.
    pub retention_days: u32,
    pub auto_pause_on_low_ink: bool,
    pub low_ink_pause_threshold: u8,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent_id: "WINDOWS-PC-001".into(),
            agent_name: default_agent_name(),
            company_name: String::new(),
            location: String::new(),
            cloud_enabled: true,
            cloud_ws_url: DEFAULT_CLOUD_WS_URL.into(),
            agent_token: String::new(),
            heartbeat_interval_ms: 30_000,
            report_push_interval_ms: 30_000,
            reconnect_delay_ms: 5_000,
            max_reconnect_attempts: 10,
            liveness_timeout_heartbeats: None,
            http_port: 5001,
            ink_check_interval_ms: 30_000,
            job_poll_interval_ms: 30_000,
            telemetry_cache_ttl_ms: 30_000,
            inter_device_delay_ms: 500,
            retention_days: 30,
            auto_pause_on_low_ink: false,
            low_ink_pause_threshold: 15,
        }
    }
}

impl AgentConfig {
    /// Overlay environment variables on top of the current values.
    ///
    /// `lookup` is usually `|k| std::env::var(k).ok()`; tests pass a map.
    /// Unparseable numeric or boolean values are ignored so a typo in the
    /// service environment never prevents startup.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("CLOUD_ENABLED").and_then(|v| parse_bool(&v)) {
            self.cloud_enabled = v;
        }
        if let Some(v) = lookup("CLOUD_WS_URL").filter(|v| !v.is_empty()) {
            self.cloud_ws_url = v;
        }
        if let Some(v) = lookup("AGENT_TOKEN") {
            self.agent_token = v;
        }
        if let Some(v) = lookup("AGENT_ID").filter(|v| !v.is_empty()) {
            self.agent_id = v;
        }
        if let Some(v) = lookup("AGENT_NAME").filter(|v| !v.is_empty()) {
            self.agent_name = v;
        }
        if let Some(v) = lookup("COMPANY_NAME") {
            self.company_name = v;
        }
        if let Some(v) = lookup("AGENT_LOCATION") {
            self.location = v;
        }
        if let Some(v) = lookup("HTTP_PORT").and_then(|v| v.parse().ok()) {
            self.http_port = v;
        }
        if let Some(v) = lookup("INK_CHECK_INTERVAL").and_then(|v| v.parse().ok()) {
            self.ink_check_interval_ms = v;
        }
    }

    /// Check the values that would otherwise fail later and far from here.
    pub fn validate(&self) -> Result<()> {
        if self.cloud_enabled {
            self.cloud_url()?;
        }
        if self.agent_id.trim().is_empty() {
            return Err(PrintwatchError::Config("agent_id must not be empty".into()));
        }
        for (name, ms) in [
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("report_push_interval_ms", self.report_push_interval_ms),
            ("reconnect_delay_ms", self.reconnect_delay_ms),
            ("ink_check_interval_ms", self.ink_check_interval_ms),
            ("job_poll_interval_ms", self.job_poll_interval_ms),
        ] {
            if ms == 0 || ms > MAX_PERIOD_MS {
                return Err(PrintwatchError::Config(format!(
                    "{name} must be between 1 and {MAX_PERIOD_MS}, got {ms}"
                )));
            }
        }
        if self.liveness_timeout_heartbeats == Some(0) {
            return Err(PrintwatchError::Config(
                "liveness_timeout_heartbeats must be at least 1".into(),
            ));
        }
        if self.retention_days > MAX_RETENTION_DAYS {
            return Err(PrintwatchError::Config(format!(
                "retention_days {} exceeds {MAX_RETENTION_DAYS}",
                self.retention_days
            )));
        }
        if self.low_ink_pause_threshold > 100 {
            return Err(PrintwatchError::Config(format!(
                "low_ink_pause_threshold {} is not a percentage",
                self.low_ink_pause_threshold
            )));
        }
        Ok(())
    }

    /// Parsed backend URL. Only `ws` and `wss` are accepted.
    pub fn cloud_url(&self) -> Result<Url> {
        let url = Url::parse(&self.cloud_ws_url)
            .map_err(|e| PrintwatchError::Config(format!("cloud_ws_url: {e}")))?;
        match url.scheme() {
            "ws" | "wss" => Ok(url),
            other => Err(PrintwatchError::Config(format!(
                "cloud_ws_url scheme must be ws or wss, got {other}"
            ))),
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn telemetry_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.telemetry_cache_ttl_ms)
    }

    pub fn inter_device_delay(&self) -> Duration {
        Duration::from_millis(self.inter_device_delay_ms)
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn default_agent_name() -> String {
    std::env::var("COMPUTERNAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| "printwatch-agent".into())
}
