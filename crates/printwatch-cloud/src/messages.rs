// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Wire messages exchanged with the backend.
//
// Every frame is a JSON object tagged by `type`. Outbound frames are typed
// structs; inbound frames are validated against a small schema and anything
// that does not fit is reported as `MalformedData`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use printwatch_core::error::{PrintwatchError, Result};
use printwatch_core::types::{DailyReport, Device, TelemetryReading};

pub const CAPABILITY: &str = "print-job-monitoring";

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Who this agent is, as announced at registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentIdentity {
    pub agent_id: String,
    pub agent_name: String,
    pub hostname: String,
    pub platform: String,
    pub arch: String,
    pub company: String,
    pub location: String,
}

impl AgentIdentity {
    pub fn new(agent_id: &str, agent_name: &str, company: &str, location: &str) -> Self {
        Self {
            agent_id: agent_id.into(),
            agent_name: agent_name.into(),
            hostname: agent_name.into(),
            platform: std::env::consts::OS.into(),
            arch: std::env::consts::ARCH.into(),
            company: company.into(),
            location: location.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationData {
    #[serde(flatten)]
    pub identity: AgentIdentity,
    pub capability: &'static str,
    pub printers: Vec<Device>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PrintersPayload {
    pub printers: Vec<Device>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InkPayload {
    pub ink_status: BTreeMap<String, TelemetryReading>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrintEventPayload {
    pub printer: String,
    pub pages: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResponseData {
    pub command_id: Option<Value>,
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

/// Frames the agent sends.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    #[serde(rename_all = "camelCase")]
    Registration {
        action: &'static str,
        agent_id: String,
        data: RegistrationData,
    },
    #[serde(rename_all = "camelCase")]
    Heartbeat {
        agent_id: String,
        timestamp: DateTime<Utc>,
        status: &'static str,
        uptime: f64,
    },
    #[serde(rename_all = "camelCase")]
    PrinterUpdate {
        agent_id: String,
        data: PrintersPayload,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    InkStatus {
        agent_id: String,
        data: InkPayload,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    DailyReport {
        agent_id: String,
        data: DailyReport,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    PrintEvent {
        agent_id: String,
        data: PrintEventPayload,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    CommandResponse {
        agent_id: String,
        data: CommandResponseData,
    },
}

impl Outbound {
    pub fn registration(identity: &AgentIdentity, printers: Vec<Device>) -> Self {
        Self::Registration {
            action: "register",
            agent_id: identity.agent_id.clone(),
            data: RegistrationData {
                identity: identity.clone(),
                capability: CAPABILITY,
                printers,
                timestamp: Utc::now(),
            },
        }
    }

    pub fn heartbeat(agent_id: &str, uptime_secs: f64) -> Self {
        Self::Heartbeat {
            agent_id: agent_id.into(),
            timestamp: Utc::now(),
            status: "alive",
            uptime: uptime_secs,
        }
    }

    pub fn printer_update(agent_id: &str, printers: Vec<Device>) -> Self {
        Self::PrinterUpdate {
            agent_id: agent_id.into(),
            data: PrintersPayload { printers },
            timestamp: Utc::now(),
        }
    }

    pub fn ink_status(agent_id: &str, ink_status: BTreeMap<String, TelemetryReading>) -> Self {
        Self::InkStatus {
            agent_id: agent_id.into(),
            data: InkPayload { ink_status },
            timestamp: Utc::now(),
        }
    }

    pub fn daily_report(agent_id: &str, report: DailyReport) -> Self {
        Self::DailyReport {
            agent_id: agent_id.into(),
            data: report,
            timestamp: Utc::now(),
        }
    }

    pub fn print_event(agent_id: &str, printer: &str, pages: u64) -> Self {
        Self::PrintEvent {
            agent_id: agent_id.into(),
            data: PrintEventPayload {
                printer: printer.into(),
                pages,
            },
            timestamp: Utc::now(),
        }
    }

    pub fn command_response(agent_id: &str, data: CommandResponseData) -> Self {
        Self::CommandResponse {
            agent_id: agent_id.into(),
            data,
        }
    }

    /// Wire name, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Registration { .. } => "registration",
            Self::Heartbeat { .. } => "heartbeat",
            Self::PrinterUpdate { .. } => "printer_update",
            Self::InkStatus { .. } => "ink_status",
            Self::DailyReport { .. } => "daily_report",
            Self::PrintEvent { .. } => "print_event",
            Self::CommandResponse { .. } => "command_response",
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// A remote command as the backend sends it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    pub action: String,
    #[serde(default)]
    pub printer_name: Option<String>,
    /// Echoed back untouched; the backend uses both strings and numbers.
    #[serde(default)]
    pub command_id: Option<Value>,
}

/// Commands the agent knows how to carry out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    PauseDevice,
    ResumeDevice,
    GetStatus,
    GetConsumableStatus,
}

impl CommandKind {
    /// Legacy `*_printer` / `get_ink_status` spellings are still accepted.
    pub fn parse(action: &str) -> Option<Self> {
        match action {
            "pause_device" | "pause_printer" => Some(Self::PauseDevice),
            "resume_device" | "resume_printer" => Some(Self::ResumeDevice),
            "get_status" => Some(Self::GetStatus),
            "get_consumable_status" | "get_ink_status" => Some(Self::GetConsumableStatus),
            _ => None,
        }
    }
}

/// Frames the agent understands.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// `registration_ack`, `connection_ack` or `welcome`.
    RegistrationAck,
    HeartbeatAck,
    Command(CommandRequest),
    /// Well-formed but not something this agent handles.
    Other(String),
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
}

pub fn parse_inbound(text: &str) -> Result<Inbound> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| PrintwatchError::MalformedData(format!("backend frame is not JSON: {e}")))?;
    let envelope: Envelope = serde_json::from_value(value.clone())
        .map_err(|e| PrintwatchError::MalformedData(format!("backend frame has no type: {e}")))?;

    Ok(match envelope.kind.as_str() {
        "registration_ack" | "connection_ack" | "welcome" => Inbound::RegistrationAck,
        "heartbeat_ack" => Inbound::HeartbeatAck,
        "command" => Inbound::Command(
            serde_json::from_value(value)
                .map_err(|e| PrintwatchError::MalformedData(format!("bad command frame: {e}")))?,
        ),
        _ => Inbound::Other(envelope.kind),
    })
}
