// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Collaborator boundaries for host-specific capabilities.
//
// The monitoring engines never talk to the operating system directly. Device
// enumeration, instrumentation queries, the spooler's job list and the page
// store all sit behind these traits so that they can be swapped per platform
// and faked in tests.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use printwatch_core::error::Result;

use crate::snmp::VarBind;

/// One printer as reported by the host, before normalisation.
///
/// Field names follow the host's JSON output. Everything except the name is
/// optional because the host emits `null` freely.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RawDeviceRecord {
    pub name: String,
    #[serde(default)]
    pub printer_status: Option<u32>,
    #[serde(default)]
    pub shared: Option<bool>,
    #[serde(default)]
    pub work_offline: Option<bool>,
    #[serde(default)]
    pub port_name: Option<String>,
    #[serde(default)]
    pub driver_name: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
}

/// One spooler job as reported by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawJobRecord {
    #[serde(rename = "Printer")]
    pub printer: String,
    #[serde(rename = "JobId")]
    pub job_id: u32,
    #[serde(rename = "JobStatus")]
    pub status: String,
    #[serde(rename = "SubmittedTime")]
    pub submitted_at: NaiveDateTime,
    #[serde(rename = "PagesPrinted", default)]
    pub pages_printed: Option<u32>,
    #[serde(rename = "UserName", default)]
    pub user_name: Option<String>,
    #[serde(rename = "ComputerName", default)]
    pub computer_name: Option<String>,
    #[serde(rename = "DocumentName", default)]
    pub document_name: Option<String>,
}

/// Host-local instrumentation facts about one printer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LocalProbe {
    /// Whether the host knows a printer by this name at all.
    pub found: bool,
    #[serde(default)]
    pub driver_name: String,
    #[serde(default)]
    pub port_name: String,
    /// Vendor status-monitor processes currently running.
    #[serde(default)]
    pub status_monitors: Vec<String>,
}

/// Enumeration and status of printers attached to or visible from this host.
///
/// Every method may fail with `QueryFailure`; callers decide whether that is
/// fatal (it almost never is).
#[async_trait]
pub trait DeviceQueryFacility: Send + Sync {
    /// All printers the host knows about, unfiltered.
    async fn list_devices(&self) -> Result<Vec<RawDeviceRecord>>;

    /// Network management query against a device address.
    ///
    /// Returns one binding per requested OID, in request order. OIDs the
    /// device does not implement come back as `NoSuchObject`.
    async fn query_device_protocol(
        &self,
        address: &str,
        oids: &[&str],
        timeout: Duration,
    ) -> Result<Vec<VarBind>>;

    /// Host-local instrumentation for one printer.
    async fn query_device_local(&self, name: &str) -> Result<LocalProbe>;

    /// Spooler jobs submitted today, any status.
    async fn list_todays_jobs(&self) -> Result<Vec<RawJobRecord>>;

    /// Resolve a device-derived hostname to an address literal.
    async fn resolve_hostname(&self, hostname: &str) -> Result<Option<String>>;

    /// Pause or resume a printer queue.
    async fn set_device_paused(&self, name: &str, paused: bool) -> Result<()>;
}

/// Whole-document JSON persistence.
#[async_trait]
pub trait PersistentStore: Send + Sync {
    /// `Ok(None)` when the document does not exist yet.
    async fn read_json(&self, path: &Path) -> Result<Option<serde_json::Value>>;

    /// Replace the document atomically.
    async fn write_json(&self, path: &Path, value: &serde_json::Value) -> Result<()>;

    async fn exists(&self, path: &Path) -> bool;
}
