// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Windows host facility backed by PowerShell and WMI.
//
// Each query runs a short PowerShell script that prints JSON. The output is
// parsed into a fixed schema; anything that does not fit is reported as
// `MalformedData` rather than half-understood.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::process::Command;
use tracing::{debug, instrument};

use printwatch_core::error::{PrintwatchError, Result};

use crate::process::ProcessRegistry;
use crate::snmp::{SnmpClient, VarBind};
use crate::traits::{DeviceQueryFacility, LocalProbe, RawDeviceRecord, RawJobRecord};

/// Upper bound for any single PowerShell invocation.
const SCRIPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Vendor status-monitor processes worth reporting.
const STATUS_MONITOR_PROCESSES: &[&str] = &["CNMSTMON"];

// ---------------------------------------------------------------------------
// Scripts
// ---------------------------------------------------------------------------

const LIST_DEVICES_SCRIPT: &str = r#"
Get-CimInstance -ClassName Win32_Printer |
  Select-Object Name, PrinterStatus, Shared, WorkOffline, PortName, DriverName, Location, Comment |
  ConvertTo-Json -Compress
"#;

const TODAYS_JOBS_SCRIPT: &str = r#"
$today = (Get-Date).ToString('yyyy-MM-dd')
$jobs = @()
foreach ($printer in (Get-Printer -ErrorAction SilentlyContinue)) {
  foreach ($job in (Get-PrintJob -PrinterName $printer.Name -ErrorAction SilentlyContinue)) {
    if ($job.SubmittedTime.ToString('yyyy-MM-dd') -ne $today) { continue }
    $jobs += [PSCustomObject]@{
      Printer       = $printer.Name
      JobId         = [int]$job.Id
      JobStatus     = [string]$job.JobStatus
      SubmittedTime = $job.SubmittedTime.ToString('yyyy-MM-ddTHH:mm:ss')
      PagesPrinted  = [int]$job.PagesPrinted
      UserName      = $job.UserName
      ComputerName  = $job.ComputerName
      DocumentName  = $job.DocumentName
    }
  }
}
ConvertTo-Json -InputObject @($jobs) -Compress
"#;

fn local_probe_script(name: &str) -> String {
    let monitors = STATUS_MONITOR_PROCESSES
        .iter()
        .map(|p| format!("'{p}'"))
        .collect::<Vec<_>>()
        .join(",");
    format!(
        r#"
$name = '{name}'
$p = Get-CimInstance -ClassName Win32_Printer | Where-Object {{ $_.Name -eq $name }} | Select-Object -First 1
$running = @(Get-Process -Name @({monitors}) -ErrorAction SilentlyContinue | ForEach-Object {{ $_.ProcessName.ToUpper() }})
if ($p) {{
  [PSCustomObject]@{{ Found = $true; DriverName = $p.DriverName; PortName = $p.PortName; StatusMonitors = $running }} | ConvertTo-Json -Compress
}} else {{
  [PSCustomObject]@{{ Found = $false; StatusMonitors = $running }} | ConvertTo-Json -Compress
}}
"#,
        name = escape_single_quoted(name),
    )
}

fn pause_script(name: &str, paused: bool) -> String {
    let method = if paused { "Pause" } else { "Resume" };
    format!(
        r#"
$name = '{name}'
$p = Get-CimInstance -ClassName Win32_Printer | Where-Object {{ $_.Name -eq $name }} | Select-Object -First 1
if (-not $p) {{ throw "printer not found" }}
Invoke-CimMethod -InputObject $p -MethodName {method} | Out-Null
"#,
        name = escape_single_quoted(name),
    )
}

/// PowerShell single-quoted literals escape `'` by doubling it.
fn escape_single_quoted(raw: &str) -> String {
    raw.replace('\'', "''")
}

// ---------------------------------------------------------------------------
// Output parsing
// ---------------------------------------------------------------------------

/// Parse a list the host may emit as `[]`, `[{...}]`, a bare `{...}`, or
/// nothing at all.
pub fn parse_list<T: DeserializeOwned>(output: &str) -> Result<Vec<T>> {
    let trimmed = output.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(Vec::new());
    }
    let value: serde_json::Value = serde_json::from_str(trimmed)
        .map_err(|e| PrintwatchError::MalformedData(format!("host output is not JSON: {e}")))?;
    let items = match value {
        serde_json::Value::Array(items) => items,
        obj @ serde_json::Value::Object(_) => vec![obj],
        other => {
            return Err(PrintwatchError::MalformedData(format!(
                "expected a list, got {other}"
            )));
        }
    };
    items
        .into_iter()
        .map(|item| {
            serde_json::from_value(item)
                .map_err(|e| PrintwatchError::MalformedData(format!("unexpected record shape: {e}")))
        })
        .collect()
}

pub fn parse_local_probe(output: &str) -> Result<LocalProbe> {
    serde_json::from_str(output.trim())
        .map_err(|e| PrintwatchError::MalformedData(format!("local probe: {e}")))
}

/// Resolve a hostname through the system resolver.
pub async fn lookup_address(hostname: &str) -> Result<Option<String>> {
    match tokio::net::lookup_host((hostname, 0)).await {
        Ok(mut addrs) => Ok(addrs.next().map(|a| a.ip().to_string())),
        Err(e) => {
            debug!(hostname, error = %e, "hostname did not resolve");
            Ok(None)
        }
    }
}

// ---------------------------------------------------------------------------
// Facility
// ---------------------------------------------------------------------------

/// Device-query facility for Windows hosts.
pub struct HostFacility {
    processes: Arc<ProcessRegistry>,
    snmp: SnmpClient,
    shell: String,
}

impl HostFacility {
    pub fn new(processes: Arc<ProcessRegistry>) -> Self {
        Self {
            processes,
            snmp: SnmpClient::default(),
            shell: "powershell.exe".into(),
        }
    }

    async fn run_script(&self, script: &str) -> Result<String> {
        let mut cmd = Command::new(&self.shell);
        cmd.args(["-NoProfile", "-NonInteractive", "-ExecutionPolicy", "Bypass", "-Command"])
            .arg(script);

        let out = self.processes.run(cmd, SCRIPT_TIMEOUT).await?;
        if out.stderr.contains("UnauthorizedAccess") || out.stderr.contains("Execution_Policies") {
            return Err(PrintwatchError::QueryFailure(
                "PowerShell execution policy blocks the agent; allow RemoteSigned for this user".into(),
            ));
        }
        if !out.status.success() {
            let detail = out.stderr.trim();
            return Err(PrintwatchError::QueryFailure(if detail.is_empty() {
                format!("PowerShell exited with {}", out.status)
            } else {
                detail.to_string()
            }));
        }
        Ok(out.stdout)
    }
}

#[async_trait]
impl DeviceQueryFacility for HostFacility {
    #[instrument(skip(self))]
    async fn list_devices(&self) -> Result<Vec<RawDeviceRecord>> {
        let output = self.run_script(LIST_DEVICES_SCRIPT).await?;
        parse_list(&output)
    }

    async fn query_device_protocol(
        &self,
        address: &str,
        oids: &[&str],
        timeout: Duration,
    ) -> Result<Vec<VarBind>> {
        self.snmp.get(address, oids, timeout).await
    }

    #[instrument(skip(self))]
    async fn query_device_local(&self, name: &str) -> Result<LocalProbe> {
        let output = self.run_script(&local_probe_script(name)).await?;
        parse_local_probe(&output)
    }

    async fn list_todays_jobs(&self) -> Result<Vec<RawJobRecord>> {
        let output = self.run_script(TODAYS_JOBS_SCRIPT).await?;
        parse_list(&output)
    }

    async fn resolve_hostname(&self, hostname: &str) -> Result<Option<String>> {
        lookup_address(hostname).await
    }

    async fn set_device_paused(&self, name: &str, paused: bool) -> Result<()> {
        self.run_script(&pause_script(name, paused)).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_object_is_a_one_element_list() {
        let records: Vec<RawDeviceRecord> =
            parse_list(r#"{"Name":"Office HP","PrinterStatus":3,"PortName":"IP_10.0.0.9"}"#)
                .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "Office HP");
        assert_eq!(records[0].printer_status, Some(3));
        assert_eq!(records[0].shared, None);
    }

    #[test]
    fn empty_output_is_an_empty_list() {
        let records: Vec<RawDeviceRecord> = parse_list("  \r\n").unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn nulls_are_tolerated() {
        let records: Vec<RawDeviceRecord> = parse_list(
            r#"[{"Name":"Lab","PrinterStatus":null,"Shared":null,"WorkOffline":false,"PortName":"USB001","DriverName":null,"Location":null,"Comment":null}]"#,
        )
        .unwrap();
        assert_eq!(records[0].work_offline, Some(false));
        assert_eq!(records[0].driver_name, None);
    }

    #[test]
    fn record_without_name_is_malformed() {
        let err = parse_list::<RawDeviceRecord>(r#"[{"PortName":"USB001"}]"#).unwrap_err();
        assert!(matches!(err, PrintwatchError::MalformedData(_)));
    }

    #[test]
    fn garbage_is_malformed() {
        let err = parse_list::<RawDeviceRecord>("Get-CimInstance : Access denied").unwrap_err();
        assert!(matches!(err, PrintwatchError::MalformedData(_)));
    }

    #[test]
    fn job_records_parse() {
        let jobs: Vec<RawJobRecord> = parse_list(
            r#"[{"Printer":"Office HP","JobId":12,"JobStatus":"Printed","SubmittedTime":"2026-03-09T14:05:07","PagesPrinted":3,"UserName":"ana","ComputerName":"PC1","DocumentName":"memo.docx"}]"#,
        )
        .unwrap();
        assert_eq!(jobs[0].job_id, 12);
        assert_eq!(jobs[0].pages_printed, Some(3));
        assert_eq!(jobs[0].submitted_at.format("%H:%M").to_string(), "14:05");
    }

    #[test]
    fn local_probe_parses() {
        let probe = parse_local_probe(
            r#"{"Found":true,"DriverName":"Canon MF3010","PortName":"USB001","StatusMonitors":["CNMSTMON"]}"#,
        )
        .unwrap();
        assert!(probe.found);
        assert_eq!(probe.status_monitors, vec!["CNMSTMON".to_string()]);

        let missing = parse_local_probe(r#"{"Found":false,"StatusMonitors":[]}"#).unwrap();
        assert!(!missing.found);
        assert!(missing.driver_name.is_empty());
    }

    #[test]
    fn quotes_in_names_are_escaped() {
        let script = local_probe_script("Bob's Printer");
        assert!(script.contains("$name = 'Bob''s Printer'"));
    }
}
