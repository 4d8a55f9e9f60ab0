// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Telemetry sources: SNMP against the device, or host-local instrumentation.
//
// Both produce the same `TelemetryReading` shape. Which one runs first is a
// pure function of the device attributes, see `choose_adapter`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument};

use printwatch_bridge::snmp::VarBind;
use printwatch_bridge::traits::{DeviceQueryFacility, LocalProbe};
use printwatch_core::error::{PrintwatchError, Result};
use printwatch_core::types::{Device, MonitoringMethod, TelemetryReading, TelemetrySource};

use crate::vendor::{OidProfile, PAGE_COUNTER_OID, SYS_DESCR_OID};

/// Bound on the sysDescr identification query.
pub const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(2);

/// Bound on the consumable-level query.
pub const LEVELS_TIMEOUT: Duration = Duration::from_secs(3);

/// Status-monitor process that makes Canon devices readable locally.
const CANON_STATUS_MONITOR: &str = "CNMSTMON";

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

/// The adapter to try first for a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterChoice {
    /// Query the device over SNMP; fall back to local on failure.
    Protocol { address: String },
    /// Go straight to the local query, tagged with why.
    Local { method: MonitoringMethod },
}

/// Pick the first adapter for `device`.
///
/// `address` is the resolved management address, if any.
pub fn choose_adapter(device: &Device, address: Option<&str>) -> AdapterChoice {
    if !device.is_network {
        return AdapterChoice::Local {
            method: MonitoringMethod::LocalAttached,
        };
    }
    match address {
        None => AdapterChoice::Local {
            method: MonitoringMethod::LocalNoAddress,
        },
        Some(address) => AdapterChoice::Protocol {
            address: address.to_string(),
        },
    }
}

// ---------------------------------------------------------------------------
// Protocol query
// ---------------------------------------------------------------------------

/// Vendor-aware SNMP query.
#[derive(Clone)]
pub struct ProtocolQuery {
    facility: Arc<dyn DeviceQueryFacility>,
    identify_timeout: Duration,
    levels_timeout: Duration,
}

impl ProtocolQuery {
    pub fn new(facility: Arc<dyn DeviceQueryFacility>) -> Self {
        Self {
            facility,
            identify_timeout: IDENTIFY_TIMEOUT,
            levels_timeout: LEVELS_TIMEOUT,
        }
    }

    /// Identify the device, then read its consumable levels and page counter.
    ///
    /// A device that answers but reports no usable levels yields an
    /// unsupported reading rather than an error.
    #[instrument(skip(self, device), fields(device = %device.name))]
    pub async fn query(&self, device: &Device, address: &str) -> Result<TelemetryReading> {
        let ident = self
            .facility
            .query_device_protocol(address, &[SYS_DESCR_OID], self.identify_timeout)
            .await
            .map_err(|e| unreachable(address, e))?;
        let system_info = ident
            .first()
            .and_then(|vb| vb.value.as_text())
            .unwrap_or_default();

        let profile = OidProfile::detect(&system_info);
        debug!(address, profile = profile.name(), "device identified");

        let oids = profile.query_oids();
        let bindings = self
            .facility
            .query_device_protocol(address, &oids, self.levels_timeout)
            .await
            .map_err(|e| unreachable(address, e))?;

        let (levels, page_count) = interpret_levels(profile, &bindings);
        let mut reading = if levels.is_empty() {
            TelemetryReading::unsupported(
                &device.id,
                &device.name,
                TelemetrySource::Protocol,
                MonitoringMethod::Protocol,
                "Device answered SNMP but reported no consumable levels",
            )
        } else {
            TelemetryReading::with_levels(
                &device.id,
                &device.name,
                TelemetrySource::Protocol,
                MonitoringMethod::Protocol,
                levels,
            )
        };
        reading.vendor = Some(profile.name().to_string());
        reading.system_info = (!system_info.is_empty()).then_some(system_info);
        reading.page_count = page_count;
        reading.ip_address = Some(address.to_string());
        Ok(reading)
    }
}

fn unreachable(address: &str, err: PrintwatchError) -> PrintwatchError {
    match err {
        PrintwatchError::ProtocolUnreachable(_) => err,
        other => PrintwatchError::ProtocolUnreachable(format!("{address}: {other}")),
    }
}

/// Map bindings back onto channel names.
///
/// Percentages outside 0..=100 (including the negative "unknown" sentinels
/// the Printer MIB uses) are dropped. The page counter takes any
/// non-negative integer.
pub fn interpret_levels(profile: OidProfile, bindings: &[VarBind]) -> (BTreeMap<String, u8>, Option<u64>) {
    let value_of = |oid: &str| {
        bindings
            .iter()
            .find(|vb| vb.oid == oid)
            .and_then(|vb| vb.value.as_u64())
    };

    let levels = profile
        .channels()
        .iter()
        .filter_map(|(channel, oid)| {
            let value = value_of(oid)?;
            let pct = u8::try_from(value).ok().filter(|v| *v <= 100)?;
            Some((channel.to_string(), pct))
        })
        .collect();

    (levels, value_of(PAGE_COUNTER_OID))
}

// ---------------------------------------------------------------------------
// Local query
// ---------------------------------------------------------------------------

/// Host-local query. Never fails: problems become unsupported readings.
#[derive(Clone)]
pub struct LocalQuery {
    facility: Arc<dyn DeviceQueryFacility>,
}

impl LocalQuery {
    pub fn new(facility: Arc<dyn DeviceQueryFacility>) -> Self {
        Self { facility }
    }

    #[instrument(skip(self, device), fields(device = %device.name))]
    pub async fn query(&self, device: &Device, method: MonitoringMethod) -> TelemetryReading {
        match self.facility.query_device_local(&device.name).await {
            Ok(probe) => interpret_probe(device, method, &probe),
            Err(e) => {
                debug!(error = %e, "local query failed");
                TelemetryReading::unsupported(
                    &device.id,
                    &device.name,
                    TelemetrySource::Local,
                    method,
                    format!("Local query failed: {e}"),
                )
            }
        }
    }
}

/// Human label for a spooler port.
pub fn port_label(port_name: &str) -> &'static str {
    let port = port_name.to_uppercase();
    if port.contains("USB") {
        "USB"
    } else if port.contains("WSD") {
        "WSD Network"
    } else if port.contains("IP_") || port.contains("TCP") {
        "TCP/IP Network"
    } else {
        "Other"
    }
}

/// Vendor heuristics over a local probe.
pub fn interpret_probe(device: &Device, method: MonitoringMethod, probe: &LocalProbe) -> TelemetryReading {
    let unsupported = |vendor: Option<&str>, message: &str| {
        let mut r = TelemetryReading::unsupported(
            &device.id,
            &device.name,
            TelemetrySource::Local,
            method,
            message,
        );
        r.vendor = vendor.map(str::to_string);
        r
    };

    if !probe.found {
        return unsupported(None, "Printer not found");
    }

    let driver = probe.driver_name.to_lowercase();
    let port = port_label(&probe.port_name);

    if driver.contains("canon") {
        let monitor_running = probe
            .status_monitors
            .iter()
            .any(|p| p.eq_ignore_ascii_case(CANON_STATUS_MONITOR));
        if monitor_running {
            let mut r = TelemetryReading::with_levels(
                &device.id,
                &device.name,
                TelemetrySource::Local,
                method,
                BTreeMap::new(),
            );
            r.vendor = Some("Canon".into());
            r.message = Some("Canon Status Monitor is running.".into());
            return r;
        }
        return unsupported(
            Some("Canon"),
            "Install Canon Status Monitor from Canon website for ink monitoring.",
        );
    }
    if driver.contains("epson") {
        return unsupported(
            Some("Epson"),
            "Epson printer detected. Requires Epson Status Monitor for ink levels.",
        );
    }
    if driver.contains("hp") {
        let message = if port.contains("Network") {
            "HP Network printer. Use SNMP for ink monitoring."
        } else {
            "HP USB printer. HP Smart app may provide ink levels."
        };
        return unsupported(Some("HP"), message);
    }

    let message = if port == "USB" {
        "Generic USB printer. Ink monitoring not available via standard Windows APIs."
    } else {
        "Generic printer detected."
    };
    unsupported(Some("Generic"), message)
}
