// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Device directory: enumerate printers from the host and normalise them.
//
// Raw records come from the device-query facility. Virtual sinks (PDF, XPS,
// fax, OneNote) are dropped here so nothing downstream ever counts or queries
// them. Address extraction walks a fixed priority list and stops at the first
// hit.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use printwatch_bridge::traits::{DeviceQueryFacility, RawDeviceRecord};
use printwatch_core::error::Result;
use printwatch_core::types::{Connection, Device, HealthStatus, Vendor};

// ---------------------------------------------------------------------------
// Virtual sink filter
// ---------------------------------------------------------------------------

const SKIP_NAMES: &[&str] = &[
    "Microsoft Print to PDF",
    "Microsoft XPS Document Writer",
    "Fax",
    "OneNote",
    "Adobe PDF",
    "Send To OneNote",
];

const SKIP_PORT_PREFIXES: &[&str] = &["PORTPROMPT:", "FILE:", "SHRFAX:"];

/// Whether a raw record describes a virtual/digital sink rather than paper.
pub fn is_virtual_sink(record: &RawDeviceRecord) -> bool {
    if SKIP_NAMES.iter().any(|skip| record.name.contains(skip)) {
        return true;
    }

    let driver = record.driver_name.as_deref().unwrap_or_default();
    if driver.contains("Microsoft")
        && (driver.contains("PDF") || driver.contains("XPS") || driver.contains("Fax"))
    {
        return true;
    }

    let port = record.port_name.as_deref().unwrap_or_default();
    let port_lower = port.to_lowercase();
    SKIP_PORT_PREFIXES.iter().any(|p| port.contains(p))
        || port_lower.contains("pdf")
        || port_lower.contains("xps")
}

// ---------------------------------------------------------------------------
// Address extraction
// ---------------------------------------------------------------------------

/// Whether the port or location marks the device as network-attached.
pub fn looks_networked(port_name: &str, location: &str) -> bool {
    let port = port_name.to_uppercase();
    port.contains("IP_")
        || port.contains("WSD")
        || port.contains("192.")
        || port.contains("169.")
        || port.contains("10.")
        || location.contains("http://")
}

/// First dotted-quad embedded anywhere in `text`.
pub fn find_ipv4(text: &str) -> Option<Ipv4Addr> {
    text.split(|c: char| !(c.is_ascii_digit() || c == '.'))
        .filter(|token| !token.is_empty())
        .find_map(|token| {
            let parts: Vec<&str> = token.split('.').collect();
            parts.windows(4).find_map(|quad| {
                if quad.iter().any(|p| p.is_empty() || p.len() > 3) {
                    return None;
                }
                quad.join(".").parse().ok()
            })
        })
}

/// IPv6 literal inside `[...]`, with any `%zone` suffix removed.
pub fn find_bracketed_ipv6(text: &str) -> Option<Ipv6Addr> {
    let start = text.find('[')? + 1;
    let end = start + text[start..].find(']')?;
    let inner = &text[start..end];
    let addr = inner.split('%').next().unwrap_or(inner);
    addr.parse().ok()
}

/// Host component of a URL-shaped location such as `http://printer-3f:3911/`.
pub fn find_url_host(location: &str) -> Option<String> {
    let parsed = url::Url::parse(location.trim()).ok()?;
    let host = parsed.host_str()?.trim_matches(|c| c == '[' || c == ']');
    (!host.is_empty()).then(|| host.to_string())
}

/// Hostname derived from a device name: everything before the first `(`.
///
/// Only returns names that could plausibly be DNS labels.
pub fn name_derived_hostname(name: &str) -> Option<String> {
    let candidate = name.split('(').next().unwrap_or(name).trim();
    let plausible = !candidate.is_empty()
        && candidate
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_');
    plausible.then(|| candidate.to_string())
}

/// Extraction steps that need no I/O, in priority order.
pub fn extract_address(port_name: &str, location: &str) -> Option<String> {
    if let Some(ip) = find_ipv4(port_name) {
        return Some(ip.to_string());
    }
    if let Some(ip) = find_ipv4(location) {
        return Some(ip.to_string());
    }
    if let Some(ip) = find_bracketed_ipv6(location) {
        return Some(ip.to_string());
    }
    find_url_host(location)
}

// ---------------------------------------------------------------------------
// Normalisation
// ---------------------------------------------------------------------------

/// Build a `Device` from a raw record. Returns `None` for virtual sinks.
///
/// The WSD name-resolution step needs the facility and is applied by
/// [`DeviceDirectory`]; everything here is pure.
pub fn normalize(record: &RawDeviceRecord) -> Option<Device> {
    if record.name.trim().is_empty() || is_virtual_sink(record) {
        return None;
    }

    let port_name = record.port_name.clone().unwrap_or_default();
    let driver_name = record.driver_name.clone().unwrap_or_default();
    let location = record.location.clone().unwrap_or_default();
    let comment = record.comment.clone().unwrap_or_default();
    let work_offline = record.work_offline.unwrap_or(false);

    let mut health_status = HealthStatus::from_raw(record.printer_status);
    if work_offline || record.name.contains("Offline") {
        health_status = HealthStatus::Offline;
    }

    let is_network = looks_networked(&port_name, &location);
    let ip_address = if is_network {
        extract_address(&port_name, &location)
    } else {
        None
    };
    let connection = Connection::from_port_name(&port_name);
    let vendor = Vendor::detect(&driver_name, &comment);

    Some(Device {
        id: Device::stable_id(&record.name),
        name: record.name.clone(),
        port_type: connection.port_type(is_network),
        connection,
        ip_address,
        is_network,
        vendor,
        health_status,
        raw_status: record.printer_status,
        supports_telemetry: is_network && vendor.exposes_consumables(),
        driver_name,
        port_name,
        location,
        comment,
        shared: record.shared.unwrap_or(false),
        work_offline,
    })
}

/// Addresses claimed by more than one device.
pub fn duplicate_addresses(devices: &[Device]) -> Vec<(String, usize)> {
    let mut seen: HashMap<&str, usize> = HashMap::new();
    for device in devices {
        if let Some(ip) = device.ip_address.as_deref() {
            *seen.entry(ip).or_default() += 1;
        }
    }
    let mut dupes: Vec<(String, usize)> = seen
        .into_iter()
        .filter(|(_, count)| *count > 1)
        .map(|(ip, count)| (ip.to_string(), count))
        .collect();
    dupes.sort();
    dupes
}

// ---------------------------------------------------------------------------
// Directory
// ---------------------------------------------------------------------------

/// Enumerates and normalises the printers visible from this host.
#[derive(Clone)]
pub struct DeviceDirectory {
    facility: Arc<dyn DeviceQueryFacility>,
}

impl DeviceDirectory {
    pub fn new(facility: Arc<dyn DeviceQueryFacility>) -> Self {
        Self { facility }
    }

    /// Enumerate devices, propagating facility failures.
    #[instrument(skip(self))]
    pub async fn try_list_devices(&self) -> Result<Vec<Device>> {
        let records = self.facility.list_devices().await?;
        let total = records.len();

        let mut devices = Vec::with_capacity(total);
        for record in &records {
            let Some(mut device) = normalize(record) else {
                debug!(name = %record.name, "skipping virtual device");
                continue;
            };
            if device.ip_address.is_none() && device.connection == Connection::Wsd {
                device.ip_address = self.resolve_by_name(&device.name).await;
            }
            devices.push(device);
        }

        for (ip, count) in duplicate_addresses(&devices) {
            warn!(ip = %ip, count, "address shared by several devices");
        }
        info!(found = devices.len(), skipped = total - devices.len(), "device scan complete");
        Ok(devices)
    }

    /// Enumerate devices. An unreachable facility yields an empty list.
    pub async fn list_devices(&self) -> Vec<Device> {
        match self.try_list_devices().await {
            Ok(devices) => devices,
            Err(e) => {
                warn!(error = %e, "device enumeration failed");
                Vec::new()
            }
        }
    }

    /// The device's extracted address, or a name-based lookup as a last resort.
    pub async fn resolve_address(&self, device: &Device) -> Option<String> {
        if let Some(ip) = &device.ip_address {
            return Some(ip.clone());
        }
        self.resolve_by_name(&device.name).await
    }

    async fn resolve_by_name(&self, name: &str) -> Option<String> {
        let hostname = name_derived_hostname(name)?;
        match self.facility.resolve_hostname(&hostname).await {
            Ok(Some(ip)) => {
                debug!(device = name, hostname = %hostname, ip = %ip, "resolved device hostname");
                Some(ip)
            }
            Ok(None) => None,
            Err(e) => {
                debug!(device = name, error = %e, "hostname resolution failed");
                None
            }
        }
    }
}
