// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Core domain types for the Printwatch agent.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Consumable thresholds
// ---------------------------------------------------------------------------

/// Levels at or below this percentage raise a warning.
pub const WARNING_THRESHOLD: u8 = 15;

/// Levels at or below this percentage are critical.
pub const CRITICAL_THRESHOLD: u8 = 10;

/// Drum life is reported on its own scale and never feeds the ink thresholds.
pub const DRUM_CHANNEL: &str = "drum";

// ---------------------------------------------------------------------------
// Devices
// ---------------------------------------------------------------------------

/// Coarse connectivity class of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortType {
    Usb,
    Network,
    Serial,
    Virtual,
}

/// Fine-grained port classification derived from the port identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Connection {
    Wsd,
    Usb,
    Parallel,
    Serial,
    Tcpip,
    Local,
    Fax,
    Unknown,
}

impl Connection {
    /// Classify a spooler port name. First match wins, case-insensitive.
    pub fn from_port_name(port_name: &str) -> Self {
        let port = port_name.to_ascii_lowercase();
        if port.is_empty() {
            Self::Unknown
        } else if port.contains("wsd") {
            Self::Wsd
        } else if port.contains("usb") {
            Self::Usb
        } else if port.contains("lpt") {
            Self::Parallel
        } else if port.contains("com") {
            Self::Serial
        } else if port.contains("ip_")
            || port.contains("192.")
            || port.contains("169.")
            || port.contains("10.")
        {
            Self::Tcpip
        } else if port.contains("localhost") {
            Self::Local
        } else if port.contains("fax") {
            Self::Fax
        } else {
            Self::Unknown
        }
    }

    /// Collapse to the coarse class. Unrecognised local ports count as a
    /// direct (USB-like) attachment.
    pub fn port_type(self, is_network: bool) -> PortType {
        if is_network {
            return PortType::Network;
        }
        match self {
            Self::Wsd | Self::Tcpip => PortType::Network,
            Self::Parallel | Self::Serial => PortType::Serial,
            Self::Fax => PortType::Virtual,
            Self::Usb | Self::Local | Self::Unknown => PortType::Usb,
        }
    }
}

/// Normalised device status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Ready,
    Printing,
    Warmup,
    Stopped,
    Offline,
    Other,
    Unknown,
}

impl HealthStatus {
    /// Map a raw spooler status code. Extended codes collapse to `Other`.
    pub fn from_raw(code: Option<u32>) -> Self {
        match code {
            Some(1) => Self::Other,
            Some(2) => Self::Unknown,
            Some(3) => Self::Ready,
            Some(4) => Self::Printing,
            Some(5) => Self::Warmup,
            Some(6) => Self::Stopped,
            Some(7) => Self::Offline,
            Some(_) => Self::Other,
            None => Self::Unknown,
        }
    }

    pub fn is_online(self) -> bool {
        matches!(self, Self::Ready | Self::Printing | Self::Warmup)
    }
}

/// Printer manufacturer, detected from free-text identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Vendor {
    #[serde(rename = "HP")]
    Hp,
    Canon,
    Epson,
    Brother,
    Xerox,
    Samsung,
    Lexmark,
    Ricoh,
    Kyocera,
    Konica,
    Sharp,
    Toshiba,
    #[serde(rename = "OKI")]
    Oki,
    Dell,
    Unknown,
}

/// Keyword table in match priority order.
const VENDOR_KEYWORDS: &[(Vendor, &[&str])] = &[
    (Vendor::Hp, &["hp", "hewlett-packard", "hewlett packard"]),
    (Vendor::Canon, &["canon"]),
    (Vendor::Epson, &["epson"]),
    (Vendor::Brother, &["brother"]),
    (Vendor::Xerox, &["xerox"]),
    (Vendor::Samsung, &["samsung"]),
    (Vendor::Lexmark, &["lexmark"]),
    (Vendor::Ricoh, &["ricoh"]),
    (Vendor::Kyocera, &["kyocera"]),
    (Vendor::Konica, &["konica", "konica minolta"]),
    (Vendor::Sharp, &["sharp"]),
    (Vendor::Toshiba, &["toshiba"]),
    (Vendor::Oki, &["oki", "oki data"]),
    (Vendor::Dell, &["dell"]),
];

impl Vendor {
    /// Case-insensitive substring match of `driver + " " + comment`.
    pub fn detect(driver_name: &str, comment: &str) -> Self {
        let haystack = format!("{driver_name} {comment}").to_lowercase();
        VENDOR_KEYWORDS
            .iter()
            .find(|(_, keywords)| keywords.iter().any(|k| haystack.contains(k)))
            .map(|(vendor, _)| *vendor)
            .unwrap_or(Self::Unknown)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Hp => "HP",
            Self::Canon => "Canon",
            Self::Epson => "Epson",
            Self::Brother => "Brother",
            Self::Xerox => "Xerox",
            Self::Samsung => "Samsung",
            Self::Lexmark => "Lexmark",
            Self::Ricoh => "Ricoh",
            Self::Kyocera => "Kyocera",
            Self::Konica => "Konica",
            Self::Sharp => "Sharp",
            Self::Toshiba => "Toshiba",
            Self::Oki => "OKI",
            Self::Dell => "Dell",
            Self::Unknown => "Unknown",
        }
    }

    /// Vendors whose network devices expose consumable levels.
    pub fn exposes_consumables(self) -> bool {
        matches!(
            self,
            Self::Hp | Self::Canon | Self::Epson | Self::Brother | Self::Xerox
        )
    }
}

impl std::fmt::Display for Vendor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A physical or logical printer visible from this host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    /// Stable across scans: derived from the name.
    pub id: String,
    pub name: String,
    pub port_type: PortType,
    pub connection: Connection,
    /// IPv4/IPv6 literal or hostname, when one could be extracted.
    pub ip_address: Option<String>,
    pub is_network: bool,
    pub vendor: Vendor,
    pub health_status: HealthStatus,
    pub raw_status: Option<u32>,
    pub supports_telemetry: bool,
    pub driver_name: String,
    pub port_name: String,
    pub location: String,
    pub comment: String,
    pub shared: bool,
    pub work_offline: bool,
}

impl Device {
    /// UUIDv5 of the device name.
    pub fn stable_id(name: &str) -> String {
        Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
    }

    pub fn is_online(&self) -> bool {
        !self.work_offline && self.health_status.is_online()
    }

    pub fn is_offline(&self) -> bool {
        self.work_offline || self.health_status == HealthStatus::Offline
    }

    pub fn is_printing(&self) -> bool {
        self.health_status == HealthStatus::Printing
    }
}

// ---------------------------------------------------------------------------
// Consumable telemetry
// ---------------------------------------------------------------------------

/// Which adapter produced a reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TelemetrySource {
    Protocol,
    Local,
    None,
}

/// Path the engine took to obtain a reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MonitoringMethod {
    /// Network protocol query succeeded.
    #[serde(rename = "SNMP")]
    Protocol,
    /// Network device, protocol query failed or was unsupported.
    #[serde(rename = "WMI-Fallback")]
    LocalFallback,
    /// Network device without a resolvable address.
    #[serde(rename = "WMI-NoIP")]
    LocalNoAddress,
    /// Directly attached device.
    #[serde(rename = "WMI-USB")]
    LocalAttached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WarningSeverity {
    Warning,
    Critical,
}

/// One low consumable channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InkWarning {
    pub color: String,
    pub level: u8,
    pub message: String,
    pub severity: WarningSeverity,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InkHealthStatus {
    Critical,
    Warning,
    Healthy,
    Unsupported,
}

/// Consumable levels for one device at one point in time.
///
/// Warnings and the health summary are derived from `levels` on demand and
/// never stored, so a reading cannot disagree with itself.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryReading {
    pub device_id: String,
    pub printer: String,
    levels: BTreeMap<String, u8>,
    supported: bool,
    pub source: TelemetrySource,
    pub monitoring_method: MonitoringMethod,
    pub captured_at: DateTime<Utc>,
    pub vendor: Option<String>,
    pub system_info: Option<String>,
    pub page_count: Option<u64>,
    pub ip_address: Option<String>,
    pub message: Option<String>,
}

impl TelemetryReading {
    /// A supported reading. Values above 100 are dropped.
    pub fn with_levels(
        device_id: impl Into<String>,
        printer: impl Into<String>,
        source: TelemetrySource,
        monitoring_method: MonitoringMethod,
        levels: BTreeMap<String, u8>,
    ) -> Self {
        let levels = levels.into_iter().filter(|(_, v)| *v <= 100).collect();
        Self {
            device_id: device_id.into(),
            printer: printer.into(),
            levels,
            supported: true,
            source,
            monitoring_method,
            captured_at: Utc::now(),
            vendor: None,
            system_info: None,
            page_count: None,
            ip_address: None,
            message: None,
        }
    }

    /// An unsupported reading; always has empty levels.
    pub fn unsupported(
        device_id: impl Into<String>,
        printer: impl Into<String>,
        source: TelemetrySource,
        monitoring_method: MonitoringMethod,
        message: impl Into<String>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            printer: printer.into(),
            levels: BTreeMap::new(),
            supported: false,
            source,
            monitoring_method,
            captured_at: Utc::now(),
            vendor: None,
            system_info: None,
            page_count: None,
            ip_address: None,
            message: Some(message.into()),
        }
    }

    /// Downgrade to unsupported, clearing the levels.
    pub fn into_unsupported(mut self, message: impl Into<String>) -> Self {
        self.levels.clear();
        self.supported = false;
        self.message = Some(message.into());
        self
    }

    pub fn levels(&self) -> &BTreeMap<String, u8> {
        &self.levels
    }

    pub fn supported(&self) -> bool {
        self.supported
    }

    /// All channels at or below the warning threshold, drum excluded.
    pub fn warnings(&self) -> Vec<InkWarning> {
        self.levels
            .iter()
            .filter(|(color, level)| color.as_str() != DRUM_CHANNEL && **level <= WARNING_THRESHOLD)
            .map(|(color, level)| InkWarning {
                color: color.clone(),
                level: *level,
                message: format!("{color} ink low: {level}%"),
                severity: if *level <= CRITICAL_THRESHOLD {
                    WarningSeverity::Critical
                } else {
                    WarningSeverity::Warning
                },
                timestamp: self.captured_at,
            })
            .collect()
    }

    pub fn critical_warnings(&self) -> Vec<InkWarning> {
        self.warnings()
            .into_iter()
            .filter(|w| w.severity == WarningSeverity::Critical)
            .collect()
    }

    pub fn ink_health_status(&self) -> InkHealthStatus {
        let warnings = self.warnings();
        if warnings.iter().any(|w| w.severity == WarningSeverity::Critical) {
            InkHealthStatus::Critical
        } else if !warnings.is_empty() {
            InkHealthStatus::Warning
        } else if self.supported {
            InkHealthStatus::Healthy
        } else {
            InkHealthStatus::Unsupported
        }
    }

    pub fn warning_summary(&self) -> String {
        match self.warnings().len() {
            0 => "All ink levels normal".into(),
            n => format!("{n} ink warning(s)"),
        }
    }

    /// Lowest ink/toner level, drum excluded.
    pub fn lowest_ink_level(&self) -> Option<u8> {
        self.levels
            .iter()
            .filter(|(color, _)| color.as_str() != DRUM_CHANNEL)
            .map(|(_, level)| *level)
            .min()
    }
}

impl Serialize for TelemetryReading {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Wire<'a> {
            device_id: &'a str,
            printer: &'a str,
            levels: &'a BTreeMap<String, u8>,
            supported: bool,
            source: TelemetrySource,
            monitoring_method: MonitoringMethod,
            last_checked: DateTime<Utc>,
            vendor: &'a Option<String>,
            system_info: &'a Option<String>,
            page_count: Option<u64>,
            ip_address: &'a Option<String>,
            message: &'a Option<String>,
            warnings: Vec<InkWarning>,
            critical_warnings: Vec<InkWarning>,
            has_warnings: bool,
            has_critical_warnings: bool,
            ink_health_status: InkHealthStatus,
            warning_summary: String,
        }

        let warnings = self.warnings();
        let critical_warnings = self.critical_warnings();
        Wire {
            device_id: &self.device_id,
            printer: &self.printer,
            levels: &self.levels,
            supported: self.supported,
            source: self.source,
            monitoring_method: self.monitoring_method,
            last_checked: self.captured_at,
            vendor: &self.vendor,
            system_info: &self.system_info,
            page_count: self.page_count,
            ip_address: &self.ip_address,
            message: &self.message,
            has_warnings: !warnings.is_empty(),
            has_critical_warnings: !critical_warnings.is_empty(),
            ink_health_status: self.ink_health_status(),
            warning_summary: self.warning_summary(),
            warnings,
            critical_warnings,
        }
        .serialize(serializer)
    }
}

// ---------------------------------------------------------------------------
// Print jobs and page counts
// ---------------------------------------------------------------------------

/// A completed job observed on the local spooler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrintJob {
    pub job_fingerprint: String,
    pub device: String,
    pub pages: u32,
    pub user: String,
    /// Host-local wall-clock submission time.
    pub submitted_at: NaiveDateTime,
    pub document: Option<String>,
    pub computer: Option<String>,
}

impl PrintJob {
    /// `"{device}-{job_id}-{yyyyMMddHHmmss}"`.
    pub fn fingerprint(device: &str, job_id: u32, submitted_at: NaiveDateTime) -> String {
        format!("{device}-{job_id}-{}", submitted_at.format("%Y%m%d%H%M%S"))
    }
}

/// One device's line in a daily usage report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevicePages {
    pub name: String,
    pub pages: u64,
    pub total_lifetime: u64,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Per-device page usage for one day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyReport {
    pub success: bool,
    pub date: NaiveDate,
    pub total_pages: u64,
    /// Sorted by pages, busiest first.
    pub printers: Vec<DevicePages>,
    pub count: usize,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Cloud connector
// ---------------------------------------------------------------------------

/// Lifecycle of the cloud channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectorState {
    Disconnected,
    Connecting,
    Registering,
    Connected,
    GivenUp,
}

impl std::fmt::Display for ConnectorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Registering => "REGISTERING",
            Self::Connected => "CONNECTED",
            Self::GivenUp => "GIVEN_UP",
        };
        f.write_str(s)
    }
}
