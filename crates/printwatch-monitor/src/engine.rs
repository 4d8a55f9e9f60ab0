// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Consumable telemetry engine.
//
// Walks the device directory in scan order, one device at a time with a
// pause between queries so a shared network segment never sees a burst.
// Readings are cached per device name for a fixed TTL; a fresh reading always
// replaces the old one wholesale. A failure on one device never stops the
// cycle for the others.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use printwatch_bridge::traits::DeviceQueryFacility;
use printwatch_core::config::AgentConfig;
use printwatch_core::types::{Device, MonitoringMethod, TelemetryReading};

use crate::adapters::{choose_adapter, AdapterChoice, LocalQuery, ProtocolQuery};
use crate::directory::DeviceDirectory;

/// Overall bound on one device's protocol query (identification + levels).
pub const PROTOCOL_DEADLINE: Duration = Duration::from_secs(5);

/// Timing knobs, normally taken from the agent configuration.
#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub cache_ttl: Duration,
    pub inter_device_delay: Duration,
    pub protocol_deadline: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(30),
            inter_device_delay: Duration::from_millis(500),
            protocol_deadline: PROTOCOL_DEADLINE,
        }
    }
}

impl From<&AgentConfig> for EngineSettings {
    fn from(config: &AgentConfig) -> Self {
        Self {
            cache_ttl: config.telemetry_cache_ttl(),
            inter_device_delay: config.inter_device_delay(),
            protocol_deadline: PROTOCOL_DEADLINE,
        }
    }
}

struct CacheEntry {
    reading: TelemetryReading,
    stored_at: Instant,
}

/// Orchestrates the adapters per device and owns the telemetry cache.
pub struct TelemetryEngine {
    directory: DeviceDirectory,
    protocol: ProtocolQuery,
    local: LocalQuery,
    settings: EngineSettings,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

impl TelemetryEngine {
    pub fn new(facility: Arc<dyn DeviceQueryFacility>, settings: EngineSettings) -> Self {
        Self {
            directory: DeviceDirectory::new(Arc::clone(&facility)),
            protocol: ProtocolQuery::new(Arc::clone(&facility)),
            local: LocalQuery::new(facility),
            settings,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn directory(&self) -> &DeviceDirectory {
        &self.directory
    }

    // -- Refresh ---------------------------------------------------------------

    /// Read every device. Returns readings keyed by device id.
    ///
    /// With `force` the cache is bypassed for every device.
    #[instrument(skip(self))]
    pub async fn refresh(&self, force: bool) -> BTreeMap<String, TelemetryReading> {
        let devices = self.directory.list_devices().await;
        let mut results = BTreeMap::new();
        let mut queried_previous = false;

        for device in &devices {
            if !force {
                if let Some(cached) = self.cached(&device.name) {
                    debug!(device = %device.name, "using cached telemetry");
                    results.insert(device.id.clone(), cached);
                    continue;
                }
            }
            if queried_previous && !self.settings.inter_device_delay.is_zero() {
                tokio::time::sleep(self.settings.inter_device_delay).await;
            }
            let reading = self.query_device(device).await;
            self.store(&device.name, reading.clone());
            results.insert(device.id.clone(), reading);
            queried_previous = true;
        }

        let supported = results.values().filter(|r| r.supported()).count();
        let warnings = results.values().filter(|r| !r.warnings().is_empty()).count();
        let critical = results
            .values()
            .filter(|r| !r.critical_warnings().is_empty())
            .count();
        info!(
            total = results.len(),
            supported,
            warnings,
            critical,
            "telemetry cycle complete"
        );
        results
    }

    /// Reading for one device by name, from cache when fresh.
    ///
    /// `None` when the directory does not list a device by that name.
    pub async fn reading_for(&self, name: &str, force: bool) -> Option<TelemetryReading> {
        if !force {
            if let Some(cached) = self.cached(name) {
                return Some(cached);
            }
        }
        let devices = self.directory.list_devices().await;
        let device = devices.iter().find(|d| d.name == name)?;
        let reading = self.query_device(device).await;
        self.store(&device.name, reading.clone());
        Some(reading)
    }

    /// Last known reading for every device, keyed by device name.
    pub fn snapshot(&self) -> BTreeMap<String, TelemetryReading> {
        self.cache
            .lock()
            .map(|cache| {
                cache
                    .iter()
                    .map(|(name, entry)| (name.clone(), entry.reading.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Like `snapshot`, but only when the cache holds readings and none of
    /// them has outlived the TTL.
    pub fn warm_snapshot(&self) -> Option<BTreeMap<String, TelemetryReading>> {
        let cache = self.cache.lock().ok()?;
        if cache.is_empty() || cache.values().any(|e| e.stored_at.elapsed() >= self.settings.cache_ttl) {
            return None;
        }
        Some(
            cache
                .iter()
                .map(|(name, entry)| (name.clone(), entry.reading.clone()))
                .collect(),
        )
    }

    /// Drop every cached reading.
    pub fn clear_cache(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            let dropped = cache.len();
            cache.clear();
            info!(dropped, "telemetry cache cleared");
        }
    }

    // -- Per device ------------------------------------------------------------

    fn cached(&self, name: &str) -> Option<TelemetryReading> {
        let cache = self.cache.lock().ok()?;
        let entry = cache.get(name)?;
        (entry.stored_at.elapsed() < self.settings.cache_ttl).then(|| entry.reading.clone())
    }

    fn store(&self, name: &str, reading: TelemetryReading) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(
                name.to_string(),
                CacheEntry {
                    reading,
                    stored_at: Instant::now(),
                },
            );
        }
    }

    #[instrument(skip(self, device), fields(device = %device.name))]
    async fn query_device(&self, device: &Device) -> TelemetryReading {
        let address = if device.is_network {
            self.directory.resolve_address(device).await
        } else {
            None
        };

        match choose_adapter(device, address.as_deref()) {
            AdapterChoice::Local { method } => {
                let mut reading = self.local.query(device, method).await;
                reading.ip_address = address;
                reading
            }
            AdapterChoice::Protocol { address } => {
                let outcome =
                    tokio::time::timeout(self.settings.protocol_deadline, self.protocol.query(device, &address))
                        .await;
                match outcome {
                    Ok(Ok(reading)) if reading.supported() => return reading,
                    Ok(Ok(_)) => {
                        // The device answered; it just has nothing to say.
                        debug!("protocol reading unsupported, falling back to local query");
                    }
                    Ok(Err(e)) => {
                        warn!(address = %address, error = %e, "protocol query failed");
                    }
                    Err(_) => {
                        warn!(address = %address, "protocol query timed out");
                    }
                }
                let mut reading = self.local.query(device, MonitoringMethod::LocalFallback).await;
                reading.ip_address = Some(address);
                reading
            }
        }
    }

}

#[cfg(test)]
mod tests {
    use printwatch_bridge::traits::LocalProbe;
    use printwatch_core::types::{InkHealthStatus, TelemetrySource};

    use super::*;
    use crate::testing::{raw_network, raw_usb, FakeFacility};
    use crate::vendor::PAGE_COUNTER_OID;

    const BLACK: &str = "1.3.6.1.2.1.43.11.1.1.9.1.1";

    fn engine(facility: Arc<FakeFacility>) -> TelemetryEngine {
        TelemetryEngine::new(facility, EngineSettings::default())
    }

    #[tokio::test(start_paused = true)]
    async fn attached_devices_never_use_protocol() {
        let facility = Arc::new(FakeFacility::default().with_devices(vec![raw_usb("Desk Canon")]));
        let engine = engine(Arc::clone(&facility));

        let results = engine.refresh(false).await;
        assert_eq!(results.len(), 1);
        let reading = results.values().next().unwrap();
        assert_eq!(reading.monitoring_method, MonitoringMethod::LocalAttached);
        assert_eq!(reading.source, TelemetrySource::Local);
        assert_eq!(facility.protocol_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn critical_black_from_protocol() {
        let facility = Arc::new(
            FakeFacility::default()
                .with_devices(vec![raw_network("Office HP", Some("10.0.0.9"))])
                .with_snmp("10.0.0.9", "HP LaserJet", &[(BLACK, 8), (PAGE_COUNTER_OID, 100)]),
        );
        let engine = engine(Arc::clone(&facility));

        let results = engine.refresh(false).await;
        let reading = results.values().next().unwrap();
        assert_eq!(reading.monitoring_method, MonitoringMethod::Protocol);
        assert_eq!(reading.ink_health_status(), InkHealthStatus::Critical);
        let critical = reading.critical_warnings();
        assert_eq!(critical.len(), 1);
        assert_eq!((critical[0].color.as_str(), critical[0].level), ("black", 8));
    }

    #[tokio::test(start_paused = true)]
    async fn cache_hits_within_ttl() {
        let facility = Arc::new(
            FakeFacility::default()
                .with_devices(vec![raw_network("Office HP", Some("10.0.0.9"))])
                .with_snmp("10.0.0.9", "HP LaserJet", &[(BLACK, 55)]),
        );
        let engine = engine(Arc::clone(&facility));

        let first = engine.refresh(false).await;
        let calls = facility.protocol_calls();
        let second = engine.refresh(false).await;
        assert_eq!(facility.protocol_calls(), calls);
        assert_eq!(
            first.values().next().unwrap().levels(),
            second.values().next().unwrap().levels()
        );

        engine.refresh(true).await;
        assert!(facility.protocol_calls() > calls);

        let before_expiry = facility.protocol_calls();
        tokio::time::advance(Duration::from_secs(31)).await;
        engine.refresh(false).await;
        assert!(facility.protocol_calls() > before_expiry);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_device_is_retried_over_protocol_every_cycle() {
        let facility = Arc::new(
            FakeFacility::default().with_devices(vec![raw_network("Office HP", Some("10.0.0.50"))]),
        );
        let engine = engine(Arc::clone(&facility));

        let results = engine.refresh(true).await;
        let reading = results.values().next().unwrap();
        assert_eq!(reading.monitoring_method, MonitoringMethod::LocalFallback);
        assert_eq!(reading.ip_address.as_deref(), Some("10.0.0.50"));

        let mut calls = facility.protocol_calls();
        assert!(calls > 0);
        for _ in 0..5 {
            let results = engine.refresh(true).await;
            let reading = results.values().next().unwrap();
            assert_eq!(reading.monitoring_method, MonitoringMethod::LocalFallback);
            assert!(facility.protocol_calls() > calls, "every cycle tries the device first");
            calls = facility.protocol_calls();
        }
        assert_eq!(facility.local_calls(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn network_device_without_address_goes_local() {
        let facility = Arc::new(FakeFacility::default().with_devices(vec![raw_network("Lab Printer", None)]));
        let engine = engine(Arc::clone(&facility));

        let results = engine.refresh(false).await;
        let reading = results.values().next().unwrap();
        assert_eq!(reading.monitoring_method, MonitoringMethod::LocalNoAddress);
        assert_eq!(facility.protocol_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn one_failing_device_does_not_stop_the_cycle() {
        let facility = Arc::new(
            FakeFacility::default()
                .with_devices(vec![
                    raw_network("Dead", Some("10.0.0.50")),
                    raw_network("Alive", Some("10.0.0.9")),
                    raw_usb("Desk Canon"),
                ])
                .with_snmp("10.0.0.9", "HP", &[(BLACK, 70)])
                .with_probe(
                    "Desk Canon",
                    LocalProbe {
                        found: true,
                        driver_name: "Canon MF3010".into(),
                        port_name: "USB001".into(),
                        status_monitors: vec!["CNMSTMON".into()],
                    },
                ),
        );
        let engine = engine(Arc::clone(&facility));

        let results = engine.refresh(false).await;
        assert_eq!(results.len(), 3);
        let snapshot = engine.snapshot();
        assert_eq!(snapshot["Alive"].levels().get("black"), Some(&70));
        assert!(snapshot["Desk Canon"].supported());
        assert!(!snapshot["Dead"].supported());
    }

    #[tokio::test(start_paused = true)]
    async fn clear_cache_empties_snapshot() {
        let facility = Arc::new(FakeFacility::default().with_devices(vec![raw_usb("Desk")]));
        let engine = engine(facility);
        engine.refresh(false).await;
        assert_eq!(engine.snapshot().len(), 1);
        engine.clear_cache();
        assert!(engine.snapshot().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn warm_snapshot_only_while_every_reading_is_fresh() {
        let facility = Arc::new(FakeFacility::default().with_devices(vec![raw_usb("Desk")]));
        let engine = engine(facility);
        assert!(engine.warm_snapshot().is_none());

        engine.refresh(false).await;
        let warm = engine.warm_snapshot().unwrap();
        assert!(warm.contains_key("Desk"));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(engine.warm_snapshot().is_none());
        assert_eq!(engine.snapshot().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reading_for_unknown_device_is_none() {
        let facility = Arc::new(FakeFacility::default().with_devices(vec![raw_usb("Desk")]));
        let engine = engine(facility);
        assert!(engine.reading_for("Nope", false).await.is_none());
        assert!(engine.reading_for("Desk", false).await.is_some());
    }
}
