// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Low-ink auto-pause.
//
// After a telemetry refresh, devices whose lowest ink/toner channel has
// dropped to the pause threshold are paused in the spooler and resumed once
// they report healthy levels again. Manual pause/resume commands go through
// the same service so the paused set stays truthful.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use tracing::{info, instrument, warn};

use printwatch_bridge::traits::DeviceQueryFacility;
use printwatch_core::error::Result;
use printwatch_core::types::TelemetryReading;

/// What the service should do with one device after a refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseAction {
    Pause,
    Resume,
    Keep,
}

/// Pure decision for one reading.
///
/// Unsupported readings never change state: a missing level is not a
/// recovery.
pub fn decide(reading: &TelemetryReading, threshold: u8, currently_paused: bool) -> PauseAction {
    if !reading.supported() {
        return PauseAction::Keep;
    }
    match reading.lowest_ink_level() {
        Some(level) if level <= threshold && !currently_paused => PauseAction::Pause,
        Some(level) if level > threshold && currently_paused => PauseAction::Resume,
        _ => PauseAction::Keep,
    }
}

pub struct AutoPauseService {
    facility: Arc<dyn DeviceQueryFacility>,
    enabled: bool,
    threshold: u8,
    paused: Mutex<BTreeSet<String>>,
}

impl AutoPauseService {
    pub fn new(facility: Arc<dyn DeviceQueryFacility>, enabled: bool, threshold: u8) -> Self {
        Self {
            facility,
            enabled,
            threshold,
            paused: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn paused_devices(&self) -> Vec<String> {
        self.paused
            .lock()
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_paused(&self, name: &str) -> bool {
        self.paused.lock().map(|set| set.contains(name)).unwrap_or(false)
    }

    /// Apply the threshold policy to a batch of fresh readings.
    ///
    /// Returns the actions that were carried out. A failure on one device is
    /// logged and does not stop the others.
    pub async fn evaluate<'a, I>(&self, readings: I) -> Vec<(String, PauseAction)>
    where
        I: IntoIterator<Item = &'a TelemetryReading>,
    {
        if !self.enabled {
            return Vec::new();
        }
        let mut applied = Vec::new();
        for reading in readings {
            let action = decide(reading, self.threshold, self.is_paused(&reading.printer));
            let outcome = match action {
                PauseAction::Keep => continue,
                PauseAction::Pause => self.pause_device(&reading.printer).await,
                PauseAction::Resume => self.resume_device(&reading.printer).await,
            };
            match outcome {
                Ok(()) => applied.push((reading.printer.clone(), action)),
                Err(e) => warn!(device = %reading.printer, ?action, error = %e, "auto-pause action failed"),
            }
        }
        applied
    }

    #[instrument(skip(self))]
    pub async fn pause_device(&self, name: &str) -> Result<()> {
        self.facility.set_device_paused(name, true).await?;
        if let Ok(mut set) = self.paused.lock() {
            set.insert(name.to_string());
        }
        info!(device = %name, "device paused");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn resume_device(&self, name: &str) -> Result<()> {
        self.facility.set_device_paused(name, false).await?;
        if let Ok(mut set) = self.paused.lock() {
            set.remove(name);
        }
        info!(device = %name, "device resumed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use printwatch_core::types::{MonitoringMethod, TelemetrySource};

    use super::*;
    use crate::testing::FakeFacility;

    fn reading(name: &str, levels: &[(&str, u8)]) -> TelemetryReading {
        let levels: BTreeMap<String, u8> = levels.iter().map(|(c, l)| (c.to_string(), *l)).collect();
        TelemetryReading::with_levels(
            format!("id-{name}"),
            name,
            TelemetrySource::Protocol,
            MonitoringMethod::Protocol,
            levels,
        )
    }

    #[test]
    fn decision_table() {
        let low = reading("A", &[("black", 12), ("cyan", 80)]);
        let ok = reading("A", &[("black", 60)]);
        let drum_only_low = reading("A", &[("black", 60), ("drum", 3)]);
        let unsupported = TelemetryReading::unsupported(
            "id-A",
            "A",
            TelemetrySource::Local,
            MonitoringMethod::LocalAttached,
            "no data",
        );

        assert_eq!(decide(&low, 15, false), PauseAction::Pause);
        assert_eq!(decide(&low, 15, true), PauseAction::Keep);
        assert_eq!(decide(&ok, 15, true), PauseAction::Resume);
        assert_eq!(decide(&ok, 15, false), PauseAction::Keep);
        assert_eq!(decide(&drum_only_low, 15, false), PauseAction::Keep);
        assert_eq!(decide(&unsupported, 15, true), PauseAction::Keep);
    }

    #[tokio::test]
    async fn pauses_then_resumes() {
        let facility = Arc::new(FakeFacility::default());
        let service = AutoPauseService::new(facility.clone(), true, 15);

        let applied = service.evaluate([&reading("Office", &[("black", 9)])]).await;
        assert_eq!(applied, vec![("Office".to_string(), PauseAction::Pause)]);
        assert!(service.is_paused("Office"));

        let applied = service.evaluate([&reading("Office", &[("black", 95)])]).await;
        assert_eq!(applied, vec![("Office".to_string(), PauseAction::Resume)]);
        assert!(service.paused_devices().is_empty());

        let calls = facility.pause_calls.lock().unwrap().clone();
        assert_eq!(calls, vec![("Office".to_string(), true), ("Office".to_string(), false)]);
    }

    #[tokio::test]
    async fn disabled_service_does_nothing() {
        let facility = Arc::new(FakeFacility::default());
        let service = AutoPauseService::new(facility.clone(), false, 15);
        assert!(service.evaluate([&reading("Office", &[("black", 1)])]).await.is_empty());
        assert!(facility.pause_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn facility_failure_leaves_set_untouched() {
        let service = AutoPauseService::new(Arc::new(FakeFacility::failing()), true, 15);
        assert!(service.pause_device("Office").await.is_err());
        assert!(!service.is_paused("Office"));
    }
}
