// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Stub facility for hosts without a print spooler integration.
//
// Spooler-backed methods return `PlatformUnavailable`. SNMP and name
// resolution are plain network operations and work everywhere.

use std::time::Duration;

use async_trait::async_trait;

use printwatch_core::error::{PrintwatchError, Result};

use crate::host::lookup_address;
use crate::snmp::{SnmpClient, VarBind};
use crate::traits::*;

/// Facility returned on non-Windows hosts.
#[derive(Default)]
pub struct StubFacility {
    snmp: SnmpClient,
}

impl StubFacility {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeviceQueryFacility for StubFacility {
    async fn list_devices(&self) -> Result<Vec<RawDeviceRecord>> {
        tracing::warn!("DeviceQueryFacility::list_devices called on stub facility");
        Err(PrintwatchError::PlatformUnavailable)
    }

    async fn query_device_protocol(
        &self,
        address: &str,
        oids: &[&str],
        timeout: Duration,
    ) -> Result<Vec<VarBind>> {
        self.snmp.get(address, oids, timeout).await
    }

    async fn query_device_local(&self, _name: &str) -> Result<LocalProbe> {
        Err(PrintwatchError::PlatformUnavailable)
    }

    async fn list_todays_jobs(&self) -> Result<Vec<RawJobRecord>> {
        tracing::warn!("DeviceQueryFacility::list_todays_jobs called on stub facility");
        Err(PrintwatchError::PlatformUnavailable)
    }

    async fn resolve_hostname(&self, hostname: &str) -> Result<Option<String>> {
        lookup_address(hostname).await
    }

    async fn set_device_paused(&self, _name: &str, _paused: bool) -> Result<()> {
        tracing::warn!("DeviceQueryFacility::set_device_paused called on stub facility");
        Err(PrintwatchError::PlatformUnavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spooler_methods_are_unavailable() {
        let stub = StubFacility::new();
        assert!(matches!(
            stub.list_devices().await,
            Err(PrintwatchError::PlatformUnavailable)
        ));
        assert!(matches!(
            stub.set_device_paused("x", true).await,
            Err(PrintwatchError::PlatformUnavailable)
        ));
    }

    #[tokio::test]
    async fn address_literals_resolve_to_themselves() {
        let stub = StubFacility::new();
        assert_eq!(
            stub.resolve_hostname("127.0.0.1").await.unwrap(),
            Some("127.0.0.1".to_string())
        );
    }
}
