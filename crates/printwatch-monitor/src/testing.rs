// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// In-memory fakes for the host collaborators, shared by the unit tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use printwatch_bridge::snmp::{SnmpValue, VarBind};
use printwatch_bridge::traits::{DeviceQueryFacility, LocalProbe, RawDeviceRecord, RawJobRecord};
use printwatch_core::error::{PrintwatchError, Result};
use printwatch_core::types::Device;

use crate::directory::normalize;
use crate::vendor::SYS_DESCR_OID;

#[derive(Default)]
pub struct FakeFacility {
    failing: bool,
    devices: Vec<RawDeviceRecord>,
    snmp: HashMap<String, (String, HashMap<String, u64>)>,
    hostnames: HashMap<String, String>,
    probes: HashMap<String, LocalProbe>,
    jobs: Mutex<Vec<RawJobRecord>>,
    pub protocol_calls: AtomicUsize,
    pub local_calls: AtomicUsize,
    pub pause_calls: Mutex<Vec<(String, bool)>>,
}

impl FakeFacility {
    /// Every host call fails with `QueryFailure`.
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Default::default()
        }
    }

    pub fn with_devices(mut self, devices: Vec<RawDeviceRecord>) -> Self {
        self.devices = devices;
        self
    }

    pub fn with_hostname(mut self, hostname: &str, ip: &str) -> Self {
        self.hostnames.insert(hostname.into(), ip.into());
        self
    }

    /// An SNMP agent at `address` answering `sysDescr` and the given OIDs.
    pub fn with_snmp(mut self, address: &str, descr: &str, values: &[(&str, u64)]) -> Self {
        let values = values.iter().map(|(oid, v)| (oid.to_string(), *v)).collect();
        self.snmp.insert(address.into(), (descr.into(), values));
        self
    }

    pub fn with_probe(mut self, name: &str, probe: LocalProbe) -> Self {
        self.probes.insert(name.into(), probe);
        self
    }

    pub fn set_jobs(&self, jobs: Vec<RawJobRecord>) {
        if let Ok(mut guard) = self.jobs.lock() {
            *guard = jobs;
        }
    }

    pub fn protocol_calls(&self) -> usize {
        self.protocol_calls.load(Ordering::SeqCst)
    }

    pub fn local_calls(&self) -> usize {
        self.local_calls.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        if self.failing {
            Err(PrintwatchError::QueryFailure("facility unreachable".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DeviceQueryFacility for FakeFacility {
    async fn list_devices(&self) -> Result<Vec<RawDeviceRecord>> {
        self.check()?;
        Ok(self.devices.clone())
    }

    async fn query_device_protocol(
        &self,
        address: &str,
        oids: &[&str],
        _timeout: Duration,
    ) -> Result<Vec<VarBind>> {
        self.protocol_calls.fetch_add(1, Ordering::SeqCst);
        let Some((descr, values)) = self.snmp.get(address) else {
            return Err(PrintwatchError::ProtocolUnreachable(format!("{address}: no response")));
        };
        Ok(oids
            .iter()
            .map(|oid| {
                let value = if *oid == SYS_DESCR_OID {
                    SnmpValue::OctetString(descr.as_bytes().to_vec())
                } else {
                    values
                        .get(*oid)
                        .map(|v| SnmpValue::Integer(*v as i64))
                        .unwrap_or(SnmpValue::NoSuchObject)
                };
                VarBind {
                    oid: oid.to_string(),
                    value,
                }
            })
            .collect())
    }

    async fn query_device_local(&self, name: &str) -> Result<LocalProbe> {
        self.local_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        Ok(self.probes.get(name).cloned().unwrap_or_default())
    }

    async fn list_todays_jobs(&self) -> Result<Vec<RawJobRecord>> {
        self.check()?;
        Ok(self.jobs.lock().map(|j| j.clone()).unwrap_or_default())
    }

    async fn resolve_hostname(&self, hostname: &str) -> Result<Option<String>> {
        Ok(self.hostnames.get(hostname).cloned())
    }

    async fn set_device_paused(&self, name: &str, paused: bool) -> Result<()> {
        self.check()?;
        if let Ok(mut calls) = self.pause_calls.lock() {
            calls.push((name.to_string(), paused));
        }
        Ok(())
    }
}

pub fn raw_network(name: &str, ip: Option<&str>) -> RawDeviceRecord {
    RawDeviceRecord {
        name: name.into(),
        printer_status: Some(3),
        port_name: Some(match ip {
            Some(ip) => format!("IP_{ip}"),
            None => "WSD-7c1e-42aa".into(),
        }),
        driver_name: Some("HP LaserJet Pro M404".into()),
        ..Default::default()
    }
}

pub fn raw_usb(name: &str) -> RawDeviceRecord {
    RawDeviceRecord {
        name: name.into(),
        printer_status: Some(3),
        port_name: Some("USB001".into()),
        driver_name: Some("Canon MF3010".into()),
        ..Default::default()
    }
}

pub fn network_device(name: &str, ip: Option<&str>) -> Device {
    normalize(&raw_network(name, ip)).expect("network fixture is a real printer")
}

pub fn usb_device(name: &str) -> Device {
    normalize(&raw_usb(name)).expect("usb fixture is a real printer")
}

pub fn raw_job(printer: &str, id: u32, status: &str, at: &str, pages: Option<u32>) -> RawJobRecord {
    RawJobRecord {
        printer: printer.into(),
        job_id: id,
        status: status.into(),
        submitted_at: chrono::NaiveDateTime::parse_from_str(at, "%Y-%m-%dT%H:%M:%S")
            .expect("fixture timestamp"),
        pages_printed: pages,
        user_name: None,
        computer_name: Some("PC1".into()),
        document_name: Some("memo.docx".into()),
    }
}
