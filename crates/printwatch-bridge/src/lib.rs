// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Printwatch host bridge: device enumeration, SNMP transport, helper process
// control and the JSON document store.

pub mod host;
pub mod process;
pub mod snmp;
pub mod store;
pub mod stub;
pub mod traits;

use std::sync::Arc;

use process::ProcessRegistry;
use traits::DeviceQueryFacility;

/// The device-query facility for the host operating system.
///
/// Windows gets the PowerShell-backed facility; every other host gets the
/// stub, which still answers SNMP queries.
pub fn host_facility(processes: Arc<ProcessRegistry>) -> Arc<dyn DeviceQueryFacility> {
    #[cfg(windows)]
    {
        Arc::new(host::HostFacility::new(processes))
    }
    #[cfg(not(windows))]
    {
        // Nothing spawns helpers here; the registry still drains at shutdown.
        let _ = processes;
        Arc::new(stub::StubFacility::new())
    }
}
