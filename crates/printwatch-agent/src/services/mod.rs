// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Service layer: wires the monitor and cloud crates together for the HTTP
// facade and the scheduled tasks.

pub mod agent_services;
pub mod data_dir;
