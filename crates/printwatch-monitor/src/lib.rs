// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Printwatch monitor: device directory, consumable telemetry engine and the
// print-job counter with its page store and schedules.

pub mod adapters;
pub mod autopause;
pub mod counter;
pub mod directory;
pub mod engine;
pub mod jobs;
pub mod pages;
pub mod tasks;
pub mod vendor;

#[cfg(test)]
mod testing;

pub use autopause::AutoPauseService;
pub use counter::{CollectionSummary, PrintJobCounter};
pub use directory::DeviceDirectory;
pub use engine::{EngineSettings, TelemetryEngine};
pub use jobs::JobSource;
pub use pages::PageStore;
pub use tasks::TaskArena;
