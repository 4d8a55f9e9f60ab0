// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Persistent page-count store (`pages.json`).
//
// The document is loaded once and kept in memory; every mutation rewrites the
// whole file. If a write fails the in-memory copy stays authoritative and the
// next successful write carries the change to disk. A missing or corrupt
// file starts from an empty document instead of failing.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Days, Local, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use printwatch_bridge::traits::PersistentStore;
use printwatch_core::error::{PrintwatchError, Result};
use printwatch_core::types::{DailyReport, DevicePages};

/// File name inside the data directory.
pub const PAGES_FILE: &str = "pages.json";

const DOCUMENT_VERSION: &str = "2.0";

// ---------------------------------------------------------------------------
// Document schema
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyPages {
    #[serde(default)]
    pub windows_spooler: u64,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrinterPages {
    #[serde(default)]
    pub total_lifetime: u64,
    /// Keyed by `YYYY-MM-DD`.
    #[serde(default)]
    pub daily: BTreeMap<String, DailyPages>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreMetadata {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub created: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_printers: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reset: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily_reset: Option<String>,
}

fn default_version() -> String {
    DOCUMENT_VERSION.to_string()
}

impl Default for StoreMetadata {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            version: default_version(),
            created: Some(now),
            last_updated: Some(now),
            total_printers: None,
            last_reset: None,
            daily_reset: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageDocument {
    #[serde(default)]
    pub printers: BTreeMap<String, PrinterPages>,
    #[serde(default)]
    pub metadata: StoreMetadata,
}

fn date_key(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// The host's local calendar date.
pub fn today() -> NaiveDate {
    Local::now().date_naive()
}

/// Result of a successful `add_pages`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddedPages {
    pub printer: String,
    pub pages: u64,
    pub date: NaiveDate,
    pub day_total: u64,
    pub total_lifetime: u64,
    /// False when the write failed and the change lives only in memory.
    pub persisted: bool,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

struct StoreState {
    doc: Option<PageDocument>,
}

/// Page counts per printer, per day, plus a lifetime total.
///
/// All access goes through one async mutex, so every read-modify-write is
/// whole and ordered.
pub struct PageStore {
    backend: Arc<dyn PersistentStore>,
    path: PathBuf,
    state: Mutex<StoreState>,
}

impl PageStore {
    pub fn new(backend: Arc<dyn PersistentStore>, data_dir: &Path) -> Self {
        Self {
            backend,
            path: data_dir.join(PAGES_FILE),
            state: Mutex::new(StoreState { doc: None }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the backing file exists yet.
    pub async fn exists(&self) -> bool {
        self.backend.exists(&self.path).await
    }

    /// Create the file with an empty document when it does not exist.
    pub async fn initialize(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let doc = self.loaded(&mut state).await;
        if !self.backend.exists(&self.path).await {
            let snapshot = doc.clone();
            self.backend
                .write_json(&self.path, &serde_json::to_value(&snapshot)?)
                .await?;
            info!(path = %self.path.display(), "created page store");
        }
        Ok(())
    }

    async fn load(&self) -> PageDocument {
        match self.backend.read_json(&self.path).await {
            Ok(Some(value)) => match serde_json::from_value::<PageDocument>(value) {
                Ok(doc) => doc,
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "page store has unexpected shape, starting empty");
                    PageDocument::default()
                }
            },
            Ok(None) => PageDocument::default(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "page store unreadable, starting empty");
                PageDocument::default()
            }
        }
    }

    async fn loaded<'a>(&self, state: &'a mut StoreState) -> &'a mut PageDocument {
        if state.doc.is_none() {
            state.doc = Some(self.load().await);
        }
        state.doc.get_or_insert_with(PageDocument::default)
    }

    async fn persist(&self, doc: &PageDocument) -> Result<()> {
        let value = serde_json::to_value(doc)?;
        self.backend.write_json(&self.path, &value).await.map_err(|e| match e {
            PrintwatchError::Persist(_) => e,
            other => PrintwatchError::Persist(other.to_string()),
        })
    }

    // -- Mutations -------------------------------------------------------------

    /// Add pages to today's bucket and the lifetime total.
    pub async fn add_pages(&self, printer: &str, pages: u64) -> Result<AddedPages> {
        self.add_pages_on(printer, pages, today()).await
    }

    pub async fn add_pages_on(&self, printer: &str, pages: u64, date: NaiveDate) -> Result<AddedPages> {
        if printer.trim().is_empty() {
            return Err(PrintwatchError::InvalidRequest("printer name is required".into()));
        }
        if pages == 0 {
            return Err(PrintwatchError::InvalidRequest("pages must be greater than zero".into()));
        }

        let mut state = self.state.lock().await;
        let doc = self.loaded(&mut state).await;
        let now = Utc::now();

        let key = date_key(date);
        let current = doc.printers.get(printer);
        let day_before = current
            .and_then(|p| p.daily.get(&key))
            .map_or(0, |d| d.windows_spooler);
        let lifetime_before = current.map_or(0, |p| p.total_lifetime);
        let (Some(day_total), Some(total_lifetime)) =
            (day_before.checked_add(pages), lifetime_before.checked_add(pages))
        else {
            warn!(printer, pages, "page count would overflow, event rejected");
            return Err(PrintwatchError::InvalidRequest("page count out of range".into()));
        };

        let entry = doc.printers.entry(printer.to_string()).or_default();
        let day = entry.daily.entry(key).or_insert_with(|| DailyPages {
            windows_spooler: 0,
            timestamp: Some(now),
        });
        day.windows_spooler = day_total;
        entry.total_lifetime = total_lifetime;
        entry.last_updated = Some(now);

        doc.metadata.last_updated = Some(now);
        doc.metadata.total_printers = Some(doc.printers.len());

        let snapshot = doc.clone();
        let persisted = match self.persist(&snapshot).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, printer, pages, "page count kept in memory only");
                false
            }
        };
        debug!(printer, pages, day_total, total_lifetime, "pages added");

        Ok(AddedPages {
            printer: printer.to_string(),
            pages,
            date,
            day_total,
            total_lifetime,
            persisted,
        })
    }

    /// Mark the start of a new counting day. History is kept.
    pub async fn reset_daily_counters(&self) -> Result<NaiveDate> {
        let mut state = self.state.lock().await;
        let doc = self.loaded(&mut state).await;
        let date = today();
        doc.metadata.last_reset = Some(Utc::now());
        doc.metadata.daily_reset = Some(date_key(date));
        let snapshot = doc.clone();
        self.persist(&snapshot).await?;
        info!(date = %date, "daily counters reset");
        Ok(date)
    }

    /// Drop daily buckets older than `retention_days`. Returns how many went.
    ///
    /// Printers left with no buckets and a zero lifetime are removed too.
    /// Lifetime totals are never decremented.
    pub async fn cleanup_old_data(&self, retention_days: u32) -> Result<usize> {
        let cutoff = today()
            .checked_sub_days(Days::new(u64::from(retention_days)))
            .map(date_key)
            .ok_or_else(|| PrintwatchError::InvalidRequest(format!("retention of {retention_days} days")))?;

        let mut state = self.state.lock().await;
        let doc = self.loaded(&mut state).await;

        let mut cleaned = 0;
        for printer in doc.printers.values_mut() {
            let before = printer.daily.len();
            printer.daily.retain(|date, _| date.as_str() >= cutoff.as_str());
            cleaned += before - printer.daily.len();
        }
        doc.printers
            .retain(|_, p| !(p.daily.is_empty() && p.total_lifetime == 0));

        if cleaned > 0 {
            let snapshot = doc.clone();
            self.persist(&snapshot).await?;
            info!(cleaned, retention_days, "pruned old daily page counts");
        }
        Ok(cleaned)
    }

    // -- Reads -----------------------------------------------------------------

    /// Per-printer pages for `date`, busiest first. Idle printers are omitted.
    pub async fn daily_report(&self, date: Option<NaiveDate>) -> DailyReport {
        let date = date.unwrap_or_else(today);
        let printers = self.print_jobs(Some(date), None).await;
        let total_pages = printers.iter().fold(0u64, |sum, p| sum.saturating_add(p.pages));
        DailyReport {
            success: true,
            date,
            total_pages,
            count: printers.len(),
            printers,
            timestamp: Utc::now(),
        }
    }

    /// Pages recorded on `date`, optionally for one printer only.
    pub async fn print_jobs(&self, date: Option<NaiveDate>, printer: Option<&str>) -> Vec<DevicePages> {
        let key = date_key(date.unwrap_or_else(today));
        let mut state = self.state.lock().await;
        let doc = self.loaded(&mut state).await;

        let mut rows: Vec<DevicePages> = doc
            .printers
            .iter()
            .filter(|(name, _)| printer.is_none_or(|p| p == name.as_str()))
            .filter_map(|(name, data)| {
                let pages = data.daily.get(&key)?.windows_spooler;
                (pages > 0).then(|| DevicePages {
                    name: name.clone(),
                    pages,
                    total_lifetime: data.total_lifetime,
                    last_updated: data.last_updated,
                })
            })
            .collect();
        rows.sort_by(|a, b| b.pages.cmp(&a.pages).then_with(|| a.name.cmp(&b.name)));
        rows
    }

    /// Lifetime total for one printer.
    pub async fn lifetime_total(&self, printer: &str) -> u64 {
        let mut state = self.state.lock().await;
        let doc = self.loaded(&mut state).await;
        doc.printers.get(printer).map(|p| p.total_lifetime).unwrap_or(0)
    }

    /// A copy of the whole document.
    pub async fn document(&self) -> PageDocument {
        let mut state = self.state.lock().await;
        self.loaded(&mut state).await.clone()
    }
}

#[cfg(test)]
mod tests {
    use printwatch_bridge::store::JsonFileStore;

    use super::*;

    fn store_in(dir: &Path) -> PageStore {
        PageStore::new(Arc::new(JsonFileStore::new()), dir)
    }

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[tokio::test]
    async fn add_pages_accumulates() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());

        store.add_pages_on("Office HP", 3, day("2026-03-09")).await.unwrap();
        let added = store.add_pages_on("Office HP", 2, day("2026-03-09")).await.unwrap();
        assert_eq!(added.day_total, 5);
        assert_eq!(added.total_lifetime, 5);
        assert!(added.persisted);

        store.add_pages_on("Office HP", 4, day("2026-03-10")).await.unwrap();
        assert_eq!(store.lifetime_total("Office HP").await, 9);
    }

    #[tokio::test]
    async fn zero_pages_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        assert!(matches!(
            store.add_pages("Office HP", 0).await,
            Err(PrintwatchError::InvalidRequest(_))
        ));
        assert!(store.add_pages(" ", 1).await.is_err());
    }

    #[tokio::test]
    async fn overflowing_add_is_rejected_and_totals_kept() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let big = i64::MAX as u64;

        store.add_pages_on("Office HP", big, day("2026-03-09")).await.unwrap();
        let second = store.add_pages_on("Office HP", big, day("2026-03-09")).await.unwrap();
        assert_eq!(second.total_lifetime, big * 2);

        assert!(matches!(
            store.add_pages_on("Office HP", big, day("2026-03-09")).await,
            Err(PrintwatchError::InvalidRequest(_))
        ));
        // Lifetime spans days, so a fresh day still overflows it.
        assert!(store.add_pages_on("Office HP", big, day("2026-03-10")).await.is_err());
        assert_eq!(store.lifetime_total("Office HP").await, big * 2);

        let doc = store.document().await;
        assert!(!doc.printers["Office HP"].daily.contains_key("2026-03-10"));
    }

    #[tokio::test]
    async fn document_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        store.add_pages_on("Office HP", 7, day("2026-03-09")).await.unwrap();
        store.add_pages_on("Lab", 2, day("2026-03-09")).await.unwrap();
        let written = store.document().await;

        let reopened = store_in(dir.path());
        let read = reopened.document().await;
        assert_eq!(read.printers, written.printers);
        assert_eq!(read.metadata.version, "2.0");
    }

    #[tokio::test]
    async fn report_sorted_and_skips_idle() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let d = day("2026-03-09");
        store.add_pages_on("Small", 1, d).await.unwrap();
        store.add_pages_on("Busy", 40, d).await.unwrap();
        store.add_pages_on("Yesterday", 9, day("2026-03-08")).await.unwrap();

        let report = store.daily_report(Some(d)).await;
        assert_eq!(report.total_pages, 41);
        assert_eq!(report.count, 2);
        assert_eq!(report.printers[0].name, "Busy");
        assert_eq!(report.printers[1].name, "Small");

        let only = store.print_jobs(Some(d), Some("Small")).await;
        assert_eq!(only.len(), 1);
        assert_eq!(only[0].pages, 1);
    }

    #[tokio::test]
    async fn corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(PAGES_FILE), "{\"printers\": [1,").unwrap();
        let store = store_in(dir.path());
        assert!(store.document().await.printers.is_empty());

        store.add_pages("Office HP", 1).await.unwrap();
        assert_eq!(store.lifetime_total("Office HP").await, 1);
    }

    #[tokio::test]
    async fn bom_prefixed_file_loads() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(PAGES_FILE),
            "\u{feff}{\"printers\":{\"Lab\":{\"totalLifetime\":12,\"daily\":{}}},\"metadata\":{\"version\":\"2.0\"}}",
        )
        .unwrap();
        let store = store_in(dir.path());
        assert_eq!(store.lifetime_total("Lab").await, 12);
    }

    #[tokio::test]
    async fn cleanup_keeps_lifetime() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let old = today() - Days::new(45);
        store.add_pages_on("Office HP", 10, old).await.unwrap();
        store.add_pages_on("Office HP", 1, today()).await.unwrap();

        let cleaned = store.cleanup_old_data(30).await.unwrap();
        assert_eq!(cleaned, 1);
        assert_eq!(store.lifetime_total("Office HP").await, 11);
        assert_eq!(store.document().await.printers["Office HP"].daily.len(), 1);
    }

    #[tokio::test]
    async fn retention_beyond_the_calendar_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        store.add_pages_on("Office HP", 2, today()).await.unwrap();

        assert!(matches!(
            store.cleanup_old_data(u32::MAX).await,
            Err(PrintwatchError::InvalidRequest(_))
        ));
        assert_eq!(store.lifetime_total("Office HP").await, 2);
    }

    #[tokio::test]
    async fn reset_records_metadata_and_keeps_history() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        store.add_pages("Office HP", 4).await.unwrap();

        let date = store.reset_daily_counters().await.unwrap();
        let doc = store.document().await;
        assert_eq!(doc.metadata.daily_reset, Some(date_key(date)));
        assert!(doc.metadata.last_reset.is_some());
        assert_eq!(doc.printers["Office HP"].total_lifetime, 4);
    }

    #[tokio::test]
    async fn initialize_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        assert!(!store.exists().await);
        store.initialize().await.unwrap();
        assert!(store.exists().await);
    }
}
