// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Print-job counter.
//
// Each poll pulls today's completed jobs, skips the ones already seen this
// session and folds the rest into the page store. Re-polling the same spool
// is therefore idempotent.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use printwatch_core::types::PrintJob;

use crate::jobs::JobSource;
use crate::pages::PageStore;

/// Once the fingerprint set grows past this many entries...
pub const FINGERPRINT_CEILING: usize = 1000;
/// ...only this many of the most recent are kept.
pub const FINGERPRINT_RETAIN: usize = 500;

/// Insertion-ordered set of job fingerprints with bulk eviction.
#[derive(Debug, Default)]
pub struct FingerprintSet {
    order: VecDeque<String>,
    members: HashSet<String>,
}

impl FingerprintSet {
    pub fn contains(&self, fingerprint: &str) -> bool {
        self.members.contains(fingerprint)
    }

    /// Returns false when the fingerprint was already present.
    pub fn insert(&mut self, fingerprint: &str) -> bool {
        if !self.members.insert(fingerprint.to_string()) {
            return false;
        }
        self.order.push_back(fingerprint.to_string());
        if self.order.len() > FINGERPRINT_CEILING {
            while self.order.len() > FINGERPRINT_RETAIN {
                if let Some(old) = self.order.pop_front() {
                    self.members.remove(&old);
                }
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.members.clear();
    }
}

/// Outcome of one `collect` pass.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionSummary {
    pub success: bool,
    pub new_jobs: usize,
    pub total_pages: u64,
    pub jobs: Vec<PrintJob>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct PrintJobCounter {
    source: JobSource,
    pages: Arc<PageStore>,
    seen: Mutex<FingerprintSet>,
    running: AtomicBool,
}

impl PrintJobCounter {
    pub fn new(source: JobSource, pages: Arc<PageStore>) -> Self {
        Self {
            source,
            pages,
            seen: Mutex::new(FingerprintSet::default()),
            running: AtomicBool::new(false),
        }
    }

    pub fn pages(&self) -> &Arc<PageStore> {
        &self.pages
    }

    /// Mark the counter as running; returns false if it already was.
    pub fn start(&self) -> bool {
        let was_running = self.running.swap(true, Ordering::AcqRel);
        if !was_running {
            info!("print job monitor started");
        }
        !was_running
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stop counting and forget this session's fingerprints.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.seen.lock().await.clear();
        info!("print job monitor stopped");
    }

    pub async fn seen_count(&self) -> usize {
        self.seen.lock().await.len()
    }

    /// Pull today's jobs and count the new ones.
    #[instrument(skip(self))]
    pub async fn collect(&self) -> CollectionSummary {
        let jobs = match self.source.todays_completed_jobs().await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!(error = %e, "print spooler query failed");
                return CollectionSummary {
                    success: false,
                    new_jobs: 0,
                    total_pages: 0,
                    jobs: Vec::new(),
                    message: None,
                    error: Some(e.to_string()),
                };
            }
        };
        self.ingest(jobs).await
    }

    /// Fold a batch of jobs into the store, skipping known fingerprints.
    pub async fn ingest(&self, jobs: Vec<PrintJob>) -> CollectionSummary {
        // Held for the whole batch so two polls never interleave.
        let mut seen = self.seen.lock().await;
        let mut accepted = Vec::new();
        let mut total_pages = 0u64;

        for job in jobs {
            if seen.contains(&job.job_fingerprint) {
                continue;
            }
            if let Err(e) = self.pages.add_pages(&job.device, u64::from(job.pages)).await {
                warn!(device = %job.device, error = %e, "job not counted");
                continue;
            }
            seen.insert(&job.job_fingerprint);
            total_pages += u64::from(job.pages);
            info!(
                device = %job.device,
                pages = job.pages,
                user = %job.user,
                document = job.document.as_deref().unwrap_or(""),
                "print job counted"
            );
            accepted.push(job);
        }

        let new_jobs = accepted.len();
        CollectionSummary {
            success: true,
            new_jobs,
            total_pages,
            jobs: accepted,
            message: Some(if new_jobs > 0 {
                format!("Found {new_jobs} new jobs")
            } else {
                "No new jobs".into()
            }),
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Local;
    use printwatch_bridge::store::JsonFileStore;

    use super::*;
    use crate::testing::{raw_job, FakeFacility};

    fn today_at(hms: &str) -> String {
        format!("{}T{hms}", Local::now().date_naive().format("%Y-%m-%d"))
    }

    fn counter(facility: Arc<FakeFacility>, dir: &std::path::Path) -> PrintJobCounter {
        let pages = Arc::new(PageStore::new(Arc::new(JsonFileStore::new()), dir));
        PrintJobCounter::new(JobSource::new(facility), pages)
    }

    #[test]
    fn fingerprint_set_evicts_oldest_half() {
        let mut set = FingerprintSet::default();
        for i in 0..=FINGERPRINT_CEILING {
            assert!(set.insert(&format!("job-{i}")));
        }
        assert_eq!(set.len(), FINGERPRINT_RETAIN);
        assert!(!set.contains("job-0"));
        assert!(set.contains(&format!("job-{FINGERPRINT_CEILING}")));
        assert!(!set.insert(&format!("job-{FINGERPRINT_CEILING}")));
    }

    #[tokio::test]
    async fn duplicate_fingerprints_count_once() {
        let dir = tempfile::tempdir().unwrap();
        let facility = Arc::new(FakeFacility::default());
        let at = today_at("09:15:00");
        facility.set_jobs(vec![
            raw_job("Office HP", 7, "Printed", &at, Some(3)),
            raw_job("Office HP", 7, "Printed", &at, Some(3)),
        ]);
        let counter = counter(Arc::clone(&facility), dir.path());

        let summary = counter.collect().await;
        assert!(summary.success);
        assert_eq!(summary.new_jobs, 1);
        assert_eq!(summary.total_pages, 3);

        let again = counter.collect().await;
        assert_eq!(again.new_jobs, 0);
        assert_eq!(again.message.as_deref(), Some("No new jobs"));
        assert_eq!(counter.pages().lifetime_total("Office HP").await, 3);
    }

    #[tokio::test]
    async fn facility_failure_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let counter = counter(Arc::new(FakeFacility::failing()), dir.path());
        let summary = counter.collect().await;
        assert!(!summary.success);
        assert!(summary.error.is_some());
        assert_eq!(counter.seen_count().await, 0);
    }

    #[tokio::test]
    async fn stop_clears_fingerprints() {
        let dir = tempfile::tempdir().unwrap();
        let facility = Arc::new(FakeFacility::default());
        facility.set_jobs(vec![raw_job("Lab", 1, "Completed", &today_at("08:00:00"), None)]);
        let counter = counter(Arc::clone(&facility), dir.path());

        assert!(counter.start());
        assert!(!counter.start());
        let summary = counter.collect().await;
        assert_eq!(summary.message.as_deref(), Some("Found 1 new jobs"));
        assert_eq!(counter.seen_count().await, 1);

        counter.stop().await;
        assert!(!counter.is_running());
        assert_eq!(counter.seen_count().await, 0);
    }
}
