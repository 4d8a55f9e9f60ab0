// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Job source: today's completed jobs from the local spooler.

use std::sync::Arc;

use chrono::NaiveDate;

use printwatch_bridge::traits::{DeviceQueryFacility, RawJobRecord};
use printwatch_core::error::Result;
use printwatch_core::types::PrintJob;

use crate::pages::today;

const COMPLETED_STATUSES: &[&str] = &["Printed", "Completed"];

/// Whether a spooler status string means the job finished printing.
pub fn is_completed(status: &str) -> bool {
    status
        .split(',')
        .map(str::trim)
        .any(|s| COMPLETED_STATUSES.iter().any(|c| s.eq_ignore_ascii_case(c)))
}

/// Turn a raw spooler record into a job, if it completed on `date`.
pub fn to_print_job(record: &RawJobRecord, date: NaiveDate) -> Option<PrintJob> {
    if !is_completed(&record.status) || record.submitted_at.date() != date {
        return None;
    }
    let pages = record.pages_printed.filter(|p| *p > 0).unwrap_or(1);
    let non_empty = |s: &Option<String>| s.clone().filter(|v| !v.trim().is_empty());

    Some(PrintJob {
        job_fingerprint: PrintJob::fingerprint(&record.printer, record.job_id, record.submitted_at),
        device: record.printer.clone(),
        pages,
        user: non_empty(&record.user_name).unwrap_or_else(|| "Unknown".into()),
        submitted_at: record.submitted_at,
        document: non_empty(&record.document_name),
        computer: non_empty(&record.computer_name),
    })
}

/// Pulls completed jobs for "today" from the device-query facility.
#[derive(Clone)]
pub struct JobSource {
    facility: Arc<dyn DeviceQueryFacility>,
}

impl JobSource {
    pub fn new(facility: Arc<dyn DeviceQueryFacility>) -> Self {
        Self { facility }
    }

    pub async fn todays_completed_jobs(&self) -> Result<Vec<PrintJob>> {
        self.completed_jobs_on(today()).await
    }

    pub async fn completed_jobs_on(&self, date: NaiveDate) -> Result<Vec<PrintJob>> {
        let records = self.facility.list_todays_jobs().await?;
        Ok(records.iter().filter_map(|r| to_print_job(r, date)).collect())
    }
}
