// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Scheduled background work.
//
// Every timer the agent runs lives in one `TaskArena`, so shutdown can cancel
// them as a group. Panics in a task are reported on a fault channel instead of
// vanishing with the task.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Days, Local, NaiveDateTime, NaiveTime, TimeZone};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::pages::PageStore;

/// Offset past midnight at which daily counters roll over.
pub const RESET_OFFSET: Duration = Duration::from_secs(5);

/// Delay before retrying a reset when the page store is not initialised yet.
pub const RESET_RETRY: Duration = Duration::from_secs(60);

/// Period of the retention cleanup.
pub const CLEANUP_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

/// Floor for `spawn_interval` periods; a zero period would spin.
pub const MIN_PERIOD: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// Arena
// ---------------------------------------------------------------------------

pub struct TaskArena {
    cancel: CancellationToken,
    watchers: Mutex<JoinSet<()>>,
    workers: Mutex<Vec<AbortHandle>>,
    running: Mutex<BTreeMap<&'static str, Arc<AtomicBool>>>,
    faults_tx: mpsc::UnboundedSender<String>,
    faults_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl Default for TaskArena {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskArena {
    pub fn new() -> Self {
        let (faults_tx, faults_rx) = mpsc::unbounded_channel();
        Self {
            cancel: CancellationToken::new(),
            watchers: Mutex::new(JoinSet::new()),
            workers: Mutex::new(Vec::new()),
            running: Mutex::new(BTreeMap::new()),
            faults_tx,
            faults_rx: Mutex::new(Some(faults_rx)),
        }
    }

    /// Token cancelled when the arena shuts down.
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Receiver of the names of tasks that panicked. Can be taken once.
    pub fn take_faults(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.faults_rx.lock().ok().and_then(|mut rx| rx.take())
    }

    /// Run `fut` until it completes or the arena shuts down.
    pub fn spawn<F>(&self, name: &'static str, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.cancel.is_cancelled() {
            warn!(task = name, "arena is shut down, task not started");
            return;
        }

        let flag = Arc::new(AtomicBool::new(true));
        if let Ok(mut running) = self.running.lock() {
            running.insert(name, Arc::clone(&flag));
        }

        let token = self.cancel.clone();
        let worker = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = fut => {}
            }
        });
        if let Ok(mut workers) = self.workers.lock() {
            workers.push(worker.abort_handle());
        }

        let faults = self.faults_tx.clone();
        if let Ok(mut watchers) = self.watchers.lock() {
            watchers.spawn(async move {
                if let Err(e) = worker.await {
                    if e.is_panic() {
                        error!(task = name, "background task panicked");
                        let _ = faults.send(name.to_string());
                    }
                }
                flag.store(false, Ordering::Release);
                debug!(task = name, "task finished");
            });
        }
        info!(task = name, "task started");
    }

    /// Run `job` every `period`, the first time immediately.
    pub fn spawn_interval<F, Fut>(&self, name: &'static str, period: Duration, mut job: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if period < MIN_PERIOD {
            warn!(task = name, period_ms = period.as_millis() as u64, "period too short, using minimum");
        }
        let period = period.max(MIN_PERIOD);
        self.spawn(name, async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                job().await;
            }
        });
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.running
            .lock()
            .ok()
            .and_then(|running| running.get(name).map(|f| f.load(Ordering::Acquire)))
            .unwrap_or(false)
    }

    /// Snapshot of every task ever started and whether it is still alive.
    pub fn running(&self) -> BTreeMap<String, bool> {
        self.running
            .lock()
            .map(|running| {
                running
                    .iter()
                    .map(|(name, flag)| (name.to_string(), flag.load(Ordering::Acquire)))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Cancel every task and wait up to `deadline` for them to wind down.
    ///
    /// Tasks still alive after the deadline are aborted. Returns how many had
    /// to be aborted.
    pub async fn shutdown(&self, deadline: Duration) -> usize {
        self.cancel.cancel();
        let mut watchers = match self.watchers.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(_) => JoinSet::new(),
        };

        let drained = tokio::time::timeout(deadline, async {
            while watchers.join_next().await.is_some() {}
        })
        .await;

        if drained.is_ok() {
            info!("all scheduled tasks stopped");
            return 0;
        }

        let stragglers = watchers.len();
        warn!(stragglers, "tasks did not stop in time, aborting");
        if let Ok(workers) = self.workers.lock() {
            for worker in workers.iter() {
                worker.abort();
            }
        }
        watchers.abort_all();
        stragglers
    }
}

// ---------------------------------------------------------------------------
// Daily schedules
// ---------------------------------------------------------------------------

/// The next reset instant strictly after `now`, on the local wall clock.
pub fn next_reset_after(now: NaiveDateTime) -> NaiveDateTime {
    let offset = NaiveTime::MIN + chrono::Duration::seconds(RESET_OFFSET.as_secs() as i64);
    let today = now.date().and_time(offset);
    if now < today {
        today
    } else {
        now.date()
            .checked_add_days(Days::new(1))
            .unwrap_or(now.date())
            .and_time(offset)
    }
}

/// How long to sleep from `now` until the next reset.
pub fn until_next_reset(now: DateTime<Local>) -> Duration {
    let target = next_reset_after(now.naive_local());
    let target = Local
        .from_local_datetime(&target)
        .earliest()
        .unwrap_or_else(|| now + chrono::Duration::days(1));
    (target - now).to_std().unwrap_or(RESET_RETRY)
}

/// Roll the daily counters over shortly after every local midnight.
pub async fn midnight_reset_loop(store: Arc<PageStore>) {
    loop {
        let wait = until_next_reset(Local::now());
        debug!(seconds = wait.as_secs(), "next daily reset scheduled");
        tokio::time::sleep(wait).await;

        while !store.exists().await {
            warn!(path = %store.path().display(), "page store not initialised, retrying reset later");
            tokio::time::sleep(RESET_RETRY).await;
        }

        match store.reset_daily_counters().await {
            Ok(date) => info!(%date, "daily page counters reset"),
            Err(e) => warn!(error = %e, "daily reset failed"),
        }
    }
}

/// Prune daily history older than `retention_days`, now and then daily.
pub async fn cleanup_loop(store: Arc<PageStore>, retention_days: u32) {
    let mut ticker = tokio::time::interval(CLEANUP_PERIOD);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match store.cleanup_old_data(retention_days).await {
            Ok(removed) => info!(removed, retention_days, "page history cleaned up"),
            Err(e) => warn!(error = %e, "page history cleanup failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use chrono::NaiveDate;

    use super::*;

    fn at(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    #[test]
    fn reset_is_just_after_midnight() {
        assert_eq!(next_reset_after(at("2026-03-09 14:30:00")), at("2026-03-10 00:00:05"));
        assert_eq!(next_reset_after(at("2026-03-09 00:00:01")), at("2026-03-09 00:00:05"));
        assert_eq!(next_reset_after(at("2026-03-09 00:00:05")), at("2026-03-10 00:00:05"));
        assert_eq!(next_reset_after(at("2026-12-31 23:59:59")), at("2027-01-01 00:00:05"));
    }

    #[test]
    fn wait_is_at_most_a_day() {
        let wait = until_next_reset(Local::now());
        assert!(wait <= Duration::from_secs(25 * 60 * 60));
    }

    #[tokio::test(start_paused = true)]
    async fn interval_task_runs_until_shutdown() {
        let arena = TaskArena::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        arena.spawn_interval("ink-monitor", Duration::from_secs(30), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
        assert!(arena.is_running("ink-monitor"));

        assert_eq!(arena.shutdown(Duration::from_secs(1)).await, 0);
        assert!(!arena.is_running("ink-monitor"));
        assert_eq!(arena.running().get("ink-monitor"), Some(&false));

        arena.spawn("late", async {});
        assert!(!arena.is_running("late"));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_period_is_raised_to_the_floor() {
        let arena = TaskArena::new();
        let mut faults = arena.take_faults().unwrap();
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        arena.spawn_interval("ink-monitor", Duration::ZERO, move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(MIN_PERIOD * 10 + MIN_PERIOD / 2).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 11);
        assert!(arena.is_running("ink-monitor"));
        assert!(faults.try_recv().is_err());
        arena.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn panics_are_reported() {
        let arena = TaskArena::new();
        let mut faults = arena.take_faults().unwrap();
        assert!(arena.take_faults().is_none());

        arena.spawn("doomed", async { panic!("boom") });
        assert_eq!(faults.recv().await.as_deref(), Some("doomed"));
        arena.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn cleanup_runs_at_startup() {
        use printwatch_bridge::store::JsonFileStore;

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(PageStore::new(Arc::new(JsonFileStore::new()), dir.path()));
        let old = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        store.add_pages_on("Office", 4, old).await.unwrap();

        let arena = TaskArena::new();
        arena.spawn("cleanup", cleanup_loop(Arc::clone(&store), 30));
        for _ in 0..50 {
            if store.print_jobs(Some(old), None).await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(store.print_jobs(Some(old), None).await.is_empty());
        assert_eq!(store.lifetime_total("Office").await, 4);
        arena.shutdown(Duration::from_secs(1)).await;
    }
}
