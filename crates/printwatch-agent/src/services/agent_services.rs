// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Central service layer: builds every subsystem once at startup and hands
// out cheap clones to the HTTP handlers and the scheduled tasks.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{info, warn};

use printwatch_bridge::process::ProcessRegistry;
use printwatch_bridge::store::JsonFileStore;
use printwatch_bridge::traits::DeviceQueryFacility;
use printwatch_cloud::transport::Transport;
use printwatch_cloud::{CloudConnector, ConnectorSettings, Outbound, TelemetryProvider, WsTransport};
use printwatch_core::AgentConfig;
use printwatch_core::error::Result;
use printwatch_core::types::{DailyReport, Device, TelemetryReading};
use printwatch_monitor::pages::AddedPages;
use printwatch_monitor::tasks::{cleanup_loop, midnight_reset_loop};
use printwatch_monitor::{
    AutoPauseService, EngineSettings, JobSource, PageStore, PrintJobCounter, TaskArena, TelemetryEngine,
};

const CONFIG_FILE: &str = "config.json";

// ---------------------------------------------------------------------------
// Telemetry provider for the cloud connector
// ---------------------------------------------------------------------------

/// What the cloud connector reads from and commands.
pub struct MonitorProvider {
    engine: Arc<TelemetryEngine>,
    pages: Arc<PageStore>,
    autopause: Arc<AutoPauseService>,
}

#[async_trait]
impl TelemetryProvider for MonitorProvider {
    async fn printers(&self) -> Result<Vec<Device>> {
        self.engine.directory().try_list_devices().await
    }

    /// Served from the cache while it is warm so a backend query never
    /// waits on a full device cycle.
    async fn consumables(&self) -> BTreeMap<String, TelemetryReading> {
        match self.engine.warm_snapshot() {
            Some(snapshot) => snapshot,
            None => by_name(self.engine.refresh(false).await),
        }
    }

    async fn daily_report(&self) -> DailyReport {
        self.pages.daily_report(None).await
    }

    async fn pause_device(&self, name: &str) -> Result<()> {
        self.autopause.pause_device(name).await
    }

    async fn resume_device(&self, name: &str) -> Result<()> {
        self.autopause.resume_device(name).await
    }
}

/// Re-key engine output (by device id) by device name.
fn by_name(readings: BTreeMap<String, TelemetryReading>) -> BTreeMap<String, TelemetryReading> {
    readings
        .into_values()
        .map(|reading| (reading.printer.clone(), reading))
        .collect()
}

// ---------------------------------------------------------------------------
// Services
// ---------------------------------------------------------------------------

/// Shared agent services.
///
/// All fields are Arc-wrapped so the struct can be cloned into handlers and
/// spawned tasks.
#[derive(Clone)]
pub struct AgentServices {
    config: Arc<AgentConfig>,
    processes: Arc<ProcessRegistry>,
    engine: Arc<TelemetryEngine>,
    pages: Arc<PageStore>,
    counter: Arc<PrintJobCounter>,
    autopause: Arc<AutoPauseService>,
    tasks: Arc<TaskArena>,
    cloud: Option<Arc<CloudConnector>>,
    shutting_down: Arc<AtomicBool>,
    started: Instant,
}

impl AgentServices {
    /// Initialise every subsystem against the host facility.
    pub async fn init(config: AgentConfig, data_dir: PathBuf) -> Result<Self> {
        let processes = Arc::new(ProcessRegistry::default());
        let facility = printwatch_bridge::host_facility(Arc::clone(&processes));
        Self::build(config, data_dir, facility, processes, Arc::new(WsTransport)).await
    }

    /// Initialise with explicit collaborators.
    pub async fn build(
        config: AgentConfig,
        data_dir: PathBuf,
        facility: Arc<dyn DeviceQueryFacility>,
        processes: Arc<ProcessRegistry>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        info!(path = %data_dir.display(), agent_id = %config.agent_id, "initialising agent services");

        let engine = Arc::new(TelemetryEngine::new(
            Arc::clone(&facility),
            EngineSettings::from(&config),
        ));
        let pages = Arc::new(PageStore::new(Arc::new(JsonFileStore::new()), &data_dir));
        if let Err(e) = pages.initialize().await {
            warn!(error = %e, "page store could not be created, counting in memory");
        }
        let counter = Arc::new(PrintJobCounter::new(
            JobSource::new(Arc::clone(&facility)),
            Arc::clone(&pages),
        ));
        let autopause = Arc::new(AutoPauseService::new(
            facility,
            config.auto_pause_on_low_ink,
            config.low_ink_pause_threshold,
        ));

        let cloud = if config.cloud_enabled {
            let provider = Arc::new(MonitorProvider {
                engine: Arc::clone(&engine),
                pages: Arc::clone(&pages),
                autopause: Arc::clone(&autopause),
            });
            Some(CloudConnector::new(
                ConnectorSettings::from_config(&config)?,
                transport,
                provider,
            ))
        } else {
            info!("cloud uplink disabled");
            None
        };

        Ok(Self {
            config: Arc::new(config),
            processes,
            engine,
            pages,
            counter,
            autopause,
            tasks: Arc::new(TaskArena::new()),
            cloud,
            shutting_down: Arc::new(AtomicBool::new(false)),
            started: Instant::now(),
        })
    }

    // -- Lifecycle -------------------------------------------------------------

    /// Start the scheduled work and the cloud uplink.
    pub fn start_background(&self) {
        self.counter.start();

        let svc = self.clone();
        self.tasks.spawn_interval(
            "ink-monitor",
            Duration::from_millis(self.config.ink_check_interval_ms),
            move || {
                let svc = svc.clone();
                async move { svc.ink_cycle().await }
            },
        );

        let svc = self.clone();
        self.tasks.spawn_interval(
            "job-counter",
            Duration::from_millis(self.config.job_poll_interval_ms),
            move || {
                let svc = svc.clone();
                async move { svc.job_cycle().await }
            },
        );

        self.tasks
            .spawn("midnight-reset", midnight_reset_loop(Arc::clone(&self.pages)));
        self.tasks.spawn(
            "page-cleanup",
            cleanup_loop(Arc::clone(&self.pages), self.config.retention_days),
        );

        if let Some(cloud) = &self.cloud {
            cloud.start();
        }
    }

    async fn ink_cycle(&self) {
        let readings = self.engine.refresh(false).await;
        self.autopause.evaluate(readings.values()).await;
        if let Some(cloud) = &self.cloud {
            cloud.push(Outbound::ink_status(cloud.agent_id(), by_name(readings)));
        }
    }

    async fn job_cycle(&self) {
        if !self.counter.is_running() {
            return;
        }
        let summary = self.counter.collect().await;
        if summary.new_jobs > 0 {
            if let Some(cloud) = &self.cloud {
                let report = self.pages.daily_report(None).await;
                cloud.push(Outbound::daily_report(cloud.agent_id(), report));
            }
        }
    }

    /// Flag the shutdown. Returns false if one was already under way.
    pub fn mark_shutting_down(&self) -> bool {
        !self.shutting_down.swap(true, Ordering::AcqRel)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    // -- Accessors -------------------------------------------------------------

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<TelemetryEngine> {
        &self.engine
    }

    pub fn pages(&self) -> &Arc<PageStore> {
        &self.pages
    }

    pub fn counter(&self) -> &Arc<PrintJobCounter> {
        &self.counter
    }

    pub fn tasks(&self) -> &Arc<TaskArena> {
        &self.tasks
    }

    pub fn processes(&self) -> &Arc<ProcessRegistry> {
        &self.processes
    }

    pub fn cloud(&self) -> Option<&Arc<CloudConnector>> {
        self.cloud.as_ref()
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    // -- Operations ------------------------------------------------------------

    pub async fn printers(&self) -> Vec<Device> {
        self.engine.directory().list_devices().await
    }

    /// Consumable readings keyed by device name.
    pub async fn consumables(&self, force: bool) -> BTreeMap<String, TelemetryReading> {
        by_name(self.engine.refresh(force).await)
    }

    /// Count pages reported from outside the spooler and tell the backend.
    pub async fn record_print_event(&self, printer: &str, pages: u64) -> Result<AddedPages> {
        let added = self.pages.add_pages(printer, pages).await?;
        info!(printer = %printer, pages, day_total = added.day_total, "print event recorded");
        if let Some(cloud) = &self.cloud {
            cloud.push(Outbound::print_event(cloud.agent_id(), printer, pages));
        }
        Ok(added)
    }
}

// ---------------------------------------------------------------------------
// Config persistence
// ---------------------------------------------------------------------------

/// Load `config.json`, writing the defaults on first run.
pub fn load_or_create_config(data_dir: &Path) -> AgentConfig {
    if let Some(config) = load_config(data_dir) {
        return config;
    }
    let config = AgentConfig::default();
    if !data_dir.join(CONFIG_FILE).exists() {
        match persist_config(data_dir, &config) {
            Ok(()) => info!(path = %data_dir.join(CONFIG_FILE).display(), "wrote default config"),
            Err(e) => warn!(error = %e, "could not write default config"),
        }
    } else {
        warn!("config.json is unreadable, using defaults");
    }
    config
}

fn load_config(data_dir: &Path) -> Option<AgentConfig> {
    let path = data_dir.join(CONFIG_FILE);
    let data = std::fs::read_to_string(&path).ok()?;
    serde_json::from_str(data.trim_start_matches('\u{feff}')).ok()
}

fn persist_config(data_dir: &Path, config: &AgentConfig) -> Result<()> {
    let path = data_dir.join(CONFIG_FILE);
    let json = serde_json::to_string_pretty(config)?;
    std::fs::write(&path, json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use printwatch_bridge::snmp::VarBind;
    use printwatch_bridge::stub::StubFacility;
    use printwatch_bridge::traits::{LocalProbe, RawDeviceRecord, RawJobRecord};
    use printwatch_core::error::PrintwatchError;

    use super::*;

    pub(crate) async fn offline_services(dir: &Path) -> AgentServices {
        let config = AgentConfig {
            cloud_enabled: false,
            ..Default::default()
        };
        AgentServices::build(
            config,
            dir.to_path_buf(),
            Arc::new(StubFacility::new()),
            Arc::new(ProcessRegistry::default()),
            Arc::new(WsTransport),
        )
        .await
        .unwrap()
    }

    #[test]
    fn first_run_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_or_create_config(dir.path());
        assert_eq!(config, AgentConfig::default());
        assert!(dir.path().join(CONFIG_FILE).exists());

        let mut edited = config.clone();
        edited.agent_id = "FRONTDESK-01".into();
        persist_config(dir.path(), &edited).unwrap();
        assert_eq!(load_or_create_config(dir.path()).agent_id, "FRONTDESK-01");
    }

    #[test]
    fn corrupt_config_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "{ nope").unwrap();
        assert_eq!(load_or_create_config(dir.path()), AgentConfig::default());
        assert_eq!(std::fs::read_to_string(dir.path().join(CONFIG_FILE)).unwrap(), "{ nope");
    }

    #[tokio::test]
    async fn print_events_reach_the_page_store() {
        let dir = tempfile::tempdir().unwrap();
        let svc = offline_services(dir.path()).await;
        assert!(svc.pages().exists().await);

        let added = svc.record_print_event("Office", 4).await.unwrap();
        assert_eq!(added.day_total, 4);
        assert!(added.persisted);
        assert!(matches!(
            svc.record_print_event("Office", 0).await,
            Err(PrintwatchError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn stub_host_has_no_printers() {
        let dir = tempfile::tempdir().unwrap();
        let svc = offline_services(dir.path()).await;
        assert!(svc.printers().await.is_empty());
        assert!(svc.consumables(true).await.is_empty());
        assert!(svc.cloud().is_none());
    }

    /// One attached printer; counts local queries.
    #[derive(Default)]
    struct OnePrinter {
        local_calls: AtomicUsize,
    }

    #[async_trait]
    impl DeviceQueryFacility for OnePrinter {
        async fn list_devices(&self) -> Result<Vec<RawDeviceRecord>> {
            Ok(vec![RawDeviceRecord {
                name: "Desk Canon".into(),
                printer_status: Some(3),
                port_name: Some("USB001".into()),
                driver_name: Some("Canon MF3010".into()),
                ..Default::default()
            }])
        }

        async fn query_device_protocol(
            &self,
            address: &str,
            _oids: &[&str],
            _timeout: Duration,
        ) -> Result<Vec<VarBind>> {
            Err(PrintwatchError::ProtocolUnreachable(address.to_string()))
        }

        async fn query_device_local(&self, _name: &str) -> Result<LocalProbe> {
            self.local_calls.fetch_add(1, Ordering::SeqCst);
            Ok(LocalProbe::default())
        }

        async fn list_todays_jobs(&self) -> Result<Vec<RawJobRecord>> {
            Ok(Vec::new())
        }

        async fn resolve_hostname(&self, _hostname: &str) -> Result<Option<String>> {
            Ok(None)
        }

        async fn set_device_paused(&self, _name: &str, _paused: bool) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn backend_consumable_query_uses_warm_cache() {
        let dir = tempfile::tempdir().unwrap();
        let facility = Arc::new(OnePrinter::default());
        let engine = Arc::new(TelemetryEngine::new(facility.clone(), EngineSettings::default()));
        let pages = Arc::new(PageStore::new(Arc::new(JsonFileStore::new()), dir.path()));
        let provider = MonitorProvider {
            engine: Arc::clone(&engine),
            pages,
            autopause: Arc::new(AutoPauseService::new(facility.clone(), false, 15)),
        };

        let cold = provider.consumables().await;
        assert!(cold.contains_key("Desk Canon"));
        assert_eq!(facility.local_calls.load(Ordering::SeqCst), 1);

        let warm = provider.consumables().await;
        assert_eq!(warm.keys().collect::<Vec<_>>(), vec!["Desk Canon"]);
        assert_eq!(facility.local_calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        provider.consumables().await;
        assert_eq!(facility.local_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn shutdown_flag_is_set_once() {
        let dir = tempfile::tempdir().unwrap();
        let svc = offline_services(dir.path()).await;
        assert!(svc.mark_shutting_down());
        assert!(!svc.mark_shutting_down());
        assert!(svc.is_shutting_down());
    }
}
