// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Cloud connector.
//
// A background loop owns the channel: connect, register, heartbeat, push,
// answer commands, and on failure wait a fixed delay and try again until the
// attempt budget runs out. Everything slow (device listing, telemetry,
// pause/resume) runs in spawned tasks that hand their frame back through an
// outbound queue, so the loop never stops reading the channel.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;

use printwatch_core::config::AgentConfig;
use printwatch_core::error::{PrintwatchError, Result};
use printwatch_core::types::{ConnectorState, DailyReport, Device, TelemetryReading};

use crate::messages::{
    AgentIdentity, CommandKind, CommandRequest, CommandResponseData, Inbound, Outbound, parse_inbound,
};
use crate::session::{Session, SessionStatus};
use crate::transport::{Channel, Credentials, Frame, Transport};

/// Gap between the pushes that follow a registration ack.
pub const PUSH_STAGGER: Duration = Duration::from_millis(500);

/// Bound on opening the channel, upgrade handshake included.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on writing one frame. A peer that stops reading counts as lost.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the backend has to acknowledge a registration.
pub const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(30);

const OUTBOUND_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

/// The engines the connector reports on and routes commands to.
#[async_trait]
pub trait TelemetryProvider: Send + Sync {
    async fn printers(&self) -> Result<Vec<Device>>;

    /// Consumable readings keyed by device name.
    async fn consumables(&self) -> BTreeMap<String, TelemetryReading>;

    async fn daily_report(&self) -> DailyReport;

    async fn pause_device(&self, name: &str) -> Result<()>;

    async fn resume_device(&self, name: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ConnectorSettings {
    pub url: Url,
    pub credentials: Credentials,
    pub identity: AgentIdentity,
    pub heartbeat_interval: Duration,
    pub report_interval: Duration,
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
    /// Drop the channel after this long without any inbound frame.
    pub liveness_timeout: Option<Duration>,
}

impl ConnectorSettings {
    pub fn from_config(config: &AgentConfig) -> Result<Self> {
        let heartbeat_interval = config.heartbeat_interval();
        Ok(Self {
            url: config.cloud_url()?,
            credentials: Credentials {
                agent_id: config.agent_id.clone(),
                token: config.agent_token.clone(),
            },
            identity: AgentIdentity::new(
                &config.agent_id,
                &config.agent_name,
                &config.company_name,
                &config.location,
            ),
            heartbeat_interval,
            report_interval: Duration::from_millis(config.report_push_interval_ms),
            reconnect_delay: config.reconnect_delay(),
            max_reconnect_attempts: config.max_reconnect_attempts,
            liveness_timeout: config
                .liveness_timeout_heartbeats
                .map(|n| heartbeat_interval * n),
        })
    }
}

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

/// Scheduled follow-ups to a registration ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Push {
    Printers,
    Consumables,
    Report,
}

enum Ended {
    Cancelled,
    Lost(PrintwatchError),
}

pub struct CloudConnector {
    settings: ConnectorSettings,
    transport: Arc<dyn Transport>,
    provider: Arc<dyn TelemetryProvider>,
    status_tx: watch::Sender<SessionStatus>,
    outbound_tx: mpsc::Sender<Outbound>,
    outbound_rx: Mutex<Option<mpsc::Receiver<Outbound>>>,
    wake: Notify,
    cancel: CancellationToken,
    started: Instant,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CloudConnector {
    pub fn new(
        settings: ConnectorSettings,
        transport: Arc<dyn Transport>,
        provider: Arc<dyn TelemetryProvider>,
    ) -> Arc<Self> {
        let (status_tx, _) = watch::channel(SessionStatus::default());
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        Arc::new(Self {
            settings,
            transport,
            provider,
            status_tx,
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            wake: Notify::new(),
            cancel: CancellationToken::new(),
            started: Instant::now(),
            task: Mutex::new(None),
        })
    }

    /// Start the background loop. Calling it twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        let Some(outbound_rx) = self.outbound_rx.lock().ok().and_then(|mut rx| rx.take()) else {
            warn!("cloud connector already started");
            return;
        };
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.run(outbound_rx).await });
        if let Ok(mut task) = self.task.lock() {
            *task = Some(handle);
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.status_tx.borrow().connected()
    }

    /// Leave `GIVEN_UP` (or cut a reconnect wait short) with a fresh budget.
    pub fn reconnect(&self) {
        match self.status().state {
            ConnectorState::GivenUp | ConnectorState::Disconnected => {
                info!("manual cloud reconnect requested");
                self.wake.notify_one();
            }
            state => debug!(%state, "reconnect ignored, channel is active"),
        }
    }

    /// Queue a frame for the backend. Dropped, with a diagnostic, when the
    /// channel is not connected.
    pub fn push(&self, frame: Outbound) -> bool {
        if !self.is_connected() {
            debug!(kind = frame.kind(), "cloud not connected, push dropped");
            return false;
        }
        let kind = frame.kind();
        match self.outbound_tx.try_send(frame) {
            Ok(()) => true,
            Err(e) => {
                warn!(kind, error = %e, "outbound queue rejected push");
                false
            }
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.settings.identity.agent_id
    }

    /// Stop the loop and close the channel, waiting at most `deadline`.
    pub async fn close(&self, deadline: Duration) {
        self.cancel.cancel();
        let handle = self.task.lock().ok().and_then(|mut task| task.take());
        let Some(mut handle) = handle else {
            return;
        };
        if tokio::time::timeout(deadline, &mut handle).await.is_err() {
            warn!("cloud connector did not stop in time, aborting");
            handle.abort();
        }
    }

    // -- Driver loop -----------------------------------------------------------

    async fn run(self: Arc<Self>, mut outbound_rx: mpsc::Receiver<Outbound>) {
        let mut session = Session::new(self.settings.max_reconnect_attempts);

        loop {
            if !session.begin_attempt() {
                self.publish(&session);
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => break,
                    _ = self.wake.notified() => {
                        session.reset();
                        self.publish(&session);
                        continue;
                    }
                }
            }
            self.publish(&session);

            match self.connect_and_serve(&mut session, &mut outbound_rx).await {
                Ended::Cancelled => break,
                Ended::Lost(e) => {
                    warn!(error = %e, attempt = session.reconnect_attempts(), "cloud channel lost");
                    session.transport_down();
                    self.publish(&session);
                }
            }

            debug!(delay_ms = self.settings.reconnect_delay.as_millis() as u64, "waiting before reconnect");
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = self.wake.notified() => session.reset(),
                _ = tokio::time::sleep(self.settings.reconnect_delay) => {}
            }
        }

        session.transport_down();
        self.publish(&session);
        debug!("cloud connector loop exiting");
    }

    #[instrument(skip_all)]
    async fn connect_and_serve(
        self: &Arc<Self>,
        session: &mut Session,
        outbound_rx: &mut mpsc::Receiver<Outbound>,
    ) -> Ended {
        let connect = self.transport.connect(&self.settings.url, &self.settings.credentials);
        let connected = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ended::Cancelled,
            result = tokio::time::timeout(CONNECT_TIMEOUT, connect) => result,
        };
        let mut channel = match connected {
            Ok(Ok(channel)) => channel,
            Ok(Err(e)) => return Ended::Lost(e),
            Err(_) => return Ended::Lost(PrintwatchError::ChannelFault("connect timed out".into())),
        };

        // Frames queued for an earlier connection are stale now.
        while outbound_rx.try_recv().is_ok() {}

        session.transport_up();
        self.publish(session);

        let printers = self.provider.printers().await.unwrap_or_else(|e| {
            warn!(error = %e, "registering without a printer list");
            Vec::new()
        });
        let registration = Outbound::registration(&self.settings.identity, printers);
        if let Err(e) = send(channel.as_mut(), &registration).await {
            return Ended::Lost(e);
        }
        info!("registration sent");

        let mut heartbeat: Option<Interval> = None;
        let mut report: Option<Interval> = None;
        let mut pending: VecDeque<(Instant, Push)> = VecDeque::new();
        let mut last_seen = Instant::now();
        let mut ack_deadline = Some(last_seen + REGISTRATION_TIMEOUT);

        let ended = loop {
            let liveness_deadline = self.settings.liveness_timeout.map(|t| last_seen + t);

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break Ended::Cancelled,

                frame = channel.recv() => match frame {
                    None => break Ended::Lost(PrintwatchError::ChannelFault("closed by peer".into())),
                    Some(Err(e)) => break Ended::Lost(e),
                    Some(Ok(Frame::Liveness)) => last_seen = Instant::now(),
                    Some(Ok(Frame::Text(text))) => {
                        last_seen = Instant::now();
                        match parse_inbound(&text) {
                            Ok(Inbound::RegistrationAck) => {
                                if session.acknowledged() {
                                    ack_deadline = None;
                                    self.publish(session);
                                    heartbeat = Some(ticker(self.settings.heartbeat_interval));
                                    report = Some(ticker(self.settings.report_interval));
                                    let now = Instant::now();
                                    pending = VecDeque::from([
                                        (now, Push::Printers),
                                        (now + PUSH_STAGGER, Push::Consumables),
                                        (now + PUSH_STAGGER * 2, Push::Report),
                                    ]);
                                }
                            }
                            Ok(Inbound::HeartbeatAck) => debug!("heartbeat acknowledged"),
                            Ok(Inbound::Command(request)) => self.dispatch(request),
                            Ok(Inbound::Other(kind)) => debug!(%kind, "ignoring backend message"),
                            Err(e) => warn!(error = %e, "ignoring malformed backend frame"),
                        }
                    }
                },

                _ = tick(&mut heartbeat) => {
                    let frame = Outbound::heartbeat(&self.settings.identity.agent_id, self.started.elapsed().as_secs_f64());
                    if let Err(e) = send(channel.as_mut(), &frame).await {
                        break Ended::Lost(e);
                    }
                    session.record_heartbeat(chrono::Utc::now());
                    self.publish(session);
                    debug!("heartbeat sent");
                }

                _ = tick(&mut report) => self.spawn_push(Push::Report),

                _ = due(pending.front().map(|(at, _)| *at)) => {
                    if let Some((_, push)) = pending.pop_front() {
                        self.spawn_push(push);
                    }
                }

                Some(frame) = outbound_rx.recv() => {
                    if session.state() != ConnectorState::Connected {
                        debug!(kind = frame.kind(), "not registered yet, frame dropped");
                        continue;
                    }
                    if let Err(e) = send(channel.as_mut(), &frame).await {
                        break Ended::Lost(e);
                    }
                    debug!(kind = frame.kind(), "frame sent");
                }

                _ = due(ack_deadline) => {
                    break Ended::Lost(PrintwatchError::ChannelFault("registration not acknowledged".into()));
                }

                _ = due(liveness_deadline) => {
                    break Ended::Lost(PrintwatchError::ChannelFault("no traffic within liveness window".into()));
                }
            }
        };

        if tokio::time::timeout(SEND_TIMEOUT, channel.close()).await.is_err() {
            debug!("close handshake timed out");
        }
        ended
    }

    fn publish(&self, session: &Session) {
        self.status_tx.send_replace(session.status());
    }

    // -- Pushes and commands ---------------------------------------------------

    fn spawn_push(self: &Arc<Self>, push: Push) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let agent_id = &this.settings.identity.agent_id;
            let frame = match push {
                Push::Printers => match this.provider.printers().await {
                    Ok(printers) => Outbound::printer_update(agent_id, printers),
                    Err(e) => {
                        warn!(error = %e, "printer snapshot unavailable");
                        return;
                    }
                },
                Push::Consumables => Outbound::ink_status(agent_id, this.provider.consumables().await),
                Push::Report => Outbound::daily_report(agent_id, this.provider.daily_report().await),
            };
            this.push(frame);
        });
    }

    fn dispatch(self: &Arc<Self>, request: CommandRequest) {
        let Some(kind) = CommandKind::parse(&request.action) else {
            warn!(action = %request.action, "unknown command ignored");
            return;
        };
        info!(action = %request.action, printer = request.printer_name.as_deref().unwrap_or(""), "command received");

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let data = this.execute(kind, &request).await;
            this.push(Outbound::command_response(&this.settings.identity.agent_id, data));
        });
    }

    async fn execute(&self, kind: CommandKind, request: &CommandRequest) -> CommandResponseData {
        let command_id = request.command_id.clone();
        let printer = request.printer_name.as_deref().unwrap_or("");

        let outcome: Result<(String, Option<serde_json::Value>)> = match kind {
            CommandKind::PauseDevice | CommandKind::ResumeDevice if printer.is_empty() => Err(
                PrintwatchError::InvalidRequest("printerName is required".into()),
            ),
            CommandKind::PauseDevice => self
                .provider
                .pause_device(printer)
                .await
                .map(|()| (format!("Printer {printer} paused successfully"), None)),
            CommandKind::ResumeDevice => self
                .provider
                .resume_device(printer)
                .await
                .map(|()| (format!("Printer {printer} resumed successfully"), None)),
            CommandKind::GetStatus => self.provider.printers().await.and_then(|printers| {
                let message = format!("{} printers", printers.len());
                Ok((message, Some(serde_json::to_value(printers)?)))
            }),
            CommandKind::GetConsumableStatus => {
                let status = self.provider.consumables().await;
                let message = format!("Consumable status for {} printers", status.len());
                serde_json::to_value(status)
                    .map(|v| (message, Some(v)))
                    .map_err(PrintwatchError::from)
            }
        };

        match outcome {
            Ok((message, result)) => CommandResponseData {
                command_id,
                success: true,
                message,
                result,
            },
            Err(e) => {
                warn!(action = %request.action, error = %e, "command failed");
                CommandResponseData {
                    command_id,
                    success: false,
                    message: e.to_string(),
                    result: None,
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn send(channel: &mut dyn Channel, frame: &Outbound) -> Result<()> {
    let text = frame.to_json()?;
    match tokio::time::timeout(SEND_TIMEOUT, channel.send(text)).await {
        Ok(result) => result,
        Err(_) => Err(PrintwatchError::ChannelFault(format!("{} send timed out", frame.kind()))),
    }
}

/// Interval whose first tick is one full period away.
fn ticker(period: Duration) -> Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn due(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use chrono::{NaiveDate, Utc};
    use printwatch_core::types::{
        Connection, HealthStatus, MonitoringMethod, PortType, TelemetrySource, Vendor,
    };
    use serde_json::Value;
    use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

    use super::*;

    // -- Fakes -----------------------------------------------------------------

    struct FakeChannel {
        to_agent: UnboundedReceiver<String>,
        from_agent: UnboundedSender<String>,
        /// Writes never complete, like a peer that stopped reading.
        stalled: bool,
    }

    #[async_trait]
    impl Channel for FakeChannel {
        async fn send(&mut self, text: String) -> Result<()> {
            if self.stalled {
                return std::future::pending().await;
            }
            self.from_agent
                .send(text)
                .map_err(|_| PrintwatchError::ChannelFault("server gone".into()))
        }

        async fn recv(&mut self) -> Option<Result<Frame>> {
            self.to_agent.recv().await.map(|t| Ok(Frame::Text(t)))
        }

        async fn close(&mut self) {}
    }

    /// Test side of one accepted connection.
    struct Server {
        to_agent: UnboundedSender<String>,
        from_agent: UnboundedReceiver<String>,
    }

    impl Server {
        fn say(&self, text: &str) {
            self.to_agent.send(text.into()).unwrap();
        }

        async fn next(&mut self) -> Value {
            let text = tokio::time::timeout(Duration::from_secs(120), self.from_agent.recv())
                .await
                .expect("agent sent nothing")
                .expect("channel closed");
            serde_json::from_str(&text).unwrap()
        }

        async fn next_of(&mut self, kind: &str) -> Value {
            loop {
                let frame = self.next().await;
                if frame["type"] == kind {
                    return frame;
                }
            }
        }
    }

    #[derive(Default)]
    struct FakeTransport {
        accept: Mutex<VecDeque<FakeChannel>>,
        attempts: AtomicUsize,
        /// Connection attempts hang instead of failing.
        hang: AtomicBool,
    }

    impl FakeTransport {
        /// Accept the next connection attempt; later attempts fail.
        fn accept_next(&self) -> Server {
            self.accept_channel(false)
        }

        /// Accept the next connection attempt with a channel that never
        /// finishes a write.
        fn accept_stalled(&self) -> Server {
            self.accept_channel(true)
        }

        fn accept_channel(&self, stalled: bool) -> Server {
            let (to_agent_tx, to_agent_rx) = unbounded_channel();
            let (from_agent_tx, from_agent_rx) = unbounded_channel();
            self.accept.lock().unwrap().push_back(FakeChannel {
                to_agent: to_agent_rx,
                from_agent: from_agent_tx,
                stalled,
            });
            Server {
                to_agent: to_agent_tx,
                from_agent: from_agent_rx,
            }
        }

        fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn connect(&self, _url: &Url, _credentials: &Credentials) -> Result<Box<dyn Channel>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.hang.load(Ordering::SeqCst) {
                return std::future::pending().await;
            }
            match self.accept.lock().unwrap().pop_front() {
                Some(channel) => Ok(Box::new(channel)),
                None => Err(PrintwatchError::ChannelFault("connection refused".into())),
            }
        }
    }

    #[derive(Default)]
    struct FakeProvider {
        paused: Mutex<Vec<String>>,
    }

    fn device(name: &str) -> Device {
        Device {
            id: Device::stable_id(name),
            name: name.into(),
            port_type: PortType::Network,
            connection: Connection::Tcpip,
            ip_address: Some("10.0.0.5".into()),
            is_network: true,
            vendor: Vendor::Hp,
            health_status: HealthStatus::Ready,
            raw_status: Some(3),
            supports_telemetry: true,
            driver_name: "HP LaserJet".into(),
            port_name: "IP_10.0.0.5".into(),
            location: String::new(),
            comment: String::new(),
            shared: false,
            work_offline: false,
        }
    }

    #[async_trait]
    impl TelemetryProvider for FakeProvider {
        async fn printers(&self) -> Result<Vec<Device>> {
            Ok(vec![device("Office")])
        }

        async fn consumables(&self) -> BTreeMap<String, TelemetryReading> {
            let levels = BTreeMap::from([("black".to_string(), 8u8)]);
            BTreeMap::from([(
                "Office".to_string(),
                TelemetryReading::with_levels(
                    Device::stable_id("Office"),
                    "Office",
                    TelemetrySource::Protocol,
                    MonitoringMethod::Protocol,
                    levels,
                ),
            )])
        }

        async fn daily_report(&self) -> DailyReport {
            DailyReport {
                success: true,
                date: NaiveDate::from_ymd_opt(2026, 3, 9).unwrap(),
                total_pages: 0,
                printers: Vec::new(),
                count: 0,
                timestamp: Utc::now(),
            }
        }

        async fn pause_device(&self, name: &str) -> Result<()> {
            self.paused.lock().unwrap().push(name.to_string());
            Ok(())
        }

        async fn resume_device(&self, name: &str) -> Result<()> {
            Err(PrintwatchError::QueryFailure(format!("{name} not found")))
        }
    }

    fn settings(max_attempts: u32) -> ConnectorSettings {
        ConnectorSettings {
            url: Url::parse("ws://backend.test/ws/agent").unwrap(),
            credentials: Credentials {
                agent_id: "AGENT-1".into(),
                token: "secret".into(),
            },
            identity: AgentIdentity::new("AGENT-1", "FRONTDESK", "Acme", "Lobby"),
            heartbeat_interval: Duration::from_secs(30),
            report_interval: Duration::from_secs(3600),
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_attempts: max_attempts,
            liveness_timeout: None,
        }
    }

    fn connector(
        settings: ConnectorSettings,
        transport: &Arc<FakeTransport>,
    ) -> (Arc<CloudConnector>, Arc<FakeProvider>) {
        let provider = Arc::new(FakeProvider::default());
        let connector = CloudConnector::new(settings, transport.clone(), provider.clone());
        (connector, provider)
    }

    async fn wait_for(connector: &CloudConnector, state: ConnectorState) {
        let mut rx = connector.subscribe();
        tokio::time::timeout(Duration::from_secs(600), rx.wait_for(|s| s.state == state))
            .await
            .expect("state never reached")
            .expect("connector dropped");
    }

    // -- Tests -----------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn registers_then_pushes_in_order() {
        let transport = Arc::new(FakeTransport::default());
        let mut server = transport.accept_next();
        let (connector, _) = connector(settings(3), &transport);
        connector.start();

        let registration = server.next().await;
        assert_eq!(registration["type"], "registration");
        assert_eq!(registration["data"]["printers"][0]["name"], "Office");
        assert_eq!(connector.status().state, ConnectorState::Registering);

        server.say(r#"{"type":"registration_ack"}"#);
        wait_for(&connector, ConnectorState::Connected).await;

        assert_eq!(server.next().await["type"], "printer_update");
        let ink = server.next().await;
        assert_eq!(ink["type"], "ink_status");
        assert_eq!(ink["data"]["inkStatus"]["Office"]["inkHealthStatus"], "CRITICAL");
        assert_eq!(server.next().await["type"], "daily_report");

        let heartbeat = server.next().await;
        assert_eq!(heartbeat["type"], "heartbeat");
        assert_eq!(heartbeat["agentId"], "AGENT-1");
        assert!(connector.status().last_heartbeat_at.is_some());

        connector.close(Duration::from_secs(1)).await;
        assert_eq!(connector.status().state, ConnectorState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_then_resumes_on_manual_reconnect() {
        let transport = Arc::new(FakeTransport::default());
        let (connector, _) = connector(settings(3), &transport);
        connector.start();

        wait_for(&connector, ConnectorState::GivenUp).await;
        assert_eq!(transport.attempts(), 3);

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(transport.attempts(), 3);

        let mut server = transport.accept_next();
        connector.reconnect();
        assert_eq!(server.next().await["type"], "registration");
        assert_eq!(transport.attempts(), 4);

        connector.close(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_stops_heartbeats_and_retries_once_after_delay() {
        let transport = Arc::new(FakeTransport::default());
        let mut server = transport.accept_next();
        let (connector, _) = connector(settings(10), &transport);
        connector.start();

        server.next_of("registration").await;
        server.say(r#"{"type":"welcome"}"#);
        server.next_of("heartbeat").await;

        // Hang up from the backend side but keep listening for stray frames.
        let Server {
            to_agent,
            mut from_agent,
        } = server;
        let mut status = connector.subscribe();
        drop(to_agent);
        status.wait_for(|s| s.state != ConnectorState::Connected).await.unwrap();
        assert_eq!(transport.attempts(), 1);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(transport.attempts(), 1);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(transport.attempts(), 2);
        assert!(!connector.is_connected());

        // Two heartbeat periods later nothing more arrived on the old channel.
        tokio::time::sleep(Duration::from_secs(60)).await;
        let mut stray = Vec::new();
        while let Some(text) = from_agent.recv().await {
            stray.push(text);
        }
        assert!(
            stray.iter().all(|t| !t.contains(r#""type":"heartbeat""#)),
            "heartbeat after disconnect: {stray:?}"
        );

        connector.close(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn hung_connect_counts_as_a_failed_attempt() {
        let transport = Arc::new(FakeTransport::default());
        transport.hang.store(true, Ordering::SeqCst);
        let (connector, _) = connector(settings(2), &transport);
        let begun = Instant::now();
        connector.start();

        wait_for(&connector, ConnectorState::GivenUp).await;
        assert_eq!(transport.attempts(), 2);
        assert!(begun.elapsed() >= CONNECT_TIMEOUT * 2);
        connector.close(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn unacknowledged_registration_is_abandoned() {
        let transport = Arc::new(FakeTransport::default());
        let mut server = transport.accept_next();
        let (connector, _) = connector(settings(3), &transport);
        connector.start();

        server.next_of("registration").await;
        let sent = Instant::now();
        assert_eq!(connector.status().state, ConnectorState::Registering);

        let mut status = connector.subscribe();
        status.wait_for(|s| s.state != ConnectorState::Registering).await.unwrap();
        assert!(sent.elapsed() >= REGISTRATION_TIMEOUT);
        assert!(!connector.is_connected());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(transport.attempts(), 2);
        connector.close(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_write_drops_the_channel() {
        let transport = Arc::new(FakeTransport::default());
        let _server = transport.accept_stalled();
        let (connector, _) = connector(settings(1), &transport);
        let begun = Instant::now();
        connector.start();

        wait_for(&connector, ConnectorState::GivenUp).await;
        assert_eq!(transport.attempts(), 1);
        assert!(begun.elapsed() >= SEND_TIMEOUT);
        connector.close(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn commands_are_answered_with_their_id() {
        let transport = Arc::new(FakeTransport::default());
        let mut server = transport.accept_next();
        let (connector, provider) = connector(settings(3), &transport);
        connector.start();

        server.next_of("registration").await;
        server.say(r#"{"type":"connection_ack"}"#);
        wait_for(&connector, ConnectorState::Connected).await;

        server.say("garbage");
        server.say(r#"{"type":"command","action":"reboot","commandId":"x"}"#);
        server.say(r#"{"type":"command","action":"pause_device","printerName":"Office","commandId":"c-1"}"#);
        let response = server.next_of("command_response").await;
        assert_eq!(response["data"]["commandId"], "c-1");
        assert_eq!(response["data"]["success"], true);
        assert_eq!(provider.paused.lock().unwrap().clone(), vec!["Office".to_string()]);

        server.say(r#"{"type":"command","action":"resume_device","printerName":"Ghost","commandId":7}"#);
        let response = server.next_of("command_response").await;
        assert_eq!(response["data"]["commandId"], 7);
        assert_eq!(response["data"]["success"], false);

        server.say(r#"{"type":"command","action":"get_consumable_status","commandId":8}"#);
        let response = server.next_of("command_response").await;
        assert_eq!(response["data"]["result"]["Office"]["supported"], true);

        assert!(connector.is_connected());
        connector.close(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn pushes_while_disconnected_are_dropped() {
        let transport = Arc::new(FakeTransport::default());
        let (connector, _) = connector(settings(1), &transport);
        assert!(!connector.push(Outbound::print_event("AGENT-1", "Office", 2)));
        connector.start();
        wait_for(&connector, ConnectorState::GivenUp).await;
        assert!(!connector.push(Outbound::print_event("AGENT-1", "Office", 2)));
        connector.close(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn silent_channel_trips_liveness_timeout() {
        let transport = Arc::new(FakeTransport::default());
        let mut server = transport.accept_next();
        let mut settings = settings(3);
        settings.liveness_timeout = Some(Duration::from_secs(90));
        let (connector, _) = connector(settings, &transport);
        connector.start();

        server.next_of("registration").await;
        server.say(r#"{"type":"registration_ack"}"#);
        wait_for(&connector, ConnectorState::Connected).await;

        let mut status = connector.subscribe();
        status.wait_for(|s| s.state != ConnectorState::Connected).await.unwrap();
        connector.close(Duration::from_secs(1)).await;
    }
}
