// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Local HTTP facade. Every route is served bare and under /api.

use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use printwatch_core::error::{PrintwatchError, Result};
use printwatch_core::types::{Device, HealthStatus};
use printwatch_monitor::pages::today;

use crate::services::agent_services::AgentServices;

const AGENT_LABEL: &str = "Printwatch Agent";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Handler error rendered as `{success:false, error}`.
#[derive(Debug)]
pub struct ApiError(PrintwatchError);

impl From<PrintwatchError> for ApiError {
    fn from(e: PrintwatchError) -> Self {
        Self(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(PrintwatchError::InvalidRequest(rejection.body_text()))
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self.0 {
            PrintwatchError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(error = %self.0, "request failed");
        }
        (status, Json(json!({ "success": false, "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult = std::result::Result<Json<Value>, ApiError>;

fn parse_date(raw: Option<&str>) -> Result<Option<NaiveDate>> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map(Some)
            .map_err(|_| PrintwatchError::InvalidRequest(format!("date must be YYYY-MM-DD, got {s:?}"))),
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn router(svc: AgentServices) -> Router {
    let routes = Router::new()
        .route("/health", get(health))
        .route("/printers", get(printers))
        .route("/printers/health", get(printers_health))
        .route("/ink-status", get(ink_status))
        .route("/report/daily", get(daily_report))
        .route("/print-jobs", get(print_jobs))
        .route("/events/print", post(print_event))
        .route("/cache/clear", post(clear_cache))
        .route("/refresh", post(refresh))
        .route("/debug", get(debug_state));

    Router::new()
        .merge(routes.clone())
        .nest("/api", routes)
        .with_state(svc)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

fn running(flag: bool) -> &'static str {
    if flag { "RUNNING" } else { "STOPPED" }
}

async fn health(State(svc): State<AgentServices>) -> Json<Value> {
    let cloud = svc.cloud().map(|c| c.status());
    let connected = cloud.as_ref().is_some_and(|s| s.connected());
    let state = cloud
        .as_ref()
        .map(|s| s.state.to_string())
        .unwrap_or_else(|| "DISABLED".to_owned());

    Json(json!({
        "success": true,
        "agent": AGENT_LABEL,
        "agentId": svc.config().agent_id,
        "uptime": svc.uptime().as_secs_f64(),
        "cloudConnected": connected,
        "connectorState": state,
        "monitors": {
            "inkMonitor": running(svc.tasks().is_running("ink-monitor")),
            "pageCounter": running(svc.counter().is_running()),
            "cloud": state,
        },
        "shutdown": if svc.is_shutting_down() { "IN_PROGRESS" } else { "NO" },
        "timestamp": Utc::now(),
        "endpoints": {
            "printers": "/api/printers",
            "dailyReport": "/api/report/daily",
            "inkStatus": "/api/ink-status",
            "health": "/api/printers/health",
            "printJobs": "/api/print-jobs",
            "debug": "/api/debug",
        },
    }))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PrinterView<'a> {
    #[serde(flatten)]
    device: &'a Device,
    is_online: bool,
    is_offline: bool,
    is_printing: bool,
}

impl<'a> From<&'a Device> for PrinterView<'a> {
    fn from(device: &'a Device) -> Self {
        Self {
            device,
            is_online: device.is_online(),
            is_offline: device.is_offline(),
            is_printing: device.is_printing(),
        }
    }
}

async fn printers(State(svc): State<AgentServices>) -> ApiResult {
    let devices = svc.engine().directory().try_list_devices().await?;
    let views: Vec<PrinterView<'_>> = devices.iter().map(PrinterView::from).collect();
    Ok(Json(json!({
        "success": true,
        "count": views.len(),
        "printers": views,
        "timestamp": Utc::now(),
    })))
}

async fn printers_health(State(svc): State<AgentServices>) -> ApiResult {
    let devices = svc.engine().directory().try_list_devices().await?;
    let cached = svc.engine().snapshot();
    let now = Utc::now();

    let reports: Vec<Value> = devices
        .iter()
        .map(|d| {
            let healthy = d.health_status == HealthStatus::Ready;
            json!({
                "name": d.name,
                "status": d.health_status,
                "rawStatus": d.raw_status.unwrap_or(0),
                "healthStatus": if healthy { "HEALTHY" } else { "ERROR" },
                "inkLevels": cached.get(&d.id).map(|r| r.levels().clone()).unwrap_or_default(),
                "ipAddress": d.ip_address,
                "vendor": d.vendor,
                "isOnline": healthy,
                "lastChecked": now,
            })
        })
        .collect();

    Ok(Json(json!({
        "success": true,
        "count": reports.len(),
        "printers": reports,
        "timestamp": now,
    })))
}

async fn ink_status(State(svc): State<AgentServices>) -> Json<Value> {
    let readings = svc.consumables(false).await;
    Json(json!({ "success": true, "inkStatus": readings, "timestamp": Utc::now() }))
}

async fn refresh(State(svc): State<AgentServices>) -> Json<Value> {
    let readings = svc.consumables(true).await;
    info!(devices = readings.len(), "forced telemetry refresh");
    Json(json!({
        "success": true,
        "count": readings.len(),
        "inkStatus": readings,
        "timestamp": Utc::now(),
    }))
}

#[derive(Debug, Default, Deserialize)]
struct ReportQuery {
    date: Option<String>,
}

async fn daily_report(State(svc): State<AgentServices>, Query(q): Query<ReportQuery>) -> Response {
    match parse_date(q.date.as_deref()) {
        Ok(date) => Json(svc.pages().daily_report(date).await).into_response(),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "success": false,
                "error": e.to_string(),
                "date": today(),
                "totalPages": 0,
                "printers": [],
            })),
        )
            .into_response(),
    }
}

#[derive(Debug, Default, Deserialize)]
struct JobsQuery {
    date: Option<String>,
    printer: Option<String>,
}

async fn print_jobs(State(svc): State<AgentServices>, Query(q): Query<JobsQuery>) -> ApiResult {
    let date = parse_date(q.date.as_deref())?.unwrap_or_else(today);
    let printer = q.printer.as_deref().filter(|p| !p.is_empty());
    let jobs = svc.pages().print_jobs(Some(date), printer).await;
    let total_pages = jobs.iter().fold(0u64, |sum, j| sum.saturating_add(j.pages));
    Ok(Json(json!({
        "success": true,
        "date": date,
        "totalPages": total_pages,
        "count": jobs.len(),
        "jobs": jobs,
        "timestamp": Utc::now(),
    })))
}

#[derive(Debug, Deserialize)]
pub(crate) struct PrintEventBody {
    printer: Option<String>,
    pages: Option<i64>,
}

async fn print_event(
    State(svc): State<AgentServices>,
    body: std::result::Result<Json<PrintEventBody>, JsonRejection>,
) -> ApiResult {
    let Json(body) = body?;
    let printer = body
        .printer
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| PrintwatchError::InvalidRequest("printer is required".into()))?;
    let pages = body
        .pages
        .filter(|n| *n > 0)
        .ok_or_else(|| PrintwatchError::InvalidRequest("pages must be a positive integer".into()))?;

    let added = svc.record_print_event(&printer, pages.unsigned_abs()).await?;
    Ok(Json(json!({
        "success": true,
        "message": format!("Added {pages} pages to {printer}"),
        "data": added,
    })))
}

/// Raw page store, telemetry cache contents and helper process count.
async fn debug_state(State(svc): State<AgentServices>) -> ApiResult {
    let store = serde_json::to_value(svc.pages().document().await).map_err(PrintwatchError::from)?;
    let snapshot = svc.engine().snapshot();
    Ok(Json(json!({
        "success": true,
        "storeData": store,
        "cacheStatus": {
            "entries": snapshot.len(),
            "warm": svc.engine().warm_snapshot().is_some(),
            "printers": snapshot.keys().collect::<Vec<_>>(),
        },
        "helperProcesses": svc.processes().active(),
        "timestamp": Utc::now(),
    })))
}

async fn clear_cache(State(svc): State<AgentServices>) -> Json<Value> {
    svc.engine().clear_cache();
    Json(json!({ "success": true, "message": "Cache cleared", "timestamp": Utc::now() }))
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// A running listener.
pub struct HttpServer {
    addr: SocketAddr,
    token: CancellationToken,
    task: JoinHandle<Result<()>>,
}

impl HttpServer {
    pub async fn bind(svc: AgentServices, addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| PrintwatchError::HttpServer(format!("cannot bind {addr}: {e}")))?;
        let addr = listener.local_addr()?;
        info!(%addr, "HTTP facade listening");

        let token = CancellationToken::new();
        let stop = token.clone();
        let app = router(svc);
        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { stop.cancelled().await })
                .await
                .map_err(|e| PrintwatchError::HttpServer(e.to_string()))
        });

        Ok(Self { addr, token, task })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting, give in-flight requests `grace` to finish, then abort.
    pub async fn stop(self, grace: Duration) -> Result<()> {
        self.token.cancel();
        let abort = self.task.abort_handle();
        match tokio::time::timeout(grace, self.task).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(join)) => Err(PrintwatchError::HttpServer(join.to_string())),
            Err(_) => {
                warn!(?grace, "HTTP drain timed out, aborting");
                abort.abort();
                Ok(())
            }
        }
    }
}
