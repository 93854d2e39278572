//! Device gateway (spec.md §4.2): the only thing agents talk to. Computes
//! desired state with ETags, ingests reports, and detects staleness.

pub mod auth;
pub mod desired;
pub mod liveness;
pub mod report;

use std::net::SocketAddr;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};
use prometheus::{Encoder, Histogram, IntCounterVec, Registry, TextEncoder};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::condition;
use crate::crd::DeviceProcess;
use auth::AuthConfig;
use desired::DesiredIndex;
use liveness::LivenessMap;
use report::{ReportAck, ReportRequest};

const FIELD_OWNER: &str = "apollo-gateway";

static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static REQUESTS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new("apollo_gateway_requests_total", "Total gateway HTTP requests"),
        &["path", "status"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

static STALE_DEVICES_TOTAL: LazyLock<prometheus::IntCounter> = LazyLock::new(|| {
    let c = prometheus::IntCounter::new(
        "apollo_gateway_stale_devices_total",
        "Total times a device was transitioned to disconnected by the staleness loop",
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

static REPORT_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    let h = Histogram::with_opts(prometheus::HistogramOpts::new(
        "apollo_gateway_report_ingest_duration_seconds",
        "Duration of report ingestion requests",
    ))
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(h.clone())).expect("metric not yet registered");
    h
});

pub struct GatewayConfig {
    pub addr: SocketAddr,
    pub default_heartbeat_seconds: u64,
    pub stale_multiplier: u64,
    pub device_token: Option<String>,
    pub device_token_secret: Option<String>,
}

#[derive(Clone)]
struct AppState {
    client: Client,
    index: Arc<DesiredIndex>,
    liveness: Arc<LivenessMap>,
    auth: Arc<AuthConfig>,
    default_heartbeat_seconds: u64,
    stale_multiplier: u64,
}

/// Entry point for `apollo gateway serve`.
pub async fn run(config: GatewayConfig) -> Result<()> {
    let client = Client::try_default().await.context("failed to load kubeconfig")?;
    client.apiserver_version().await.context("cannot reach cluster")?;

    LazyLock::force(&REQUESTS_TOTAL);
    LazyLock::force(&STALE_DEVICES_TOTAL);
    LazyLock::force(&REPORT_DURATION);

    let (index, index_task) = DesiredIndex::start(client.clone());
    let index = Arc::new(index);
    let liveness = Arc::new(LivenessMap::new());

    let state = AppState {
        client: client.clone(),
        index: index.clone(),
        liveness: liveness.clone(),
        auth: Arc::new(AuthConfig {
            device_token: config.device_token.clone(),
            device_token_secret: config.device_token_secret.clone(),
        }),
        default_heartbeat_seconds: config.default_heartbeat_seconds,
        stale_multiplier: config.stale_multiplier,
    };

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let index_handle = tokio::spawn(index_task);

    let staleness_client = client.clone();
    let staleness_liveness = liveness.clone();
    let mut staleness_shutdown = shutdown_tx.subscribe();
    let default_heartbeat = config.default_heartbeat_seconds;
    let stale_multiplier = config.stale_multiplier;
    let staleness_handle = tokio::spawn(async move {
        staleness_loop(
            staleness_client,
            staleness_liveness,
            default_heartbeat,
            stale_multiplier,
            &mut staleness_shutdown,
        )
        .await;
    });

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/v1/devices/{device}/desired", get(get_desired))
        .route("/v1/devices/{device}/report", post(post_report))
        .route("/v1/devices/{device}/connect", post(post_connect))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(config.addr)
        .await
        .with_context(|| format!("failed to bind {}", config.addr))?;
    info!(addr = %config.addr, "gateway_listening");

    let mut shutdown = shutdown_tx.subscribe();
    let serve = axum::serve(listener, app);
    tokio::select! {
        res = serve => { if let Err(e) = res { warn!(%e, "gateway_server_error"); } }
        _ = tokio::signal::ctrl_c() => { info!("shutdown_signal_received"); }
        _ = shutdown.recv() => {}
    }

    let _ = shutdown_tx.send(());
    staleness_handle.abort();
    index_handle.abort();
    Ok(())
}

async fn healthz() -> impl IntoResponse {
    StatusCode::OK
}

async fn readyz() -> impl IntoResponse {
    StatusCode::OK
}

async fn metrics() -> impl IntoResponse {
    let mut buf = Vec::new();
    let encoder = TextEncoder::new();
    encoder.encode(&REGISTRY.gather(), &mut buf).ok();
    (StatusCode::OK, buf)
}

fn device_token(headers: &HeaderMap) -> Option<&str> {
    headers.get("X-Device-Token").and_then(|v| v.to_str().ok())
}

async fn get_desired(
    State(state): State<AppState>,
    Path(device): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !auth::is_authorized(&state.auth, &device, device_token(&headers)) {
        REQUESTS_TOTAL.with_label_values(&["desired", "401"]).inc();
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let heartbeat = state.liveness.heartbeat_hint(&device, state.default_heartbeat_seconds);
    state.liveness.note_desired_fetch(
        &device,
        chrono::Utc::now(),
        heartbeat,
        state.stale_multiplier,
    );

    let processes = state.index.for_device(&device);
    let (response, etag) = match desired::compute_desired(&device, heartbeat, processes) {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, device = %device, "desired_compute_failed");
            REQUESTS_TOTAL.with_label_values(&["desired", "500"]).inc();
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    if let Some(if_none_match) = headers.get(axum::http::header::IF_NONE_MATCH) {
        if if_none_match.to_str().ok() == Some(etag.as_str()) {
            REQUESTS_TOTAL.with_label_values(&["desired", "304"]).inc();
            return (
                StatusCode::NOT_MODIFIED,
                [(axum::http::header::ETAG, etag)],
            )
                .into_response();
        }
    }

    REQUESTS_TOTAL.with_label_values(&["desired", "200"]).inc();
    (StatusCode::OK, [(axum::http::header::ETAG, etag)], Json(response)).into_response()
}

async fn post_connect(
    State(state): State<AppState>,
    Path(device): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !auth::is_authorized(&state.auth, &device, device_token(&headers)) {
        REQUESTS_TOTAL.with_label_values(&["connect", "401"]).inc();
        return StatusCode::UNAUTHORIZED.into_response();
    }
    state.liveness.record_connect(&device, chrono::Utc::now());
    REQUESTS_TOTAL.with_label_values(&["connect", "200"]).inc();
    (StatusCode::OK, Json(ReportAck { ack: true })).into_response()
}

const MAX_REPORT_BODY_BYTES: usize = 4 * 1024 * 1024;

async fn post_report(
    State(state): State<AppState>,
    Path(device): Path<String>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    let _timer = REPORT_DURATION.start_timer();

    if !auth::is_authorized(&state.auth, &device, device_token(&headers)) {
        REQUESTS_TOTAL.with_label_values(&["report", "401"]).inc();
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if body.len() > MAX_REPORT_BODY_BYTES {
        REQUESTS_TOTAL.with_label_values(&["report", "413"]).inc();
        return StatusCode::PAYLOAD_TOO_LARGE.into_response();
    }

    let report: ReportRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "report_body_invalid");
            REQUESTS_TOTAL.with_label_values(&["report", "400"]).inc();
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    state.liveness.record_report(&device, chrono::Utc::now());

    for observation in &report.observations {
        if let Err(status) = ingest_one(&state.client, &device, &report, observation).await {
            REQUESTS_TOTAL.with_label_values(&["report", &status.as_u16().to_string()]).inc();
            return status.into_response();
        }
    }

    REQUESTS_TOTAL.with_label_values(&["report", "200"]).inc();
    (StatusCode::OK, Json(ReportAck { ack: true })).into_response()
}

/// Ingest one observation: load, validate device ownership, project onto
/// status, patch with optimistic-lock retries (spec.md §4.2).
async fn ingest_one(
    client: &Client,
    device: &str,
    report: &ReportRequest,
    observation: &report::Observation,
) -> std::result::Result<(), StatusCode> {
    let api: Api<DeviceProcess> = Api::namespaced(client.clone(), &observation.namespace);

    let existing = match api.get(&observation.name).await {
        Ok(p) => p,
        Err(kube::Error::Api(e)) if e.code == 404 => {
            info!(namespace = %observation.namespace, name = %observation.name, "report_target_not_found");
            return Ok(());
        }
        Err(e) => {
            warn!(error = %e, "report_load_failed");
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    if existing.spec.device_ref.name != device {
        return Err(StatusCode::BAD_REQUEST);
    }

    let now = condition::now_rfc3339();
    for attempt in 0..3 {
        let mut status = existing.status.clone().unwrap_or_default();
        let before = status.clone();
        if existing.spec.artifact.type_ != crate::crd::ArtifactType::Oci {
            report::clear_artifact_fields_for_non_oci(&mut status, &now);
        }
        report::apply_observation(&mut status, observation, &report.timestamp, &now);
        if status == before {
            return Ok(());
        }

        let patch = serde_json::json!({ "status": status });
        match api
            .patch_status(&observation.name, &PatchParams::apply(FIELD_OWNER), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => return Ok(()),
            Err(kube::Error::Api(e)) if e.code == 409 && attempt < 2 => continue,
            Err(e) => {
                warn!(error = %e, "report_status_patch_failed");
                return Err(StatusCode::INTERNAL_SERVER_ERROR);
            }
        }
    }
    Err(StatusCode::CONFLICT)
}

async fn staleness_loop(
    client: Client,
    liveness: Arc<LivenessMap>,
    default_heartbeat_seconds: u64,
    stale_multiplier: u64,
    shutdown: &mut broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(default_heartbeat_seconds.max(1)));
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.recv() => return,
        }
        let now = chrono::Utc::now();
        for (device, entry) in liveness.snapshot() {
            if liveness::is_stale(&entry, now, default_heartbeat_seconds, stale_multiplier) {
                mark_device_disconnected(&client, &device).await;
            }
        }
    }
}

async fn mark_device_disconnected(client: &Client, device: &str) {
    let api: Api<DeviceProcess> = Api::all(client.clone());
    let list = match api.list(&kube::api::ListParams::default()).await {
        Ok(l) => l,
        Err(e) => {
            warn!(error = %e, "staleness_list_failed");
            return;
        }
    };
    let now = condition::now_rfc3339();
    for process in list.items.iter().filter(|p| p.spec.device_ref.name == device) {
        let namespace = process.namespace().unwrap_or_default();
        let name = process.name_any();
        let ns_api: Api<DeviceProcess> = Api::namespaced(client.clone(), &namespace);
        let mut status = process.status.clone().unwrap_or_default();
        let changed = condition::mark_false(
            &mut status.conditions,
            condition::types::AGENT_CONNECTED,
            crate::error::reason::AGENT_DISCONNECTED,
            "",
            &now,
        );
        if !changed {
            continue;
        }
        let patch = serde_json::json!({ "status": status });
        match ns_api
            .patch_status(&name, &PatchParams::apply(FIELD_OWNER), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => {
                STALE_DEVICES_TOTAL.inc();
                warn!(device = %device, namespace, name, "device_marked_disconnected");
            }
            Err(e) => warn!(error = %e, "staleness_patch_failed"),
        }
    }
}
