//! Deployment fan-out controller (spec.md §4.1). Keeps the set of child
//! `DeviceProcess` declarations equal to `{deployment.template applied to
//! each device matching deployment.spec.selector}`.

pub mod fanout;
pub mod index;

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::runtime::WatchStreamExt;
use kube::{Client, Resource, ResourceExt};
use prometheus::{Encoder, Histogram, IntCounter, Registry, TextEncoder};
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

use crate::crd::{Device, DeviceProcess, DeviceProcessDeployment};
use index::FieldIndex;

const FIELD_OWNER: &str = "apollo-controller";

static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static RECONCILE_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new(
        "apollo_controller_reconcile_total",
        "Total DeviceProcessDeployment reconciliation cycles",
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

static RECONCILE_ERRORS: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new(
        "apollo_controller_reconcile_errors_total",
        "Total DeviceProcessDeployment reconciliation errors",
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

static RECONCILE_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    let h = Histogram::with_opts(prometheus::HistogramOpts::new(
        "apollo_controller_reconcile_duration_seconds",
        "Duration of each fan-out reconciliation cycle",
    ))
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(h.clone())).expect("metric not yet registered");
    h
});

struct ReconcileContext {
    client: Client,
    index: Arc<FieldIndex>,
}

pub struct ControllerConfig {
    pub metrics_addr: SocketAddr,
}

/// Entry point for `apollo controller run`.
pub async fn run(config: ControllerConfig) -> Result<()> {
    let client = Client::try_default().await.context("failed to load kubeconfig")?;
    client.apiserver_version().await.context("cannot reach cluster")?;

    LazyLock::force(&RECONCILE_TOTAL);
    LazyLock::force(&RECONCILE_ERRORS);
    LazyLock::force(&RECONCILE_DURATION);

    let deployments: Api<DeviceProcessDeployment> = Api::all(client.clone());
    let devices: Api<Device> = Api::all(client.clone());
    let processes: Api<DeviceProcess> = Api::all(client.clone());

    let index = Arc::new(FieldIndex::new());
    {
        let initial = deployments.list(&ListParams::default()).await?;
        index.rebuild(&initial.items);
    }

    let ready = Arc::new(Mutex::new(false));
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let http_ready = ready.clone();
    let http_shutdown = shutdown_tx.subscribe();
    let http_handle =
        tokio::spawn(async move { serve_health(http_ready, http_shutdown, config.metrics_addr).await });

    let ctx = Arc::new(ReconcileContext { client: client.clone(), index: index.clone() });

    let mapper_index = index.clone();

    let controller_ready = ready.clone();
    let controller = Controller::new(deployments.clone(), Default::default())
        .owns(processes, Default::default())
        .watches(devices, watcher::Config::default(), move |device| {
            // Reverse index lookup: re-enqueue every deployment whose
            // selector is sensitive to one of this device's label keys (or
            // that has a universal selector, via the sentinel key) so
            // additions/removals from the matched set are picked up without
            // waiting for the deployment's own spec to change (spec.md
            // §4.1 edge case).
            let namespace = device.namespace().unwrap_or_default();
            let labels: BTreeMap<String, String> =
                device.metadata.labels.clone().unwrap_or_default().into_iter().collect();
            let keys = crate::selector::probe_keys_for_device(&labels);
            mapper_index
                .lookup(&namespace, &keys)
                .into_iter()
                .map(|key| {
                    let (namespace, name) = split_key(&key);
                    kube::runtime::reflector::ObjectRef::new(&name).within(namespace)
                })
                .collect::<Vec<_>>()
        })
        .run(reconcile, error_policy, ctx)
        .for_each(move |result| {
            let ready = controller_ready.clone();
            async move {
                {
                    let mut r = ready.lock().await;
                    *r = true;
                }
                match result {
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "reconcile_dispatch_error"),
                }
            }
        });

    tokio::select! {
        _ = controller => { info!("controller_stream_ended"); }
        _ = tokio::signal::ctrl_c() => { info!("shutdown_signal_received"); }
    }

    let _ = shutdown_tx.send(());
    let _ = http_handle.await?;
    Ok(())
}

fn split_key(key: &str) -> (&str, String) {
    match key.split_once('/') {
        Some((ns, name)) => (ns, name.to_string()),
        None => ("", key.to_string()),
    }
}

fn error_policy(
    _obj: Arc<DeviceProcessDeployment>,
    error: &kube::Error,
    _ctx: Arc<ReconcileContext>,
) -> Action {
    RECONCILE_ERRORS.inc();
    warn!(%error, "reconcile_failed");
    Action::requeue(Duration::from_secs(30))
}

async fn reconcile(
    deployment: Arc<DeviceProcessDeployment>,
    ctx: Arc<ReconcileContext>,
) -> std::result::Result<Action, kube::Error> {
    let _timer = RECONCILE_DURATION.start_timer();
    RECONCILE_TOTAL.inc();

    let namespace = deployment.namespace().unwrap_or_default();
    let name = deployment.name_any();
    let uid = deployment.uid().unwrap_or_default();

    ctx.index.update(&deployment);

    let devices_api: Api<Device> = Api::namespaced(ctx.client.clone(), &namespace);
    let device_list = devices_api.list(&ListParams::default()).await?;

    let matching: Vec<&Device> = device_list
        .items
        .iter()
        .filter(|d| {
            let labels: BTreeMap<String, String> =
                d.metadata.labels.clone().unwrap_or_default().into_iter().collect();
            crate::selector::matches(&deployment.spec.selector, &labels)
        })
        .collect();

    let processes_api: Api<DeviceProcess> = Api::namespaced(ctx.client.clone(), &namespace);
    let owned = processes_api
        .list(&ListParams::default().labels(&format!(
            "{}={}",
            crate::crd::DEPLOYMENT_NAME_LABEL,
            name
        )))
        .await?;

    let mut created = 0u32;
    let mut updated = 0u32;
    for device in &matching {
        let device_name = device.name_any();
        let device_labels: BTreeMap<String, String> =
            device.metadata.labels.clone().unwrap_or_default().into_iter().collect();
        let child_name = crate::naming::device_process_name(&name, &device_name);
        let labels = fanout::project_child_labels(&deployment, &device_labels);
        let spec = fanout::child_spec(&deployment, &device_name);

        let owner_ref = owner_reference(&deployment, &uid);
        match owned.items.iter().find(|p| p.name_any() == child_name) {
            None => {
                create_child(&processes_api, &namespace, &child_name, labels, spec, owner_ref).await?;
                created += 1;
            }
            Some(existing) => {
                if update_child_if_needed(&processes_api, existing, labels, spec).await? {
                    updated += 1;
                }
            }
        }
    }

    let matching_names: std::collections::BTreeSet<String> =
        matching.iter().map(|d| d.name_any()).collect();
    let mut deleted = 0u32;
    for existing in &owned.items {
        if !fanout::owned_by(existing, &uid) {
            continue;
        }
        let device_name = existing
            .spec
            .device_ref
            .name
            .clone();
        if !matching_names.contains(&device_name) {
            processes_api.delete(&existing.name_any(), &Default::default()).await?;
            deleted += 1;
        }
    }

    if created > 0 || deleted > 0 || updated > 0 {
        info!(namespace, name, created, updated, deleted, "fanout_reconciled");
    }

    Ok(Action::requeue(Duration::from_secs(30)))
}

fn owner_reference(deployment: &DeviceProcessDeployment, uid: &str) -> OwnerReference {
    OwnerReference {
        api_version: DeviceProcessDeployment::api_version(&()).to_string(),
        kind: DeviceProcessDeployment::kind(&()).to_string(),
        name: deployment.name_any(),
        uid: uid.to_string(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

async fn create_child(
    api: &Api<DeviceProcess>,
    namespace: &str,
    name: &str,
    labels: BTreeMap<String, String>,
    spec: crate::crd::DeviceProcessSpec,
    owner_ref: OwnerReference,
) -> std::result::Result<(), kube::Error> {
    let mut process = DeviceProcess::new(name, spec);
    process.metadata.namespace = Some(namespace.to_string());
    process.metadata.labels = Some(labels.into_iter().collect());
    process.metadata.owner_references = Some(vec![owner_ref]);

    match api
        .patch(name, &PatchParams::apply(FIELD_OWNER), &Patch::Apply(&process))
        .await
    {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 405 || e.code == 415 => {
            // Backend lacks server-side-apply support; fall back to a plain create.
            match api.create(&Default::default(), &process).await {
                Ok(_) => Ok(()),
                Err(kube::Error::Api(e)) if e.code == 409 => Ok(()),
                Err(e) => Err(e),
            }
        }
        Err(e) => Err(e),
    }
}

/// Update an existing child, merging controller-managed labels into whatever
/// is already there rather than overwriting the whole label map (spec.md
/// §4.1 write path: "never drop labels whose keys are not owned by this
/// controller"). Retries once on an optimistic-concurrency conflict.
async fn update_child_if_needed(
    api: &Api<DeviceProcess>,
    existing: &DeviceProcess,
    new_labels: BTreeMap<String, String>,
    new_spec: crate::crd::DeviceProcessSpec,
) -> std::result::Result<bool, kube::Error> {
    let spec_unchanged = existing.spec.device_ref == new_spec.device_ref
        && existing.spec.artifact == new_spec.artifact
        && existing.spec.execution == new_spec.execution
        && existing.spec.restart_policy == new_spec.restart_policy
        && existing.spec.health_check == new_spec.health_check;

    let mut merged_labels: BTreeMap<String, String> =
        existing.metadata.labels.clone().unwrap_or_default().into_iter().collect();
    let mut labels_changed = false;
    for (k, v) in &new_labels {
        if merged_labels.get(k) != Some(v) {
            merged_labels.insert(k.clone(), v.clone());
            labels_changed = true;
        }
    }

    if spec_unchanged && !labels_changed {
        return Ok(false);
    }

    for attempt in 0..3 {
        let mut updated = existing.clone();
        updated.metadata.labels = Some(merged_labels.clone().into_iter().collect());
        updated.spec = new_spec.clone();
        match api.replace(&existing.name_any(), &Default::default(), &updated).await {
            Ok(_) => return Ok(true),
            Err(kube::Error::Api(e)) if e.code == 409 && attempt < 2 => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

async fn serve_health(
    ready: Arc<Mutex<bool>>,
    mut shutdown: broadcast::Receiver<()>,
    addr: SocketAddr,
) {
    async fn healthz() -> impl IntoResponse {
        StatusCode::OK
    }

    async fn readyz(
        axum::extract::State(ready): axum::extract::State<Arc<Mutex<bool>>>,
    ) -> impl IntoResponse {
        if *ready.lock().await {
            (StatusCode::OK, "ready")
        } else {
            (StatusCode::SERVICE_UNAVAILABLE, "not ready")
        }
    }

    async fn metrics() -> impl IntoResponse {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let families = REGISTRY.gather();
        encoder.encode(&families, &mut buf).ok();
        (StatusCode::OK, buf)
    }

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(ready);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            warn!(%e, "controller_health_bind_failed");
            return;
        }
    };
    let serve = axum::serve(listener, app);
    tokio::select! {
        res = serve => { if let Err(e) = res { warn!(%e, "controller_health_server_error"); } }
        _ = shutdown.recv() => {}
    }
}
