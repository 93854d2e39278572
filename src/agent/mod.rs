//! Device agent (spec.md §4.3): a single-threaded cooperative loop that
//! polls desired state from the gateway, drives local `systemd` units to
//! match it, and reports what it observed. No server of its own — it logs
//! reconcile-cycle summaries rather than exposing metrics.

pub mod backoff;
pub mod oci;
pub mod service_manager;
pub mod state;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::crd::{ArtifactType, HealthCheck, RestartPolicy};
use crate::gateway::auth::hmac_sha256_hex;
use crate::gateway::desired::{DesiredItem, DesiredResponse};
use crate::gateway::report::{Observation, ReportAck, ReportRequest};
use crate::render;

use oci::OciConfig;
use service_manager::{ServiceManager, SystemdServiceManager, UnitStatus};
use state::{ManagedEntry, ManagedMap};

const DESIRED_POLL_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_HEARTBEAT_SECONDS: u64 = 15;
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

fn drift_min_gap() -> chrono::Duration {
    chrono::Duration::seconds(5)
}

pub struct AgentConfig {
    pub device_name: String,
    pub gateway_url: String,
    pub device_token: Option<String>,
    pub device_token_secret: Option<String>,
    pub state_path: PathBuf,
    pub unit_dir: PathBuf,
    pub env_dir: PathBuf,
    pub oci: OciConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            device_name: String::new(),
            gateway_url: String::new(),
            device_token: None,
            device_token_secret: None,
            state_path: PathBuf::from("/var/lib/apollo/agent/state.json"),
            unit_dir: PathBuf::from("/etc/systemd/system"),
            env_dir: PathBuf::from("/etc/apollo/env"),
            oci: OciConfig::default(),
        }
    }
}

/// Entry point for `apollo agent run`.
pub async fn run(config: AgentConfig) -> Result<()> {
    let client = reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .context("building HTTP client")?;
    let service_manager: Arc<dyn ServiceManager> = Arc::new(SystemdServiceManager);
    run_loop(config, client, service_manager).await
}

/// The part of `run` that accepts a swappable `ServiceManager`, so the loop's
/// shape (timers, backoff, reporting) is exercised without a real systemd.
async fn run_loop(
    config: AgentConfig,
    client: reqwest::Client,
    service_manager: Arc<dyn ServiceManager>,
) -> Result<()> {
    let mut managed = state::load(&config.state_path).await.context("loading agent state")?;
    let auth = auth_header(&config);

    let mut etag: Option<String> = None;
    let mut heartbeat_seconds = DEFAULT_HEARTBEAT_SECONDS;
    let mut consecutive_failures: u32 = 0;
    let mut latest_observations: BTreeMap<String, Observation> = BTreeMap::new();

    // Immediate first poll (spec.md §4.3 "on start, fetch desired state
    // without waiting for the first timer tick").
    let mut next_desired_at = Instant::now();
    let mut next_heartbeat_at = Instant::now() + Duration::from_secs(heartbeat_seconds);

    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(next_desired_at) => {
                match fetch_desired(&client, &config.gateway_url, &config.device_name, &auth, etag.as_deref()).await {
                    Ok(FetchOutcome::Updated(response, new_etag)) => {
                        consecutive_failures = 0;
                        etag = new_etag;
                        heartbeat_seconds = response.heartbeat_interval_seconds.max(1);

                        let desired_keys: BTreeSet<String> =
                            response.items.iter().map(|i| state::key(&i.namespace, &i.name)).collect();
                        let now = chrono::Utc::now();
                        for item in &response.items {
                            let obs = reconcile_item(&config, service_manager.as_ref(), &mut managed, item, now).await;
                            latest_observations.insert(state::key(&item.namespace, &item.name), obs);
                        }
                        prune_stale(service_manager.as_ref(), &mut managed, &config.unit_dir, &config.env_dir, &desired_keys).await;
                        latest_observations.retain(|k, _| desired_keys.contains(k));

                        if let Err(e) = state::save(&config.state_path, &managed).await {
                            warn!(error = %e, "agent_state_save_failed");
                        }
                        info!(items = response.items.len(), "reconcile_cycle_complete");
                        next_desired_at = Instant::now() + DESIRED_POLL_INTERVAL;
                    }
                    Ok(FetchOutcome::NotModified) => {
                        consecutive_failures = 0;
                        next_desired_at = Instant::now() + DESIRED_POLL_INTERVAL;
                    }
                    Err(e) => {
                        consecutive_failures = consecutive_failures.saturating_add(1);
                        let delay = backoff::transport_backoff(consecutive_failures);
                        warn!(error = %e, attempt = consecutive_failures, delay_ms = delay.as_millis() as u64, "desired_fetch_failed");
                        next_desired_at = Instant::now() + delay;
                    }
                }
            }
            _ = tokio::time::sleep_until(next_heartbeat_at) => {
                let observations: Vec<Observation> = latest_observations.values().cloned().collect();
                if let Err(e) = send_report(&client, &config.gateway_url, &config.device_name, &auth, observations, true).await {
                    warn!(error = %e, "report_post_failed");
                }
                next_heartbeat_at = Instant::now() + Duration::from_secs(heartbeat_seconds);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("agent_shutdown_signal_received");
                break;
            }
        }
    }

    Ok(())
}

fn auth_header(config: &AgentConfig) -> String {
    if let Some(secret) = &config.device_token_secret {
        hmac_sha256_hex(secret.as_bytes(), config.device_name.as_bytes())
    } else {
        config.device_token.clone().unwrap_or_default()
    }
}

enum FetchOutcome {
    Updated(DesiredResponse, Option<String>),
    NotModified,
}

async fn fetch_desired(
    client: &reqwest::Client,
    gateway_url: &str,
    device_name: &str,
    auth: &str,
    etag: Option<&str>,
) -> Result<FetchOutcome> {
    let url = format!("{gateway_url}/v1/devices/{device_name}/desired");
    let mut request = client.get(&url).header("X-Device-Token", auth);
    if let Some(etag) = etag {
        request = request.header(reqwest::header::IF_NONE_MATCH, etag);
    }
    let response = request.send().await.context("sending desired request")?;

    if response.status() == reqwest::StatusCode::NOT_MODIFIED {
        return Ok(FetchOutcome::NotModified);
    }
    if response.status() != reqwest::StatusCode::OK {
        anyhow::bail!("desired fetch failed with status {}", response.status());
    }
    let new_etag = response
        .headers()
        .get(reqwest::header::ETAG)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    let body: DesiredResponse = response.json().await.context("parsing desired response body")?;
    Ok(FetchOutcome::Updated(body, new_etag))
}

async fn send_report(
    client: &reqwest::Client,
    gateway_url: &str,
    device_name: &str,
    auth: &str,
    observations: Vec<Observation>,
    heartbeat: bool,
) -> Result<()> {
    let url = format!("{gateway_url}/v1/devices/{device_name}/report");
    let body = ReportRequest {
        agent_version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        heartbeat,
        observations,
    };
    let response = client
        .post(&url)
        .header("X-Device-Token", auth)
        .json(&body)
        .send()
        .await
        .context("sending report")?;
    if !response.status().is_success() {
        anyhow::bail!("report POST failed with status {}", response.status());
    }
    let _ack: ReportAck = response.json().await.context("parsing report ack")?;
    Ok(())
}

fn blank_observation(namespace: &str, name: &str) -> Observation {
    Observation {
        namespace: namespace.to_string(),
        name: name.to_string(),
        observed_spec_hash: None,
        process_started: None,
        healthy: None,
        pid: None,
        start_time: None,
        error_message: None,
        warning_message: None,
        artifact_downloaded: None,
        artifact_verified: None,
        artifact_digest: None,
        artifact_download_attempts: None,
        last_artifact_attempt_time: None,
        artifact_last_error: None,
        artifact_download_reason: None,
        artifact_download_message: None,
        artifact_verify_reason: None,
        artifact_verify_message: None,
    }
}

/// Write `content` to `path` only if it differs from what's already there,
/// via tempfile-in-same-dir + rename. Returns whether a write happened.
async fn write_if_changed(path: &Path, content: &[u8], mode: u32) -> Result<bool> {
    if let Ok(existing) = tokio::fs::read(path).await {
        if existing == content {
            return Ok(false);
        }
    }
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
    tokio::fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let tmp_name = format!(
        "{}.tmp.{}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("file"),
        std::process::id()
    );
    let tmp_path = path.with_file_name(tmp_name);
    tokio::fs::write(&tmp_path, content)
        .await
        .with_context(|| format!("writing {}", tmp_path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = tokio::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(mode)).await;
    }
    tokio::fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("renaming {} into place at {}", tmp_path.display(), path.display()))?;
    Ok(true)
}

/// One pass of the 8-step per-item reconciliation procedure (spec.md §4.3):
/// render unit+env, ensure the artifact if OCI-backed, write only on change,
/// reload/enable-start/restart the unit as needed, query status, apply
/// drift correction, and build the observation to report.
async fn reconcile_item(
    config: &AgentConfig,
    service_manager: &dyn ServiceManager,
    managed: &mut ManagedMap,
    item: &DesiredItem,
    now: chrono::DateTime<chrono::Utc>,
) -> Observation {
    let map_key = state::key(&item.namespace, &item.name);
    let mut obs = blank_observation(&item.namespace, &item.name);
    obs.observed_spec_hash = Some(item.spec_hash.clone());

    let unit_name = render::unit_file_name(&item.namespace, &item.name);
    let env_name = render::env_file_name(&item.namespace, &item.name);
    let unit_path = config.unit_dir.join(&unit_name);
    let env_path = config.env_dir.join(&env_name);

    let env_content = match render::render_env_file(&item.spec) {
        Ok(c) => c,
        Err(e) => {
            obs.process_started = Some(false);
            obs.error_message = Some(format!("rendering environment file: {e}"));
            return obs;
        }
    };
    let unit_content = match render::render_unit_file(&item.namespace, &item.name, &item.spec, &env_path.to_string_lossy()) {
        Ok(c) => c,
        Err(e) => {
            obs.process_started = Some(false);
            obs.error_message = Some(format!("rendering unit file: {e}"));
            return obs;
        }
    };

    if item.spec.artifact.type_ == ArtifactType::Oci {
        match oci::ensure(&config.oci, &item.spec.artifact.url).await {
            Ok(result) => {
                obs.artifact_downloaded = Some(true);
                obs.artifact_verified = Some(true);
                obs.artifact_digest = Some(result.digest);
                obs.artifact_download_attempts = Some(result.attempts);
                obs.last_artifact_attempt_time = result.last_attempt_time.map(|t| t.to_rfc3339());
            }
            Err(e) => {
                obs.artifact_downloaded = Some(false);
                obs.artifact_verified = Some(false);
                obs.artifact_last_error = Some(e.message.clone());
                obs.artifact_download_reason = Some(e.reason.to_string());
                obs.artifact_download_message = Some(e.message.clone());
                obs.process_started = Some(false);
                obs.error_message = Some(format!("artifact unavailable: {e}"));
                // Don't strand a unit built against an artifact that no
                // longer resolves: give up managing it until it does.
                if let Some(entry) = managed.remove(&map_key) {
                    let _ = service_manager.stop_and_disable(&entry.unit_name).await;
                    let _ = tokio::fs::remove_file(config.unit_dir.join(&entry.unit_name)).await;
                    let _ = tokio::fs::remove_file(config.env_dir.join(&entry.env_name)).await;
                    let _ = service_manager.reload().await;
                }
                return obs;
            }
        }
    }

    let is_new = !managed.contains_key(&map_key);

    let env_changed = match write_if_changed(&env_path, env_content.as_bytes(), 0o600).await {
        Ok(c) => c,
        Err(e) => {
            obs.process_started = Some(false);
            obs.error_message = Some(format!("writing environment file: {e}"));
            return obs;
        }
    };
    let unit_changed = match write_if_changed(&unit_path, unit_content.as_bytes(), 0o644).await {
        Ok(c) => c,
        Err(e) => {
            obs.process_started = Some(false);
            obs.error_message = Some(format!("writing unit file: {e}"));
            return obs;
        }
    };

    if unit_changed {
        if let Err(e) = service_manager.reload().await {
            warn!(error = %e, unit = %unit_name, "service_manager_reload_failed");
        }
    }

    let mut action_taken: Option<&'static str> = None;
    if is_new {
        match service_manager.enable_and_start(&unit_name).await {
            Ok(()) => action_taken = Some("enable-and-start"),
            Err(e) => {
                obs.process_started = Some(false);
                obs.error_message = Some(format!("starting {unit_name}: {e}"));
            }
        }
    } else if unit_changed || env_changed {
        match service_manager.restart(&unit_name).await {
            Ok(()) => action_taken = Some("restart"),
            Err(e) => {
                obs.process_started = Some(false);
                obs.error_message = Some(format!("restarting {unit_name}: {e}"));
            }
        }
    }

    let mut status = match service_manager.status(&unit_name).await {
        Ok(s) => s,
        Err(e) => {
            obs.process_started = Some(false);
            obs.error_message = Some(format!("querying status of {unit_name}: {e}"));
            UnitStatus::default()
        }
    };

    // Drift correction (spec.md §4.3 step 7): every declaration implies
    // desire-to-run regardless of `restartPolicy` — DaemonSet semantics —
    // gated so a persistently-failing unit isn't restarted every cycle.
    if !status.is_started() {
        let existing_entry = managed.get(&map_key);
        if state::should_attempt_action(existing_entry, &item.spec_hash, now, drift_min_gap()) {
            let corrective = if status.active_state == "active" && status.main_pid == 0 {
                service_manager.restart(&unit_name).await
            } else {
                service_manager.enable_and_start(&unit_name).await
            };
            match corrective {
                Ok(()) => {
                    action_taken = Some("drift-correction");
                    match service_manager.status(&unit_name).await {
                        Ok(s) => status = s,
                        Err(e) => warn!(error = %e, unit = %unit_name, "post_drift_status_query_failed"),
                    }
                }
                Err(e) => warn!(error = %e, unit = %unit_name, "drift_correction_failed"),
            }
        }
    }

    if matches!(item.spec.restart_policy, RestartPolicy::Never) {
        obs.warning_message =
            Some("restartPolicy Never does not exempt this declaration from DaemonSet-style reconciliation".to_string());
    }

    obs.process_started = Some(status.is_started());
    obs.pid = Some(status.main_pid);
    obs.start_time = status.exec_main_start_timestamp.clone();

    obs.healthy = match &item.spec.health_check {
        Some(check) => match run_health_check(check).await {
            Ok(healthy) => Some(healthy),
            Err(e) => {
                warn!(error = %e, unit = %unit_name, "health_check_exec_failed");
                Some(false)
            }
        },
        None => Some(status.is_started()),
    };

    let entry = managed.get(&map_key).cloned().unwrap_or_default();
    managed.insert(
        map_key,
        ManagedEntry {
            unit_name,
            env_name,
            last_action_at: if action_taken.is_some() { Some(now.to_rfc3339()) } else { entry.last_action_at },
            last_action_spec_hash: if action_taken.is_some() {
                Some(item.spec_hash.clone())
            } else {
                entry.last_action_spec_hash
            },
            last_action_description: action_taken.map(|a| a.to_string()).or(entry.last_action_description),
        },
    );

    obs
}

/// Run a health check's exec command with its configured timeout, the same
/// `tokio::process::Command` + `tokio::time::timeout` pattern the service
/// manager driver uses for `systemctl`.
async fn run_health_check(check: &HealthCheck) -> Result<bool> {
    let Some((argv0, rest)) = check.exec.command.split_first() else {
        return Ok(false);
    };
    let mut cmd = tokio::process::Command::new(argv0);
    cmd.args(rest);
    let timeout = Duration::from_secs(check.timeout_seconds.max(1) as u64);
    match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(output)) => Ok(output.status.success()),
        Ok(Err(e)) => Err(anyhow::anyhow!("spawning health check command: {e}")),
        Err(_) => Ok(false),
    }
}

/// Stop, disable, and forget every managed declaration no longer present in
/// the latest desired response (spec.md §4.3 "Pruning").
async fn prune_stale(
    service_manager: &dyn ServiceManager,
    managed: &mut ManagedMap,
    unit_dir: &Path,
    env_dir: &Path,
    desired_keys: &BTreeSet<String>,
) {
    let stale_keys: Vec<String> = managed.keys().filter(|k| !desired_keys.contains(*k)).cloned().collect();
    for key in stale_keys {
        let Some(entry) = managed.remove(&key) else { continue };
        if let Err(e) = service_manager.stop_and_disable(&entry.unit_name).await {
            warn!(error = %e, unit = %entry.unit_name, "prune_stop_and_disable_failed");
        }
        let _ = tokio::fs::remove_file(unit_dir.join(&entry.unit_name)).await;
        let _ = tokio::fs::remove_file(env_dir.join(&entry.env_name)).await;
        if let Err(e) = service_manager.reload().await {
            warn!(error = %e, "prune_reload_failed");
        }
        info!(key = %key, unit = %entry.unit_name, "pruned_managed_declaration");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ArtifactSpec, DeviceProcessSpec, DeviceRef, ExecutionSpec, HealthCheckExec};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::tempdir;

    #[derive(Default)]
    struct FakeServiceManager {
        reload_calls: Mutex<u32>,
        started: Mutex<BTreeSet<String>>,
        status_override: Mutex<Option<UnitStatus>>,
    }

    #[async_trait]
    impl ServiceManager for FakeServiceManager {
        async fn reload(&self) -> Result<()> {
            *self.reload_calls.lock().unwrap() += 1;
            Ok(())
        }
        async fn enable_and_start(&self, unit: &str) -> Result<()> {
            self.started.lock().unwrap().insert(unit.to_string());
            Ok(())
        }
        async fn restart(&self, unit: &str) -> Result<()> {
            self.started.lock().unwrap().insert(unit.to_string());
            Ok(())
        }
        async fn stop_and_disable(&self, unit: &str) -> Result<()> {
            self.started.lock().unwrap().remove(unit);
            Ok(())
        }
        async fn status(&self, unit: &str) -> Result<UnitStatus> {
            if let Some(status) = self.status_override.lock().unwrap().clone() {
                return Ok(status);
            }
            if self.started.lock().unwrap().contains(unit) {
                Ok(UnitStatus {
                    main_pid: 100,
                    active_state: "active".into(),
                    sub_state: "running".into(),
                    exec_main_start_timestamp: Some("t0".into()),
                })
            } else {
                Ok(UnitStatus::default())
            }
        }
    }

    fn sample_item(namespace: &str, name: &str, spec_hash: &str, command: &str) -> DesiredItem {
        DesiredItem {
            uid: format!("{name}-uid"),
            namespace: namespace.to_string(),
            name: name.to_string(),
            generation: 1,
            spec: DeviceProcessSpec {
                device_ref: DeviceRef { kind: "Device".into(), name: "tor1-01".into() },
                artifact: ArtifactSpec { type_: ArtifactType::File, url: "file:///bin/true".into(), sha256: None },
                execution: ExecutionSpec { command: vec![command.to_string()], ..Default::default() },
                restart_policy: RestartPolicy::Always,
                health_check: None,
            },
            spec_hash: spec_hash.to_string(),
        }
    }

    fn sample_config(dir: &std::path::Path) -> AgentConfig {
        AgentConfig {
            unit_dir: dir.join("units"),
            env_dir: dir.join("env"),
            oci: OciConfig { cache_root: dir.join("oci"), ..OciConfig::default() },
            ..AgentConfig::default()
        }
    }

    #[tokio::test]
    async fn write_if_changed_skips_identical_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x.env");
        assert!(write_if_changed(&path, b"hello", 0o600).await.unwrap());
        assert!(!write_if_changed(&path, b"hello", 0o600).await.unwrap());
        assert!(write_if_changed(&path, b"world", 0o600).await.unwrap());
    }

    #[tokio::test]
    async fn reconcile_item_enables_and_starts_new_unit() {
        let dir = tempdir().unwrap();
        let config = sample_config(dir.path());
        let sm = FakeServiceManager::default();
        let mut managed = ManagedMap::new();
        let item = sample_item("ns", "proc", "sha256:aa", "/usr/bin/app");

        let obs = reconcile_item(&config, &sm, &mut managed, &item, chrono::Utc::now()).await;

        assert_eq!(obs.process_started, Some(true));
        assert!(managed.contains_key(&state::key("ns", "proc")));
        assert!(config.unit_dir.join(render::unit_file_name("ns", "proc")).is_file());
        assert!(config.env_dir.join(render::env_file_name("ns", "proc")).is_file());
    }

    #[tokio::test]
    async fn reconcile_item_restarts_when_unit_content_changes() {
        let dir = tempdir().unwrap();
        let config = sample_config(dir.path());
        let sm = FakeServiceManager::default();
        let mut managed = ManagedMap::new();

        let first = sample_item("ns", "proc", "sha256:aa", "/usr/bin/app");
        reconcile_item(&config, &sm, &mut managed, &first, chrono::Utc::now()).await;
        let unit_name = render::unit_file_name("ns", "proc");
        assert!(sm.started.lock().unwrap().contains(&unit_name));

        sm.started.lock().unwrap().clear();
        let second = sample_item("ns", "proc", "sha256:bb", "/usr/bin/app-v2");
        let obs = reconcile_item(&config, &sm, &mut managed, &second, chrono::Utc::now()).await;

        assert!(sm.started.lock().unwrap().contains(&unit_name));
        assert_eq!(obs.process_started, Some(true));
    }

    #[tokio::test]
    async fn reconcile_item_applies_drift_correction_on_first_attempt() {
        let dir = tempdir().unwrap();
        let config = sample_config(dir.path());
        let sm = FakeServiceManager::default();
        *sm.status_override.lock().unwrap() = Some(UnitStatus::default());
        let mut managed = ManagedMap::new();
        let item = sample_item("ns", "proc", "sha256:aa", "/usr/bin/app");

        reconcile_item(&config, &sm, &mut managed, &item, chrono::Utc::now()).await;

        let unit_name = render::unit_file_name("ns", "proc");
        assert!(sm.started.lock().unwrap().contains(&unit_name));
        let entry = managed.get(&state::key("ns", "proc")).unwrap();
        assert_eq!(entry.last_action_description.as_deref(), Some("drift-correction"));
    }

    #[tokio::test]
    async fn reconcile_item_marks_artifact_failure_and_forgets_prior_unit() {
        let dir = tempdir().unwrap();
        let config = sample_config(dir.path());
        let sm = FakeServiceManager::default();
        let mut managed = ManagedMap::new();
        let mut item = sample_item("ns", "proc", "sha256:aa", "/usr/bin/app");
        item.spec.artifact = ArtifactSpec { type_: ArtifactType::Oci, url: "ghcr.io/example/app:latest".into(), sha256: None };

        let obs = reconcile_item(&config, &sm, &mut managed, &item, chrono::Utc::now()).await;

        assert_eq!(obs.artifact_downloaded, Some(false));
        assert_eq!(obs.artifact_download_reason.as_deref(), Some(crate::error::reason::UNPINNED_REFERENCE));
        assert!(managed.is_empty());
    }

    #[tokio::test]
    async fn prune_removes_entries_absent_from_latest_desired_set() {
        let dir = tempdir().unwrap();
        let unit_dir = dir.path().join("units");
        let env_dir = dir.path().join("env");
        tokio::fs::create_dir_all(&unit_dir).await.unwrap();
        tokio::fs::create_dir_all(&env_dir).await.unwrap();
        let unit_name = render::unit_file_name("ns", "gone");
        let env_name = render::env_file_name("ns", "gone");
        tokio::fs::write(unit_dir.join(&unit_name), b"x").await.unwrap();
        tokio::fs::write(env_dir.join(&env_name), b"x").await.unwrap();

        let sm = FakeServiceManager::default();
        sm.started.lock().unwrap().insert(unit_name.clone());
        let mut managed = ManagedMap::new();
        managed.insert(
            state::key("ns", "gone"),
            ManagedEntry { unit_name: unit_name.clone(), env_name: env_name.clone(), ..Default::default() },
        );

        prune_stale(&sm, &mut managed, &unit_dir, &env_dir, &BTreeSet::new()).await;

        assert!(managed.is_empty());
        assert!(!sm.started.lock().unwrap().contains(&unit_name));
        assert!(!unit_dir.join(&unit_name).is_file());
        assert!(*sm.reload_calls.lock().unwrap() >= 1);
    }

    #[tokio::test]
    async fn run_health_check_reflects_exit_status() {
        let passing = HealthCheck {
            exec: HealthCheckExec { command: vec!["true".into()] },
            period_seconds: 5,
            timeout_seconds: 2,
            success_threshold: 1,
            failure_threshold: 1,
        };
        assert!(run_health_check(&passing).await.unwrap());

        let mut failing = passing.clone();
        failing.exec.command = vec!["false".into()];
        assert!(!run_health_check(&failing).await.unwrap());
    }

    #[test]
    fn auth_header_prefers_hmac_when_secret_configured() {
        let config = AgentConfig {
            device_name: "tor1-01".into(),
            device_token: Some("static".into()),
            device_token_secret: Some("s3cr3t".into()),
            ..AgentConfig::default()
        };
        let expected = hmac_sha256_hex(b"s3cr3t", b"tor1-01");
        assert_eq!(auth_header(&config), expected);
    }

    #[test]
    fn auth_header_falls_back_to_static_token() {
        let config = AgentConfig { device_token: Some("static".into()), ..AgentConfig::default() };
        assert_eq!(auth_header(&config), "static");
    }
}
