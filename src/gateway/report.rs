//! Report ingestion: the per-observation status projection spec.md §4.2
//! spells out as 8 ordered steps, plus the artifact-condition reflection
//! spec.md §4.3/§4.4 require to carry `Artifact*` fields end-to-end.

use serde::{Deserialize, Serialize};

use crate::condition::{self, types};
use crate::crd::{DeviceProcessStatus, Phase};
use crate::error::reason;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRequest {
    pub agent_version: String,
    pub timestamp: String,
    #[serde(default)]
    pub heartbeat: bool,
    pub observations: Vec<Observation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Observation {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub observed_spec_hash: Option<String>,
    #[serde(default)]
    pub process_started: Option<bool>,
    #[serde(default)]
    pub healthy: Option<bool>,
    #[serde(default)]
    pub pid: Option<i64>,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub warning_message: Option<String>,
    #[serde(default)]
    pub artifact_downloaded: Option<bool>,
    #[serde(default)]
    pub artifact_verified: Option<bool>,
    #[serde(default)]
    pub artifact_digest: Option<String>,
    #[serde(default)]
    pub artifact_download_attempts: Option<u32>,
    #[serde(default)]
    pub last_artifact_attempt_time: Option<String>,
    #[serde(default)]
    pub artifact_last_error: Option<String>,
    #[serde(default)]
    pub artifact_download_reason: Option<String>,
    #[serde(default)]
    pub artifact_download_message: Option<String>,
    #[serde(default)]
    pub artifact_verify_reason: Option<String>,
    #[serde(default)]
    pub artifact_verify_message: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReportAck {
    pub ack: bool,
}

/// Apply one observation onto `status` following spec.md §4.2 steps 1-8 (the
/// cross-device `deviceRef.name` check happens before this is called — see
/// the handler). Returns `true` if any condition's `(status, reason,
/// message)` tuple changed or a new spec hash was observed — the gateway's
/// signal to emit an event (spec.md §4.2 "Event emission").
pub fn apply_observation(
    status: &mut DeviceProcessStatus,
    observation: &Observation,
    report_timestamp: &str,
    now: &str,
) -> bool {
    let mut changed = false;

    // Step 2: resource-present implies desire-to-run.
    status.runtime_semantics = Some("DaemonSet".to_string());

    // Step 3.
    if !condition::is_true(&status.conditions, types::AGENT_CONNECTED) {
        changed |= condition::mark_true(&mut status.conditions, types::AGENT_CONNECTED, reason::AGENT_CONNECTED, "", now);
    }

    // Step 4.
    if let Some(observed_hash) = &observation.observed_spec_hash {
        if status.observed_spec_hash.as_deref() != Some(observed_hash.as_str()) {
            status.observed_spec_hash = Some(observed_hash.clone());
            let message = format!("observed {observed_hash} at {report_timestamp}");
            changed |= condition::mark_true(&mut status.conditions, types::SPEC_OBSERVED, reason::SPEC_OBSERVED, &message, now);
        }
    }

    // Step 5.
    if let Some(started) = observation.process_started {
        if started {
            changed |= condition::mark_true(&mut status.conditions, types::PROCESS_STARTED, reason::PROCESS_OBSERVED_RUNNING, "", now);
            if status.phase == Phase::Pending {
                status.phase = Phase::Running;
            }
        } else {
            let (r, m) = match &observation.error_message {
                Some(msg) if !msg.is_empty() => (reason::RECONCILE_ERROR, msg.as_str()),
                _ => (reason::PROCESS_NOT_STARTED, ""),
            };
            changed |= condition::mark_false(&mut status.conditions, types::PROCESS_STARTED, r, m, now);
        }
    }

    // Step 6.
    if let Some(warning) = &observation.warning_message {
        if !warning.is_empty() {
            changed |= condition::mark_true(&mut status.conditions, types::SPEC_WARNING, reason::SPEC_WARNING, warning, now);
        }
    }

    // Step 7.
    if let Some(healthy) = observation.healthy {
        if healthy {
            changed |= condition::mark_true(&mut status.conditions, types::HEALTHY, reason::HEALTHY, "", now);
            if status.phase == Phase::Pending {
                status.phase = Phase::Running;
            }
        } else {
            changed |= condition::mark_false(&mut status.conditions, types::HEALTHY, reason::UNHEALTHY, "", now);
        }
    }

    // Step 8.
    if let Some(pid) = observation.pid {
        status.pid = if pid == 0 { None } else { Some(pid) };
    }
    if let Some(start_time) = &observation.start_time {
        status.start_time = if start_time.is_empty() { None } else { Some(start_time.clone()) };
    }

    // Artifact conditions (spec.md §4.3 "Observation carrying", §4.4 types).
    if let Some(downloaded) = observation.artifact_downloaded {
        let (r, m) = artifact_reason_message(
            downloaded,
            &observation.artifact_download_reason,
            &observation.artifact_download_message,
        );
        changed |= condition::set_condition(
            &mut status.conditions,
            types::ARTIFACT_DOWNLOADED,
            bool_status(downloaded),
            r,
            m,
            now,
        );
    }
    if let Some(verified) = observation.artifact_verified {
        let (r, m) = artifact_reason_message(
            verified,
            &observation.artifact_verify_reason,
            &observation.artifact_verify_message,
        );
        changed |= condition::set_condition(
            &mut status.conditions,
            types::ARTIFACT_VERIFIED,
            bool_status(verified),
            r,
            m,
            now,
        );
    }
    if let Some(digest) = &observation.artifact_digest {
        status.artifact_version = Some(digest.clone());
    }

    changed
}

/// When the current desired item is non-OCI, `Artifact*` observation fields
/// must be explicitly reset so stale OCI state from an earlier type doesn't
/// leak across a type change (spec.md §4.3 "Observation carrying").
pub fn clear_artifact_fields_for_non_oci(status: &mut DeviceProcessStatus, now: &str) -> bool {
    let mut changed = false;
    changed |= condition::set_condition(
        &mut status.conditions,
        types::ARTIFACT_DOWNLOADED,
        crate::crd::ConditionStatus::Unknown,
        reason::NOT_APPLICABLE,
        "",
        now,
    );
    changed |= condition::set_condition(
        &mut status.conditions,
        types::ARTIFACT_VERIFIED,
        crate::crd::ConditionStatus::Unknown,
        reason::NOT_APPLICABLE,
        "",
        now,
    );
    if status.artifact_version.is_some() {
        status.artifact_version = None;
        changed = true;
    }
    changed
}

fn bool_status(b: bool) -> crate::crd::ConditionStatus {
    if b { crate::crd::ConditionStatus::True } else { crate::crd::ConditionStatus::False }
}

fn artifact_reason_message<'a>(
    ok: bool,
    reason_field: &'a Option<String>,
    message_field: &'a Option<String>,
) -> (&'a str, &'a str) {
    let default_reason = if ok { reason::ARTIFACT_OK } else { reason::ARTIFACT_VERIFY_FAILED };
    (
        reason_field.as_deref().unwrap_or(default_reason),
        message_field.as_deref().unwrap_or(""),
    )
}
