use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/* ============================= SHARED CONDITION TYPE ============================= */

/// Tri-state condition status, mirroring the upstream Kubernetes convention.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// A single status condition. At most one condition per `type_` may exist on
/// a resource; see [`crate::condition`] for the algebra that maintains this.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    pub last_transition_time: String,
}

/* ============================= DEVICE (inventory) ============================= */

/// Device is the inventory entry the controller's selector matches against.
///
/// The controller only ever reads `.metadata.labels`; the spec body is
/// intentionally empty beyond free-form notes so this CRD can stand in for
/// whatever inventory source a deployment actually uses.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "apollo.dev",
    version = "v1",
    kind = "Device",
    plural = "devices",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/* ============================= PROCESS SPEC TYPES ============================= */

/// Reference to the device a process declaration targets.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRef {
    pub kind: String,
    pub name: String,
}

/// Source an artifact is fetched from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactType {
    Oci,
    Http,
    File,
}

/// The payload a process's execution environment is materialized from.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactSpec {
    #[serde(rename = "type")]
    pub type_: ArtifactType,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

/// Local execution mechanism the agent drives.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionBackend {
    Systemd,
    Initd,
    Container,
}

/// A single `KEY=VALUE` environment entry.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

/// How the process is started once its artifact is in place.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSpec {
    pub backend: Option<ExecutionBackend>,
    /// First element is argv0; must be non-empty.
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<EnvVar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

/// Mirrors the service manager's own restart directive. DaemonSet semantics
/// (spec.md §4.3) mean the agent converges toward Running regardless of this
/// value — it only shapes the rendered unit's `Restart=` line.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub enum RestartPolicy {
    #[default]
    Always,
    OnFailure,
    Never,
}

/// Command executed to decide process health.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckExec {
    pub command: Vec<String>,
}

/// Optional liveness/readiness probe for a process declaration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheck {
    pub exec: HealthCheckExec,
    pub period_seconds: u32,
    pub timeout_seconds: u32,
    pub success_threshold: u32,
    pub failure_threshold: u32,
}

/* ============================= DEVICE PROCESS CRD ============================= */

/// DeviceProcess is the unit of work: one process on one device.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "apollo.dev",
    version = "v1",
    kind = "DeviceProcess",
    plural = "deviceprocesses",
    status = "DeviceProcessStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct DeviceProcessSpec {
    pub device_ref: DeviceRef,
    pub artifact: ArtifactSpec,
    pub execution: ExecutionSpec,
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheck>,
}

/// Observed phase of a process declaration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub enum Phase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

/// DeviceProcessStatus is written exclusively by the gateway (spec.md §9's
/// spec/status subresource split); the controller never touches it.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceProcessStatus {
    #[serde(default)]
    pub phase: Phase,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_spec_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_termination_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_semantics: Option<String>,
}

/* ============================= DEPLOYMENT CRD ============================= */

/// Update strategy family. `rolling_update` is only meaningful when
/// `type_ == RollingUpdate`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub enum UpdateStrategyType {
    #[default]
    RollingUpdate,
    Recreate,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RollingUpdateSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<IntOrString>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStrategy {
    #[serde(default, rename = "type")]
    pub type_: UpdateStrategyType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rolling_update: Option<RollingUpdateSpec>,
}

/// Process spec without `deviceRef` — the deployment supplies that per device.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DeviceProcessTemplateSpec {
    pub artifact: ArtifactSpec,
    pub execution: ExecutionSpec,
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheck>,
}

// `ArtifactSpec` has no `Default`, so `DeviceProcessTemplateSpec`'s derive
// needs one; provide the empty-artifact placeholder used only so the
// template type can appear inside other `Default`-deriving structs in tests.
impl Default for ArtifactSpec {
    fn default() -> Self {
        ArtifactSpec {
            type_: ArtifactType::File,
            url: String::new(),
            sha256: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct TemplateMetadata {
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DeviceProcessTemplate {
    #[serde(default)]
    pub metadata: TemplateMetadata,
    pub spec: DeviceProcessTemplateSpec,
}

/// DeviceProcessDeployment fans out `template` to every device `selector`
/// matches, producing one `DeviceProcess` per device.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "apollo.dev",
    version = "v1",
    kind = "DeviceProcessDeployment",
    plural = "deviceprocessdeployments",
    status = "DeviceProcessDeploymentStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct DeviceProcessDeploymentSpec {
    pub selector: LabelSelector,
    #[serde(default)]
    pub update_strategy: UpdateStrategy,
    pub template: DeviceProcessTemplate,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceProcessDeploymentStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired_number_scheduled: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_number_scheduled: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_number_scheduled: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number_ready: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number_available: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number_unavailable: Option<i32>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/* ============================= LABELS ============================= */

/// Label key recording the owning deployment's name on every child it
/// manages (spec.md §3 invariant: every owned declaration carries both this
/// and [`UID_LABEL`]).
pub const DEPLOYMENT_NAME_LABEL: &str = "apollo.dev/deployment-name";
/// Label key recording the owning deployment's uid. Pruning only ever
/// deletes declarations whose value here matches the current owner.
pub const UID_LABEL: &str = "apollo.dev/deployment-uid";
/// Label applied for convenience/compatibility with generic `app=` selectors.
pub const APP_LABEL: &str = "app";

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    #[test]
    fn device_process_crd_generates_valid_yaml() {
        let crd = DeviceProcess::crd();
        let yaml = serde_yaml::to_string(&crd).expect("CRD should serialize to YAML");
        assert!(yaml.contains("apollo.dev"));
        assert!(yaml.contains("DeviceProcess"));
        assert!(yaml.contains("deviceprocesses"));
    }

    #[test]
    fn deployment_crd_generates_valid_yaml() {
        let crd = DeviceProcessDeployment::crd();
        let yaml = serde_yaml::to_string(&crd).expect("CRD should serialize to YAML");
        assert!(yaml.contains("DeviceProcessDeployment"));
        assert!(yaml.contains("deviceprocessdeployments"));
    }

    #[test]
    fn device_crd_is_namespaced() {
        let crd = Device::crd();
        assert_eq!(crd.spec.scope, "Namespaced");
    }

    #[test]
    fn process_spec_roundtrip() {
        let spec = DeviceProcessSpec {
            device_ref: DeviceRef {
                kind: "Device".into(),
                name: "tor1-01".into(),
            },
            artifact: ArtifactSpec {
                type_: ArtifactType::Oci,
                url: "ghcr.io/example/app@sha256:aa".into(),
                sha256: None,
            },
            execution: ExecutionSpec {
                backend: Some(ExecutionBackend::Systemd),
                command: vec!["/usr/bin/app".into()],
                ..Default::default()
            },
            restart_policy: RestartPolicy::Always,
            health_check: None,
        };
        let json = serde_json::to_string(&spec).expect("should serialize");
        let back: DeviceProcessSpec = serde_json::from_str(&json).expect("should deserialize");
        assert_eq!(back.device_ref.name, "tor1-01");
        assert_eq!(back.execution.command, vec!["/usr/bin/app".to_string()]);
    }

    #[test]
    fn condition_status_is_pascal_case() {
        let json = serde_json::to_string(&ConditionStatus::True).unwrap();
        assert_eq!(json, "\"True\"");
    }

    #[test]
    fn status_default_is_pending_with_no_conditions() {
        let status = DeviceProcessStatus::default();
        assert_eq!(status.phase, Phase::Pending);
        assert!(status.conditions.is_empty());
    }

    #[test]
    fn restart_policy_default_is_always() {
        assert_eq!(RestartPolicy::default(), RestartPolicy::Always);
    }
}
