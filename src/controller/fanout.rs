//! Pure child-projection logic for the deployment fan-out controller
//! (spec.md §4.1): label projection, per-device spec construction, and the
//! ownership predicate pruning uses.

use std::collections::BTreeMap;

use kube::ResourceExt;

use crate::crd::{
    DeviceProcess, DeviceProcessDeployment, DeviceProcessSpec, DeviceRef, APP_LABEL,
    DEPLOYMENT_NAME_LABEL, UID_LABEL,
};

/// Label keys always considered for device-value projection, in addition to
/// whatever keys the deployment's own selector names.
const ALWAYS_PROJECTED_KEYS: [&str; 3] = ["role", "type", "rack"];

/// The child's labels: template labels, control labels, and device label
/// values copied for every key in `{selector keys} ∪ {role,type,rack}` —
/// copied only when both key and value satisfy label-syntax rules, silently
/// skipped otherwise (spec.md §4.1 "Device-label projection onto child").
pub fn project_child_labels(
    deployment: &DeviceProcessDeployment,
    device_labels: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut labels: BTreeMap<String, String> = deployment
        .spec
        .template
        .metadata
        .labels
        .clone()
        .into_iter()
        .collect();

    let deployment_name = deployment.name_any();
    labels.insert(APP_LABEL.to_string(), deployment_name.clone());
    labels.insert(DEPLOYMENT_NAME_LABEL.to_string(), deployment_name);
    labels.insert(UID_LABEL.to_string(), deployment.uid().unwrap_or_default());

    let mut projected_keys: std::collections::BTreeSet<String> =
        crate::selector::index_keys(&deployment.spec.selector);
    projected_keys.remove(crate::selector::UNIVERSAL_SELECTOR_KEY);
    projected_keys.extend(ALWAYS_PROJECTED_KEYS.iter().map(|s| s.to_string()));

    for key in &projected_keys {
        let Some(value) = device_labels.get(key) else {
            continue;
        };
        if crate::naming::is_valid_label_key(key) && crate::naming::is_valid_label_value(value) {
            labels.insert(key.clone(), value.clone());
        }
    }

    labels
}

/// Build the full per-device `DeviceProcessSpec` from the deployment's
/// template plus the target device's identity.
pub fn child_spec(deployment: &DeviceProcessDeployment, device_name: &str) -> DeviceProcessSpec {
    let template = &deployment.spec.template.spec;
    DeviceProcessSpec {
        device_ref: DeviceRef {
            kind: "Device".to_string(),
            name: device_name.to_string(),
        },
        artifact: template.artifact.clone(),
        execution: template.execution.clone(),
        restart_policy: template.restart_policy,
        health_check: template.health_check.clone(),
    }
}

/// Pruning may only delete declarations whose uid label matches the current
/// owner (spec.md §3 invariant — protects against name reuse across
/// deletions).
pub fn owned_by(process: &DeviceProcess, deployment_uid: &str) -> bool {
    process
        .metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(UID_LABEL))
        .is_some_and(|uid| uid == deployment_uid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        ArtifactSpec, ArtifactType, DeviceProcessDeploymentSpec, DeviceProcessTemplate,
        DeviceProcessTemplateSpec, ExecutionSpec, RestartPolicy, TemplateMetadata,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

    fn sample_deployment() -> DeviceProcessDeployment {
        let mut d = DeviceProcessDeployment::new(
            "fan-out",
            DeviceProcessDeploymentSpec {
                selector: LabelSelector {
                    match_labels: Some([("role".to_string(), "tor".to_string())].into_iter().collect()),
                    match_expressions: None,
                },
                update_strategy: Default::default(),
                template: DeviceProcessTemplate {
                    metadata: TemplateMetadata {
                        labels: [("team".to_string(), "net".to_string())].into_iter().collect(),
                        annotations: Default::default(),
                    },
                    spec: DeviceProcessTemplateSpec {
                        artifact: ArtifactSpec {
                            type_: ArtifactType::Oci,
                            url: "ghcr.io/example/app@sha256:aa".into(),
                            sha256: None,
                        },
                        execution: ExecutionSpec {
                            command: vec!["/usr/bin/app".into()],
                            ..Default::default()
                        },
                        restart_policy: RestartPolicy::Always,
                        health_check: None,
                    },
                },
            },
        );
        d.metadata.namespace = Some("ns".to_string());
        d.metadata.uid = Some("dep-uid-1".to_string());
        d
    }

    #[test]
    fn projected_labels_include_template_and_control_labels() {
        let deployment = sample_deployment();
        let device_labels = [("role".to_string(), "tor".to_string())].into_iter().collect();
        let labels = project_child_labels(&deployment, &device_labels);
        assert_eq!(labels.get("team"), Some(&"net".to_string()));
        assert_eq!(labels.get(APP_LABEL), Some(&"fan-out".to_string()));
        assert_eq!(labels.get(DEPLOYMENT_NAME_LABEL), Some(&"fan-out".to_string()));
        assert_eq!(labels.get(UID_LABEL), Some(&"dep-uid-1".to_string()));
        assert_eq!(labels.get("role"), Some(&"tor".to_string()));
    }

    #[test]
    fn projected_labels_include_always_projected_keys_even_outside_selector() {
        let deployment = sample_deployment();
        let device_labels = [
            ("role".to_string(), "tor".to_string()),
            ("rack".to_string(), "a1".to_string()),
        ]
        .into_iter()
        .collect();
        let labels = project_child_labels(&deployment, &device_labels);
        assert_eq!(labels.get("rack"), Some(&"a1".to_string()));
    }

    #[test]
    fn invalid_device_label_value_is_silently_skipped() {
        let deployment = sample_deployment();
        let device_labels = [
            ("role".to_string(), "tor".to_string()),
            ("type".to_string(), "bad value with spaces".to_string()),
        ]
        .into_iter()
        .collect();
        let labels = project_child_labels(&deployment, &device_labels);
        assert!(!labels.contains_key("type"));
    }

    #[test]
    fn child_spec_carries_template_fields_with_device_ref() {
        let deployment = sample_deployment();
        let spec = child_spec(&deployment, "tor1-01");
        assert_eq!(spec.device_ref.name, "tor1-01");
        assert_eq!(spec.device_ref.kind, "Device");
        assert_eq!(spec.execution.command, vec!["/usr/bin/app".to_string()]);
        assert_eq!(spec.restart_policy, RestartPolicy::Always);
    }

    #[test]
    fn owned_by_matches_only_current_uid() {
        let mut process = DeviceProcess::new(
            "fan-out-tor1-01",
            child_spec(&sample_deployment(), "tor1-01"),
        );
        process.metadata.labels = Some(
            [(UID_LABEL.to_string(), "dep-uid-1".to_string())]
                .into_iter()
                .collect(),
        );
        assert!(owned_by(&process, "dep-uid-1"));
        assert!(!owned_by(&process, "dep-uid-stale"));
    }
}
