use apollo::crd::{
    ArtifactSpec, ArtifactType, Device, DeviceProcessDeployment, DeviceProcessDeploymentSpec,
    DeviceProcessTemplate, DeviceProcessTemplateSpec, DeviceSpec, ExecutionSpec, RestartPolicy,
    TemplateMetadata,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use std::collections::BTreeMap;

pub fn make_device(name: &str, namespace: &str, labels: &[(&str, &str)]) -> Device {
    let mut d = Device::new(name, DeviceSpec::default());
    d.metadata = ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()),
        ..Default::default()
    };
    d
}

pub fn make_deployment(
    name: &str,
    namespace: &str,
    uid: &str,
    selector_labels: &[(&str, &str)],
    template_labels: &[(&str, &str)],
) -> DeviceProcessDeployment {
    let mut d = DeviceProcessDeployment::new(
        name,
        DeviceProcessDeploymentSpec {
            selector: LabelSelector {
                match_labels: Some(
                    selector_labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
                ),
                match_expressions: None,
            },
            update_strategy: Default::default(),
            template: DeviceProcessTemplate {
                metadata: TemplateMetadata {
                    labels: template_labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect::<BTreeMap<_, _>>(),
                    annotations: Default::default(),
                },
                spec: DeviceProcessTemplateSpec {
                    artifact: ArtifactSpec {
                        type_: ArtifactType::File,
                        url: "file:///bin/true".to_string(),
                        sha256: None,
                    },
                    execution: ExecutionSpec { command: vec!["/bin/true".to_string()], ..Default::default() },
                    restart_policy: RestartPolicy::Always,
                    health_check: None,
                },
            },
        },
    );
    d.metadata = ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        uid: Some(uid.to_string()),
        ..Default::default()
    };
    d
}
