//! Desired-state computation and its in-memory secondary index (spec.md
//! §4.2 "Desired computation" — "a field index is required to avoid
//! cluster-wide scans").

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use futures::StreamExt;
use kube::runtime::{reflector, watcher, WatchStreamExt};
use kube::{Api, Client, Resource, ResourceExt};
use serde::{Deserialize, Serialize};

use crate::crd::DeviceProcess;
use crate::hashing::{desired_etag, spec_hash, DesiredItemKey};

/// Maintains a live `reflector::Store` of every `DeviceProcess` plus a
/// secondary index from device name to the set of declarations targeting it,
/// rebuilt from the store on every watch event. Entirely in memory, no
/// durability, matching the per-device desired cache spec.md §3 describes.
pub struct DesiredIndex {
    store: reflector::Store<DeviceProcess>,
    by_device: Arc<RwLock<BTreeMap<String, Vec<(String, String)>>>>,
}

impl DesiredIndex {
    /// Spawns the background watch/reflect task and returns the index handle
    /// plus the task's future (the caller decides how to supervise it).
    pub fn start(client: Client) -> (Self, impl std::future::Future<Output = ()>) {
        let api: Api<DeviceProcess> = Api::all(client);
        let (reader, writer) = reflector::store();
        let by_device: Arc<RwLock<BTreeMap<String, Vec<(String, String)>>>> = Default::default();
        let by_device_task = by_device.clone();
        let reader_task = reader.clone();

        let task = watcher(api, watcher::Config::default())
            .default_backoff()
            .reflect(writer)
            .for_each(move |event| {
                let by_device = by_device_task.clone();
                let reader = reader_task.clone();
                async move {
                    if event.is_err() {
                        return;
                    }
                    let mut map: BTreeMap<String, Vec<(String, String)>> = BTreeMap::new();
                    for obj in reader.state() {
                        let key = (obj.namespace().unwrap_or_default(), obj.name_any());
                        map.entry(obj.spec.device_ref.name.clone()).or_default().push(key);
                    }
                    for keys in map.values_mut() {
                        keys.sort();
                    }
                    *by_device.write().expect("desired index lock poisoned") = map;
                }
            });

        (Self { store: reader, by_device }, task)
    }

    /// Every `DeviceProcess` targeting `device`, sorted by `(namespace, name)`.
    pub fn for_device(&self, device: &str) -> Vec<Arc<DeviceProcess>> {
        let by_device = self.by_device.read().expect("desired index lock poisoned");
        let Some(keys) = by_device.get(device) else {
            return Vec::new();
        };
        keys.iter()
            .filter_map(|(namespace, name)| {
                self.store.get(&reflector::ObjectRef::new(name).within(namespace))
            })
            .collect()
    }
}

/// One item of the `GET .../desired` response body (spec.md §6). Also the
/// agent's own view of the wire format when parsing the response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DesiredItem {
    pub uid: String,
    pub namespace: String,
    pub name: String,
    pub generation: i64,
    pub spec: crate::crd::DeviceProcessSpec,
    pub spec_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DesiredResponse {
    pub device_name: String,
    pub heartbeat_interval_seconds: u64,
    pub items: Vec<DesiredItem>,
}

/// Build the response body and its ETag from a device's declarations. Pure
/// (given the already-fetched process list), so it's directly testable.
pub fn compute_desired(
    device: &str,
    heartbeat_interval_seconds: u64,
    mut processes: Vec<Arc<DeviceProcess>>,
) -> Result<(DesiredResponse, String), serde_json::Error> {
    processes.sort_by(|a, b| {
        (a.namespace().unwrap_or_default(), a.name_any())
            .cmp(&(b.namespace().unwrap_or_default(), b.name_any()))
    });

    let mut items = Vec::with_capacity(processes.len());
    let mut hashes = Vec::with_capacity(processes.len());
    for p in &processes {
        let hash = spec_hash(&p.spec)?;
        hashes.push((p.namespace().unwrap_or_default(), p.name_any(), p.meta().generation.unwrap_or(0), hash));
    }

    let etag_keys: Vec<DesiredItemKey<'_>> = hashes
        .iter()
        .map(|(ns, name, generation, hash)| DesiredItemKey {
            namespace: ns,
            name,
            generation: *generation,
            spec_hash: hash,
        })
        .collect();
    let etag = format!("\"{}\"", desired_etag(&etag_keys));

    for (p, (namespace, name, generation, hash)) in processes.iter().zip(hashes.into_iter()) {
        items.push(DesiredItem {
            uid: p.uid().unwrap_or_default(),
            namespace,
            name,
            generation,
            spec: p.spec.clone(),
            spec_hash: hash,
        });
    }

    Ok((
        DesiredResponse {
            device_name: device.to_string(),
            heartbeat_interval_seconds,
            items,
        },
        etag,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ArtifactSpec, ArtifactType, DeviceProcessSpec, DeviceRef, ExecutionSpec, RestartPolicy};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn process(ns: &str, name: &str, device: &str, generation: i64) -> Arc<DeviceProcess> {
        let mut p = DeviceProcess::new(
            name,
            DeviceProcessSpec {
                device_ref: DeviceRef { kind: "Device".into(), name: device.into() },
                artifact: ArtifactSpec { type_: ArtifactType::File, url: "file:///bin/true".into(), sha256: None },
                execution: ExecutionSpec { command: vec!["/bin/true".into()], ..Default::default() },
                restart_policy: RestartPolicy::Always,
                health_check: None,
            },
        );
        p.metadata = ObjectMeta {
            namespace: Some(ns.to_string()),
            name: Some(name.to_string()),
            generation: Some(generation),
            uid: Some(format!("{name}-uid")),
            ..Default::default()
        };
        Arc::new(p)
    }

    #[test]
    fn desired_is_sorted_by_namespace_then_name() {
        let processes = vec![process("ns", "b", "tor1-01", 1), process("ns", "a", "tor1-01", 1)];
        let (resp, _) = compute_desired("tor1-01", 15, processes).unwrap();
        assert_eq!(resp.items[0].name, "a");
        assert_eq!(resp.items[1].name, "b");
    }

    #[test]
    fn etag_is_stable_across_repeated_computation() {
        let processes = vec![process("ns", "a", "tor1-01", 1)];
        let (_, etag1) = compute_desired("tor1-01", 15, processes.clone()).unwrap();
        let (_, etag2) = compute_desired("tor1-01", 15, processes).unwrap();
        assert_eq!(etag1, etag2);
    }

    #[test]
    fn etag_changes_when_generation_changes() {
        let (_, etag1) = compute_desired("tor1-01", 15, vec![process("ns", "a", "tor1-01", 1)]).unwrap();
        let (_, etag2) = compute_desired("tor1-01", 15, vec![process("ns", "a", "tor1-01", 2)]).unwrap();
        assert_ne!(etag1, etag2);
    }

    #[test]
    fn etag_is_quoted() {
        let (_, etag) = compute_desired("tor1-01", 15, vec![process("ns", "a", "tor1-01", 1)]).unwrap();
        assert!(etag.starts_with('"') && etag.ends_with('"'));
    }
}
