//! Canonical-json spec hashing and desired-response ETag computation
//! (spec.md §3, §4.2, §8).

use crate::crd::DeviceProcessSpec;
use sha2::{Digest, Sha256};

/// `serde_json`'s default `Map` backs onto a `BTreeMap`, so
/// `serde_json::to_vec` already emits object keys in sorted order — that's
/// the "canonical-json" spec.md calls for without a separate canonicalizer.
pub fn canonical_json(spec: &DeviceProcessSpec) -> serde_json::Result<Vec<u8>> {
    let value = serde_json::to_value(spec)?;
    serde_json::to_vec(&value)
}

/// `"sha256:" + hex(sha256(canonical-json(spec)))`.
pub fn spec_hash(spec: &DeviceProcessSpec) -> serde_json::Result<String> {
    let bytes = canonical_json(spec)?;
    let digest = Sha256::digest(&bytes);
    Ok(format!("sha256:{}", hex::encode(digest)))
}

/// One item of a desired-state response, the unit the ETag is computed over.
pub struct DesiredItemKey<'a> {
    pub namespace: &'a str,
    pub name: &'a str,
    pub generation: i64,
    pub spec_hash: &'a str,
}

/// `hex(sha256(concat of "namespace/name/generation/specHash;" for each item
/// in order)))`, quoted by the caller when used as an HTTP ETag header value.
pub fn desired_etag(items: &[DesiredItemKey<'_>]) -> String {
    let mut hasher = Sha256::new();
    for item in items {
        hasher.update(item.namespace.as_bytes());
        hasher.update(b"/");
        hasher.update(item.name.as_bytes());
        hasher.update(b"/");
        hasher.update(item.generation.to_string().as_bytes());
        hasher.update(b"/");
        hasher.update(item.spec_hash.as_bytes());
        hasher.update(b";");
    }
    hex::encode(hasher.finalize())
}
