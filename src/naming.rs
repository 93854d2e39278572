//! Deterministic process-declaration naming (spec.md §3 invariant, §8
//! testable properties).

use sha1::{Digest, Sha1};
use std::sync::LazyLock;

const MAX_NAME_LEN: usize = 253;
const HASH_SUFFIX_HEX_LEN: usize = 10;

static DNS_1123_SUBDOMAIN: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"^[a-z0-9]([-a-z0-9.]*[a-z0-9])?$").unwrap());

/// DNS-1123 subdomain: lowercase alphanumerics, `-` and `.`, not leading or
/// trailing with `-`/`.`, and at most 253 characters.
pub fn is_valid_dns_1123_subdomain(s: &str) -> bool {
    !s.is_empty() && s.len() <= MAX_NAME_LEN && DNS_1123_SUBDOMAIN.is_match(s)
}

/// Label key/value syntax: keys are `[prefix/]name` where `name` matches
/// `[A-Za-z0-9]([-_.A-Za-z0-9]*[A-Za-z0-9])?` and is at most 63 chars; values
/// follow the same rule but may be empty. This is the predicate the
/// controller's label projection (spec.md §4.1) silently skips on failure.
pub fn is_valid_label_value(s: &str) -> bool {
    if s.is_empty() {
        return true;
    }
    is_valid_label_segment(s)
}

pub fn is_valid_label_key(s: &str) -> bool {
    match s.split_once('/') {
        Some((prefix, name)) => !prefix.is_empty() && is_valid_label_segment(name),
        None => is_valid_label_segment(s),
    }
}

fn is_valid_label_segment(s: &str) -> bool {
    if s.is_empty() || s.len() > 63 {
        return false;
    }
    static LABEL_SEGMENT: LazyLock<regex::Regex> = LazyLock::new(|| {
        regex::Regex::new(r"^[A-Za-z0-9]([-_.A-Za-z0-9]*[A-Za-z0-9])?$").unwrap()
    });
    LABEL_SEGMENT.is_match(s)
}

/// Compute the deterministic `DeviceProcess` name for `(deployment, device)`.
///
/// `lower(deployment-name + "-" + device-name)` when that's a valid DNS-1123
/// subdomain within length; otherwise a truncated-prefix + hash fallback.
/// The hash input **must** include the deployment name, or two deployments
/// targeting the same device would collide (spec.md §3).
pub fn device_process_name(deployment_name: &str, device_name: &str) -> String {
    let candidate = format!("{}-{}", deployment_name, device_name).to_lowercase();
    if is_valid_dns_1123_subdomain(&candidate) {
        return candidate;
    }

    let hash_input = format!("{}:{}", deployment_name, device_name);
    let digest = Sha1::digest(hash_input.as_bytes());
    let hash_hex = hex::encode(digest);
    let suffix = &hash_hex[..HASH_SUFFIX_HEX_LEN];

    let lower_dep = deployment_name.to_lowercase();
    // Reserve room for "-" + suffix.
    let budget = MAX_NAME_LEN.saturating_sub(1 + HASH_SUFFIX_HEX_LEN);
    let prefix: String = lower_dep.chars().take(budget).collect();
    let prefix = prefix.trim_end_matches(['-', '.']).to_string();
    format!("{prefix}-{suffix}")
}
