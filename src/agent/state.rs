//! Managed-map persistence (spec.md §4.3 "State persistence"). The agent's
//! only durable state: which declarations it currently manages, the unit
//! files it wrote for them, and enough bookkeeping to gate drift-correction
//! attempts (§4.3 step 7, `shouldAttemptAction`).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// One managed declaration, keyed by `"<namespace>/<name>"` in [`ManagedMap`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ManagedEntry {
    pub unit_name: String,
    pub env_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_action_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_action_spec_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_action_description: Option<String>,
}

pub type ManagedMap = BTreeMap<String, ManagedEntry>;

pub fn key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

/// Load the managed map from `path`. A missing file is a valid empty map
/// (spec.md §4.3: "Load on startup; absent or empty file is a valid empty
/// map").
pub async fn load(path: &Path) -> Result<ManagedMap> {
    match tokio::fs::read(path).await {
        Ok(bytes) if bytes.is_empty() => Ok(ManagedMap::new()),
        Ok(bytes) => {
            serde_json::from_slice(&bytes).with_context(|| format!("parsing agent state at {}", path.display()))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ManagedMap::new()),
        Err(e) => Err(e).with_context(|| format!("reading agent state at {}", path.display())),
    }
}

/// Persist `map` to `path` atomically: write a tempfile in the same
/// directory, then rename over the destination (spec.md §4.3 "write the
/// managed map to `<state path>` atomically").
pub async fn save(path: &Path, map: &ManagedMap) -> Result<()> {
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
    tokio::fs::create_dir_all(dir).await.with_context(|| format!("creating state directory {}", dir.display()))?;

    let body = serde_json::to_vec_pretty(map).context("serializing agent state")?;
    let tmp_path: PathBuf = dir.join(format!(".state.tmp.{}", std::process::id()));
    tokio::fs::write(&tmp_path, &body)
        .await
        .with_context(|| format!("writing temp state file {}", tmp_path.display()))?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("renaming {} into place at {}", tmp_path.display(), path.display()))?;
    Ok(())
}

/// Gate for drift-correction attempts (spec.md §4.3 step 7): always on the
/// first attempt, when the spec hash has changed, or when at least `min_gap`
/// has elapsed since the last recorded action.
pub fn should_attempt_action(
    entry: Option<&ManagedEntry>,
    current_spec_hash: &str,
    now: chrono::DateTime<chrono::Utc>,
    min_gap: chrono::Duration,
) -> bool {
    let Some(entry) = entry else { return true };
    if entry.last_action_spec_hash.as_deref() != Some(current_spec_hash) {
        return true;
    }
    match &entry.last_action_at {
        None => true,
        Some(at) => match chrono::DateTime::parse_from_rfc3339(at) {
            Ok(at) => now - at.with_timezone(&chrono::Utc) >= min_gap,
            Err(_) => true,
        },
    }
}
