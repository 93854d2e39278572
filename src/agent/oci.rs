//! OCI artifact ensure procedure (spec.md §4.3a). Given a digest-pinned
//! `<registry>/<repo>@sha256:<64-hex>` reference, materializes a verified
//! single-layer rootfs under a content-addressed cache directory, with
//! at-most-once concurrent materialization per digest on the host.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use fs4::fs_std::FileExt;
use oci_client::client::{ClientConfig, ClientProtocol};
use oci_client::secrets::RegistryAuth;
use oci_client::{Client, Reference};
use regex::Regex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::agent::backoff::oci_retry_backoff;
use crate::error::{reason, ReasonedError};

pub const DEFAULT_MAX_EXTRACT_BYTES: u64 = 512 * 1024 * 1024;
pub const DEFAULT_MAX_EXTRACT_ENTRIES: usize = 10_000;
const MAX_DOWNLOAD_ATTEMPTS: u32 = 3;

static DIGEST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^sha256:[A-Fa-f0-9]{64}$").expect("static regex is valid"));

#[derive(Debug, Clone)]
pub struct OciConfig {
    pub cache_root: PathBuf,
    pub plain_http: bool,
    pub plain_http_hosts: Vec<String>,
    pub max_extract_bytes: u64,
    pub max_extract_entries: usize,
}

impl Default for OciConfig {
    fn default() -> Self {
        OciConfig {
            cache_root: PathBuf::from("/var/lib/apollo/artifacts/oci"),
            plain_http: false,
            plain_http_hosts: Vec::new(),
            max_extract_bytes: DEFAULT_MAX_EXTRACT_BYTES,
            max_extract_entries: DEFAULT_MAX_EXTRACT_ENTRIES,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnsureResult {
    pub rootfs: PathBuf,
    pub digest: String,
    pub attempts: u32,
    pub last_attempt_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
struct CacheMeta<'a> {
    #[serde(rename = "ref")]
    reference: &'a str,
    digest: &'a str,
    size: u64,
    #[serde(rename = "fetchedAt")]
    fetched_at: DateTime<Utc>,
}

/// Top-level entry point for §4.3 step 2 ("run the OCI ensure sub-procedure").
pub async fn ensure(config: &OciConfig, reference_str: &str) -> Result<EnsureResult, ReasonedError> {
    let digest = parse_pinned_digest(reference_str)?;
    let digest_hex = digest.trim_start_matches("sha256:");
    let digest_dir = config.cache_root.join(digest_hex);

    tokio::fs::create_dir_all(&digest_dir)
        .await
        .map_err(|e| ReasonedError::new(reason::ARTIFACT_VERIFY_FAILED, format!("creating cache dir: {e}")))?;

    let lock_path = digest_dir.join(".lock");
    let _lock = acquire_lock(&lock_path).await?;

    let ready_path = digest_dir.join("READY");
    let rootfs_path = digest_dir.join("rootfs");
    if ready_path.is_file() && rootfs_path.is_dir() {
        debug!(digest = digest_hex, "oci_cache_hit");
        return Ok(EnsureResult { rootfs: rootfs_path, digest, attempts: 0, last_attempt_time: None });
    }

    let registry_host = reference_str.split('/').next().unwrap_or_default();
    let plain_http = config.plain_http
        || config
            .plain_http_hosts
            .iter()
            .any(|h| h.trim().eq_ignore_ascii_case(registry_host));

    let reference: Reference = reference_str
        .parse()
        .map_err(|e| ReasonedError::new(reason::UNSUPPORTED_ARTIFACT, format!("invalid reference: {e}")))?;

    let (image, attempts, last_attempt_time) = download_with_retry(&reference, plain_http).await?;

    if image.digest.as_deref() != Some(digest.as_str()) {
        return Err(ReasonedError::new(
            reason::DIGEST_MISMATCH,
            format!("requested {digest}, got {:?}", image.digest),
        ));
    }
    match image.layers.len() {
        0 => {
            return Err(ReasonedError::new(reason::ARTIFACT_VERIFY_FAILED, "manifest has zero layers".to_string()))
        }
        1 => {}
        n => return Err(ReasonedError::new(reason::UNSUPPORTED_ARTIFACT, format!("manifest has {n} layers, expected 1"))),
    }
    let layer = &image.layers[0];

    let tmp_root = digest_dir.join(format!("rootfs.tmp.{}", nanos_since_epoch()));
    let extract_result = extract_layer(layer.data.clone(), layer.media_type.clone(), tmp_root.clone(), config.max_extract_bytes, config.max_extract_entries).await;

    let extracted_bytes = match extract_result {
        Ok(bytes) => bytes,
        Err(e) => {
            let _ = tokio::fs::remove_dir_all(&tmp_root).await;
            return Err(e);
        }
    };

    if rootfs_path.is_dir() {
        tokio::fs::remove_dir_all(&rootfs_path)
            .await
            .map_err(|e| ReasonedError::new(reason::ARTIFACT_VERIFY_FAILED, format!("removing stale rootfs: {e}")))?;
    }
    tokio::fs::rename(&tmp_root, &rootfs_path)
        .await
        .map_err(|e| ReasonedError::new(reason::ARTIFACT_VERIFY_FAILED, format!("renaming rootfs into place: {e}")))?;

    let meta = CacheMeta { reference: reference_str, digest: &digest, size: extracted_bytes, fetched_at: Utc::now() };
    let meta_json = serde_json::to_vec_pretty(&meta)
        .map_err(|e| ReasonedError::new(reason::ARTIFACT_VERIFY_FAILED, format!("serializing meta.json: {e}")))?;
    tokio::fs::write(digest_dir.join("meta.json"), meta_json)
        .await
        .map_err(|e| ReasonedError::new(reason::ARTIFACT_VERIFY_FAILED, format!("writing meta.json: {e}")))?;
    tokio::fs::write(&ready_path, b"ok\n")
        .await
        .map_err(|e| ReasonedError::new(reason::ARTIFACT_VERIFY_FAILED, format!("writing READY: {e}")))?;

    Ok(EnsureResult { rootfs: rootfs_path, digest, attempts, last_attempt_time })
}

fn parse_pinned_digest(reference_str: &str) -> Result<String, ReasonedError> {
    let Some((_, digest)) = reference_str.rsplit_once('@') else {
        return Err(ReasonedError::new(
            reason::UNPINNED_REFERENCE,
            format!("reference {reference_str:?} is not pinned by digest"),
        ));
    };
    if !DIGEST_RE.is_match(digest) {
        return Err(ReasonedError::new(
            reason::UNPINNED_REFERENCE,
            format!("digest {digest:?} does not match sha256:<64hex>"),
        ));
    }
    Ok(digest.to_string())
}

async fn acquire_lock(lock_path: &Path) -> Result<std::fs::File, ReasonedError> {
    let lock_path = lock_path.to_path_buf();
    tokio::task::spawn_blocking(move || -> std::io::Result<std::fs::File> {
        let file = std::fs::OpenOptions::new().create(true).write(true).open(&lock_path)?;
        file.lock_exclusive()?;
        Ok(file)
    })
    .await
    .map_err(|e| ReasonedError::new(reason::ARTIFACT_VERIFY_FAILED, format!("lock task panicked: {e}")))?
    .map_err(|e| ReasonedError::new(reason::ARTIFACT_VERIFY_FAILED, format!("acquiring cache lock: {e}")))
}

async fn download_with_retry(
    reference: &Reference,
    plain_http: bool,
) -> Result<(oci_client::client::ImageData, u32, Option<DateTime<Utc>>), ReasonedError> {
    let protocol = if plain_http { ClientProtocol::Http } else { ClientProtocol::Https };
    let client = Client::new(ClientConfig { protocol, ..Default::default() });
    let auth = RegistryAuth::Anonymous;
    let accepted = vec![
        "application/vnd.oci.image.layer.v1.tar",
        "application/vnd.oci.image.layer.v1.tar+gzip",
        "application/vnd.docker.image.rootfs.diff.tar.gzip",
    ];

    let mut attempts = 0u32;
    let mut last_attempt_time = None;
    loop {
        attempts += 1;
        last_attempt_time = Some(Utc::now());
        match client.pull(reference, &auth, accepted.clone()).await {
            Ok(image) => return Ok((image, attempts, last_attempt_time)),
            Err(e) => {
                let text = e.to_string();
                if attempts >= MAX_DOWNLOAD_ATTEMPTS || !is_retryable(&text) {
                    return Err(ReasonedError::new(reason::ARTIFACT_VERIFY_FAILED, format!("pulling artifact: {text}")));
                }
                warn!(attempt = attempts, error = %text, "oci_pull_retrying");
                tokio::time::sleep(oci_retry_backoff(attempts)).await;
            }
        }
    }
}

/// spec.md §4.3a "Retryability": DeadlineExceeded; transport errors flagged
/// Timeout/Temporary; HTTP-style 429/5xx substrings in the error text.
fn is_retryable(error_text: &str) -> bool {
    let lower = error_text.to_ascii_lowercase();
    lower.contains("deadline exceeded")
        || lower.contains("timeout")
        || lower.contains("timed out")
        || lower.contains("temporary")
        || lower.contains("429")
        || ["500", "502", "503", "504"].iter().any(|code| lower.contains(code))
}

fn nanos_since_epoch() -> u128 {
    SystemTime::now().duration_since(SystemTime::UNIX_EPOCH).map(|d| d.as_nanos()).unwrap_or(0)
}

/// Extract a single tar (optionally gzip'd) layer into `tmp_root`, enforcing
/// path-traversal, entry-type, and size/count limits (spec.md §4.3a
/// "Extraction"). Runs on a blocking thread since `tar`/`flate2` are
/// synchronous. Returns the total bytes written.
async fn extract_layer(
    data: Vec<u8>,
    media_type: String,
    tmp_root: PathBuf,
    max_extract_bytes: u64,
    max_extract_entries: usize,
) -> Result<u64, ReasonedError> {
    tokio::task::spawn_blocking(move || extract_layer_blocking(&data, &media_type, &tmp_root, max_extract_bytes, max_extract_entries))
        .await
        .map_err(|e| ReasonedError::new(reason::ARTIFACT_VERIFY_FAILED, format!("extraction task panicked: {e}")))?
}

fn extract_layer_blocking(
    data: &[u8],
    media_type: &str,
    tmp_root: &Path,
    max_extract_bytes: u64,
    max_extract_entries: usize,
) -> Result<u64, ReasonedError> {
    std::fs::create_dir_all(tmp_root)
        .map_err(|e| ReasonedError::new(reason::ARTIFACT_VERIFY_FAILED, format!("creating temp rootfs dir: {e}")))?;

    let cursor = std::io::Cursor::new(data);
    let mut archive: tar::Archive<Box<dyn std::io::Read>> = if media_type.contains("gzip") {
        tar::Archive::new(Box::new(flate2::read::GzDecoder::new(cursor)))
    } else {
        tar::Archive::new(Box::new(cursor))
    };

    let mut total_bytes = 0u64;
    let mut entry_count = 0usize;

    let entries = archive
        .entries()
        .map_err(|e| ReasonedError::new(reason::ARTIFACT_VERIFY_FAILED, format!("reading tar entries: {e}")))?;

    for entry in entries {
        let mut entry = entry.map_err(|e| ReasonedError::new(reason::ARTIFACT_VERIFY_FAILED, format!("reading tar entry: {e}")))?;

        entry_count += 1;
        if entry_count > max_extract_entries {
            return Err(ReasonedError::new(reason::EXTRACT_LIMIT_EXCEEDED, format!("entry count exceeds {max_extract_entries}")));
        }

        let path = entry
            .path()
            .map_err(|e| ReasonedError::new(reason::INVALID_PATH, format!("reading entry path: {e}")))?
            .into_owned();
        let Some(name) = path.to_str() else {
            return Err(ReasonedError::new(reason::INVALID_PATH, "entry path is not valid UTF-8".to_string()));
        };
        if name.is_empty() || name == "." {
            continue;
        }
        if name.starts_with('/') || name.starts_with("..") || name.contains("../") {
            return Err(ReasonedError::new(reason::INVALID_PATH, format!("unsafe entry path: {name}")));
        }

        let target = tmp_root.join(name);
        if target == tmp_root || !target.starts_with(tmp_root) {
            return Err(ReasonedError::new(reason::INVALID_PATH, format!("entry escapes rootfs: {name}")));
        }

        let mode = entry.header().mode().unwrap_or(0o644);
        let entry_type = entry.header().entry_type();

        if entry_type.is_dir() {
            std::fs::create_dir_all(&target)
                .map_err(|e| ReasonedError::new(reason::ARTIFACT_VERIFY_FAILED, format!("creating dir {name}: {e}")))?;
            set_unix_mode(&target, mode);
        } else if entry_type.is_file() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ReasonedError::new(reason::ARTIFACT_VERIFY_FAILED, format!("creating parent dirs for {name}: {e}")))?;
                set_unix_mode(parent, 0o755);
            }
            let mut file = std::fs::File::create(&target)
                .map_err(|e| ReasonedError::new(reason::ARTIFACT_VERIFY_FAILED, format!("creating file {name}: {e}")))?;
            let written = std::io::copy(&mut entry, &mut file)
                .map_err(|e| ReasonedError::new(reason::ARTIFACT_VERIFY_FAILED, format!("writing file {name}: {e}")))?;
            total_bytes += written;
            if total_bytes > max_extract_bytes {
                return Err(ReasonedError::new(reason::EXTRACT_LIMIT_EXCEEDED, format!("extracted size exceeds {max_extract_bytes} bytes")));
            }
            set_unix_mode(&target, mode);
        } else {
            return Err(ReasonedError::new(reason::UNSUPPORTED_ENTRY_TYPE, format!("unsupported entry type for {name}: {entry_type:?}")));
        }
    }

    Ok(total_bytes)
}

#[cfg(unix)]
fn set_unix_mode(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode));
}

#[cfg(not(unix))]
fn set_unix_mode(_path: &Path, _mode: u32) {}
