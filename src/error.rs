//! Tagged errors carried end-to-end: from an agent-side failure, through an
//! observation, into a gateway-written condition reason/message pair
//! (spec.md §9, "Exceptions / error returns").

/// A `{reason, message}` pair. `reason` is a short stable tag (e.g.
/// `DigestMismatch`, `InvalidPath`) the gateway and agent both use verbatim
/// as a condition `reason` or observation field; `message` is free text for
/// humans.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("{reason}: {message}")]
pub struct ReasonedError {
    pub reason: &'static str,
    pub message: String,
}

impl ReasonedError {
    pub fn new(reason: &'static str, message: impl Into<String>) -> Self {
        ReasonedError {
            reason,
            message: message.into(),
        }
    }
}

/// Well-known reason tags used verbatim across the OCI ensure procedure,
/// render/validation, and gateway report ingestion (spec.md §7, §9).
pub mod reason {
    pub const DIGEST_MISMATCH: &str = "DigestMismatch";
    pub const INVALID_PATH: &str = "InvalidPath";
    pub const UNSUPPORTED_ENTRY_TYPE: &str = "UnsupportedEntryType";
    pub const EXTRACT_LIMIT_EXCEEDED: &str = "ExtractLimitExceeded";
    pub const UNSUPPORTED_ARTIFACT: &str = "UnsupportedArtifact";
    pub const ARTIFACT_VERIFY_FAILED: &str = "ArtifactVerifyFailed";
    pub const UNPINNED_REFERENCE: &str = "UnpinnedReference";
    pub const RECONCILE_ERROR: &str = "ReconcileError";
    pub const PROCESS_NOT_STARTED: &str = "ProcessNotStarted";
    pub const AGENT_CONNECTED: &str = "AgentConnected";
    pub const AGENT_DISCONNECTED: &str = "AgentDisconnected";
    pub const SPEC_OBSERVED: &str = "SpecObserved";
    pub const NOT_APPLICABLE: &str = "NotApplicable";
    pub const PROCESS_OBSERVED_RUNNING: &str = "ProcessObservedRunning";
    pub const SPEC_WARNING: &str = "SpecWarning";
    pub const HEALTHY: &str = "HealthCheckPassed";
    pub const UNHEALTHY: &str = "HealthCheckFailed";
    pub const ARTIFACT_OK: &str = "Ready";
}
