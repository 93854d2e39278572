//! Shared condition algebra (spec.md §4.4). The same `set_condition` is used
//! by the controller's deployment status aggregation and the gateway's
//! per-process status projection, so both sides stay monotonic the same way.

use crate::crd::{Condition, ConditionStatus};
use chrono::{SecondsFormat, Utc};

/// Current time as RFC3339, the timestamp format used for
/// `lastTransitionTime` and every wire timestamp in spec.md §6.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Find-or-insert `type_` in `conditions`, overwriting status/reason/message.
/// `lastTransitionTime` is only stamped with `now` when `status` actually
/// changed; otherwise the prior transition time is preserved. Returns `true`
/// if the condition's `(status, reason, message)` tuple changed — the signal
/// spec.md §4.2 uses to decide whether to emit an event.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: ConditionStatus,
    reason: &str,
    message: &str,
    now: &str,
) -> bool {
    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == type_) {
        let changed =
            existing.status != status || existing.reason != reason || existing.message != message;
        if existing.status != status {
            existing.last_transition_time = now.to_string();
        }
        existing.status = status;
        existing.reason = reason.to_string();
        existing.message = message.to_string();
        changed
    } else {
        conditions.push(Condition {
            type_: type_.to_string(),
            status,
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: now.to_string(),
        });
        true
    }
}

pub fn mark_true(conditions: &mut Vec<Condition>, type_: &str, reason: &str, message: &str, now: &str) -> bool {
    set_condition(conditions, type_, ConditionStatus::True, reason, message, now)
}

pub fn mark_false(conditions: &mut Vec<Condition>, type_: &str, reason: &str, message: &str, now: &str) -> bool {
    set_condition(conditions, type_, ConditionStatus::False, reason, message, now)
}

pub fn find(conditions: &[Condition], type_: &str) -> Option<&Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

pub fn is_true(conditions: &[Condition], type_: &str) -> bool {
    matches!(find(conditions, type_), Some(c) if c.status == ConditionStatus::True)
}

/// Condition type name constants (spec.md §4.4).
pub mod types {
    pub const AGENT_CONNECTED: &str = "AgentConnected";
    pub const SPEC_OBSERVED: &str = "SpecObserved";
    pub const SPEC_WARNING: &str = "SpecWarning";
    pub const ARTIFACT_DOWNLOADED: &str = "ArtifactDownloaded";
    pub const ARTIFACT_VERIFIED: &str = "ArtifactVerified";
    pub const PROCESS_STARTED: &str = "ProcessStarted";
    pub const HEALTHY: &str = "Healthy";
    pub const AVAILABLE: &str = "Available";
    pub const PROGRESSING: &str = "Progressing";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_condition_is_inserted() {
        let mut conditions = Vec::new();
        let changed = mark_true(&mut conditions, "Healthy", "Probe", "ok", "t0");
        assert!(changed);
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].last_transition_time, "t0");
    }

    #[test]
    fn transition_time_stable_when_status_unchanged() {
        let mut conditions = Vec::new();
        mark_true(&mut conditions, "Healthy", "Probe", "ok", "t0");
        let changed = mark_true(&mut conditions, "Healthy", "Probe", "ok", "t1");
        assert!(!changed);
        assert_eq!(conditions[0].last_transition_time, "t0");
    }

    #[test]
    fn reason_change_without_status_change_preserves_transition_time() {
        let mut conditions = Vec::new();
        mark_true(&mut conditions, "Healthy", "Probe", "ok", "t0");
        let changed = mark_true(&mut conditions, "Healthy", "ProbeAgain", "still ok", "t1");
        assert!(changed);
        assert_eq!(conditions[0].last_transition_time, "t0");
        assert_eq!(conditions[0].reason, "ProbeAgain");
    }

    #[test]
    fn status_change_stamps_new_transition_time() {
        let mut conditions = Vec::new();
        mark_true(&mut conditions, "Healthy", "Probe", "ok", "t0");
        let changed = mark_false(&mut conditions, "Healthy", "ProbeFailed", "no", "t1");
        assert!(changed);
        assert_eq!(conditions[0].last_transition_time, "t1");
    }

    #[test]
    fn at_most_one_condition_per_type() {
        let mut conditions = Vec::new();
        mark_true(&mut conditions, "Healthy", "a", "a", "t0");
        mark_true(&mut conditions, "Healthy", "b", "b", "t1");
        mark_true(&mut conditions, "AgentConnected", "c", "c", "t2");
        assert_eq!(conditions.len(), 2);
    }
}
