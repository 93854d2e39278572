//! In-memory liveness map (spec.md §4.2 "Liveness accounting", §5
//! "Concurrency" — shared across handlers behind one reader/writer lock).

use std::collections::BTreeMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Default)]
pub struct DeviceLiveness {
    pub last_seen: Option<DateTime<Utc>>,
    pub last_report: Option<DateTime<Utc>>,
    pub heartbeat_hint_seconds: Option<u64>,
}

#[derive(Default)]
pub struct LivenessMap {
    inner: RwLock<BTreeMap<String, DeviceLiveness>>,
}

impl LivenessMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// A report POST always proves liveness and resets the staleness clock.
    pub fn record_report(&self, device: &str, now: DateTime<Utc>) {
        let mut map = self.inner.write().expect("liveness lock poisoned");
        let entry = map.entry(device.to_string()).or_default();
        entry.last_report = Some(now);
        entry.last_seen = Some(now);
    }

    /// `POST /connect`: best-effort "I am alive now", independent of whether
    /// the device has ever reported.
    pub fn record_connect(&self, device: &str, now: DateTime<Utc>) {
        let mut map = self.inner.write().expect("liveness lock poisoned");
        map.entry(device.to_string()).or_default().last_seen = Some(now);
    }

    /// A desired GET only counts as a heartbeat if the device has posted a
    /// report within `effective_heartbeat * stale_multiplier` — reading
    /// desired state proves nothing about whether the agent is actually
    /// converging (spec.md §4.2 rationale).
    pub fn note_desired_fetch(
        &self,
        device: &str,
        now: DateTime<Utc>,
        effective_heartbeat_seconds: u64,
        stale_multiplier: u64,
    ) {
        let mut map = self.inner.write().expect("liveness lock poisoned");
        let entry = map.entry(device.to_string()).or_default();
        let Some(last_report) = entry.last_report else {
            return;
        };
        let stale_after = chrono::Duration::seconds(
            (effective_heartbeat_seconds * stale_multiplier) as i64,
        );
        if now - last_report <= stale_after {
            entry.last_seen = Some(now);
        }
    }

    pub fn set_heartbeat_hint(&self, device: &str, seconds: u64) {
        let mut map = self.inner.write().expect("liveness lock poisoned");
        map.entry(device.to_string()).or_default().heartbeat_hint_seconds = Some(seconds);
    }

    pub fn heartbeat_hint(&self, device: &str, default_seconds: u64) -> u64 {
        let map = self.inner.read().expect("liveness lock poisoned");
        map.get(device)
            .and_then(|d| d.heartbeat_hint_seconds)
            .unwrap_or(default_seconds)
    }

    /// A read snapshot for the staleness loop: take the lock once, copy out,
    /// release, then perform writes elsewhere (spec.md §4.2 "Concurrency").
    pub fn snapshot(&self) -> Vec<(String, DeviceLiveness)> {
        let map = self.inner.read().expect("liveness lock poisoned");
        map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }
}

/// Is `device` stale as of `now`, given its liveness entry and the gateway's
/// configured defaults? Pure so the staleness loop's decision is testable
/// without a clock or lock.
pub fn is_stale(
    liveness: &DeviceLiveness,
    now: DateTime<Utc>,
    default_heartbeat_seconds: u64,
    stale_multiplier: u64,
) -> bool {
    let Some(last_seen) = liveness.last_seen else {
        return true;
    };
    let effective_heartbeat = liveness.heartbeat_hint_seconds.unwrap_or(default_heartbeat_seconds);
    let stale_after = chrono::Duration::seconds((effective_heartbeat * stale_multiplier) as i64);
    now - last_seen > stale_after
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(seconds_offset: i64) -> DateTime<Utc> {
        DateTime::UNIX_EPOCH + chrono::Duration::seconds(seconds_offset)
    }

    #[test]
    fn report_sets_both_last_seen_and_last_report() {
        let map = LivenessMap::new();
        map.record_report("tor1-01", t(100));
        let snap = map.snapshot();
        let (_, liveness) = snap.iter().find(|(d, _)| d == "tor1-01").unwrap();
        assert_eq!(liveness.last_seen, Some(t(100)));
        assert_eq!(liveness.last_report, Some(t(100)));
    }

    #[test]
    fn connect_sets_only_last_seen() {
        let map = LivenessMap::new();
        map.record_connect("tor1-01", t(100));
        let snap = map.snapshot();
        let (_, liveness) = snap.iter().find(|(d, _)| d == "tor1-01").unwrap();
        assert_eq!(liveness.last_seen, Some(t(100)));
        assert_eq!(liveness.last_report, None);
    }

    #[test]
    fn desired_fetch_counts_as_heartbeat_only_within_window() {
        let map = LivenessMap::new();
        map.record_report("tor1-01", t(0));
        map.note_desired_fetch("tor1-01", t(10), 15, 3);
        let snap = map.snapshot();
        let (_, liveness) = snap.iter().find(|(d, _)| d == "tor1-01").unwrap();
        assert_eq!(liveness.last_seen, Some(t(10)));
    }

    #[test]
    fn desired_fetch_outside_window_does_not_prove_liveness() {
        let map = LivenessMap::new();
        map.record_report("tor1-01", t(0));
        map.note_desired_fetch("tor1-01", t(1000), 15, 3);
        let snap = map.snapshot();
        let (_, liveness) = snap.iter().find(|(d, _)| d == "tor1-01").unwrap();
        assert_eq!(liveness.last_seen, Some(t(0)));
    }

    #[test]
    fn never_seen_device_is_stale() {
        let liveness = DeviceLiveness::default();
        assert!(is_stale(&liveness, t(100), 15, 3));
    }

    #[test]
    fn device_within_stale_window_is_not_stale() {
        let liveness = DeviceLiveness { last_seen: Some(t(0)), last_report: None, heartbeat_hint_seconds: None };
        assert!(!is_stale(&liveness, t(44), 15, 3));
        assert!(is_stale(&liveness, t(46), 15, 3));
    }

    #[test]
    fn per_device_heartbeat_hint_overrides_default() {
        let liveness = DeviceLiveness { last_seen: Some(t(0)), last_report: None, heartbeat_hint_seconds: Some(5) };
        assert!(is_stale(&liveness, t(20), 15, 3));
    }
}
