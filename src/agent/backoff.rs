//! Jittered exponential backoff (spec.md §4.3 main loop, §4.3a OCI download
//! retry, §5 "Backpressure"). Two distinct schedules: the main loop's
//! transport backoff doubles per failure up to a cap with small additive
//! jitter; the OCI download retry grows per attempt with jitter up to half
//! the un-jittered value, both capped at the same global maximum.

use std::time::Duration;

/// Global backoff ceiling shared by the main loop and the OCI download retry
/// (spec.md §5 "agent uses jittered exponential backoff (base 2s → cap 30s)").
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

const TRANSPORT_BASE: Duration = Duration::from_secs(2);
const TRANSPORT_MAX_JITTER_MS: u64 = 250;

const OCI_BASE: Duration = Duration::from_secs(1);

/// Main-loop transport backoff: `min(base * 2^failures, cap) + jitter(0..=250ms)`.
pub fn transport_backoff(consecutive_failures: u32) -> Duration {
    let base_ms = TRANSPORT_BASE.as_millis() as u64;
    let pow = if consecutive_failures >= 63 { u64::MAX } else { 1u64 << consecutive_failures };
    let doubled_ms = base_ms.saturating_mul(pow).min(MAX_BACKOFF.as_millis() as u64);
    let jitter_ms = rand::random_range(0..=TRANSPORT_MAX_JITTER_MS);
    Duration::from_millis(doubled_ms.saturating_add(jitter_ms))
}

/// OCI download retry backoff: `1s * 2^attempt + jitter(0..=base/2)`, capped
/// at [`MAX_BACKOFF`] overall (spec.md §4.3a "Download").
pub fn oci_retry_backoff(attempt: u32) -> Duration {
    let base_ms = OCI_BASE.as_millis() as u64;
    let pow = if attempt >= 63 { u64::MAX } else { 1u64 << attempt };
    let exp_ms = base_ms.saturating_mul(pow);
    let jitter_cap = exp_ms / 2;
    let jitter_ms = if jitter_cap == 0 { 0 } else { rand::random_range(0..=jitter_cap) };
    let total_ms = exp_ms.saturating_add(jitter_ms).min(MAX_BACKOFF.as_millis() as u64);
    Duration::from_millis(total_ms)
}
