/// Diagnostic counters for the data plane
///
/// Updated lock-free from the pump; read by diagnostic consumers.
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct EngineStats {
    pub queries_blocked: AtomicU64,
    pub queries_forwarded: AtomicU64,
    pub responses_relayed: AtomicU64,
    pub parse_failures: AtomicU64,
    pub non_dns_dropped: AtomicU64,
    pub ipv6_dropped: AtomicU64,
    pub queries_timed_out: AtomicU64,
    pub tracker_evictions: AtomicU64,
    pub upstream_send_failures: AtomicU64,
    pub tunnel_write_drops: AtomicU64,
    pub unmatched_responses: AtomicU64,
}

impl EngineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            queries_blocked: self.queries_blocked.load(Ordering::Relaxed),
            queries_forwarded: self.queries_forwarded.load(Ordering::Relaxed),
            responses_relayed: self.responses_relayed.load(Ordering::Relaxed),
            parse_failures: self.parse_failures.load(Ordering::Relaxed),
            non_dns_dropped: self.non_dns_dropped.load(Ordering::Relaxed),
            ipv6_dropped: self.ipv6_dropped.load(Ordering::Relaxed),
            queries_timed_out: self.queries_timed_out.load(Ordering::Relaxed),
            tracker_evictions: self.tracker_evictions.load(Ordering::Relaxed),
            upstream_send_failures: self.upstream_send_failures.load(Ordering::Relaxed),
            tunnel_write_drops: self.tunnel_write_drops.load(Ordering::Relaxed),
            unmatched_responses: self.unmatched_responses.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub queries_blocked: u64,
    pub queries_forwarded: u64,
    pub responses_relayed: u64,
    pub parse_failures: u64,
    pub non_dns_dropped: u64,
    pub ipv6_dropped: u64,
    pub queries_timed_out: u64,
    pub tracker_evictions: u64,
    pub upstream_send_failures: u64,
    pub tunnel_write_drops: u64,
    pub unmatched_responses: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let stats = EngineStats::new();
        stats.queries_blocked.fetch_add(1, Ordering::Relaxed);
        stats.queries_blocked.fetch_add(1, Ordering::Relaxed);
        stats.parse_failures.fetch_add(1, Ordering::Relaxed);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.queries_blocked, 2);
        assert_eq!(snapshot.parse_failures, 1);
        assert_eq!(snapshot.queries_forwarded, 0);
    }
}
