use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Bridge-wide counters, updated by every dispatch.
#[derive(Debug, Default)]
pub struct BridgeMetrics {
    pub requests: AtomicU64,
    pub errors: AtomicU64,
    pub allocations: AtomicU64,
    pub failed_allocations: AtomicU64,
    pub frees: AtomicU64,
    pub delegated: AtomicU64,
}

/// Point-in-time copy of [`BridgeMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub requests: u64,
    pub errors: u64,
    pub allocations: u64,
    pub failed_allocations: u64,
    pub frees: u64,
    pub delegated: u64,
}

impl BridgeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            allocations: self.allocations.load(Ordering::Relaxed),
            failed_allocations: self.failed_allocations.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
            delegated: self.delegated.load(Ordering::Relaxed),
        }
    }
}
