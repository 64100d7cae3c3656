pub mod alerts;
pub mod market_monitor;

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

pub use alerts::{Alert, AlertLevel, AlertSink, CollectingAlertSink, TracingAlertSink};
pub use market_monitor::{
    MarketConditions, MarketFeatures, MarketMonitor, MarketTrend, PriceCacheEntry, PriceData,
};

/// 실행 카운터
#[derive(Debug, Default)]
pub struct ExecutionStats {
    opportunities_received: AtomicU64,
    executions_started: AtomicU64,
    submitted: AtomicU64,
    abandoned: AtomicU64,
    safety_rejections: AtomicU64,
    retries: AtomicU64,
    confirmed: AtomicU64,
    reverted: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionStatsSnapshot {
    pub opportunities_received: u64,
    pub executions_started: u64,
    pub submitted: u64,
    pub abandoned: u64,
    pub safety_rejections: u64,
    pub retries: u64,
    pub confirmed: u64,
    pub reverted: u64,
    pub dropped: u64,
}

impl ExecutionStatsSnapshot {
    pub fn success_rate(&self) -> f64 {
        if self.executions_started == 0 {
            0.0
        } else {
            self.submitted as f64 / self.executions_started as f64
        }
    }
}

impl ExecutionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_opportunity(&self) {
        self.opportunities_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_started(&self) {
        self.executions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_abandoned(&self, safety_rejected: bool) {
        self.abandoned.fetch_add(1, Ordering::Relaxed);
        if safety_rejected {
            self.safety_rejections.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_receipt(&self, status: crate::types::TxStatus) {
        use crate::types::TxStatus;
        let counter = match status {
            TxStatus::Success => &self.confirmed,
            TxStatus::Reverted => &self.reverted,
            TxStatus::Dropped => &self.dropped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ExecutionStatsSnapshot {
        ExecutionStatsSnapshot {
            opportunities_received: self.opportunities_received.load(Ordering::Relaxed),
            executions_started: self.executions_started.load(Ordering::Relaxed),
            submitted: self.submitted.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            safety_rejections: self.safety_rejections.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            confirmed: self.confirmed.load(Ordering::Relaxed),
            reverted: self.reverted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TxStatus;

    #[test]
    fn test_execution_stats_snapshot() {
        let stats = ExecutionStats::new();
        stats.record_started();
        stats.record_started();
        stats.record_submitted();
        stats.record_abandoned(true);
        stats.record_receipt(TxStatus::Reverted);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.executions_started, 2);
        assert_eq!(snapshot.safety_rejections, 1);
        assert_eq!(snapshot.reverted, 1);
        assert!((snapshot.success_rate() - 0.5).abs() < f64::EPSILON);
    }
}
