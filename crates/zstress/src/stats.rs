use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Counters for one reporting period
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PeriodSnapshot {
    pub transactions: u64,
    pub min_gas_used: i64,
    pub max_gas_used: i64,
}

impl PeriodSnapshot {
    const fn empty() -> Self {
        // min starts at the largest value so the first observation always replaces it
        Self { transactions: 0, min_gas_used: i64::MAX, max_gas_used: 0 }
    }

    fn observe(&mut self, gas_used: i64) {
        self.transactions += 1;
        self.min_gas_used = self.min_gas_used.min(gas_used);
        self.max_gas_used = self.max_gas_used.max(gas_used);
    }

    /// Smallest gas seen, or 0 when nothing was broadcast
    pub const fn min_gas(&self) -> i64 {
        if self.transactions == 0 {
            0
        } else {
            self.min_gas_used
        }
    }

    pub fn rate(&self, period: Duration) -> f64 {
        let secs = period.as_secs_f64();
        if secs <= 0.0 {
            0.0
        } else {
            self.transactions as f64 / secs
        }
    }
}

/// Cumulative counters for the whole run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RunTotals {
    pub broadcasts: PeriodSnapshot,
    pub resyncs: u64,
    pub retries: u64,
}

#[derive(Debug)]
struct Counters {
    period: PeriodSnapshot,
    totals: RunTotals,
}

/// Statistics shared by every broadcasting task.
///
/// All updates go through one mutex and stay O(1) inside the lock.
#[derive(Debug)]
pub struct RunStatistics {
    counters: Mutex<Counters>,
}

impl Default for RunStatistics {
    fn default() -> Self {
        Self {
            counters: Mutex::new(Counters {
                period: PeriodSnapshot::empty(),
                totals: RunTotals { broadcasts: PeriodSnapshot::empty(), resyncs: 0, retries: 0 },
            }),
        }
    }
}

impl RunStatistics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, Counters> {
        // counters are plain integers, a panic mid-update cannot leave them unusable
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_success(&self, gas_used: i64) {
        let mut counters = self.lock();
        counters.period.observe(gas_used);
        counters.totals.broadcasts.observe(gas_used);
    }

    pub fn record_resync(&self) {
        self.lock().totals.resyncs += 1;
    }

    pub fn record_retry(&self) {
        self.lock().totals.retries += 1;
    }

    /// Returns the current period's counters and starts a new period.
    pub fn take_period(&self) -> PeriodSnapshot {
        std::mem::replace(&mut self.lock().period, PeriodSnapshot::empty())
    }

    pub fn totals(&self) -> RunTotals {
        self.lock().totals
    }
}

/// Logs throughput every `period` until cancelled.
pub async fn run_stats_reporter(
    stats: Arc<RunStatistics>,
    period: Duration,
    cancel: CancellationToken,
) {
    let start = tokio::time::Instant::now() + period;
    let mut interval = tokio::time::interval_at(start, period);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let snapshot = stats.take_period();
                log_period(&snapshot, period);
            }
        }
    }
}

fn log_period(snapshot: &PeriodSnapshot, period: Duration) {
    info!(
        transactions = snapshot.transactions,
        tps = format!("{:.1}", snapshot.rate(period)),
        min_gas_used = snapshot.min_gas(),
        max_gas_used = snapshot.max_gas_used,
        "Progress"
    );
}

pub fn log_final_report(totals: &RunTotals, elapsed: Duration) {
    info!(
        broadcasts = totals.broadcasts.transactions,
        resyncs = totals.resyncs,
        retries = totals.retries,
        elapsed_secs = format!("{:.1}", elapsed.as_secs_f64()),
        tps = format!("{:.1}", totals.broadcasts.rate(elapsed)),
        min_gas_used = totals.broadcasts.min_gas(),
        max_gas_used = totals.broadcasts.max_gas_used,
        "Stress run finished"
    );
}
