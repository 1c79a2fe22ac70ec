//! 📊 Sink statistics: lock-free counters the workers bump and the summary reads.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
struct WorkerCounters {
    // taken off the batch channel, not yet settled
    queued: AtomicU64,
    batches: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

/// 📊 Shared by the handle, the batcher and every worker of one sink.
#[derive(Debug)]
pub struct SinkStatistics {
    submitted: AtomicU64,
    workers: Vec<WorkerCounters>,
    // 🧹 failures nobody's worker owns (e.g. a batch that never reached a worker)
    orphaned_failures: AtomicU64,
}

/// 📸 A point-in-time copy. Counters are read one by one, so under load a snapshot can be
/// a few records behind itself; after `close` it is exact.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SinkStatisticsSnapshot {
    pub submitted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub batches: u64,
    pub per_worker: Vec<WorkerSnapshot>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerSnapshot {
    /// Records this worker has taken and not yet settled.
    pub queued: u64,
    pub batches: u64,
    pub succeeded: u64,
    pub failed: u64,
}

impl SinkStatisticsSnapshot {
    /// ⏳ Submitted but not yet attempted.
    pub fn in_flight(&self) -> u64 {
        self.submitted.saturating_sub(self.succeeded + self.failed)
    }
}

impl SinkStatistics {
    pub fn new(workers: usize) -> Self {
        Self {
            submitted: AtomicU64::new(0),
            workers: (0..workers).map(|_| WorkerCounters::default()).collect(),
            orphaned_failures: AtomicU64::new(0),
        }
    }

    pub(crate) fn record_submitted(&self, n: u64) {
        self.submitted.fetch_add(n, Ordering::Relaxed);
    }

    /// 📥 `worker` picked a batch of `n` records off the channel.
    pub(crate) fn record_taken(&self, worker: usize, n: u64) {
        if let Some(counters) = self.workers.get(worker) {
            counters.queued.fetch_add(n, Ordering::Relaxed);
        }
    }

    /// 📝 One batch attempt finished on `worker` (or on no worker at all).
    pub(crate) fn record_batch(&self, worker: Option<usize>, succeeded: u64, failed: u64) {
        match worker.and_then(|index| self.workers.get(index)) {
            Some(counters) => {
                let settled = succeeded + failed;
                let _ = counters
                    .queued
                    .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |queued| {
                        Some(queued.saturating_sub(settled))
                    });
                counters.batches.fetch_add(1, Ordering::Relaxed);
                counters.succeeded.fetch_add(succeeded, Ordering::Relaxed);
                counters.failed.fetch_add(failed, Ordering::Relaxed);
            }
            None => {
                self.orphaned_failures
                    .fetch_add(succeeded + failed, Ordering::Relaxed);
            }
        }
    }

    pub fn snapshot(&self) -> SinkStatisticsSnapshot {
        let per_worker: Vec<WorkerSnapshot> = self
            .workers
            .iter()
            .map(|counters| WorkerSnapshot {
                queued: counters.queued.load(Ordering::Relaxed),
                batches: counters.batches.load(Ordering::Relaxed),
                succeeded: counters.succeeded.load(Ordering::Relaxed),
                failed: counters.failed.load(Ordering::Relaxed),
            })
            .collect();
        SinkStatisticsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            succeeded: per_worker.iter().map(|w| w.succeeded).sum(),
            failed: per_worker.iter().map(|w| w.failed).sum::<u64>()
                + self.orphaned_failures.load(Ordering::Relaxed),
            batches: per_worker.iter().map(|w| w.batches).sum(),
            per_worker,
        }
    }
}
