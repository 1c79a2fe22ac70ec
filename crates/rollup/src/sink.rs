//! 🚰 The Concurrent Bulk Sink: accepts records one at a time, writes them in batches,
//! with several bulk requests in flight at once.
//!
//! 🧠 Knowledge graph:
//! - [`SinkHandle::submit`] registers the record with the [`DrainBarrier`] *before* queueing it,
//!   so the barrier can never read zero while a record is on its way.
//! - A `BatchWorker` groups records into batches (by count, by age, or on [`SinkHandle::flush`]).
//! - `SinkWorker`s pull batches off an MPMC channel and call [`DocumentStore::bulk_upsert`].
//! - Every attempted record is settled exactly once, success or failure. Failed items go to the
//!   failure callback and the counters; they are never retried and never block the drain.
//!
//! The producer never waits on a write. It waits only when the queue is full, and at the
//! end, on the drain barrier.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Result, bail};
use async_channel::Sender;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::app_config::RuntimeConfig;
use crate::backends::{CommonSinkConfig, DocumentStore};
use crate::common::{BulkItemFailure, OutputRecord};
use crate::drain::DrainBarrier;

pub mod stats;
mod workers;

pub use stats::{SinkStatistics, SinkStatisticsSnapshot, WorkerSnapshot};
use workers::{BatchWorker, SinkWorker, Worker};

/// 📞 Called once per record the store refused. Runs on a sink worker; keep it quick.
pub type FailureCallback = Arc<dyn Fn(&BulkItemFailure) + Send + Sync>;

/// 📞 The default callback: one `warn!` per failed record, with everything the store said.
pub fn log_failure() -> FailureCallback {
    Arc::new(|failure: &BulkItemFailure| {
        warn!(
            collection = %failure.collection,
            id = %failure.id,
            status = failure.status,
            "💀 bulk item failed: {}",
            failure.error
        );
    })
}

/// ⚙️ How one sink batches and how many writers it runs.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkSinkConfig {
    pub workers: usize,
    pub bulk_actions: usize,
    pub flush_interval: Duration,
    pub channel_capacity: usize,
}

impl BulkSinkConfig {
    pub fn from_configs(runtime: &RuntimeConfig, common: &CommonSinkConfig) -> Self {
        Self {
            workers: runtime.sink_workers,
            bulk_actions: common.bulk_actions,
            flush_interval: common.flush_interval(),
            channel_capacity: runtime.queue_capacity,
        }
    }
}

impl Default for BulkSinkConfig {
    fn default() -> Self {
        Self::from_configs(&RuntimeConfig::default(), &CommonSinkConfig::default())
    }
}

pub(crate) enum SinkMessage {
    Record(OutputRecord),
    Flush,
}

impl std::fmt::Debug for SinkMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SinkMessage::Record(record) => write!(f, "Record({})", record.id),
            SinkMessage::Flush => write!(f, "Flush"),
        }
    }
}

/// 📒 Where every finished write attempt is written down: counters, callback, barrier.
pub(crate) struct Ledger {
    stats: Arc<SinkStatistics>,
    drain: DrainBarrier,
    on_failure: FailureCallback,
    callback_panics: AtomicU64,
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("stats", &self.stats)
            .field("drain", &self.drain)
            .finish_non_exhaustive()
    }
}

impl Ledger {
    /// 📝 `attempted` records finished; `failures` are the ones that didn't make it.
    ///
    /// A panicking callback is caught and counted; the records still settle.
    pub(crate) fn account(&self, worker: Option<usize>, attempted: usize, failures: &[BulkItemFailure]) {
        for failure in failures {
            if panic::catch_unwind(AssertUnwindSafe(|| (self.on_failure)(failure))).is_err() {
                self.callback_panics.fetch_add(1, Ordering::Relaxed);
                error!("💀 the failure callback panicked on '{}' in '{}'", failure.id, failure.collection);
            }
        }
        let failed = failures.len().min(attempted) as u64;
        let succeeded = attempted as u64 - failed;
        self.stats.record_batch(worker, succeeded, failed);
        self.drain.settle(attempted as u64);
    }

    /// 🧹 `records` left a worker without ever being attempted. They count as failed.
    pub(crate) fn abandon(&self, worker: Option<usize>, records: usize) {
        self.stats.record_batch(worker, 0, records as u64);
        self.drain.settle(records as u64);
    }

    pub(crate) fn stats(&self) -> &SinkStatistics {
        &self.stats
    }
}

/// 🚰 A running sink. Submit, flush, wait, close.
#[derive(Debug)]
pub struct SinkHandle {
    tx: Sender<SinkMessage>,
    stats: Arc<SinkStatistics>,
    drain: DrainBarrier,
    ledger: Arc<Ledger>,
    batcher: JoinHandle<Result<()>>,
    workers: Vec<JoinHandle<Result<()>>>,
}

impl SinkHandle {
    /// 🚀 Spawn the batcher and `config.workers` writers against `store`.
    pub fn start<S>(store: Arc<S>, config: BulkSinkConfig, on_failure: FailureCallback) -> Self
    where
        S: DocumentStore + ?Sized + 'static,
    {
        let workers = config.workers.max(1);
        let stats = Arc::new(SinkStatistics::new(workers));
        let drain = DrainBarrier::new();
        let ledger = Arc::new(Ledger {
            stats: Arc::clone(&stats),
            drain: drain.clone(),
            on_failure,
            callback_panics: AtomicU64::new(0),
        });

        let (tx, rx) = async_channel::bounded(config.channel_capacity.max(1));
        // 🧮 one queued batch per writer keeps everyone busy without hoarding records
        let (batches_tx, batches_rx) = async_channel::bounded(workers);

        let batcher = BatchWorker::new(
            rx,
            batches_tx,
            config.bulk_actions,
            config.flush_interval,
            Arc::clone(&ledger),
        )
        .start();
        let workers = (0..workers)
            .map(|id| SinkWorker::new(id, batches_rx.clone(), Arc::clone(&store), Arc::clone(&ledger)).start())
            .collect();

        debug!("🚰 sink started: {:?}", config);
        Self {
            tx,
            stats,
            drain,
            ledger,
            batcher,
            workers,
        }
    }

    /// 📨 Hand one record to the sink. Waits only if the queue is full.
    pub async fn submit(&self, record: OutputRecord) -> Result<()> {
        self.drain.register(1);
        self.stats.record_submitted(1);
        if self.tx.send(SinkMessage::Record(record)).await.is_err() {
            self.drain.settle(1);
            bail!("💀 The sink's batcher is gone. This record has nowhere to go.");
        }
        Ok(())
    }

    /// 🚽 Ship the partial batch now instead of waiting for the interval.
    pub async fn flush(&self) -> Result<()> {
        self.tx
            .send(SinkMessage::Flush)
            .await
            .map_err(|_| anyhow::anyhow!("💀 Asked a closed sink to flush. It politely declined."))
    }

    pub fn drain_barrier(&self) -> DrainBarrier {
        self.drain.clone()
    }

    pub fn stats(&self) -> SinkStatisticsSnapshot {
        self.stats.snapshot()
    }

    /// 🏁 Flush, wait for every write, stop every task, return the final counters.
    ///
    /// Every task is joined even when one of them failed. A worker that died or a failure
    /// callback that panicked makes this an `Err`, so the partition is reported as failed.
    pub async fn close(self) -> Result<SinkStatisticsSnapshot> {
        self.tx.close();
        let mut problems = Vec::new();
        match self.batcher.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => problems.push(format!("{err:#}")),
            Err(join_error) => problems.push(format!("the batcher task died: {join_error}")),
        }
        for (id, worker) in self.workers.into_iter().enumerate() {
            match worker.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => problems.push(format!("sink worker {id}: {err:#}")),
                Err(join_error) => problems.push(format!("sink worker {id} died: {join_error}")),
            }
        }
        let callback_panics = self.ledger.callback_panics.load(Ordering::Relaxed);
        if callback_panics > 0 {
            problems.push(format!("the failure callback panicked {callback_panics} times"));
        }
        if !problems.is_empty() {
            bail!("💀 The sink shut down unhealthy: {}", problems.join("; "));
        }
        Ok(self.stats.snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::in_mem::InMemoryStore;
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::sync::Mutex;

    /// 💣 A store whose every write blows up mid-request.
    #[derive(Debug)]
    struct ExplodingStore;

    #[async_trait]
    impl DocumentStore for ExplodingStore {
        async fn bulk_upsert(&self, _batch: &[OutputRecord]) -> Result<Vec<BulkItemFailure>> {
            panic!("the bulk write exploded");
        }

        async fn ensure_collection(&self, _collection: &str, _mapping: Option<&Value>) -> Result<()> {
            Ok(())
        }
    }

    fn a_record(id: usize) -> OutputRecord {
        OutputRecord {
            id: format!("2020_1_{id}"),
            collection: "air_carrier_flight_report".to_string(),
            fields: json!({"n": id}).as_object().cloned().unwrap_or_default(),
        }
    }

    fn a_config(workers: usize, bulk_actions: usize) -> BulkSinkConfig {
        BulkSinkConfig {
            workers,
            bulk_actions,
            flush_interval: Duration::from_secs(60),
            channel_capacity: 16,
        }
    }

    fn collecting() -> (FailureCallback, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let callback: FailureCallback = Arc::new(move |failure: &BulkItemFailure| {
            sink_seen.lock().expect("💀 poisoned").push(failure.id.clone());
        });
        (callback, seen)
    }

    #[tokio::test]
    async fn the_one_where_every_record_lands_in_small_batches() -> Result<()> {
        let store = Arc::new(InMemoryStore::new());
        let sink = SinkHandle::start(Arc::clone(&store), a_config(4, 3), log_failure());
        for id in 0..10 {
            sink.submit(a_record(id)).await?;
        }
        sink.flush().await?;
        sink.drain_barrier().wait_until_drained().await;

        let stats = sink.close().await?;
        assert_eq!(stats.submitted, 10);
        assert_eq!(stats.succeeded, 10);
        assert_eq!(stats.failed, 0);
        assert_eq!(store.ids("air_carrier_flight_report").await.len(), 10);
        assert!(store.batch_sizes().await.iter().all(|size| *size <= 3));
        assert_eq!(stats.per_worker.iter().map(|w| w.succeeded).sum::<u64>(), 10);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_refused_records_are_reported_and_still_drain() -> Result<()> {
        let store = Arc::new(InMemoryStore::new().failing_ids(["2020_1_2", "2020_1_5"]));
        let (callback, seen) = collecting();
        let sink = SinkHandle::start(Arc::clone(&store), a_config(2, 4), callback);
        for id in 0..8 {
            sink.submit(a_record(id)).await?;
        }
        sink.flush().await?;
        tokio::time::timeout(Duration::from_secs(5), sink.drain_barrier().wait_until_drained())
            .await
            .expect("💀 failures must count as settled, or the drain never opens");

        let stats = sink.close().await?;
        assert_eq!(stats.succeeded, 6);
        assert_eq!(stats.failed, 2);
        let mut failed = seen.lock().expect("💀 poisoned").clone();
        failed.sort();
        assert_eq!(failed, vec!["2020_1_2", "2020_1_5"]);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_dead_network_fails_everything_but_blocks_nothing() -> Result<()> {
        let store = Arc::new(InMemoryStore::new().with_transport_failure());
        let (callback, seen) = collecting();
        let sink = SinkHandle::start(store, a_config(3, 2), callback);
        for id in 0..5 {
            sink.submit(a_record(id)).await?;
        }
        sink.flush().await?;
        tokio::time::timeout(Duration::from_secs(5), sink.drain_barrier().wait_until_drained())
            .await
            .expect("💀 a transport error is still an attempt");

        let stats = sink.close().await?;
        assert_eq!(stats.failed, 5);
        assert_eq!(stats.succeeded, 0);
        assert_eq!(seen.lock().expect("💀 poisoned").len(), 5);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_the_flush_interval_ships_a_lonely_record() -> Result<()> {
        let store = Arc::new(InMemoryStore::new());
        let config = BulkSinkConfig {
            flush_interval: Duration::from_millis(50),
            ..a_config(1, 1000)
        };
        let sink = SinkHandle::start(Arc::clone(&store), config, log_failure());
        sink.submit(a_record(1)).await?;
        tokio::time::timeout(Duration::from_secs(5), sink.drain_barrier().wait_until_drained())
            .await
            .expect("💀 the ticker should have shipped the partial batch without a flush");
        assert_eq!(store.ids("air_carrier_flight_report").await.len(), 1);
        sink.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_close_ships_the_leftovers() -> Result<()> {
        let store = Arc::new(InMemoryStore::new());
        let sink = SinkHandle::start(Arc::clone(&store), a_config(2, 1000), log_failure());
        for id in 0..7 {
            sink.submit(a_record(id)).await?;
        }
        let stats = sink.close().await?;
        assert_eq!(stats.succeeded, 7);
        assert_eq!(stats.in_flight(), 0);
        assert_eq!(store.batch_sizes().await, vec![7]);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_the_store_panics_and_the_drain_still_opens() -> Result<()> {
        let (callback, seen) = collecting();
        let sink = SinkHandle::start(Arc::new(ExplodingStore), a_config(2, 2), callback);
        for id in 0..5 {
            sink.submit(a_record(id)).await?;
        }
        sink.flush().await?;
        tokio::time::timeout(Duration::from_secs(5), sink.drain_barrier().wait_until_drained())
            .await
            .expect("💀 a panicking write must still settle its batch");

        let stats = sink.close().await?;
        assert_eq!(stats.failed, 5);
        assert_eq!(stats.succeeded, 0);
        assert_eq!(stats.in_flight(), 0);
        assert_eq!(seen.lock().expect("💀 poisoned").len(), 5);
        assert_eq!(stats.per_worker.iter().map(|w| w.queued).sum::<u64>(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_panicking_callback_settles_the_batch_but_fails_the_close() -> Result<()> {
        let store = Arc::new(InMemoryStore::new().failing_ids(["2020_1_1"]));
        let callback: FailureCallback = Arc::new(|_: &BulkItemFailure| panic!("callback blew up"));
        let sink = SinkHandle::start(Arc::clone(&store), a_config(2, 2), callback);
        for id in 0..4 {
            sink.submit(a_record(id)).await?;
        }
        sink.flush().await?;
        tokio::time::timeout(Duration::from_secs(5), sink.drain_barrier().wait_until_drained())
            .await
            .expect("💀 a panicking callback must not strand the drain");
        assert_eq!(sink.stats().succeeded, 3);
        assert_eq!(sink.stats().failed, 1);

        let closed = sink.close().await;
        let err = closed.expect_err("💀 a panicked callback should surface at close");
        assert!(format!("{err:#}").contains("panicked 1 times"));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn the_one_where_a_full_batch_restarts_the_flush_clock() -> Result<()> {
        let store = Arc::new(InMemoryStore::new());
        let config = BulkSinkConfig {
            flush_interval: Duration::from_secs(1),
            ..a_config(1, 2)
        };
        let sink = SinkHandle::start(Arc::clone(&store), config, log_failure());

        tokio::time::sleep(Duration::from_millis(900)).await;
        for id in 0..3 {
            sink.submit(a_record(id)).await?;
        }
        // the old schedule would tick at 1s and ship the straggler 100ms after the full batch
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(store.batch_sizes().await, vec![2]);

        tokio::time::sleep(Duration::from_millis(900)).await;
        assert_eq!(store.batch_sizes().await, vec![2, 1]);
        sink.close().await?;
        Ok(())
    }
}
