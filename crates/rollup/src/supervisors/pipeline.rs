use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use indicatif::MultiProgress;
use tracing::{debug, error, info};

use crate::backends::{DocumentStore, QuerySource};
use crate::common::Partition;
use crate::cursor::GroupedQueryCursor;
use crate::progress::{PartitionProgress, PartitionSummary};
use crate::records::{Built, RecordBuilder};
use crate::sink::{BulkSinkConfig, FailureCallback, SinkHandle};

/// 🏭 One partition's worth of cursor → builder → sink. Each run gets its own sink, so the
/// drain at the end waits for this partition's writes and nobody else's.
pub(crate) struct PartitionPipeline<Q: ?Sized, D: ?Sized> {
    pub(crate) source: Arc<Q>,
    pub(crate) store: Arc<D>,
    pub(crate) sink: BulkSinkConfig,
    pub(crate) default_page_size: usize,
    pub(crate) on_failure: FailureCallback,
    pub(crate) progress: MultiProgress,
}

impl<Q: ?Sized, D: ?Sized> Clone for PartitionPipeline<Q, D> {
    fn clone(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
            store: Arc::clone(&self.store),
            sink: self.sink.clone(),
            default_page_size: self.default_page_size,
            on_failure: Arc::clone(&self.on_failure),
            progress: self.progress.clone(),
        }
    }
}

impl<Q: std::fmt::Debug + ?Sized, D: std::fmt::Debug + ?Sized> std::fmt::Debug for PartitionPipeline<Q, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionPipeline")
            .field("source", &self.source)
            .field("store", &self.store)
            .field("sink", &self.sink)
            .field("default_page_size", &self.default_page_size)
            .finish_non_exhaustive()
    }
}

impl<Q, D> PartitionPipeline<Q, D>
where
    Q: QuerySource + ?Sized,
    D: DocumentStore + ?Sized + 'static,
{
    /// 🚀 Run the partition to completion. Never returns `Err`: a page or build failure ends
    /// production early and lands in `PartitionSummary::error`, but whatever was already
    /// submitted is still drained and counted.
    pub(crate) async fn run(self, builder: RecordBuilder, partition: Partition) -> PartitionSummary {
        let started = Instant::now();
        let report = builder.report().name.clone();
        let mut summary = PartitionSummary::new(&report, partition.clone());
        let progress = PartitionProgress::new(&self.progress, &report, &partition);
        info!("🚀 {report} {partition}: starting");

        let sink = SinkHandle::start(Arc::clone(&self.store), self.sink.clone(), Arc::clone(&self.on_failure));

        if let Err(err) = self.produce(&builder, &partition, &sink, &progress, &mut summary).await {
            error!("💀 {report} {partition}: stopped after {} pages: {err:#}", summary.pages);
            summary.error = Some(format!("{err:#}"));
        }

        // 🚽 drain before counting; a partition is complete once every record was attempted
        if let Err(err) = sink.flush().await {
            summary.error.get_or_insert_with(|| format!("{err:#}"));
        }
        let barrier = sink.drain_barrier();
        progress.draining(barrier.outstanding());
        barrier.wait_until_drained().await;

        match sink.close().await {
            Ok(stats) => {
                summary.succeeded = stats.succeeded;
                summary.failed = stats.failed;
            }
            Err(err) => {
                error!("💀 {report} {partition}: sink shutdown failed: {err:#}");
                summary.error.get_or_insert_with(|| format!("{err:#}"));
            }
        }

        summary.elapsed = started.elapsed();
        progress.finish(&summary);
        info!(
            "🏁 {report} {partition}: {} pages, {} groups, {} succeeded, {} failed, {} skipped in {:?}",
            summary.pages, summary.groups_seen, summary.succeeded, summary.failed, summary.groups_skipped, summary.elapsed
        );
        summary
    }

    async fn produce(
        &self,
        builder: &RecordBuilder,
        partition: &Partition,
        sink: &SinkHandle,
        progress: &PartitionProgress,
        summary: &mut PartitionSummary,
    ) -> Result<()> {
        let query = builder.report().grouped_query(partition, self.default_page_size);
        let mut cursor = GroupedQueryCursor::open(&*self.source, query);

        while let Some(groups) = cursor.next_page().await? {
            summary.pages = cursor.pages_fetched();
            for group in &groups {
                summary.groups_seen += 1;
                match builder.build(partition, group)? {
                    Built::Record(record) => {
                        sink.submit(record).await?;
                        summary.records_submitted += 1;
                    }
                    Built::Skipped(reason) => {
                        debug!("⏭️ {} {partition}: skipped a group: {reason}", summary.report);
                        summary.groups_skipped += 1;
                    }
                }
            }
            progress.page(summary.pages, summary.groups_seen, summary.records_submitted);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::in_mem::{InMemorySource, InMemoryStore};
    use crate::reference::ReferenceData;
    use crate::reports::catalog;
    use crate::sink::log_failure;
    use indicatif::ProgressDrawTarget;
    use serde_json::json;
    use std::time::Duration;

    fn flights(n: usize) -> Vec<serde_json::Map<String, serde_json::Value>> {
        (0..n)
            .map(|i| {
                json!({
                    "year": 2020,
                    "month": 1,
                    "reporting_airline": format!("C{}", i % 7),
                    "dep_delay": 3.0,
                    "arr_delay": -1.0,
                    "dep_del15": 0,
                    "arr_del15": 0,
                    "cancelled": 0
                })
                .as_object()
                .cloned()
                .unwrap_or_default()
            })
            .collect()
    }

    fn pipeline(source: InMemorySource, store: Arc<InMemoryStore>) -> PartitionPipeline<InMemorySource, InMemoryStore> {
        PartitionPipeline {
            source: Arc::new(source),
            store,
            sink: BulkSinkConfig {
                workers: 2,
                bulk_actions: 3,
                flush_interval: Duration::from_secs(60),
                channel_capacity: 8,
            },
            default_page_size: 2,
            on_failure: log_failure(),
            progress: MultiProgress::with_draw_target(ProgressDrawTarget::hidden()),
        }
    }

    fn builder() -> RecordBuilder {
        RecordBuilder::new(Arc::new(catalog::air_carrier_flight_report()), Arc::new(ReferenceData::new()))
    }

    #[tokio::test]
    async fn the_one_where_four_pages_of_carriers_all_land() -> Result<()> {
        let store = Arc::new(InMemoryStore::new());
        let source = InMemorySource::new().with_collection(catalog::ON_TIME_DATA, flights(30));
        let summary = pipeline(source, Arc::clone(&store))
            .run(builder(), Partition::Monthly { year: 2020, month: 1 })
            .await;

        assert!(summary.is_success(), "{:?}", summary.error);
        // 7 carriers at 2 per page: 4 pages, the last one carrying the missing token
        assert_eq!(summary.pages, 4);
        assert_eq!(summary.groups_seen, 7);
        assert_eq!(summary.succeeded, 7);
        assert_eq!(store.ids("air_carrier_flight_report").await.len(), 7);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_quiet_month_writes_nothing_and_is_fine() -> Result<()> {
        let store = Arc::new(InMemoryStore::new());
        let source = InMemorySource::new().with_collection(catalog::ON_TIME_DATA, flights(30));
        let summary = pipeline(source, Arc::clone(&store))
            .run(builder(), Partition::Monthly { year: 1999, month: 12 })
            .await;

        assert!(summary.is_success());
        assert_eq!(summary.pages, 1);
        assert_eq!(summary.groups_seen, 0);
        assert!(store.ids("air_carrier_flight_report").await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_page_three_dies_and_pages_one_and_two_stay_written() -> Result<()> {
        let store = Arc::new(InMemoryStore::new());
        let source = InMemorySource::new()
            .with_collection(catalog::ON_TIME_DATA, flights(30))
            .failing_on_request(3);
        let summary = pipeline(source, Arc::clone(&store))
            .run(builder(), Partition::Monthly { year: 2020, month: 1 })
            .await;

        assert!(!summary.is_success());
        assert_eq!(summary.pages, 2);
        assert_eq!(summary.records_submitted, 4);
        assert_eq!(summary.succeeded, 4);
        assert_eq!(store.ids("air_carrier_flight_report").await.len(), 4);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_refused_writes_still_complete_the_partition() -> Result<()> {
        let store = Arc::new(InMemoryStore::new().failing_ids(["2020_1_C3"]));
        let source = InMemorySource::new().with_collection(catalog::ON_TIME_DATA, flights(30));
        let summary = pipeline(source, Arc::clone(&store))
            .run(builder(), Partition::Monthly { year: 2020, month: 1 })
            .await;

        assert!(summary.is_success());
        assert_eq!(summary.succeeded, 6);
        assert_eq!(summary.failed, 1);
        Ok(())
    }
}
