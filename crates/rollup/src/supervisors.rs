//! 🎬 *[camera pans across a dimly lit server room]*
//! 🎬 "In a world where months must be counted... one supervisor dared to count them all."
//!
//! 📦 The Supervisor: the Partition Orchestrator. For every report, for every partition
//! that report accepts, it runs one [`pipeline::PartitionPipeline`] and writes down what
//! happened.
//!
//! 🧠 Knowledge graph:
//! - Everything the pipelines touch comes in through [`Supervisor::new`]: the query source,
//!   the document store, the reference data. No globals, no singletons, no surprises.
//! - `partition_parallelism` bounds how many partitions of one report run at once (a
//!   semaphore, acquired in partition order). `1` walks them one by one.
//! - `overlap_reports` runs whole reports as concurrent tasks, joined before the grand total.
//! - A failed partition is logged and recorded. Its siblings carry on. The run as a whole
//!   fails only when partitions ran and none of them succeeded.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use futures::future::join_all;
use indicatif::MultiProgress;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::app_config::AppConfig;
use crate::backends::{DocumentStore, QuerySource};
use crate::common::Partition;
use crate::progress::{PartitionSummary, RunSummary};
use crate::records::RecordBuilder;
use crate::reference::ReferenceData;
use crate::reports::ReportSpec;
use crate::sink::{BulkSinkConfig, FailureCallback, log_failure};

mod pipeline;

use pipeline::PartitionPipeline;

/// 🔧 How the supervisor schedules its minions.
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorConfig {
    pub sink: BulkSinkConfig,
    pub partition_parallelism: usize,
    pub overlap_reports: bool,
    /// Page size for reports that don't set their own.
    pub default_page_size: usize,
}

impl SupervisorConfig {
    pub fn from_app_config(app_config: &AppConfig) -> Self {
        Self {
            sink: BulkSinkConfig::from_configs(&app_config.runtime, &app_config.sink_config.common_config()),
            partition_parallelism: app_config.runtime.partition_parallelism,
            overlap_reports: app_config.runtime.overlap_reports,
            default_page_size: app_config.source_config.page_size(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            sink: BulkSinkConfig::default(),
            partition_parallelism: 1,
            overlap_reports: false,
            default_page_size: crate::backends::CommonSourceConfig::default().page_size,
        }
    }
}

/// 📦 Hovers over the pipelines asking "is it done yet?", but politely, via `JoinSet`.
pub struct Supervisor<Q: ?Sized, D: ?Sized> {
    config: SupervisorConfig,
    source: Arc<Q>,
    store: Arc<D>,
    reference: Arc<ReferenceData>,
    on_failure: FailureCallback,
    progress: MultiProgress,
}

impl<Q: std::fmt::Debug + ?Sized, D: std::fmt::Debug + ?Sized> std::fmt::Debug for Supervisor<Q, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("config", &self.config)
            .field("source", &self.source)
            .field("store", &self.store)
            .field("reference", &self.reference)
            .finish_non_exhaustive()
    }
}

impl<Q, D> Supervisor<Q, D>
where
    Q: QuerySource + ?Sized + 'static,
    D: DocumentStore + ?Sized + 'static,
{
    pub fn new(config: SupervisorConfig, source: Arc<Q>, store: Arc<D>, reference: Arc<ReferenceData>) -> Self {
        Self {
            config,
            source,
            store,
            reference,
            on_failure: log_failure(),
            progress: MultiProgress::new(),
        }
    }

    /// 📞 Replace the default "log it and move on" failed-write callback.
    pub fn with_failure_callback(mut self, on_failure: FailureCallback) -> Self {
        self.on_failure = on_failure;
        self
    }

    /// 🌀 Draw the partition spinners somewhere other than stderr.
    pub fn with_progress(mut self, progress: MultiProgress) -> Self {
        self.progress = progress;
        self
    }

    fn pipeline(&self) -> PartitionPipeline<Q, D> {
        PartitionPipeline {
            source: Arc::clone(&self.source),
            store: Arc::clone(&self.store),
            sink: self.config.sink.clone(),
            default_page_size: self.config.default_page_size,
            on_failure: Arc::clone(&self.on_failure),
            progress: self.progress.clone(),
        }
    }

    /// 🚀 Run every report over every partition it accepts.
    ///
    /// Setup problems (an invalid report or partition, a destination that can't be created)
    /// fail before any partition starts.
    pub async fn run(&self, reports: &[ReportSpec], partitions: &[Partition]) -> Result<RunSummary> {
        let started = Instant::now();

        for partition in partitions {
            partition.validate()?;
        }
        for report in reports {
            report.validate()?;
        }
        for report in reports {
            self.store
                .ensure_collection(&report.destination_collection, report.mapping.as_ref())
                .await
                .with_context(|| {
                    format!(
                        "💀 Could not prepare destination '{}' for report '{}'. Nothing has been written yet.",
                        report.destination_collection, report.name
                    )
                })?;
        }

        let runs = reports
            .iter()
            .map(|report| self.run_report(Arc::new(report.clone()), partitions));
        let outcomes = if self.config.overlap_reports {
            join_all(runs).await
        } else {
            let mut outcomes = Vec::with_capacity(reports.len());
            for run in runs {
                outcomes.push(run.await);
            }
            outcomes
        };

        let mut summary = RunSummary::default();
        for (report, outcome) in reports.iter().zip(outcomes) {
            let (partitions, elapsed) = outcome?;
            info!("⏱️ {} finished {} partitions in {:?}", report.name, partitions.len(), elapsed);
            summary.partitions.extend(partitions);
            summary.report_elapsed.push((report.name.clone(), elapsed));
        }
        summary.elapsed = started.elapsed();

        if !summary.partitions.is_empty() && summary.succeeded_partitions() == 0 {
            error!("💀 every partition failed:\n{}", summary.table());
            bail!(
                "💀 All {} partitions failed. Not one month survived. Check the logs above for each partition's cause.",
                summary.partitions.len()
            );
        }
        info!(
            "🏁 run finished: {} partitions ok, {} failed, {} records written, {} refused, in {:?}",
            summary.succeeded_partitions(),
            summary.failed_partitions(),
            summary.records_succeeded(),
            summary.records_failed(),
            summary.elapsed
        );
        Ok(summary)
    }

    async fn run_report(
        &self,
        report: Arc<ReportSpec>,
        partitions: &[Partition],
    ) -> Result<(Vec<PartitionSummary>, Duration)> {
        let started = Instant::now();
        let accepted: Vec<Partition> = partitions.iter().filter(|p| report.accepts(p)).cloned().collect();
        if accepted.is_empty() {
            warn!("🤷 report '{}' has no {:?} partitions configured; skipping it", report.name, report.partition_kind);
            return Ok((Vec::new(), started.elapsed()));
        }

        let semaphore = Arc::new(Semaphore::new(self.config.partition_parallelism.max(1)));
        let mut tasks = JoinSet::new();
        for (index, partition) in accepted.iter().cloned().enumerate() {
            // 🎟️ acquired here, in order, so partition N never starts before partition N-1
            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .context("💀 The partition semaphore closed while partitions were still queued.")?;
            let pipeline = self.pipeline();
            let builder = RecordBuilder::new(Arc::clone(&report), Arc::clone(&self.reference));
            tasks.spawn(async move {
                let summary = pipeline.run(builder, partition).await;
                drop(permit);
                (index, summary)
            });
        }

        let mut slots: Vec<Option<PartitionSummary>> = vec![None; accepted.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, summary)) => slots[index] = Some(summary),
                Err(err) => error!("💀 a partition task of '{}' panicked: {err}", report.name),
            }
        }

        let summaries = slots
            .into_iter()
            .zip(accepted)
            .map(|(slot, partition)| {
                slot.unwrap_or_else(|| {
                    let mut lost = PartitionSummary::new(&report.name, partition);
                    lost.error = Some("partition task panicked".to_string());
                    lost
                })
            })
            .collect();
        Ok((summaries, started.elapsed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::in_mem::{InMemorySource, InMemoryStore};
    use crate::common::{BulkItemFailure, ContinuationToken, Group, GroupPage, KeyValue};
    use crate::reports::catalog;
    use indicatif::{InMemoryTerm, ProgressDrawTarget};
    use serde_json::{Map, Value, json};
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn flight(year: i32, month: u8, carrier: &str, dep_delay: f64, cancelled: u8) -> Map<String, Value> {
        json!({
            "year": year,
            "month": month,
            "reporting_airline": carrier,
            "origin": "DFW",
            "dest": "ORD",
            "dep_delay": dep_delay,
            "arr_delay": dep_delay,
            "dep_del15": if dep_delay >= 15.0 { 1 } else { 0 },
            "arr_del15": if dep_delay >= 15.0 { 1 } else { 0 },
            "cancelled": cancelled
        })
        .as_object()
        .cloned()
        .unwrap_or_default()
    }

    fn a_year_of_flights() -> Vec<Map<String, Value>> {
        let mut docs = Vec::new();
        for month in 1..=3 {
            for carrier in ["AA", "DL", "UA", "WN"] {
                docs.push(flight(2020, month, carrier, -4.0, 0));
                docs.push(flight(2020, month, carrier, 22.0, 0));
                docs.push(flight(2020, month, carrier, 0.0, 1));
            }
        }
        docs
    }

    fn months(months: &[u8]) -> Vec<Partition> {
        months.iter().map(|&month| Partition::Monthly { year: 2020, month }).collect()
    }

    fn a_config(partition_parallelism: usize) -> SupervisorConfig {
        SupervisorConfig {
            sink: BulkSinkConfig {
                workers: 3,
                bulk_actions: 2,
                flush_interval: Duration::from_secs(60),
                channel_capacity: 4,
            },
            partition_parallelism,
            overlap_reports: false,
            default_page_size: 3,
        }
    }

    fn supervisor(
        source: InMemorySource,
        store: &Arc<InMemoryStore>,
        partition_parallelism: usize,
    ) -> Supervisor<InMemorySource, InMemoryStore> {
        Supervisor::new(
            a_config(partition_parallelism),
            Arc::new(source),
            Arc::clone(store),
            Arc::new(ReferenceData::new()),
        )
    }

    #[tokio::test]
    async fn the_one_where_three_months_run_side_by_side_without_stepping_on_ids() -> Result<()> {
        let store = Arc::new(InMemoryStore::new());
        let source = InMemorySource::new().with_collection(catalog::ON_TIME_DATA, a_year_of_flights());
        let summary = supervisor(source, &store, 3)
            .run(&[catalog::air_carrier_flight_report()], &months(&[1, 2, 3]))
            .await?;

        assert_eq!(summary.partitions.len(), 3);
        assert_eq!(summary.succeeded_partitions(), 3);
        assert_eq!(summary.records_succeeded(), 12);
        let ids = store.ids("air_carrier_flight_report").await;
        assert_eq!(ids.len(), 12);
        assert!(ids.contains("2020_2_DL"));
        assert_eq!(store.ensured_collections().await, vec!["air_carrier_flight_report".to_string()]);

        let february = store
            .documents("air_carrier_flight_report")
            .await
            .get("2020_2_DL")
            .cloned()
            .context("💀 february DL should be there")?;
        assert_eq!(february["early_departure_count"], json!(1));
        assert_eq!(february["delayed_departure_count"], json!(1));
        assert_eq!(february["cancelled_count"], json!(1));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_running_twice_changes_nothing() -> Result<()> {
        let store = Arc::new(InMemoryStore::new());
        let docs = a_year_of_flights();
        let reports = [catalog::air_carrier_flight_report()];

        supervisor(InMemorySource::new().with_collection(catalog::ON_TIME_DATA, docs.clone()), &store, 1)
            .run(&reports, &months(&[1, 2]))
            .await?;
        let first = store.documents("air_carrier_flight_report").await;

        supervisor(InMemorySource::new().with_collection(catalog::ON_TIME_DATA, docs), &store, 2)
            .run(&reports, &months(&[1, 2]))
            .await?;
        let second = store.documents("air_carrier_flight_report").await;

        assert_eq!(first, second);
        assert_eq!(second.len(), 8);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_one_bad_month_does_not_spoil_the_others() -> Result<()> {
        let store = Arc::new(InMemoryStore::new());
        let source = InMemorySource::new()
            .with_collection(catalog::ON_TIME_DATA, a_year_of_flights())
            .failing_for_filter(vec![
                ("year".to_string(), KeyValue::Int(2020)),
                ("month".to_string(), KeyValue::Int(2)),
            ]);
        let summary = supervisor(source, &store, 2)
            .run(&[catalog::air_carrier_flight_report()], &months(&[1, 2, 3]))
            .await?;

        assert_eq!(summary.succeeded_partitions(), 2);
        assert_eq!(summary.failed_partitions(), 1);
        assert!(summary.partitions[1].error.is_some());
        let ids = store.ids("air_carrier_flight_report").await;
        assert_eq!(ids.len(), 8);
        assert!(!ids.iter().any(|id| id.starts_with("2020_2_")));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_every_month_fails_and_so_does_the_run() {
        let store = Arc::new(InMemoryStore::new());
        let source = InMemorySource::new()
            .with_collection(catalog::ON_TIME_DATA, a_year_of_flights())
            .failing_on_request(1);
        let outcome = supervisor(source, &store, 1)
            .run(&[catalog::air_carrier_flight_report()], &months(&[1]))
            .await;
        assert!(outcome.is_err());
    }

    #[tokio::test]
    async fn the_one_where_refused_writes_reach_the_callback_and_the_summary() -> Result<()> {
        let store = Arc::new(InMemoryStore::new().failing_ids(["2020_1_UA"]));
        let refused = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&refused);
        let source = InMemorySource::new().with_collection(catalog::ON_TIME_DATA, a_year_of_flights());
        let summary = supervisor(source, &store, 1)
            .with_failure_callback(Arc::new(move |failure: &BulkItemFailure| {
                seen.lock().expect("💀 poisoned").push(failure.id.clone());
            }))
            .run(&[catalog::air_carrier_flight_report()], &months(&[1]))
            .await?;

        assert_eq!(summary.succeeded_partitions(), 1);
        assert_eq!(summary.records_succeeded(), 3);
        assert_eq!(summary.records_failed(), 1);
        assert_eq!(*refused.lock().expect("💀 poisoned"), vec!["2020_1_UA".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_the_scripted_tokens_come_back_verbatim() -> Result<()> {
        let group = |carrier: &str| Group {
            key: vec![
                ("year".to_string(), KeyValue::Int(2020)),
                ("month".to_string(), KeyValue::Int(1)),
                ("reporting_airline".to_string(), KeyValue::Str(carrier.to_string())),
            ],
            doc_count: 1,
            sub_aggregations: HashMap::new(),
            sample: None,
        };
        let t1 = ContinuationToken(json!({"reporting_airline": "AA"}));
        let t2 = ContinuationToken(json!({"reporting_airline": "DL"}));
        let source = Arc::new(InMemorySource::scripted(vec![
            GroupPage { groups: vec![group("AA")], next_token: Some(t1.clone()) },
            GroupPage { groups: vec![group("DL")], next_token: Some(t2.clone()) },
            GroupPage { groups: vec![group("UA")], next_token: None },
        ]));
        let store = Arc::new(InMemoryStore::new());
        let summary = Supervisor::new(a_config(1), Arc::clone(&source), Arc::clone(&store), Arc::new(ReferenceData::new()))
            .run(&[catalog::air_carrier_flight_report()], &months(&[1]))
            .await?;

        assert_eq!(summary.partitions[0].pages, 3);
        assert_eq!(source.received_tokens().await, vec![None, Some(t1), Some(t2)]);
        assert_eq!(store.ids("air_carrier_flight_report").await.len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_quarterly_reports_ignore_monthly_partitions() -> Result<()> {
        let store = Arc::new(InMemoryStore::new());
        let source = InMemorySource::new().with_collection(catalog::ON_TIME_DATA, a_year_of_flights());
        let mut config = a_config(1);
        config.overlap_reports = true;
        let summary = Supervisor::new(config, Arc::new(source), Arc::clone(&store), Arc::new(ReferenceData::new()))
            .run(
                &[catalog::air_carrier_flight_report(), catalog::airport_flights()],
                &months(&[1]),
            )
            .await?;

        assert_eq!(summary.partitions.len(), 1);
        assert_eq!(summary.report_elapsed.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_panicking_callback_fails_its_month_but_never_hangs_the_run() -> Result<()> {
        let store = Arc::new(InMemoryStore::new().failing_ids(["2020_1_AA"]));
        let source = InMemorySource::new().with_collection(catalog::ON_TIME_DATA, a_year_of_flights());
        let sup = supervisor(source, &store, 2)
            .with_failure_callback(Arc::new(|_: &BulkItemFailure| panic!("callback blew up")));
        let summary = tokio::time::timeout(
            Duration::from_secs(5),
            sup.run(&[catalog::air_carrier_flight_report()], &months(&[1, 2])),
        )
        .await
        .context("💀 the run hung on a panicked callback")??;

        assert_eq!(summary.partitions.len(), 2);
        let january = &summary.partitions[0];
        assert!(january.error.as_deref().is_some_and(|e| e.contains("callback panicked")), "{january:?}");
        assert!(summary.partitions[1].is_success());
        assert_eq!(store.ids("air_carrier_flight_report").await.len(), 7);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_concurrent_months_each_get_their_own_spinner_line() -> Result<()> {
        let term = InMemoryTerm::new(10, 120);
        let multi = MultiProgress::with_draw_target(ProgressDrawTarget::term_like(Box::new(term.clone())));
        let store = Arc::new(InMemoryStore::new());
        let source = InMemorySource::new().with_collection(catalog::ON_TIME_DATA, a_year_of_flights());
        supervisor(source, &store, 2)
            .with_progress(multi)
            .run(&[catalog::air_carrier_flight_report()], &months(&[1, 2]))
            .await?;

        let screen = term.contents();
        let january = screen.lines().filter(|line| line.contains("air_carrier_flight_report 2020-01")).count();
        let february = screen.lines().filter(|line| line.contains("air_carrier_flight_report 2020-02")).count();
        assert_eq!((january, february), (1, 1), "{screen}");
        Ok(())
    }
}
