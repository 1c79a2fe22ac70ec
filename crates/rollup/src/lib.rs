//! 🛫 rollup: grouped aggregations in, one summary record per group out.
//!
//! For each partition (a month, a quarter), a cursor pages through a grouped aggregation,
//! a record builder turns each group into a document, and a concurrent bulk sink upserts
//! them by identifier. A drain barrier says when the partition is done. The supervisor
//! runs it all for every configured report.
//!
//! 🦆 The duck reviewed this crate and had no notes. The duck never has notes.

pub mod app_config;
pub mod backends;
pub mod common;
pub mod cursor;
pub mod drain;
pub mod progress;
pub mod records;
pub mod reference;
pub mod reports;
pub mod sink;
pub mod supervisors;
pub(crate) mod transforms;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::app_config::AppConfig;
use crate::backends::{SinkBackend, SourceBackend};
use crate::progress::RunSummary;
use crate::supervisors::{Supervisor, SupervisorConfig};

/// 🚀 One full run: connect, load lookups, pick reports, supervise.
///
/// Connection and reference-loading problems fail here, before a single page is fetched.
pub async fn run(app_config: AppConfig) -> Result<RunSummary> {
    let source = SourceBackend::from_config(&app_config.source_config)
        .await
        .context("💀 Failed to create the source backend.")?;
    let store = SinkBackend::from_config(&app_config.sink_config)
        .await
        .context("💀 Failed to create the sink backend.")?;

    let reference = reference::load(&app_config.reference, &source)
        .await
        .context("💀 Failed to load reference data. No partition has started.")?;
    for (table, size) in reference.table_sizes() {
        info!("📚 reference table '{table}': {size} entries");
    }

    let reports = reports::catalog::select(&app_config.reports)?;
    info!(
        "📊 running {} reports over {} partitions",
        reports.len(),
        app_config.partitions.len()
    );

    let supervisor = Supervisor::new(
        SupervisorConfig::from_app_config(&app_config),
        Arc::new(source),
        Arc::new(store),
        Arc::new(reference),
    );
    supervisor.run(&reports, &app_config.partitions).await
}
