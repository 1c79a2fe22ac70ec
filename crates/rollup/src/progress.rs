//! 📊 Progress: a spinner per running partition, and the end-of-run summary table.
//!
//! 🎬 *[the cursor pages. the sink writes. the human stares at a terminal, wondering.]*
//! This module makes the wondering shorter.
//!
//! Failed writes are promoted into the summary next to the successes, so a run that
//! "completed" with half its records refused doesn't look like a clean run. The detail
//! for each refused record is in the logs, via the sink's failure callback.

use std::fmt;
use std::time::Duration;

use comfy_table::{Cell, CellAlignment, ContentArrangement, Table, presets::NOTHING};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use crate::common::Partition;

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + s.len() / 3);
    for (i, c) in s.chars().enumerate() {
        if i > 0 && (s.len() - i) % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result
}

fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    if hours > 0 {
        format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{:02}:{:02}.{:03}", minutes, seconds, duration.subsec_millis())
    }
}

// ============================================================
// 🌀 PartitionProgress: live spinner
// ============================================================

/// 🌀 One spinner per partition in flight, one line each under the run's shared
/// [`MultiProgress`]. Hidden automatically when stderr isn't a terminal.
pub(crate) struct PartitionProgress {
    label: String,
    spinner: ProgressBar,
}

impl fmt::Debug for PartitionProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionProgress")
            .field("label", &self.label)
            .finish()
    }
}

impl PartitionProgress {
    pub(crate) fn new(multi: &MultiProgress, report: &str, partition: &Partition) -> Self {
        let spinner = multi.add(ProgressBar::new_spinner());
        spinner.set_style(
            ProgressStyle::with_template("{spinner} {prefix} {msg} [{elapsed}]")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        let label = format!("{report} {partition}");
        spinner.set_prefix(label.clone());
        spinner.enable_steady_tick(Duration::from_millis(120));
        Self { label, spinner }
    }

    pub(crate) fn page(&self, pages: usize, groups: u64, submitted: u64) {
        self.spinner.set_message(format!(
            "page {} · {} groups · {} submitted",
            pages,
            format_number(groups),
            format_number(submitted)
        ));
    }

    pub(crate) fn draining(&self, outstanding: u64) {
        self.spinner
            .set_message(format!("draining {} in-flight writes", format_number(outstanding)));
    }

    pub(crate) fn finish(&self, summary: &PartitionSummary) {
        let verdict = if summary.is_success() { "✅" } else { "💀" };
        self.spinner.finish_with_message(format!(
            "{verdict} {} records, {} failed",
            format_number(summary.succeeded),
            format_number(summary.failed)
        ));
    }
}

// ============================================================
// 🧾 Summaries
// ============================================================

/// 🧾 What happened to one partition of one report.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionSummary {
    pub report: String,
    pub partition: Partition,
    pub pages: usize,
    pub groups_seen: u64,
    pub records_submitted: u64,
    pub groups_skipped: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub elapsed: Duration,
    /// `Some` when a page fetch or record build failed. Writes that landed before the
    /// failure stay written.
    pub error: Option<String>,
}

impl PartitionSummary {
    pub fn new(report: &str, partition: Partition) -> Self {
        Self {
            report: report.to_string(),
            partition,
            pages: 0,
            groups_seen: 0,
            records_submitted: 0,
            groups_skipped: 0,
            succeeded: 0,
            failed: 0,
            elapsed: Duration::ZERO,
            error: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// 🧾 The whole run: every partition, per-report wall time, and the grand total.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub partitions: Vec<PartitionSummary>,
    pub report_elapsed: Vec<(String, Duration)>,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn succeeded_partitions(&self) -> usize {
        self.partitions.iter().filter(|p| p.is_success()).count()
    }

    pub fn failed_partitions(&self) -> usize {
        self.partitions.len() - self.succeeded_partitions()
    }

    pub fn records_succeeded(&self) -> u64 {
        self.partitions.iter().map(|p| p.succeeded).sum()
    }

    pub fn records_failed(&self) -> u64 {
        self.partitions.iter().map(|p| p.failed).sum()
    }

    pub fn groups_seen(&self) -> u64 {
        self.partitions.iter().map(|p| p.groups_seen).sum()
    }

    /// 📋 One row per partition plus a totals row. Same borderless look as the live stats.
    pub fn table(&self) -> Table {
        let mut table = Table::new();
        table.load_preset(NOTHING);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.set_header(vec![
            "report", "partition", "pages", "groups", "submitted", "succeeded", "failed", "skipped", "elapsed", "status",
        ]);

        let right = |value: String| Cell::new(value).set_alignment(CellAlignment::Right);
        for p in &self.partitions {
            table.add_row(vec![
                Cell::new(&p.report),
                Cell::new(p.partition.to_string()),
                right(p.pages.to_string()),
                right(format_number(p.groups_seen)),
                right(format_number(p.records_submitted)),
                right(format_number(p.succeeded)),
                right(format_number(p.failed)),
                right(format_number(p.groups_skipped)),
                right(format_duration(p.elapsed)),
                Cell::new(match &p.error {
                    None => "✅ ok".to_string(),
                    Some(error) => format!("💀 {error}"),
                }),
            ]);
        }

        table.add_row(vec![
            Cell::new("total"),
            Cell::new(format!("{} ok / {} failed", self.succeeded_partitions(), self.failed_partitions())),
            right(self.partitions.iter().map(|p| p.pages).sum::<usize>().to_string()),
            right(format_number(self.groups_seen())),
            right(format_number(self.partitions.iter().map(|p| p.records_submitted).sum())),
            right(format_number(self.records_succeeded())),
            right(format_number(self.records_failed())),
            right(format_number(self.partitions.iter().map(|p| p.groups_skipped).sum())),
            right(format_duration(self.elapsed)),
            Cell::new(""),
        ]);
        table
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.table())?;
        for (report, elapsed) in &self.report_elapsed {
            writeln!(f, "⏱️ {report}: {}", format_duration(*elapsed))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_one_where_big_numbers_get_commas() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn the_one_where_the_summary_promotes_failures() {
        let mut ok = PartitionSummary::new("air_carrier_flight_report", Partition::Monthly { year: 2020, month: 1 });
        ok.succeeded = 10;
        ok.failed = 2;
        let mut broken = PartitionSummary::new("air_carrier_flight_report", Partition::Monthly { year: 2020, month: 2 });
        broken.error = Some("page 3 failed".into());

        let summary = RunSummary {
            partitions: vec![ok, broken],
            report_elapsed: vec![("air_carrier_flight_report".into(), Duration::from_secs(3))],
            elapsed: Duration::from_secs(3),
        };
        assert_eq!(summary.succeeded_partitions(), 1);
        assert_eq!(summary.failed_partitions(), 1);
        assert_eq!(summary.records_failed(), 2);

        let rendered = summary.to_string();
        assert!(rendered.contains("2020-01"));
        assert!(rendered.contains("page 3 failed"));
        assert!(rendered.contains("1 ok / 1 failed"));
    }
}
