use chrono::{DateTime, Local, NaiveDate};
use std::path::{Path, PathBuf};

use crate::models::dashboard::DashboardSpec;

/// A file the export engine observed settling in the download directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadArtifact {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub observed_stable_at: DateTime<Local>,
}

/// A PDF holding only the pages a dashboard's rule retained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedDocument {
    pub path: PathBuf,
    pub page_count: u32,
}

/// The single merged PDF for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsolidatedReport {
    pub path: PathBuf,
    pub page_count: u32,
    pub source_count: usize,
}

#[derive(Debug, Clone)]
pub struct DashboardFailure {
    pub name: String,
    pub reason: String,
}

/// State owned by one scheduled run: its day-scoped directory, the ordered
/// dashboards, and what happened to each of them.
#[derive(Debug)]
pub struct RunContext {
    pub day: NaiveDate,
    pub run_dir: PathBuf,
    pub dashboards: Vec<DashboardSpec>,
    pub processed: Vec<(DashboardSpec, ProcessedDocument)>,
    pub failures: Vec<DashboardFailure>,
}

impl RunContext {
    pub fn new(download_root: &Path, day: NaiveDate, dashboards: Vec<DashboardSpec>) -> Self {
        Self {
            day,
            run_dir: download_root.join(day.format("%Y-%m-%d").to_string()),
            dashboards,
            processed: Vec::new(),
            failures: Vec::new(),
        }
    }

    pub fn day_label(&self) -> String {
        self.day.format("%Y-%m-%d").to_string()
    }

    pub fn processed_dir(&self) -> PathBuf {
        self.run_dir.join("processed")
    }

    /// Where the finished download of `spec` is moved to.
    pub fn download_path(&self, spec: &DashboardSpec) -> PathBuf {
        self.run_dir
            .join(format!("{}_{}.pdf", spec.name, self.day_label()))
    }

    pub fn processed_path(&self, spec: &DashboardSpec) -> PathBuf {
        self.processed_dir()
            .join(format!("{:02}_{}.pdf", spec.order + 1, spec.name))
    }

    /// Deterministic per day, so a same-day rerun overwrites it.
    pub fn report_path(&self, basename: &str) -> PathBuf {
        self.run_dir
            .join(format!("{}_{}.pdf", basename, self.day_label()))
    }

    pub fn record_failure(&mut self, spec: &DashboardSpec, reason: impl ToString) {
        self.failures.push(DashboardFailure {
            name: spec.name.clone(),
            reason: reason.to_string(),
        });
    }

    /// Processed documents in dashboard order.
    pub fn documents(&self) -> Vec<ProcessedDocument> {
        let mut processed: Vec<_> = self.processed.iter().collect();
        processed.sort_by_key(|(spec, _)| spec.order);
        processed.into_iter().map(|(_, doc)| doc.clone()).collect()
    }
}

/// How a run ended.
#[derive(Debug)]
pub enum RunOutcome {
    Delivered {
        report: ConsolidatedReport,
        recipients: usize,
        failed_dashboards: Vec<DashboardFailure>,
    },
    Failed {
        reason: String,
    },
}
