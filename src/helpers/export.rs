//! Export engine: turns one dashboard URL into one completed PDF on disk.
//!
//! The browser gives no completion signal for downloads, so completion is
//! inferred by polling the run's download directory. Every wait in here is
//! bounded by a deadline from [`ExportTuning`].

use async_trait::async_trait;
use chrono::Local;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::time::{Instant, sleep};
use tracing::{info, warn};

use crate::config::ExportTuning;
use crate::errors::{DigestError, Result};
use crate::helpers::browser::SessionDriver;
use crate::models::dashboard::DashboardSpec;
use crate::models::run::DownloadArtifact;

const TEMP_SUFFIXES: &[&str] = &[".crdownload", ".tmp", ".part", ".partial"];

/// One directory entry as seen by a poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileObservation {
    pub path: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
}

/// Lists the files currently present where downloads land.
#[async_trait]
pub trait DownloadSource: Send + Sync {
    async fn scan(&self) -> std::io::Result<Vec<FileObservation>>;
}

/// Plain files directly inside a directory; subdirectories are ignored.
pub struct DownloadDir {
    root: PathBuf,
}

impl DownloadDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl DownloadSource for DownloadDir {
    async fn scan(&self) -> std::io::Result<Vec<FileObservation>> {
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            // Entries can vanish mid-scan when the browser renames its temp file.
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            files.push(FileObservation {
                path: entry.path(),
                size: meta.len(),
                modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }
        Ok(files)
    }
}

pub fn is_temp_file(path: &Path) -> bool {
    let name = file_name_lower(path);
    TEMP_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
}

fn is_pdf(path: &Path) -> bool {
    file_name_lower(path).ends_with(".pdf")
}

fn file_name_lower(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

/// Drive `session` to export `spec` and wait for the resulting PDF.
///
/// Files already in `downloads` before the export starts are never picked,
/// so leftovers from an earlier run on the same day are ignored.
pub async fn export_dashboard(
    spec: &DashboardSpec,
    session: &mut dyn SessionDriver,
    downloads: &dyn DownloadSource,
    tuning: &ExportTuning,
) -> Result<DownloadArtifact> {
    info!(dashboard = %spec.name, "Exporting {}", spec.url);

    let baseline: HashSet<PathBuf> = downloads.scan().await?.into_iter().map(|f| f.path).collect();

    session.navigate(&spec.url).await?;

    if !trigger_export(spec, session, tuning).await? {
        return Err(DigestError::export_timeout(
            &spec.name,
            "export could not be triggered on either the immediate or the fallback path",
        ));
    }

    wait_for_download(&spec.name, downloads, &baseline, tuning).await
}

/// Returns `Ok(true)` once a download has been started.
async fn trigger_export(
    spec: &DashboardSpec,
    session: &mut dyn SessionDriver,
    tuning: &ExportTuning,
) -> Result<bool> {
    if tuning.force_export_immediate {
        for attempt in 1..=tuning.immediate_tries {
            sleep(tuning.pre_export_cooldown).await;
            info!(
                dashboard = %spec.name,
                "Immediate export attempt {attempt}/{}", tuning.immediate_tries
            );
            match session.trigger_export().await {
                Ok(()) => {
                    info!(dashboard = %spec.name, "Export triggered (immediate)");
                    return Ok(true);
                }
                Err(e) => {
                    warn!(dashboard = %spec.name, "Immediate export failed: {e}");
                    if let Err(e) = session.refresh().await {
                        warn!(dashboard = %spec.name, "Reload after failed attempt failed: {e}");
                    }
                }
            }
        }
    }

    info!(dashboard = %spec.name, "Falling back to export after the dashboard settles");
    if let Err(reason) = wait_until_stable(&spec.name, session, tuning).await {
        warn!(dashboard = %spec.name, "{reason}");
        return Ok(false);
    }

    sleep(tuning.pre_export_cooldown).await;
    match session.trigger_export().await {
        Ok(()) => {
            info!(dashboard = %spec.name, "Export triggered (after idle)");
            Ok(true)
        }
        Err(e) => {
            warn!(dashboard = %spec.name, "Fallback export failed: {e}");
            Ok(false)
        }
    }
}

/// Wait until the dashboard shows no loading indicator for `idle_stable`
/// without interruption, giving up after `idle_timeout`.
pub async fn wait_until_stable(
    name: &str,
    session: &mut dyn SessionDriver,
    tuning: &ExportTuning,
) -> std::result::Result<(), String> {
    let deadline = Instant::now() + tuning.idle_timeout;
    let mut quiet_since: Option<Instant> = None;

    loop {
        let now = Instant::now();
        if now > deadline {
            return Err(format!(
                "dashboard did not settle within {}s",
                tuning.idle_timeout.as_secs()
            ));
        }

        // A failed probe counts as busy.
        let busy = session.is_busy().await.unwrap_or(true);
        if busy {
            quiet_since = None;
        } else {
            let since = *quiet_since.get_or_insert_with(|| {
                info!(dashboard = %name, "No loading indicators; stability window started");
                now
            });
            if now.duration_since(since) >= tuning.idle_stable {
                info!(
                    dashboard = %name,
                    "Stable for {}s", tuning.idle_stable.as_secs()
                );
                return Ok(());
            }
        }

        sleep(tuning.stability_poll).await;
    }
}

#[derive(Debug)]
struct Candidate {
    path: PathBuf,
    size: u64,
    first_seen: Instant,
}

/// Poll `downloads` until a new, non-temporary PDF keeps the same size across
/// two polls at least `idle_stable` apart, or `download_timeout` elapses.
pub async fn wait_for_download(
    name: &str,
    downloads: &dyn DownloadSource,
    baseline: &HashSet<PathBuf>,
    tuning: &ExportTuning,
) -> Result<DownloadArtifact> {
    let deadline = Instant::now() + tuning.download_timeout;
    let mut candidate: Option<Candidate> = None;
    let mut started = false;

    info!(dashboard = %name, "Waiting for download");

    loop {
        let now = Instant::now();
        if now > deadline {
            return Err(DigestError::export_timeout(
                name,
                format!(
                    "no completed PDF appeared within {}s",
                    tuning.download_timeout.as_secs()
                ),
            ));
        }

        let fresh: Vec<FileObservation> = downloads
            .scan()
            .await?
            .into_iter()
            .filter(|f| !baseline.contains(&f.path))
            .collect();

        if !started && fresh.iter().any(|f| is_pdf(&f.path) || is_temp_file(&f.path)) {
            started = true;
            info!(dashboard = %name, "Download detected");
        }

        let in_progress = fresh.iter().any(|f| is_temp_file(&f.path));
        let latest = fresh
            .into_iter()
            .filter(|f| is_pdf(&f.path) && f.size > 0)
            .max_by_key(|f| f.modified);

        match latest {
            Some(file) if !in_progress => {
                let first_seen = candidate
                    .as_ref()
                    .filter(|c| c.path == file.path && c.size == file.size)
                    .map(|c| c.first_seen);

                match first_seen {
                    Some(since) if now.duration_since(since) >= tuning.idle_stable => {
                        info!(
                            dashboard = %name,
                            "Download complete: {} ({} bytes)",
                            file.path.display(),
                            file.size
                        );
                        return Ok(DownloadArtifact {
                            path: file.path,
                            size_bytes: file.size,
                            observed_stable_at: Local::now(),
                        });
                    }
                    Some(_) => {}
                    None => {
                        info!(
                            dashboard = %name,
                            "Waiting for {} to settle ({} bytes)",
                            file.path.display(),
                            file.size
                        );
                        candidate = Some(Candidate {
                            path: file.path,
                            size: file.size,
                            first_seen: now,
                        });
                    }
                }
            }
            _ => candidate = None,
        }

        sleep(tuning.download_poll).await;
    }
}
