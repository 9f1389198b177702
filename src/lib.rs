//! Dashboard digest
//!
//! Exports published dashboards to PDF through an already signed-in browser
//! session, trims each export to the configured pages, merges them into one
//! daily report and mails it to a recipient list, once per day.

pub mod config;
pub mod errors;
pub mod helpers;
pub mod models;
pub mod scheduler;
pub mod service;
pub mod telemetry;

pub use config::DigestConfig;
pub use errors::{DigestError, Result};
pub use service::DigestService;

// Re-export key types for convenience
pub use models::dashboard::{DashboardSpec, PageRule};
pub use models::run::{ConsolidatedReport, DownloadArtifact, ProcessedDocument, RunOutcome};
