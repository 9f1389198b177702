//! Error types shared by every stage of a digest run.

use std::path::PathBuf;

use thiserror::Error;

use crate::helpers::browser::DriverError;

pub type Result<T> = std::result::Result<T, DigestError>;

/// Failures a run can end with, classified by the stage that produced them.
#[derive(Debug, Error)]
pub enum DigestError {
    /// No export could be triggered, or no stable file appeared in time.
    #[error("export of '{dashboard}' timed out: {reason}")]
    ExportTimeout { dashboard: String, reason: String },

    /// A 1-indexed page number outside `1..=total`.
    #[error("page {index} is out of range for a document with {total} page(s)")]
    PageIndexOutOfRange { index: u32, total: u32 },

    /// A page rule would have left nothing behind.
    #[error("page rule removes all {total} page(s) of the document")]
    EmptyDocument { total: u32 },

    #[error("merge input {} is invalid: {reason}", .document.display())]
    MergeInputInvalid { document: PathBuf, reason: String },

    #[error("no documents to merge")]
    NothingToMerge,

    #[error("recipient list {} is unreadable: {reason}", .path.display())]
    RecipientListUnreadable { path: PathBuf, reason: String },

    #[error("mail dispatch failed: {0}")]
    MailDispatchFailed(String),

    /// The browser session could not be opened or driven.
    #[error("session error: {0}")]
    Session(#[from] DriverError),

    #[error("invalid dashboard configuration: {0}")]
    InvalidDashboard(String),

    /// The source artifact handed to the page rule processor is not a readable PDF.
    #[error("failed to read {}: {reason}", .path.display())]
    Pdf { path: PathBuf, reason: String },

    #[error("template error: {0}")]
    Template(#[from] askama::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DigestError {
    pub(crate) fn export_timeout(dashboard: &str, reason: impl Into<String>) -> Self {
        Self::ExportTimeout {
            dashboard: dashboard.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn pdf(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        Self::Pdf {
            path: path.into(),
            reason: err.to_string(),
        }
    }
}
