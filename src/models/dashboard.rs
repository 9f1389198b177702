use serde::Deserialize;
use std::collections::{BTreeSet, HashSet};
use std::convert::TryFrom;
use std::fmt;
use std::path::Path;
use tracing::info;

use crate::errors::{DigestError, Result};

/// Page selection applied to one exported dashboard.
///
/// Page numbers are 1-indexed, matching the numbers a reader sees in a PDF
/// viewer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PageRule {
    /// No rule: every exported page is kept.
    #[default]
    KeepAll,
    ExtractPage(u32),
    DropPages(BTreeSet<u32>),
    DropLastPages(u32),
}

impl fmt::Display for PageRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageRule::KeepAll => write!(f, "keep all pages"),
            PageRule::ExtractPage(page) => write!(f, "extract page {page}"),
            PageRule::DropPages(pages) => {
                let list: Vec<String> = pages.iter().map(u32::to_string).collect();
                write!(f, "drop pages {}", list.join(", "))
            }
            PageRule::DropLastPages(n) => write!(f, "drop last {n} page(s)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DashboardSpec {
    pub name: String,
    pub url: String,
    pub page_rule: PageRule,
    /// Position in the consolidated report, 0 for the first dashboard.
    pub order: usize,
}

/// One element of the dashboards file as written by the operator.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct DashboardEntry {
    pub name: String,
    pub url: String,
    pub extract_page: Option<u32>,
    pub drop_pages: Option<Vec<u32>>,
    pub drop_last_pages: Option<u32>,
}

impl TryFrom<(usize, DashboardEntry)> for DashboardSpec {
    type Error = DigestError;

    fn try_from((order, entry): (usize, DashboardEntry)) -> Result<Self> {
        if entry.name.is_empty()
            || !entry
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(DigestError::InvalidDashboard(format!(
                "name '{}' must be non-empty and use only letters, digits, '-' or '_'",
                entry.name
            )));
        }

        if entry.url.trim().is_empty() {
            return Err(DigestError::InvalidDashboard(format!(
                "'{}' has an empty url",
                entry.name
            )));
        }

        let rules = [
            entry.extract_page.is_some(),
            entry.drop_pages.is_some(),
            entry.drop_last_pages.is_some(),
        ]
        .into_iter()
        .filter(|set| *set)
        .count();

        if rules > 1 {
            return Err(DigestError::InvalidDashboard(format!(
                "'{}' sets more than one of extract_page | drop_pages | drop_last_pages",
                entry.name
            )));
        }

        let page_rule = match (entry.extract_page, entry.drop_pages, entry.drop_last_pages) {
            (Some(page), _, _) => PageRule::ExtractPage(page),
            (_, Some(pages), _) => PageRule::DropPages(pages.into_iter().collect()),
            (_, _, Some(n)) => PageRule::DropLastPages(n),
            _ => PageRule::KeepAll,
        };

        Ok(DashboardSpec {
            name: entry.name,
            url: entry.url,
            page_rule,
            order,
        })
    }
}

/// Parse the dashboards file contents; array position becomes `order`.
pub fn parse_dashboards(json: &str) -> Result<Vec<DashboardSpec>> {
    let entries: Vec<DashboardEntry> = serde_json::from_str(json)
        .map_err(|e| DigestError::InvalidDashboard(format!("malformed dashboards file: {e}")))?;

    let mut seen = HashSet::new();
    let mut specs = Vec::with_capacity(entries.len());

    for (order, entry) in entries.into_iter().enumerate() {
        let spec = DashboardSpec::try_from((order, entry))?;
        if !seen.insert(spec.name.clone()) {
            return Err(DigestError::InvalidDashboard(format!(
                "dashboard name '{}' is used more than once",
                spec.name
            )));
        }
        specs.push(spec);
    }

    Ok(specs)
}

pub async fn load_dashboards(path: &Path) -> Result<Vec<DashboardSpec>> {
    info!("Loading dashboards from {}", path.display());
    let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
        DigestError::InvalidDashboard(format!("cannot read {}: {e}", path.display()))
    })?;
    let specs = parse_dashboards(&raw)?;
    info!("Loaded {} dashboard(s)", specs.len());
    Ok(specs)
}
