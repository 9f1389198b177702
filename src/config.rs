//! Runtime configuration read from the environment, with embedded defaults.
//!
//! A `.env` file in the working directory is loaded first when present.
//! Keys that are set but cannot be parsed are reported instead of being
//! replaced by their default.

use std::{path::PathBuf, str::FromStr, time::Duration};

use chrono::NaiveTime;
use thiserror::Error;

const DEFAULT_DOWNLOAD_DIR: &str = "downloads";
const DEFAULT_EMAIL_LIST_PATH: &str = "recipients";
const DEFAULT_DASHBOARDS_FILE: &str = "dashboards.json";
const DEFAULT_RUN_HOUR_MINUTE: &str = "15:50";
const DEFAULT_PRE_EXPORT_COOLDOWN_SEC: u64 = 1;
const DEFAULT_IDLE_STABLE_SECONDS: u64 = 5;
const DEFAULT_IDLE_TIMEOUT_SEC: u64 = 90;
const DEFAULT_DOWNLOAD_TIMEOUT_SEC: u64 = 600;
const DEFAULT_IMMEDIATE_TRIES: u32 = 3;
const DEFAULT_STABILITY_POLL_MS: u64 = 400;
const DEFAULT_DOWNLOAD_POLL_MS: u64 = 800;
const DEFAULT_REPORT_BASENAME: &str = "DailyIndicators";
const DEFAULT_MAIL_CLIENT_PATH: &str = "sendmail";
const DEFAULT_MAIL_FROM: &str = "dashboards@localhost";
const DEFAULT_MAIL_SUBJECT_PREFIX: &str = "Daily indicators";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key} has invalid value '{value}': {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// What a run does when one dashboard fails to export or process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Fail the whole run; no partial report is merged or mailed.
    #[default]
    Abort,
    /// Merge and mail the dashboards that succeeded, listing the failures.
    Continue,
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "abort" => Ok(Self::Abort),
            "continue" => Ok(Self::Continue),
            other => Err(format!("expected 'abort' or 'continue', got '{other}'")),
        }
    }
}

/// Timing knobs for the export engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportTuning {
    pub pre_export_cooldown: Duration,
    pub idle_stable: Duration,
    pub idle_timeout: Duration,
    pub download_timeout: Duration,
    pub force_export_immediate: bool,
    pub immediate_tries: u32,
    pub stability_poll: Duration,
    pub download_poll: Duration,
}

impl Default for ExportTuning {
    fn default() -> Self {
        Self {
            pre_export_cooldown: Duration::from_secs(DEFAULT_PRE_EXPORT_COOLDOWN_SEC),
            idle_stable: Duration::from_secs(DEFAULT_IDLE_STABLE_SECONDS),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SEC),
            download_timeout: Duration::from_secs(DEFAULT_DOWNLOAD_TIMEOUT_SEC),
            force_export_immediate: true,
            immediate_tries: DEFAULT_IMMEDIATE_TRIES,
            stability_poll: Duration::from_millis(DEFAULT_STABILITY_POLL_MS),
            download_poll: Duration::from_millis(DEFAULT_DOWNLOAD_POLL_MS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BrowserConfig {
    pub executable: Option<PathBuf>,
    pub profile_dir: Option<PathBuf>,
    pub headless: bool,
}

#[derive(Debug, Clone)]
pub struct MailConfig {
    pub client_path: String,
    pub from: String,
    pub subject_prefix: String,
    pub alert_to: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DigestConfig {
    pub download_dir: PathBuf,
    pub recipients_path: PathBuf,
    pub dashboards_file: PathBuf,
    pub run_at: NaiveTime,
    pub report_basename: String,
    pub failure_policy: FailurePolicy,
    pub export: ExportTuning,
    pub browser: BrowserConfig,
    pub mail: MailConfig,
}

impl DigestConfig {
    /// Load from `.env` (if any) and the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let run_at_raw = get("RUN_HOUR_MINUTE").unwrap_or_else(|| DEFAULT_RUN_HOUR_MINUTE.into());
        let run_at = NaiveTime::parse_from_str(&run_at_raw, "%H:%M").map_err(|e| {
            ConfigError::Invalid {
                key: "RUN_HOUR_MINUTE",
                value: run_at_raw.clone(),
                reason: e.to_string(),
            }
        })?;

        let export = ExportTuning {
            pre_export_cooldown: Duration::from_secs(parse_or(
                &get,
                "PRE_EXPORT_COOLDOWN_SEC",
                DEFAULT_PRE_EXPORT_COOLDOWN_SEC,
            )?),
            idle_stable: Duration::from_secs(parse_or(
                &get,
                "IDLE_STABLE_SECONDS",
                DEFAULT_IDLE_STABLE_SECONDS,
            )?),
            idle_timeout: Duration::from_secs(parse_or(
                &get,
                "IDLE_TIMEOUT_SEC",
                DEFAULT_IDLE_TIMEOUT_SEC,
            )?),
            download_timeout: Duration::from_secs(parse_or(
                &get,
                "DOWNLOAD_TIMEOUT_SEC",
                DEFAULT_DOWNLOAD_TIMEOUT_SEC,
            )?),
            force_export_immediate: parse_bool_or(&get, "FORCE_EXPORT_IMMEDIATE", true)?,
            immediate_tries: parse_or(&get, "IMMEDIATE_TRIES", DEFAULT_IMMEDIATE_TRIES)?,
            stability_poll: Duration::from_millis(parse_or(
                &get,
                "STABILITY_POLL_MS",
                DEFAULT_STABILITY_POLL_MS,
            )?),
            download_poll: Duration::from_millis(parse_or(
                &get,
                "DOWNLOAD_POLL_MS",
                DEFAULT_DOWNLOAD_POLL_MS,
            )?),
        };

        let failure_policy = match get("RUN_FAILURE_POLICY") {
            Some(raw) => raw.parse().map_err(|reason| ConfigError::Invalid {
                key: "RUN_FAILURE_POLICY",
                value: raw.clone(),
                reason,
            })?,
            None => FailurePolicy::default(),
        };

        Ok(Self {
            download_dir: get("DOWNLOAD_DIR")
                .unwrap_or_else(|| DEFAULT_DOWNLOAD_DIR.into())
                .into(),
            recipients_path: get("EMAIL_LIST_PATH")
                .unwrap_or_else(|| DEFAULT_EMAIL_LIST_PATH.into())
                .into(),
            dashboards_file: get("DASHBOARDS_FILE")
                .unwrap_or_else(|| DEFAULT_DASHBOARDS_FILE.into())
                .into(),
            run_at,
            report_basename: get("REPORT_BASENAME")
                .unwrap_or_else(|| DEFAULT_REPORT_BASENAME.into()),
            failure_policy,
            export,
            browser: BrowserConfig {
                executable: get("BROWSER_PATH").map(PathBuf::from),
                profile_dir: get("BROWSER_PROFILE_DIR").map(PathBuf::from),
                headless: parse_bool_or(&get, "BROWSER_HEADLESS", false)?,
            },
            mail: MailConfig {
                client_path: get("MAIL_CLIENT_PATH")
                    .unwrap_or_else(|| DEFAULT_MAIL_CLIENT_PATH.into()),
                from: get("MAIL_FROM").unwrap_or_else(|| DEFAULT_MAIL_FROM.into()),
                subject_prefix: get("MAIL_SUBJECT_PREFIX")
                    .unwrap_or_else(|| DEFAULT_MAIL_SUBJECT_PREFIX.into()),
                alert_to: get("ALERT_EMAIL"),
            },
        })
    }
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn parse_bool_or<G>(get: &G, key: &'static str, default: bool) -> Result<bool, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid {
                key,
                value: raw,
                reason: "expected a boolean".into(),
            }),
        },
        None => Ok(default),
    }
}
