use async_trait::async_trait;
use chrono::{Local, NaiveDate};
use tracing::{error, info, warn};

use crate::{
    config::{DigestConfig, FailurePolicy},
    errors::{DigestError, Result},
    helpers::{
        browser::{SessionDriver, SessionFactory},
        email::{self, MailBody, MailClient, OutgoingMail},
        export::{export_dashboard, DownloadDir},
        pdf,
    },
    models::{
        dashboard::{load_dashboards, DashboardSpec},
        run::{ProcessedDocument, RunContext, RunOutcome},
    },
    scheduler::ScheduledJob,
};

/// Runs the export → page rule → merge → mail pipeline once per call.
pub struct DigestService {
    pub config: DigestConfig,
    sessions: Box<dyn SessionFactory>,
    mailer: Box<dyn MailClient>,
}

impl DigestService {
    pub fn new(
        config: DigestConfig,
        sessions: Box<dyn SessionFactory>,
        mailer: Box<dyn MailClient>,
    ) -> Self {
        info!("Creating new DigestService instance");
        Self {
            config,
            sessions,
            mailer,
        }
    }

    /// Run the pipeline for `day`, never propagating the failure: it is
    /// logged, an optional alert is sent, and the outcome is returned.
    pub async fn run_once(&self, day: NaiveDate) -> RunOutcome {
        info!("Starting digest run for {}", day);

        match self.process_run(day).await {
            Ok(outcome) => {
                info!("Digest run for {} finished", day);
                outcome
            }
            Err(e) => {
                error!("Digest run for {} failed: {}", day, e);
                self.send_alert(day, &e).await;
                RunOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Export every dashboard in order, apply page rules, merge, and mail the
    /// consolidated report.
    pub async fn process_run(&self, day: NaiveDate) -> Result<RunOutcome> {
        let dashboards = load_dashboards(&self.config.dashboards_file).await?;
        let mut ctx = RunContext::new(&self.config.download_dir, day, dashboards);
        tokio::fs::create_dir_all(&ctx.run_dir).await?;

        let mut session = self.sessions.open(&ctx.run_dir).await?;
        let downloads = DownloadDir::new(&ctx.run_dir);

        for spec in ctx.dashboards.clone() {
            info!(dashboard = %spec.name, "==== Starting {} ====", spec.name);
            match self
                .process_dashboard(&spec, session.as_mut(), &downloads, &ctx)
                .await
            {
                Ok(document) => {
                    info!(
                        dashboard = %spec.name,
                        "==== Finished {} ({} page(s)) ====", spec.name, document.page_count
                    );
                    ctx.processed.push((spec, document));
                }
                Err(e) => {
                    error!(dashboard = %spec.name, "Dashboard failed: {}", e);
                    ctx.record_failure(&spec, &e);
                    if self.config.failure_policy == FailurePolicy::Abort {
                        return Err(e);
                    }
                }
            }
        }

        // The browser is not needed past this point.
        drop(session);

        let report = pdf::merge_documents(
            &ctx.documents(),
            &ctx.report_path(&self.config.report_basename),
        )?;

        let recipients = email::load_recipients(&self.config.recipients_path).await?;

        let mut delivered: Vec<DashboardSpec> =
            ctx.processed.iter().map(|(spec, _)| spec.clone()).collect();
        delivered.sort_by_key(|spec| spec.order);
        let day_label = ctx.day_label();
        let html = email::compose_digest_html(&day_label, &delivered, &ctx.failures)?;

        let mail = OutgoingMail {
            to: recipients.clone(),
            subject: email::digest_subject(&self.config.mail.subject_prefix, &day_label),
            body: MailBody::Html(html),
            attachment: Some(report.path.clone()),
        };
        self.mailer.send(&mail).await?;

        info!(
            "Sent {} ({} page(s)) to {} recipient(s)",
            report.path.display(),
            report.page_count,
            recipients.len()
        );

        Ok(RunOutcome::Delivered {
            report,
            recipients: recipients.len(),
            failed_dashboards: ctx.failures,
        })
    }

    async fn process_dashboard(
        &self,
        spec: &DashboardSpec,
        session: &mut dyn SessionDriver,
        downloads: &DownloadDir,
        ctx: &RunContext,
    ) -> Result<ProcessedDocument> {
        let artifact = export_dashboard(spec, session, downloads, &self.config.export).await?;

        let saved = ctx.download_path(spec);
        if artifact.path != saved {
            if tokio::fs::try_exists(&saved).await? {
                tokio::fs::remove_file(&saved).await?;
            }
            tokio::fs::rename(&artifact.path, &saved).await?;
        }
        info!(dashboard = %spec.name, "Saved {}", saved.display());

        pdf::apply_rule(&saved, &spec.page_rule, &ctx.processed_path(spec))
    }

    async fn send_alert(&self, day: NaiveDate, failure: &DigestError) {
        let Some(to) = &self.config.mail.alert_to else {
            return;
        };

        let mut notice =
            email::compose_failure_notice(&day.format("%Y-%m-%d").to_string(), &failure.to_string());
        notice.to = vec![to.clone()];

        if let Err(e) = self.mailer.send(&notice).await {
            warn!("Failed to send failure alert to {}: {}", to, e);
        }
    }
}

#[async_trait]
impl ScheduledJob for DigestService {
    async fn run(&self) {
        self.run_once(Local::now().date_naive()).await;
    }
}
