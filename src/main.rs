use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use dashboard_digest::{
    config::DigestConfig,
    helpers::{browser::ChromeSessionFactory, email::SendmailClient},
    scheduler::Scheduler,
    service::DigestService,
    telemetry,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = DigestConfig::from_env().context("invalid configuration")?;

    tokio::fs::create_dir_all(&config.download_dir)
        .await
        .with_context(|| format!("cannot create {}", config.download_dir.display()))?;

    let _log_guard = telemetry::init(&config.download_dir).context("failed to set up logging")?;

    info!("Starting dashboard digest service");
    info!(
        "Downloads in {}, dashboards from {}, recipients from {}",
        config.download_dir.display(),
        config.dashboards_file.display(),
        config.recipients_path.display()
    );

    let sessions = ChromeSessionFactory::new(config.browser.clone());
    let mailer = SendmailClient::new(config.mail.client_path.clone(), config.mail.from.clone());
    let run_at = config.run_at;

    let service = Arc::new(DigestService::new(
        config,
        Box::new(sessions),
        Box::new(mailer),
    ));

    Scheduler::new(service, run_at).run_forever().await;

    Ok(())
}
