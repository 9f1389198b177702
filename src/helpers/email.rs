use askama::Template;
use async_trait::async_trait;
use lettre::message::{header::ContentType, Attachment, Mailbox, MultiPart, SinglePart};
use lettre::{Address, AsyncSendmailTransport, AsyncTransport, Message, Tokio1Executor};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use crate::errors::{DigestError, Result};
use crate::models::dashboard::DashboardSpec;
use crate::models::run::DashboardFailure;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MailBody {
    Html(String),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMail {
    pub to: Vec<String>,
    pub subject: String,
    pub body: MailBody,
    pub attachment: Option<PathBuf>,
}

/// Hands a message to whatever delivers mail on this machine.
#[async_trait]
pub trait MailClient: Send + Sync {
    async fn send(&self, mail: &OutgoingMail) -> Result<()>;
}

/// Delivers through the locally installed `sendmail`-compatible client.
pub struct SendmailClient {
    command: String,
    from: String,
}

impl SendmailClient {
    pub fn new(command: impl Into<String>, from: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            from: from.into(),
        }
    }

    async fn build(&self, mail: &OutgoingMail) -> Result<Message> {
        let from: Mailbox = self.from.parse().map_err(dispatch_error)?;
        let mut builder = Message::builder().from(from).subject(mail.subject.as_str());
        for to in &mail.to {
            let mailbox: Mailbox = to.parse().map_err(dispatch_error)?;
            builder = builder.to(mailbox);
        }

        let body = match &mail.body {
            MailBody::Html(html) => SinglePart::html(html.clone()),
            MailBody::Text(text) => SinglePart::plain(text.clone()),
        };

        let message = match &mail.attachment {
            Some(path) => {
                let bytes = tokio::fs::read(path).await?;
                let filename = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "report.pdf".to_string());
                let content_type =
                    ContentType::parse("application/pdf").map_err(dispatch_error)?;
                info!("Attachment {} is {} bytes", filename, bytes.len());

                builder.multipart(
                    MultiPart::mixed()
                        .singlepart(body)
                        .singlepart(Attachment::new(filename).body(bytes, content_type)),
                )
            }
            None => builder.singlepart(body),
        };

        message.map_err(dispatch_error)
    }
}

fn dispatch_error(e: impl std::fmt::Display) -> DigestError {
    DigestError::MailDispatchFailed(e.to_string())
}

#[async_trait]
impl MailClient for SendmailClient {
    async fn send(&self, mail: &OutgoingMail) -> Result<()> {
        info!(
            "Preparing email '{}' for {} recipient(s)",
            mail.subject,
            mail.to.len()
        );

        let message = self.build(mail).await?;
        let transport = AsyncSendmailTransport::<Tokio1Executor>::new_with_command(&self.command);

        let result = transport.send(message).await;
        match &result {
            Ok(()) => info!("Email '{}' handed to {}", mail.subject, self.command),
            Err(e) => error!("Failed to send email '{}': {}", mail.subject, e),
        }

        result.map_err(dispatch_error)
    }
}

/// Split a recipient list into addresses. Entries may be separated by new
/// lines, commas or semicolons; blank entries and `#` comments are ignored,
/// malformed entries are skipped with a warning and duplicates dropped.
pub fn parse_recipients(raw: &str) -> Vec<String> {
    let mut recipients: Vec<String> = Vec::new();

    for line in raw.lines() {
        let line = strip_comment(line);
        for entry in line.split([',', ';']) {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            match entry.parse::<Address>() {
                Ok(address) => {
                    let address = address.to_string();
                    if !recipients.contains(&address) {
                        recipients.push(address);
                    }
                }
                Err(e) => warn!("Skipping malformed recipient '{}': {}", entry, e),
            }
        }
    }

    recipients
}

/// Cut a trailing comment. `#` only starts one at the beginning of a line or
/// after whitespace, since it is legal inside an address.
fn strip_comment(line: &str) -> &str {
    let mut previous: Option<char> = None;
    for (i, c) in line.char_indices() {
        if c == '#' && previous.is_none_or(char::is_whitespace) {
            return &line[..i];
        }
        previous = Some(c);
    }
    line
}

/// Read the recipient list at `path`. A directory means "the first `.txt` or
/// `.csv` file inside it, by name".
pub async fn load_recipients(path: &Path) -> Result<Vec<String>> {
    let unreadable = |reason: String| DigestError::RecipientListUnreadable {
        path: path.to_path_buf(),
        reason,
    };

    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|e| unreadable(e.to_string()))?;

    let file = if meta.is_dir() {
        let mut entries = tokio::fs::read_dir(path)
            .await
            .map_err(|e| unreadable(e.to_string()))?;
        let mut lists = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| unreadable(e.to_string()))?
        {
            let candidate = entry.path();
            let is_list = candidate
                .extension()
                .map(|ext| {
                    let ext = ext.to_string_lossy().to_lowercase();
                    ext == "txt" || ext == "csv"
                })
                .unwrap_or(false);
            if is_list {
                lists.push(candidate);
            }
        }
        lists.sort();
        lists
            .into_iter()
            .next()
            .ok_or_else(|| unreadable("no .txt or .csv file in directory".into()))?
    } else {
        path.to_path_buf()
    };

    info!("Reading recipients from {}", file.display());
    let raw = tokio::fs::read_to_string(&file)
        .await
        .map_err(|e| unreadable(e.to_string()))?;

    let recipients = parse_recipients(&raw);
    if recipients.is_empty() {
        return Err(unreadable("no valid addresses".into()));
    }

    info!("Loaded {} recipient(s)", recipients.len());
    Ok(recipients)
}

#[derive(Template)]
#[template(path = "digest_email.html")]
struct DigestEmail<'a> {
    day: &'a str,
    delivered: &'a [DashboardSpec],
    failed: &'a [DashboardFailure],
}

pub fn compose_digest_html(
    day: &str,
    delivered: &[DashboardSpec],
    failed: &[DashboardFailure],
) -> Result<String> {
    let html = DigestEmail {
        day,
        delivered,
        failed,
    }
    .render()?;
    Ok(html)
}

pub fn digest_subject(prefix: &str, day: &str) -> String {
    format!("{prefix} ({day})")
}

pub fn compose_failure_notice(day: &str, reason: &str) -> OutgoingMail {
    OutgoingMail {
        to: Vec::new(),
        subject: format!("Dashboard digest failed ({day})"),
        body: MailBody::Text(format!(
            "The dashboard digest run for {day} did not complete.\n\nReason: {reason}\n"
        )),
        attachment: None,
    }
}
