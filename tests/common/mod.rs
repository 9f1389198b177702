#![allow(dead_code)]

use async_trait::async_trait;
use dashboard_digest::{
    config::DigestConfig,
    errors::{DigestError, Result},
    helpers::{
        browser::{DriverError, SessionDriver, SessionFactory},
        email::{MailClient, OutgoingMail},
    },
};
use lopdf::{dictionary, Document, Object, Stream};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Write a PDF whose pages carry a `Label` entry of `"<tag>-<n>"`.
pub fn write_pdf(path: &Path, tag: &str, pages: u32) {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
    });

    let mut kids: Vec<Object> = Vec::new();
    for n in 1..=pages {
        let body = format!("BT /F1 24 Tf 72 720 Td ({tag} page {n}) Tj ET");
        let content_id = doc.add_object(Stream::new(dictionary! {}, body.into_bytes()));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
            "Resources" => dictionary! { "Font" => dictionary! { "F1" => font_id } },
            "MediaBox" => vec![
                Object::Integer(0),
                Object::Integer(0),
                Object::Integer(595),
                Object::Integer(842),
            ],
            "Label" => Object::string_literal(format!("{tag}-{n}")),
        });
        kids.push(page_id.into());
    }

    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => pages as i64,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);
    doc.save(path).unwrap();
}

pub fn page_labels(path: &Path) -> Vec<String> {
    let doc = Document::load(path).unwrap();
    doc.get_pages()
        .values()
        .map(|id| {
            let page = doc.get_dictionary(*id).unwrap();
            String::from_utf8_lossy(page.get(b"Label").unwrap().as_str().unwrap()).into_owned()
        })
        .collect()
}

/// What the fake browser produces for one dashboard URL.
#[derive(Clone)]
pub enum FakeExport {
    Pdf { tag: String, pages: u32 },
    ControlMissing,
}

#[derive(Clone, Default)]
pub struct FakeBrowser {
    exports: Arc<Mutex<HashMap<String, FakeExport>>>,
    pub visited: Arc<Mutex<Vec<String>>>,
    pub sessions_opened: Arc<Mutex<usize>>,
}

impl FakeBrowser {
    pub fn serve(&self, url: &str, export: FakeExport) {
        self.exports.lock().unwrap().insert(url.to_string(), export);
    }

    pub fn visited(&self) -> Vec<String> {
        self.visited.lock().unwrap().clone()
    }
}

struct FakeSession {
    browser: FakeBrowser,
    download_dir: PathBuf,
    current: Option<String>,
}

#[async_trait]
impl SessionFactory for FakeBrowser {
    async fn open(&self, download_dir: &Path) -> std::result::Result<Box<dyn SessionDriver>, DriverError> {
        *self.sessions_opened.lock().unwrap() += 1;
        Ok(Box::new(FakeSession {
            browser: self.clone(),
            download_dir: download_dir.to_path_buf(),
            current: None,
        }))
    }
}

#[async_trait]
impl SessionDriver for FakeSession {
    async fn navigate(&mut self, url: &str) -> std::result::Result<(), DriverError> {
        self.browser.visited.lock().unwrap().push(url.to_string());
        self.current = Some(url.to_string());
        Ok(())
    }

    async fn refresh(&mut self) -> std::result::Result<(), DriverError> {
        Ok(())
    }

    async fn trigger_export(&mut self) -> std::result::Result<(), DriverError> {
        let url = self.current.clone().unwrap_or_default();
        let export = self.browser.exports.lock().unwrap().get(&url).cloned();
        match export {
            Some(FakeExport::Pdf { tag, pages }) => {
                // Like a browser: write under a temp name, then rename.
                let partial = self.download_dir.join(format!("{tag}.pdf.crdownload"));
                write_pdf(&partial, &tag, pages);
                std::fs::rename(&partial, self.download_dir.join(format!("{tag}.pdf"))).unwrap();
                Ok(())
            }
            Some(FakeExport::ControlMissing) | None => {
                Err(DriverError::ControlNotFound("export button".into()))
            }
        }
    }

    async fn is_busy(&mut self) -> std::result::Result<bool, DriverError> {
        Ok(false)
    }
}

/// Records every message; fails the ones carrying an attachment when asked to.
#[derive(Clone, Default)]
pub struct RecordingMailer {
    pub sent: Arc<Mutex<Vec<OutgoingMail>>>,
    pub fail_reports: bool,
}

impl RecordingMailer {
    pub fn sent(&self) -> Vec<OutgoingMail> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl MailClient for RecordingMailer {
    async fn send(&self, mail: &OutgoingMail) -> Result<()> {
        if self.fail_reports && mail.attachment.is_some() {
            return Err(DigestError::MailDispatchFailed("client exited with status 75".into()));
        }
        self.sent.lock().unwrap().push(mail.clone());
        Ok(())
    }
}

/// A scratch workspace with a dashboards file, a recipient list and fast
/// export timings.
pub struct Workspace {
    pub dir: tempfile::TempDir,
}

impl Workspace {
    pub fn new(dashboards_json: &str, recipients: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("dashboards.json"), dashboards_json).unwrap();
        std::fs::create_dir(dir.path().join("recipients")).unwrap();
        std::fs::write(dir.path().join("recipients/list.txt"), recipients).unwrap();
        Self { dir }
    }

    pub fn config(&self, extra: &[(&str, &str)]) -> DigestConfig {
        let root = self.dir.path();
        let mut env: HashMap<String, String> = HashMap::from([
            ("DOWNLOAD_DIR".into(), root.join("downloads").display().to_string()),
            ("EMAIL_LIST_PATH".into(), root.join("recipients").display().to_string()),
            ("DASHBOARDS_FILE".into(), root.join("dashboards.json").display().to_string()),
            ("REPORT_BASENAME".into(), "Daily".into()),
            ("PRE_EXPORT_COOLDOWN_SEC".into(), "0".into()),
            ("IDLE_STABLE_SECONDS".into(), "0".into()),
            ("IDLE_TIMEOUT_SEC".into(), "1".into()),
            ("DOWNLOAD_TIMEOUT_SEC".into(), "5".into()),
            ("IMMEDIATE_TRIES".into(), "2".into()),
            ("STABILITY_POLL_MS".into(), "10".into()),
            ("DOWNLOAD_POLL_MS".into(), "10".into()),
        ]);
        for (k, v) in extra {
            env.insert(k.to_string(), v.to_string());
        }
        DigestConfig::from_lookup(|key| env.get(key).cloned()).unwrap()
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.dir.path().join(relative)
    }
}
