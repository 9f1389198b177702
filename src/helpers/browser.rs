//! Browser session used to open dashboards and start their PDF export.
//!
//! The export engine only talks to [`SessionDriver`]; the headless Chrome
//! implementation below reuses an already signed-in browser profile and never
//! authenticates on its own.

use async_trait::async_trait;
use headless_chrome::protocol::cdp::Browser as BrowserDomain;
use headless_chrome::{Browser, Element, LaunchOptions, Tab};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::BrowserConfig;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("failed to launch browser: {0}")]
    Launch(String),

    #[error("failed to open {url}: {reason}")]
    Navigation { url: String, reason: String },

    /// The export control could not be located on the page.
    #[error("export control not found: {0}")]
    ControlNotFound(String),

    /// The export control is present but cannot be activated.
    #[error("export control disabled: {0}")]
    ControlDisabled(String),

    #[error("browser error: {0}")]
    Browser(String),
}

/// An authenticated browser session, exclusively owned by the current run.
#[async_trait]
pub trait SessionDriver: Send {
    async fn navigate(&mut self, url: &str) -> Result<(), DriverError>;

    /// Reload the current page after a failed export attempt.
    async fn refresh(&mut self) -> Result<(), DriverError>;

    /// Activate the export control. `Ok` means a download was started.
    async fn trigger_export(&mut self) -> Result<(), DriverError>;

    /// Whether the dashboard is still rendering (loading indicators visible).
    async fn is_busy(&mut self) -> Result<bool, DriverError>;
}

/// Opens one session per run, downloading into that run's directory.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self, download_dir: &Path) -> Result<Box<dyn SessionDriver>, DriverError>;
}

const CONTROL_TIMEOUT: Duration = Duration::from_secs(10);
const CONFIRM_TIMEOUT: Duration = Duration::from_secs(4);
const MENU_SETTLE: Duration = Duration::from_millis(400);

const DIRECT_EXPORT_BUTTON: &str = "//button[@id='exportMenuBtn'] | //button[contains(@title,'Export') or contains(@aria-label,'Export') or contains(@aria-label,'Exportar')]";
const DIRECT_PDF_ITEM: &str =
    "//button[@data-testid='export-to-pdf-btn'] | //button[.//span[contains(text(),'PDF')]]";
const OVERFLOW_MENU: &str = "//button[contains(@aria-label,'More options') or contains(@title,'More options') or contains(@aria-label,'Mais opções') or contains(@title,'Mais opções')]";
const EXPORT_PDF_ITEM: &str = "//button[.//span[contains(text(),'Export to PDF') or contains(text(),'Exportar para PDF')]] | //li[.//span[contains(text(),'Export to PDF') or contains(text(),'Exportar para PDF')]]";
const FILE_MENU: &str = "//button[contains(@aria-label,'File') or contains(@title,'File') or contains(@aria-label,'Arquivo') or contains(@title,'Arquivo')]";
const FILE_EXPORT_ITEM: &str =
    "//button[.//span[contains(text(),'Export') or contains(text(),'Exportar')]]";
const FILE_PDF_ITEM: &str = "//button[.//span[contains(text(),'PDF')]]";

const EXPORT_ROUTES: &[(&str, &[&str])] = &[
    ("direct", &[DIRECT_EXPORT_BUTTON, DIRECT_PDF_ITEM]),
    ("overflow", &[OVERFLOW_MENU, EXPORT_PDF_ITEM]),
    ("file menu", &[FILE_MENU, FILE_EXPORT_ITEM, FILE_PDF_ITEM]),
];

const CONFIRM_BUTTONS: &[&str] = &[
    "//*[@id='okButton']",
    "//button[@data-testid='dialog-ok-btn']",
    "//button[normalize-space(.)='OK']",
    "//button[normalize-space(.)='Export']",
    "//button[normalize-space(.)='Exportar']",
];

/// Power BI renders the report inside iframes, so both the busy probe and the
/// control lookup search every same-origin frame document as well. Frames
/// from another origin are not reachable from the page and are skipped.
const COLLECT_DOCUMENTS: &str = r#"const docs = [document];
    for (let i = 0; i < docs.length; i++) {
        for (const frame of docs[i].querySelectorAll('iframe')) {
            try {
                if (frame.contentDocument) docs.push(frame.contentDocument);
            } catch (e) {}
        }
    }"#;

const BUSY_SELECTORS: &[&str] = &[
    "//*[@aria-busy='true']",
    "//*[contains(@class,'busy') or contains(@class,'loading') or contains(@class,'spinner')]",
    "//*[@role='progressbar']",
    "//div[contains(@class,'powerbi-loader')]",
    "//div[contains(@class,'waitSpinner')]",
];

const IS_DISABLED: &str =
    "function() { return !!this.disabled || this.getAttribute('aria-disabled') === 'true'; }";
const JS_CLICK: &str = "function() { this.click(); }";
const LOOKUP_POLL: Duration = Duration::from_millis(250);

fn js_string(value: &str) -> String {
    serde_json::Value::from(value).to_string()
}

fn busy_probe_script() -> String {
    let selectors = serde_json::Value::from(BUSY_SELECTORS.to_vec()).to_string();
    format!(
        r#"(() => {{
    {COLLECT_DOCUMENTS}
    const selectors = {selectors};
    return docs.some(doc => selectors.some(s =>
        doc.evaluate(s, doc, null, XPathResult.FIRST_ORDERED_NODE_TYPE, null)
            .singleNodeValue !== null));
}})()"#
    )
}

/// Clicks the first match of `xpath` inside a frame document; the top-level
/// document is handled through the DevTools element API instead.
fn frame_click_script(xpath: &str) -> String {
    let xpath = js_string(xpath);
    format!(
        r#"(() => {{
    {COLLECT_DOCUMENTS}
    const xpath = {xpath};
    for (const doc of docs.slice(1)) {{
        const el = doc.evaluate(xpath, doc, null, XPathResult.FIRST_ORDERED_NODE_TYPE, null)
            .singleNodeValue;
        if (el === null) continue;
        if (el.disabled || el.getAttribute('aria-disabled') === 'true') return 'disabled';
        el.click();
        return 'clicked';
    }}
    return 'missing';
}})()"#
    )
}

#[derive(Debug, PartialEq, Eq)]
enum FrameClick {
    Clicked,
    Disabled,
    Missing,
}

impl FrameClick {
    fn from_result(value: Option<&serde_json::Value>) -> Self {
        match value.and_then(|v| v.as_str()) {
            Some("clicked") => Self::Clicked,
            Some("disabled") => Self::Disabled,
            _ => Self::Missing,
        }
    }
}

pub struct ChromeSessionFactory {
    config: BrowserConfig,
}

impl ChromeSessionFactory {
    pub fn new(config: BrowserConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SessionFactory for ChromeSessionFactory {
    async fn open(&self, download_dir: &Path) -> Result<Box<dyn SessionDriver>, DriverError> {
        let config = self.config.clone();
        let download_dir = download_dir.to_path_buf();
        let session = tokio::task::spawn_blocking(move || ChromeSession::launch(config, download_dir))
            .await
            .map_err(|e| DriverError::Launch(e.to_string()))??;
        Ok(Box::new(session))
    }
}

pub struct ChromeSession {
    // Dropping the browser closes it.
    _browser: Browser,
    tab: Arc<Tab>,
}

impl ChromeSession {
    fn launch(config: BrowserConfig, download_dir: PathBuf) -> Result<Self, DriverError> {
        info!(
            "Launching browser (headless: {}, profile: {:?})",
            config.headless, config.profile_dir
        );

        let options = LaunchOptions::default_builder()
            .headless(config.headless)
            .path(config.executable)
            .user_data_dir(config.profile_dir)
            .window_size(Some((1920, 1080)))
            .idle_browser_timeout(Duration::from_secs(30 * 60))
            .build()
            .map_err(|e| DriverError::Launch(e.to_string()))?;

        let browser = Browser::new(options).map_err(|e| DriverError::Launch(e.to_string()))?;
        let tab = browser
            .new_tab()
            .map_err(|e| DriverError::Launch(e.to_string()))?;

        let download_path = std::fs::canonicalize(&download_dir).unwrap_or(download_dir);
        tab.call_method(BrowserDomain::SetDownloadBehavior {
            behavior: BrowserDomain::SetDownloadBehaviorBehaviorOption::Allow,
            browser_context_id: None,
            download_path: Some(download_path.to_string_lossy().into_owned()),
            events_enabled: None,
        })
        .map_err(|e| DriverError::Launch(format!("cannot set download directory: {e}")))?;

        info!("Browser downloads go to {}", download_path.display());
        Ok(Self {
            _browser: browser,
            tab,
        })
    }

    async fn with_tab<T, F>(&self, f: F) -> Result<T, DriverError>
    where
        F: FnOnce(&Tab) -> Result<T, DriverError> + Send + 'static,
        T: Send + 'static,
    {
        let tab = Arc::clone(&self.tab);
        tokio::task::spawn_blocking(move || f(&tab))
            .await
            .map_err(|e| DriverError::Browser(e.to_string()))?
    }
}

#[async_trait]
impl SessionDriver for ChromeSession {
    async fn navigate(&mut self, url: &str) -> Result<(), DriverError> {
        let url = url.to_string();
        self.with_tab(move |tab| {
            tab.navigate_to(&url)
                .and_then(|tab| tab.wait_until_navigated())
                .map(|_| ())
                .map_err(|e| DriverError::Navigation {
                    url: url.clone(),
                    reason: e.to_string(),
                })
        })
        .await
    }

    async fn refresh(&mut self) -> Result<(), DriverError> {
        self.with_tab(|tab| {
            tab.reload(false, None)
                .and_then(|tab| tab.wait_until_navigated())
                .map(|_| ())
                .map_err(|e| DriverError::Browser(e.to_string()))
        })
        .await
    }

    async fn trigger_export(&mut self) -> Result<(), DriverError> {
        self.with_tab(|tab| {
            let mut last_error = DriverError::ControlNotFound("no export route available".into());

            for (route, steps) in EXPORT_ROUTES {
                match run_route(tab, steps) {
                    Ok(()) => {
                        info!("Export menu opened via {route} route");
                        return confirm_export(tab);
                    }
                    Err(e) => {
                        info!("Export route '{route}' unavailable: {e}");
                        // A disabled control is the more telling classification.
                        if !matches!(last_error, DriverError::ControlDisabled(_)) {
                            last_error = e;
                        }
                    }
                }
            }

            Err(last_error)
        })
        .await
    }

    async fn is_busy(&mut self) -> Result<bool, DriverError> {
        self.with_tab(|tab| {
            let result = tab
                .evaluate(&busy_probe_script(), false)
                .map_err(|e| DriverError::Browser(e.to_string()))?;
            Ok(result
                .value
                .and_then(|v| v.as_bool())
                .unwrap_or(true))
        })
        .await
    }
}

fn run_route(tab: &Tab, steps: &[&str]) -> Result<(), DriverError> {
    for xpath in steps {
        click(tab, xpath, CONTROL_TIMEOUT)?;
        std::thread::sleep(MENU_SETTLE);
    }
    Ok(())
}

/// Find `xpath` in the page or one of its frames within `timeout` and click it.
fn click(tab: &Tab, xpath: &str, timeout: Duration) -> Result<(), DriverError> {
    let deadline = Instant::now() + timeout;

    loop {
        if let Ok(element) = tab.find_element_by_xpath(xpath) {
            return click_element(&element, xpath);
        }

        let result = tab
            .evaluate(&frame_click_script(xpath), false)
            .map_err(|e| DriverError::Browser(e.to_string()))?;
        match FrameClick::from_result(result.value.as_ref()) {
            FrameClick::Clicked => {
                info!("Clicked {xpath} inside a report frame");
                return Ok(());
            }
            FrameClick::Disabled => return Err(DriverError::ControlDisabled(xpath.to_string())),
            FrameClick::Missing => {}
        }

        if Instant::now() >= deadline {
            return Err(DriverError::ControlNotFound(xpath.to_string()));
        }
        std::thread::sleep(LOOKUP_POLL);
    }
}

fn click_element(element: &Element<'_>, xpath: &str) -> Result<(), DriverError> {
    let disabled = element
        .call_js_fn(IS_DISABLED, vec![], false)
        .ok()
        .and_then(|r| r.value)
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    if disabled {
        return Err(DriverError::ControlDisabled(xpath.to_string()));
    }

    click_with_fallback(
        xpath,
        || element.click().map(|_| ()),
        || element.call_js_fn(JS_CLICK, vec![], false).map(|_| ()),
    )
}

/// Try `native`; if it fails, retry once with `scripted`.
fn click_with_fallback<E: std::fmt::Display>(
    xpath: &str,
    native: impl FnOnce() -> Result<(), E>,
    scripted: impl FnOnce() -> Result<(), E>,
) -> Result<(), DriverError> {
    let Err(e) = native() else {
        return Ok(());
    };
    warn!("Native click on {xpath} failed ({e}); retrying through JavaScript");
    scripted().map_err(|e| DriverError::Browser(format!("click on {xpath} failed: {e}")))
}

fn confirm_export(tab: &Tab) -> Result<(), DriverError> {
    for xpath in CONFIRM_BUTTONS {
        match click(tab, xpath, CONFIRM_TIMEOUT) {
            Ok(()) => {
                info!("Export dialog confirmed");
                return Ok(());
            }
            Err(DriverError::ControlNotFound(_)) => continue,
            Err(e) => warn!("Confirmation button {xpath} unusable: {e}"),
        }
    }
    Err(DriverError::ControlNotFound("export confirmation dialog".into()))
}
