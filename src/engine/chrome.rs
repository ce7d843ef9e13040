//! Chromium engine driven over CDP with `headless_chrome`.

use super::{
    expect_ready, CaptureRequest, Engine, EngineError, EngineLauncher, LaunchError, PageSize,
    WarmRequest,
};
use crate::interrupt::Interrupt;
use crate::poller::{poll_until_ready, PollPolicy, ProbeError, DEFAULT_POLL_INTERVAL};
use headless_chrome::protocol::cdp::types::Event;
use headless_chrome::protocol::cdp::{Network, Page};
use headless_chrome::types::PrintToPdfOptions;
use headless_chrome::{Browser, LaunchOptions, Tab};
use reqwest::Url;
use std::collections::HashSet;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

const PRINT_TOGGLE_SELECTOR: &str = r#"button[aria-label^="Print view"]"#;
const PRINT_ICON_SELECTOR: &str = r#"button[aria-label^="Open print options"]"#;
const HTML_DOWNLOAD_BUTTON_SELECTOR: &str = r#"button[aria-label="Download the HTML for printing"]"#;

/// True once Paged.js has produced pages and the page count has not changed for a second.
const PAGED_READY_SCRIPT: &str = r#"(() => {
    const pages = document.querySelectorAll('.pagedjs_pages .pagedjs_page');
    if (!pages.length) {
        window.__PAGED_LAST_COUNT = 0;
        window.__PAGED_LAST_CHANGE = Date.now();
        return false;
    }
    if (window.__PAGED_LAST_COUNT !== pages.length) {
        window.__PAGED_LAST_COUNT = pages.length;
        window.__PAGED_LAST_CHANGE = Date.now();
        return false;
    }
    return Date.now() - (window.__PAGED_LAST_CHANGE || 0) > 1000;
})()"#;

const DOCUMENT_LOADED_SCRIPT: &str = "document.readyState === 'complete'";

const MAIN_CONTENT_SCRIPT: &str = r#"(() => !!(document.querySelector('.pagedjs_pages')
    || document.querySelector('[data-book]')
    || document.querySelector('main')))()"#;

/// Browser launch and wait settings shared by every unit.
#[derive(Debug, Clone)]
pub struct ChromeSettings {
    pub headless: bool,
    pub sandbox: bool,
    /// Browser binary; auto-detected when None.
    pub chrome_path: Option<PathBuf>,
    pub poll_interval: Duration,
    /// Extra wait after Paged.js settles, before printing.
    pub sleep_after_ready: Duration,
    /// How long the CDP connection may stay silent. Must exceed the longest single wait.
    pub idle_timeout: Duration,
}

impl Default for ChromeSettings {
    fn default() -> Self {
        ChromeSettings {
            headless: true,
            sandbox: true,
            chrome_path: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            sleep_after_ready: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(30 * 60),
        }
    }
}

/// Launches one browser process per unit.
#[derive(Debug, Clone)]
pub struct ChromeLauncher {
    settings: ChromeSettings,
    interrupt: Interrupt,
}

impl ChromeLauncher {
    pub fn new(settings: ChromeSettings, interrupt: Interrupt) -> Self {
        ChromeLauncher {
            settings,
            interrupt,
        }
    }

    pub fn launch_chrome(&self) -> Result<ChromeEngine, LaunchError> {
        ChromeEngine::launch(self.settings.clone(), self.interrupt.clone())
    }
}

impl EngineLauncher for ChromeLauncher {
    fn launch(&self) -> Result<Box<dyn Engine>, LaunchError> {
        Ok(Box::new(self.launch_chrome()?))
    }
}

/// Closes the tab when dropped, whatever path left the operation.
struct TabGuard(Arc<Tab>);

impl Deref for TabGuard {
    type Target = Tab;

    fn deref(&self) -> &Tab {
        &self.0
    }
}

impl Drop for TabGuard {
    fn drop(&mut self) {
        if let Err(e) = self.0.close(false) {
            debug!("closing tab failed: {:#}", e);
        }
    }
}

/// A running browser. Dropping it kills the browser process.
pub struct ChromeEngine {
    browser: Browser,
    settings: ChromeSettings,
    interrupt: Interrupt,
}

impl ChromeEngine {
    pub fn launch(settings: ChromeSettings, interrupt: Interrupt) -> Result<Self, LaunchError> {
        let options = LaunchOptions::default_builder()
            .headless(settings.headless)
            .sandbox(settings.sandbox)
            .path(settings.chrome_path.clone())
            .idle_browser_timeout(settings.idle_timeout)
            .build()
            .map_err(|e| LaunchError(format!("invalid browser options: {}", e)))?;
        let browser = Browser::new(options)
            .map_err(|e| LaunchError(format!("could not start Chromium: {:#}", e)))?;
        debug!("browser launched");
        Ok(ChromeEngine {
            browser,
            settings,
            interrupt,
        })
    }

    fn open_tab(&self, stage: &str) -> Result<TabGuard, EngineError> {
        let tab = self
            .browser
            .new_tab()
            .map_err(|e| EngineError::browser(stage, format!("{:#}", e)))?;
        Ok(TabGuard(tab))
    }

    fn policy(&self, timeout: Duration) -> PollPolicy {
        PollPolicy::new(timeout, self.settings.poll_interval)
    }

    /// Poll a boolean script in `tab` until it returns true.
    fn wait_for_script(
        &self,
        tab: &Tab,
        stage: &str,
        script: &str,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        let mut probe = || eval_bool(tab, script);
        let readiness = poll_until_ready(&mut probe, self.policy(timeout), &self.interrupt);
        expect_ready(stage, readiness, timeout)
    }

    /// Poll until `selector` matches an element. Checks the interrupt between attempts.
    fn wait_for_selector(
        &self,
        tab: &Tab,
        stage: &str,
        selector: &str,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        let mut probe = || -> Result<bool, ProbeError> { Ok(tab.find_element(selector).is_ok()) };
        let readiness = poll_until_ready(&mut probe, self.policy(timeout), &self.interrupt);
        expect_ready(stage, readiness, timeout)
    }

    /// Like `wait_for_selector`, but a timeout or lookup failure is `Ok(false)`.
    fn selector_appears(
        &self,
        tab: &Tab,
        stage: &str,
        selector: &str,
        timeout: Duration,
    ) -> Result<bool, EngineError> {
        match self.wait_for_selector(tab, stage, selector, timeout) {
            Ok(()) => Ok(true),
            Err(EngineError::Interrupted) => Err(EngineError::Interrupted),
            Err(e) => {
                debug!("{} not found: {}", selector, e);
                Ok(false)
            }
        }
    }

    /// Load `url` and wait for its `load` event, polling so an interrupt is noticed.
    fn navigate(&self, tab: &Tab, url: &str, timeout: Duration) -> Result<(), EngineError> {
        info!("Navigating to {}", url);
        tab.set_default_timeout(timeout);
        tab.navigate_to(url).map_err(|e| EngineError::Navigation {
            url: url.to_string(),
            detail: format!("{:#}", e),
        })?;
        // Evaluation fails while the document is being swapped; treat that as not loaded yet.
        let mut probe = || -> Result<bool, ProbeError> {
            Ok(eval_bool(tab, DOCUMENT_LOADED_SCRIPT).unwrap_or(false))
        };
        let readiness = poll_until_ready(&mut probe, self.policy(timeout), &self.interrupt);
        expect_ready("navigation", readiness, timeout)
    }

    fn ensure_print_view(&self, tab: &Tab, timeout: Duration) -> Result<(), EngineError> {
        if self.selector_appears(tab, "print view", PRINT_TOGGLE_SELECTOR, timeout)? {
            let toggle = tab
                .find_element(PRINT_TOGGLE_SELECTOR)
                .map_err(|e| browser_error("print view", e))?;
            let pressed = toggle
                .get_attribute_value("aria-pressed")
                .map_err(|e| browser_error("print view", e))?;
            if pressed.as_deref() != Some("true") {
                debug!("enabling print preview toggle");
                toggle.click().map_err(|e| browser_error("print view", e))?;
                let script = format!(
                    "document.querySelector({})?.getAttribute('aria-pressed') === 'true'",
                    js_string(PRINT_TOGGLE_SELECTOR)
                );
                self.wait_for_script(tab, "print view", &script, timeout)?;
            }
            return Ok(());
        }

        // Some layouts expose the download button or the drawer icon without a toggle.
        let third = timeout / 3;
        if self.selector_appears(tab, "print view", HTML_DOWNLOAD_BUTTON_SELECTOR, third)? {
            debug!("found HTML download button without toggling print view");
            return Ok(());
        }
        if self.selector_appears(tab, "print view", PRINT_ICON_SELECTOR, third)? {
            debug!("found print options icon via fallback");
            return Ok(());
        }
        self.wait_for_script(tab, "print view", MAIN_CONTENT_SCRIPT, third)?;
        warn!("proceeding without explicit print UI; main content detected");
        Ok(())
    }

    fn open_print_drawer(&self, tab: &Tab, timeout: Duration) -> Result<(), EngineError> {
        if tab.find_element(HTML_DOWNLOAD_BUTTON_SELECTOR).is_ok() {
            return Ok(());
        }
        debug!("opening print options drawer");
        self.wait_for_selector(tab, "print drawer", PRINT_ICON_SELECTOR, timeout)?;
        tab.find_element(PRINT_ICON_SELECTOR)
            .and_then(|icon| icon.click().map(|_| ()))
            .map_err(|e| browser_error("print drawer", e))?;
        self.wait_for_selector(tab, "print drawer", HTML_DOWNLOAD_BUTTON_SELECTOR, timeout)
    }

    /// Click the download button and wait for the file to land in a scratch directory.
    fn download_printable_html(&self, tab: &Tab, timeout: Duration) -> Result<String, EngineError> {
        let dir = tempfile::tempdir().map_err(|e| EngineError::io(Path::new("<tempdir>"), e))?;
        tab.call_method(Page::SetDownloadBehavior {
            behavior: Page::SetDownloadBehaviorBehaviorOption::Allow,
            download_path: Some(dir.path().to_string_lossy().into_owned()),
        })
        .map_err(|e| browser_error("download", e))?;

        info!("Downloading printable HTML");
        self.wait_for_selector(tab, "download", HTML_DOWNLOAD_BUTTON_SELECTOR, timeout)?;
        tab.find_element(HTML_DOWNLOAD_BUTTON_SELECTOR)
            .and_then(|button| button.click().map(|_| ()))
            .map_err(|e| browser_error("download", e))?;

        let mut found: Option<PathBuf> = None;
        let mut probe = || -> Result<bool, ProbeError> {
            found = completed_download(dir.path())?;
            Ok(found.is_some())
        };
        let readiness = poll_until_ready(&mut probe, self.policy(timeout), &self.interrupt);
        expect_ready("download", readiness, timeout)?;
        let path = found.ok_or_else(|| EngineError::browser("download", "no file downloaded"))?;
        std::fs::read_to_string(&path).map_err(|e| EngineError::io(&path, e))
    }
}

impl Engine for ChromeEngine {
    fn warm(&mut self, request: &WarmRequest) -> Result<(), EngineError> {
        let tab = self.open_tab("navigation")?;
        let writes = Arc::new(CacheWrites::new(&request.cache_html_url, &request.marker));
        watch_cache_writes(&tab, Arc::clone(&writes))?;
        self.navigate(&tab, &request.url, request.navigation_timeout)?;

        debug!(marker = %request.marker, "waiting for cache-html POST");
        let mut probe = || -> Result<bool, ProbeError> { Ok(writes.is_complete()) };
        let policy = self.policy(request.cache_timeout);
        let readiness = poll_until_ready(&mut probe, policy, &self.interrupt);
        if let Err(e) = expect_ready("cache-html", readiness, request.cache_timeout) {
            let seen = writes.posts_seen();
            if seen.is_empty() {
                warn!("no cache-html POST was sent");
            }
            for url in seen {
                warn!("cache-html POST without the expected marker: {}", url);
            }
            return Err(e);
        }
        info!("Page successfully loaded and cached");
        Ok(())
    }

    fn capture_html(&mut self, request: &CaptureRequest) -> Result<String, EngineError> {
        let tab = self.open_tab("navigation")?;
        self.navigate(&tab, &request.url, request.navigation_timeout)?;
        tab.set_default_timeout(request.render_timeout);
        self.ensure_print_view(&tab, request.render_timeout)?;
        self.open_print_drawer(&tab, request.render_timeout)?;
        self.download_printable_html(&tab, request.render_timeout)
    }

    fn render_pdf(
        &mut self,
        html: &Path,
        size: PageSize,
        timeout: Duration,
    ) -> Result<Vec<u8>, EngineError> {
        let url = file_url(html)?;
        let tab = self.open_tab("render")?;
        debug!(html = %html.display(), "loading printable HTML");
        self.navigate(&tab, &url, timeout)?;
        debug!("waiting for Paged.js to finish layout");
        self.wait_for_script(&tab, "Paged.js layout", PAGED_READY_SCRIPT, timeout)?;
        if !self.settings.sleep_after_ready.is_zero() {
            debug!(
                secs = self.settings.sleep_after_ready.as_secs_f64(),
                "waiting after Paged.js render"
            );
            std::thread::sleep(self.settings.sleep_after_ready);
        }
        let (width, height) = size.paper_inches();
        let options = PrintToPdfOptions {
            print_background: Some(true),
            paper_width: Some(width),
            paper_height: Some(height),
            margin_top: Some(0.0),
            margin_bottom: Some(0.0),
            margin_left: Some(0.0),
            margin_right: Some(0.0),
            prefer_css_page_size: Some(true),
            ..Default::default()
        };
        tab.print_to_pdf(Some(options))
            .map_err(|e| browser_error("print to PDF", e))
    }
}

fn browser_error(stage: &str, e: anyhow::Error) -> EngineError {
    EngineError::browser(stage, format!("{:#}", e))
}

/// Cache-write requests seen on one tab. Complete once a POST to the endpoint that
/// carries the unit marker has received its response.
struct CacheWrites {
    endpoint: String,
    marker: String,
    state: Mutex<CacheWriteState>,
}

#[derive(Default)]
struct CacheWriteState {
    pending: HashSet<String>,
    complete: bool,
    other_posts: Vec<String>,
}

impl CacheWrites {
    fn new(endpoint: &str, marker: &str) -> Self {
        CacheWrites {
            endpoint: endpoint.to_string(),
            marker: marker.to_string(),
            state: Mutex::new(CacheWriteState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, CacheWriteState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn request_sent(&self, id: &str, method: &str, url: &str) {
        if !method.eq_ignore_ascii_case("POST") || !url.contains(&self.endpoint) {
            return;
        }
        let mut state = self.state();
        if url.contains(&self.marker) {
            debug!(url, "cache-html POST sent");
            state.pending.insert(id.to_string());
        } else {
            state.other_posts.push(url.to_string());
        }
    }

    fn response_done(&self, id: &str) {
        let mut state = self.state();
        if state.pending.remove(id) {
            state.complete = true;
        }
    }

    fn is_complete(&self) -> bool {
        self.state().complete
    }

    /// Cache-write POSTs that did not carry the marker.
    fn posts_seen(&self) -> Vec<String> {
        self.state().other_posts.clone()
    }
}

/// Enable network events on `tab` and feed request and response events to `writes`.
fn watch_cache_writes(tab: &Tab, writes: Arc<CacheWrites>) -> Result<(), EngineError> {
    tab.call_method(Network::Enable {
        max_total_buffer_size: None,
        max_resource_buffer_size: None,
        max_post_data_size: None,
        report_direct_socket_traffic: None,
        enable_durable_messages: None,
    })
    .map_err(|e| browser_error("cache-html", e))?;
    tab.add_event_listener(Arc::new(move |event: &Event| match event {
        Event::NetworkRequestWillBeSent(e) => writes.request_sent(
            &e.params.request_id,
            &e.params.request.method,
            &e.params.request.url,
        ),
        Event::NetworkResponseReceived(e) => writes.response_done(&e.params.request_id),
        _ => {}
    }))
    .map_err(|e| browser_error("cache-html", e))?;
    Ok(())
}

fn eval_bool(tab: &Tab, script: &str) -> Result<bool, ProbeError> {
    let result = tab
        .evaluate(script, false)
        .map_err(|e| ProbeError::new(format!("{:#}", e)))?;
    Ok(result
        .value
        .as_ref()
        .and_then(|v| v.as_bool())
        .unwrap_or(false))
}

/// Quote a string as a JavaScript literal.
fn js_string(s: &str) -> String {
    serde_json::Value::String(s.to_string()).to_string()
}

fn file_url(path: &Path) -> Result<String, EngineError> {
    let absolute = path.canonicalize().map_err(|e| EngineError::io(path, e))?;
    Url::from_file_path(&absolute)
        .map(|u| u.to_string())
        .map_err(|_| EngineError::browser("render", format!("not a file path: {}", absolute.display())))
}

/// First finished, non-empty file in `dir` (Chromium writes `.crdownload` while in progress).
fn completed_download(dir: &Path) -> Result<Option<PathBuf>, ProbeError> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| ProbeError::new(format!("{}: {}", dir.display(), e)))?;
    for entry in entries.flatten() {
        let path = entry.path();
        let in_progress = path
            .extension()
            .map(|ext| ext == "crdownload")
            .unwrap_or(false);
        let len = entry.metadata().map(|m| m.len()).unwrap_or(0);
        if path.is_file() && !in_progress && len > 0 {
            return Ok(Some(path));
        }
    }
    Ok(None)
}
