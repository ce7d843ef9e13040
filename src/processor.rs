//! Single-unit processing: warm one preview page, or export one book's PDFs.
//!
//! Every call yields exactly one [ProcessingResult]. Engine, network and disk errors
//! inside the unit become a failure result; only an engine that cannot start at all
//! is returned as an error.

use crate::catalog::compute_book_timeout;
use crate::door43::PreviewTarget;
use crate::engine::{
    letter_variant, CaptureRequest, Engine, EngineError, EngineLauncher, LaunchError, PageSize,
    WarmRequest,
};
use crate::model::{ProcessingResult, Unit};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// What to do with each unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Load the preview page and wait for the server-side cache write.
    Warm,
    /// Export printable HTML and PDFs in the given page sizes.
    Pdf { page_sizes: Vec<PageSize> },
}

/// Base timeout plus an allowance per verse.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeoutPolicy {
    pub base_secs: u64,
    pub per_verse_secs: f64,
}

impl TimeoutPolicy {
    pub fn new(base_secs: u64, per_verse_secs: f64) -> Self {
        TimeoutPolicy {
            base_secs,
            per_verse_secs,
        }
    }

    pub fn for_unit(&self, unit: Unit) -> Duration {
        Duration::from_secs(compute_book_timeout(
            self.base_secs,
            self.per_verse_secs,
            unit.verse_count(),
        ))
    }
}

/// Validated settings for a whole run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub target: PreviewTarget,
    pub mode: Mode,
    pub output_dir: PathBuf,
    /// Re-capture and re-render even when artifacts exist.
    pub force: bool,
    pub navigation: TimeoutPolicy,
    pub cache: TimeoutPolicy,
    pub render: TimeoutPolicy,
}

impl RunConfig {
    /// `{prefix}_{SIZE}.pdf` for each requested size.
    pub fn pdf_paths(&self, unit: Unit, sizes: &[PageSize]) -> Vec<(PageSize, PathBuf)> {
        let prefix = self.target.output_prefix(unit);
        sizes
            .iter()
            .map(|&size| {
                (
                    size,
                    self.output_dir
                        .join(format!("{}_{}.pdf", prefix, size.label())),
                )
            })
            .collect()
    }

    pub fn html_path(&self, unit: Unit, size: PageSize) -> PathBuf {
        self.output_dir.join(format!(
            "{}_{}.html",
            self.target.output_prefix(unit),
            size.label()
        ))
    }
}

/// Process one unit. See the module docs for the error contract.
pub fn process(
    unit: Unit,
    config: &RunConfig,
    launcher: &dyn EngineLauncher,
) -> Result<ProcessingResult, LaunchError> {
    let name = unit.display_name(&config.target.repo);
    let navigation_timeout = config.navigation.for_unit(unit);
    match &config.mode {
        Mode::Warm => {
            let request = WarmRequest {
                url: config.target.page_url(unit, true),
                cache_html_url: config.target.cache_html_url(),
                marker: config.target.cache_marker(unit),
                navigation_timeout,
                cache_timeout: config.cache.for_unit(unit),
            };
            debug!(
                unit = %name,
                navigation_secs = request.navigation_timeout.as_secs(),
                cache_secs = request.cache_timeout.as_secs(),
                "timeouts"
            );
            let mut engine = launcher.launch()?;
            Ok(match engine.warm(&request) {
                Ok(()) => ProcessingResult::success(unit, Vec::new()),
                Err(e) => ProcessingResult::failure(unit, e.into()),
            })
        }
        Mode::Pdf { page_sizes } => {
            let pdfs = config.pdf_paths(unit, page_sizes);
            if !config.force && pdfs.iter().all(|(_, path)| path.exists()) {
                info!(unit = %name, "PDF(s) already exist, skipping generation");
                let artifacts = pdfs.into_iter().map(|(_, path)| path).collect();
                return Ok(ProcessingResult::skipped(unit, artifacts));
            }
            let capture = CaptureRequest {
                url: config.target.page_url(unit, false),
                navigation_timeout,
                render_timeout: config.render.for_unit(unit),
            };
            debug!(
                unit = %name,
                navigation_secs = capture.navigation_timeout.as_secs(),
                render_secs = capture.render_timeout.as_secs(),
                "timeouts"
            );
            let mut engine = launcher.launch()?;
            Ok(
                match export_pdfs(engine.as_mut(), unit, config, &capture, &pdfs) {
                    Ok(artifacts) => ProcessingResult::success(unit, artifacts),
                    Err(e) => ProcessingResult::failure(unit, e.into()),
                },
            )
        }
    }
}

fn export_pdfs(
    engine: &mut dyn Engine,
    unit: Unit,
    config: &RunConfig,
    capture: &CaptureRequest,
    pdfs: &[(PageSize, PathBuf)],
) -> Result<Vec<PathBuf>, EngineError> {
    let a4_html = config.html_path(unit, PageSize::A4);
    if a4_html.exists() && !config.force {
        info!(
            "HTML already exists: {} (skipping download)",
            a4_html.display()
        );
    } else {
        let html = engine.capture_html(capture)?;
        write_atomic(&a4_html, html.as_bytes())?;
        info!("Saved printable HTML to {}", a4_html.display());
    }

    let mut artifacts = Vec::with_capacity(pdfs.len());
    for &(size, ref pdf) in pdfs {
        if pdf.exists() && !config.force {
            info!("PDF already exists: {} (skipping generation)", pdf.display());
            artifacts.push(pdf.clone());
            continue;
        }
        let html = match size {
            PageSize::A4 => a4_html.clone(),
            PageSize::Letter => ensure_letter_html(unit, config, &a4_html)?,
        };
        let bytes = engine.render_pdf(&html, size, capture.render_timeout)?;
        write_atomic(pdf, &bytes)?;
        info!("Wrote {} PDF to {}", size.label(), pdf.display());
        artifacts.push(pdf.clone());
    }
    Ok(artifacts)
}

/// Letter HTML next to the A4 file, derived from it unless already present.
fn ensure_letter_html(
    unit: Unit,
    config: &RunConfig,
    a4_html: &Path,
) -> Result<PathBuf, EngineError> {
    let letter_html = config.html_path(unit, PageSize::Letter);
    if letter_html.exists() && !config.force {
        info!(
            "LETTER HTML already exists: {} (skipping creation)",
            letter_html.display()
        );
        return Ok(letter_html);
    }
    let source = std::fs::read_to_string(a4_html).map_err(|e| EngineError::io(a4_html, e))?;
    let (content, found) =
        letter_variant(&source).map_err(|e| EngineError::browser("letter variant", e))?;
    if !found {
        warn!(
            "Could not find A4 size declaration in {}; writing unmodified content for Letter variant",
            a4_html.display()
        );
    }
    write_atomic(&letter_html, content.as_bytes())?;
    Ok(letter_html)
}

/// Write through a temp file in the same directory, then rename into place.
/// A partially written artifact must never exist under its final name.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), EngineError> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::Builder::new()
        .prefix(".part-")
        .tempfile_in(dir)
        .map_err(|e| EngineError::io(dir, e))?;
    tmp.write_all(bytes).map_err(|e| EngineError::io(path, e))?;
    tmp.persist(path)
        .map_err(|e| EngineError::io(path, e.error))?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::catalog::BookCode;
    use crate::model::{FailureReason, UnitStatus};
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::rc::Rc;

    /// Scripted behaviour for one unit, keyed by the URL the engine is asked to load.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) enum Script {
        Succeed,
        TimeOut,
        Crash,
    }

    #[derive(Debug, Default)]
    pub(crate) struct Calls {
        pub launches: usize,
        pub warmed: Vec<String>,
        pub captured: Vec<String>,
        pub rendered: Vec<(PathBuf, PageSize)>,
    }

    /// Launcher whose engines follow a per-book script and record every call.
    #[derive(Clone, Default)]
    pub(crate) struct FakeLauncher {
        pub scripts: HashMap<String, Script>,
        pub calls: Rc<RefCell<Calls>>,
        pub fail_launch: bool,
    }

    impl FakeLauncher {
        pub fn with(mut self, book: &str, script: Script) -> Self {
            self.scripts.insert(book.to_string(), script);
            self
        }
    }

    struct FakeEngine {
        scripts: HashMap<String, Script>,
        calls: Rc<RefCell<Calls>>,
    }

    impl FakeEngine {
        fn script_for(&self, url: &str) -> Script {
            self.scripts
                .iter()
                .find(|(book, _)| url.contains(&format!("book={}", book)))
                .map(|(_, s)| *s)
                .unwrap_or(Script::Succeed)
        }

        fn outcome(script: Script, stage: &str) -> Result<(), EngineError> {
            match script {
                Script::Succeed => Ok(()),
                Script::TimeOut => Err(EngineError::Timeout {
                    stage: stage.to_string(),
                    after: Duration::from_secs(1),
                }),
                Script::Crash => Err(EngineError::browser(stage, "target crashed")),
            }
        }
    }

    impl Engine for FakeEngine {
        fn warm(&mut self, request: &WarmRequest) -> Result<(), EngineError> {
            self.calls.borrow_mut().warmed.push(request.url.clone());
            Self::outcome(self.script_for(&request.url), "cache-html")
        }

        fn capture_html(&mut self, request: &CaptureRequest) -> Result<String, EngineError> {
            self.calls.borrow_mut().captured.push(request.url.clone());
            Self::outcome(self.script_for(&request.url), "print view")?;
            Ok("<style>@page { size: 210mm 297mm; }</style><p>book</p>".to_string())
        }

        fn render_pdf(
            &mut self,
            html: &Path,
            size: PageSize,
            _timeout: Duration,
        ) -> Result<Vec<u8>, EngineError> {
            self.calls
                .borrow_mut()
                .rendered
                .push((html.to_path_buf(), size));
            Ok(format!("%PDF {}", size.label()).into_bytes())
        }
    }

    impl EngineLauncher for FakeLauncher {
        fn launch(&self) -> Result<Box<dyn Engine>, LaunchError> {
            if self.fail_launch {
                return Err(LaunchError("no chromium".to_string()));
            }
            self.calls.borrow_mut().launches += 1;
            Ok(Box::new(FakeEngine {
                scripts: self.scripts.clone(),
                calls: Rc::clone(&self.calls),
            }))
        }
    }

    pub(crate) fn book(code: &str) -> Unit {
        Unit::Book(BookCode::parse(code).expect("known code"))
    }

    pub(crate) fn config(mode: Mode, output_dir: &Path) -> RunConfig {
        RunConfig {
            target: PreviewTarget::new(
                "https://preview.door43.org",
                "unfoldingWord",
                "en_ult",
                "v86",
            ),
            mode,
            output_dir: output_dir.to_path_buf(),
            force: false,
            navigation: TimeoutPolicy::new(90, 0.05),
            cache: TimeoutPolicy::new(300, 0.1),
            render: TimeoutPolicy::new(600, 0.15),
        }
    }

    fn pdf_mode() -> Mode {
        Mode::Pdf {
            page_sizes: PageSize::both(),
        }
    }

    #[test]
    fn timeout_policy_uses_verse_count() {
        let policy = TimeoutPolicy::new(300, 0.1);
        assert_eq!(policy.for_unit(book("gen")), Duration::from_secs(454));
        assert_eq!(policy.for_unit(Unit::Bookless), Duration::from_secs(300));
    }

    #[test]
    fn warm_success_uses_rerender_url() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let launcher = FakeLauncher::default();
        let result = process(book("mat"), &config(Mode::Warm, dir.path()), &launcher)?;
        assert_eq!(result.status, UnitStatus::Success);
        assert!(result.artifacts.is_empty());
        assert_eq!(
            launcher.calls.borrow().warmed,
            vec!["https://preview.door43.org/u/unfoldingWord/en_ult/v86/?book=mat&rerender=1"]
        );
        Ok(())
    }

    #[test]
    fn warm_timeout_is_a_unit_failure() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let launcher = FakeLauncher::default().with("mat", Script::TimeOut);
        let result = process(book("mat"), &config(Mode::Warm, dir.path()), &launcher)?;
        assert_eq!(result.status, UnitStatus::Failure);
        assert_eq!(result.error.as_ref().map(FailureReason::kind), Some("timeout"));
        Ok(())
    }

    #[test]
    fn pdf_export_writes_html_and_both_sizes() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let launcher = FakeLauncher::default();
        let cfg = config(pdf_mode(), dir.path());
        let result = process(book("gen"), &cfg, &launcher)?;

        assert!(result.is_success());
        assert!(!result.skipped);
        let a4 = dir.path().join("en_ult_01-GEN_v86_A4.pdf");
        let letter = dir.path().join("en_ult_01-GEN_v86_LETTER.pdf");
        assert_eq!(result.artifacts, vec![a4.clone(), letter.clone()]);
        assert_eq!(std::fs::read_to_string(&a4)?, "%PDF A4");
        assert_eq!(std::fs::read_to_string(&letter)?, "%PDF LETTER");

        let letter_html =
            std::fs::read_to_string(dir.path().join("en_ult_01-GEN_v86_LETTER.html"))?;
        assert!(letter_html.contains("size: letter;"));

        let calls = launcher.calls.borrow();
        assert_eq!(calls.launches, 1);
        assert_eq!(calls.captured.len(), 1);
        assert_eq!(calls.rendered.len(), 2);
        assert_eq!(calls.rendered[1].0, dir.path().join("en_ult_01-GEN_v86_LETTER.html"));
        Ok(())
    }

    #[test]
    fn existing_pdfs_skip_without_launching() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let launcher = FakeLauncher::default();
        let cfg = config(pdf_mode(), dir.path());

        let first = process(book("luk"), &cfg, &launcher)?;
        assert!(first.is_success() && !first.skipped);
        let second = process(book("luk"), &cfg, &launcher)?;
        assert!(second.is_success());
        assert!(second.skipped);
        assert_eq!(second.artifacts, first.artifacts);

        let calls = launcher.calls.borrow();
        assert_eq!(calls.launches, 1);
        assert_eq!(calls.rendered.len(), 2);
        Ok(())
    }

    #[test]
    fn force_rerenders_existing_pdfs() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let launcher = FakeLauncher::default();
        let mut cfg = config(pdf_mode(), dir.path());
        process(book("luk"), &cfg, &launcher)?;
        cfg.force = true;
        let again = process(book("luk"), &cfg, &launcher)?;
        assert!(again.is_success() && !again.skipped);
        let calls = launcher.calls.borrow();
        assert_eq!(calls.launches, 2);
        assert_eq!(calls.captured.len(), 2);
        assert_eq!(calls.rendered.len(), 4);
        Ok(())
    }

    #[test]
    fn existing_html_is_reused_for_missing_pdf() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let cfg = config(
            Mode::Pdf {
                page_sizes: vec![PageSize::A4],
            },
            dir.path(),
        );
        std::fs::write(cfg.html_path(book("jud"), PageSize::A4), "<p>cached</p>")?;
        let launcher = FakeLauncher::default();
        let result = process(book("jud"), &cfg, &launcher)?;
        assert!(result.is_success());
        let calls = launcher.calls.borrow();
        assert!(calls.captured.is_empty());
        assert_eq!(calls.rendered.len(), 1);
        Ok(())
    }

    #[test]
    fn capture_crash_is_a_unit_failure_with_no_pdf() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let launcher = FakeLauncher::default().with("mrk", Script::Crash);
        let result = process(book("mrk"), &config(pdf_mode(), dir.path()), &launcher)?;
        assert_eq!(result.status, UnitStatus::Failure);
        assert_eq!(result.error.as_ref().map(FailureReason::kind), Some("render"));
        assert!(!dir.path().join("en_ult_42-MRK_v86_A4.pdf").exists());
        Ok(())
    }

    #[test]
    fn unwritable_output_is_a_unit_failure() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let missing = dir.path().join("does-not-exist");
        let launcher = FakeLauncher::default();
        let result = process(book("gen"), &config(pdf_mode(), &missing), &launcher)?;
        assert_eq!(result.error.as_ref().map(FailureReason::kind), Some("io"));
        Ok(())
    }

    #[test]
    fn launch_failure_is_returned_as_error() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let launcher = FakeLauncher {
            fail_launch: true,
            ..FakeLauncher::default()
        };
        let err = process(book("gen"), &config(Mode::Warm, dir.path()), &launcher);
        assert_eq!(err, Err(LaunchError("no chromium".to_string())));
        Ok(())
    }

    #[test]
    fn bookless_pdf_names_use_repo_and_ref() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let cfg = config(pdf_mode(), dir.path());
        let paths = cfg.pdf_paths(Unit::Bookless, &[PageSize::Letter]);
        assert_eq!(
            paths,
            vec![(PageSize::Letter, dir.path().join("en_ult_v86_LETTER.pdf"))]
        );
        Ok(())
    }
}
