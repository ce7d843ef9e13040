//! Render/capture engines. An engine is launched once per unit and dropped when the
//! unit is done, which tears down its browser or child process on every exit path.

mod chrome;
mod weasyprint;

pub use chrome::{ChromeEngine, ChromeLauncher, ChromeSettings};
pub use weasyprint::{WeasyPrintEngine, WeasyPrintLauncher};

use crate::model::FailureReason;
use crate::poller::Readiness;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Output page size. A4 is what the preview service emits; Letter is derived from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSize {
    A4,
    Letter,
}

impl PageSize {
    /// Label used in file names.
    pub fn label(self) -> &'static str {
        match self {
            PageSize::A4 => "A4",
            PageSize::Letter => "LETTER",
        }
    }

    /// Paper width and height in inches.
    pub fn paper_inches(self) -> (f64, f64) {
        match self {
            PageSize::A4 => (8.27, 11.69),
            PageSize::Letter => (8.5, 11.0),
        }
    }

    /// Both sizes, A4 first.
    pub fn both() -> Vec<PageSize> {
        vec![PageSize::A4, PageSize::Letter]
    }
}

/// PDF rendering backend for downloaded printable HTML.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Paged.js layout inside the browser, then the browser's print-to-PDF.
    Chromium,
    /// The external `weasyprint` executable.
    WeasyPrint,
}

/// Inputs for warming one preview page.
#[derive(Debug, Clone)]
pub struct WarmRequest {
    pub url: String,
    /// Prefix of the cache-write endpoint the page posts to.
    pub cache_html_url: String,
    /// Fragment identifying this unit's cache write, e.g. `/gen.json.gz`.
    pub marker: String,
    pub navigation_timeout: Duration,
    pub cache_timeout: Duration,
}

/// Inputs for capturing printable HTML from one preview page.
#[derive(Debug, Clone)]
pub struct CaptureRequest {
    pub url: String,
    pub navigation_timeout: Duration,
    pub render_timeout: Duration,
}

/// Engine could not be started at all. Fatal for the batch.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct LaunchError(pub String);

/// Errors from a single engine operation. Converted to a unit failure by the processor.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("timed out during {stage} after {}s", .after.as_secs())]
    Timeout { stage: String, after: Duration },

    #[error("navigation to {url} failed: {detail}")]
    Navigation { url: String, detail: String },

    #[error("browser error during {stage}: {detail}")]
    Browser { stage: String, detail: String },

    #[error("{program} failed: {detail}")]
    Process { program: String, detail: String },

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("interrupted")]
    Interrupted,
}

impl EngineError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        EngineError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn browser(stage: &str, detail: impl ToString) -> Self {
        EngineError::Browser {
            stage: stage.to_string(),
            detail: detail.to_string(),
        }
    }
}

impl From<EngineError> for FailureReason {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Timeout { stage, after } => FailureReason::Timeout { stage, after },
            EngineError::Navigation { .. } => FailureReason::Transport(e.to_string()),
            EngineError::Io { .. } => FailureReason::Io(e.to_string()),
            EngineError::Browser { .. } | EngineError::Process { .. } | EngineError::Interrupted => {
                FailureReason::Render(e.to_string())
            }
        }
    }
}

/// Map a poller outcome for `stage` to an engine result.
pub(crate) fn expect_ready(
    stage: &str,
    readiness: Readiness,
    timeout: Duration,
) -> Result<(), EngineError> {
    match readiness {
        Readiness::Ready => Ok(()),
        Readiness::TimedOut { .. } => Err(EngineError::Timeout {
            stage: stage.to_string(),
            after: timeout,
        }),
        Readiness::Errored(detail) if detail == "interrupted" => Err(EngineError::Interrupted),
        Readiness::Errored(detail) => Err(EngineError::browser(stage, detail)),
    }
}

/// One launched engine instance.
pub trait Engine {
    /// Load a preview page and wait until the service has written its cache for the unit.
    fn warm(&mut self, request: &WarmRequest) -> Result<(), EngineError>;

    /// Load a preview page in print view and return the printable HTML it offers for download.
    fn capture_html(&mut self, request: &CaptureRequest) -> Result<String, EngineError>;

    /// Render a local printable HTML file to PDF bytes.
    fn render_pdf(
        &mut self,
        html: &Path,
        size: PageSize,
        timeout: Duration,
    ) -> Result<Vec<u8>, EngineError>;
}

/// Starts a fresh engine for each unit.
pub trait EngineLauncher {
    fn launch(&self) -> Result<Box<dyn Engine>, LaunchError>;
}

const A4_SIZE_DECLARATION: &str = r"(?i)(size:\s*)210mm\s+297mm;";

/// Rewrite the first A4 `size:` declaration to Letter. Returns the new HTML and whether
/// a declaration was found; without one the HTML is returned unchanged.
pub fn letter_variant(html: &str) -> Result<(String, bool), regex::Error> {
    let re = Regex::new(A4_SIZE_DECLARATION)?;
    if !re.is_match(html) {
        return Ok((html.to_string(), false));
    }
    Ok((re.replacen(html, 1, "${1}letter;").into_owned(), true))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_labels() {
        assert_eq!(PageSize::A4.label(), "A4");
        assert_eq!(PageSize::Letter.label(), "LETTER");
        assert_eq!(PageSize::both(), vec![PageSize::A4, PageSize::Letter]);
    }

    #[test]
    fn letter_variant_rewrites_first_declaration_only() -> Result<(), regex::Error> {
        let html = "@page { SIZE:  210mm 297mm; } .x { size: 210mm   297mm; }";
        let (out, found) = letter_variant(html)?;
        assert!(found);
        assert_eq!(out, "@page { SIZE:  letter; } .x { size: 210mm   297mm; }");
        Ok(())
    }

    #[test]
    fn letter_variant_without_declaration_is_unchanged() -> Result<(), regex::Error> {
        let html = "<html><style>@page { size: letter; }</style></html>";
        let (out, found) = letter_variant(html)?;
        assert!(!found);
        assert_eq!(out, html);
        Ok(())
    }

    #[test]
    fn readiness_maps_to_engine_errors() {
        let t = Duration::from_secs(5);
        assert!(expect_ready("x", Readiness::Ready, t).is_ok());
        assert!(matches!(
            expect_ready("cache-html", Readiness::TimedOut { waited: t }, t),
            Err(EngineError::Timeout { ref stage, .. }) if stage == "cache-html"
        ));
        assert!(matches!(
            expect_ready("x", Readiness::Errored("interrupted".into()), t),
            Err(EngineError::Interrupted)
        ));
        assert!(matches!(
            expect_ready("x", Readiness::Errored("page crashed".into()), t),
            Err(EngineError::Browser { .. })
        ));
    }

    #[test]
    fn engine_errors_classify_as_failure_reasons() {
        let timeout: FailureReason = EngineError::Timeout {
            stage: "render".into(),
            after: Duration::from_secs(3),
        }
        .into();
        assert_eq!(timeout.kind(), "timeout");
        let nav: FailureReason = EngineError::Navigation {
            url: "https://x".into(),
            detail: "dns".into(),
        }
        .into();
        assert_eq!(nav.kind(), "transport");
        let io: FailureReason =
            EngineError::io(Path::new("out.pdf"), std::io::Error::other("disk full")).into();
        assert_eq!(io.kind(), "io");
    }
}
