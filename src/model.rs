//! Per-unit outcomes and the batch summary folded from them.

use crate::catalog::BookCode;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// One unit of work: a book, or a whole resource that has no books (e.g. `en_ta`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    Book(BookCode),
    Bookless,
}

impl Unit {
    pub fn book(self) -> Option<BookCode> {
        match self {
            Unit::Book(code) => Some(code),
            Unit::Bookless => None,
        }
    }

    /// Name used in progress lines and the summary: `GEN`, or the upper-cased repo.
    pub fn display_name(self, repo: &str) -> String {
        match self {
            Unit::Book(code) => code.to_string(),
            Unit::Bookless => repo.to_ascii_uppercase(),
        }
    }

    pub fn verse_count(self) -> u32 {
        self.book().map(BookCode::verse_count).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitStatus {
    Success,
    Failure,
}

/// Why a unit failed. Recorded, never propagated past the unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    Timeout { stage: String, after: Duration },
    Transport(String),
    Render(String),
    Io(String),
}

impl FailureReason {
    /// Short classification shown in the summary.
    pub fn kind(&self) -> &'static str {
        match self {
            FailureReason::Timeout { .. } => "timeout",
            FailureReason::Transport(_) => "transport",
            FailureReason::Render(_) => "render",
            FailureReason::Io(_) => "io",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Timeout { stage, after } => {
                write!(f, "timeout: {} after {}s", stage, after.as_secs())
            }
            FailureReason::Transport(detail) => write!(f, "transport: {}", detail),
            FailureReason::Render(detail) => write!(f, "render: {}", detail),
            FailureReason::Io(detail) => write!(f, "io: {}", detail),
        }
    }
}

/// Outcome of processing one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingResult {
    pub unit: Unit,
    pub status: UnitStatus,
    /// Files produced or found in place (PDF mode). Empty for cache warming.
    pub artifacts: Vec<PathBuf>,
    /// True when every artifact already existed and nothing was rendered.
    pub skipped: bool,
    pub error: Option<FailureReason>,
}

impl ProcessingResult {
    pub fn success(unit: Unit, artifacts: Vec<PathBuf>) -> Self {
        ProcessingResult {
            unit,
            status: UnitStatus::Success,
            artifacts,
            skipped: false,
            error: None,
        }
    }

    pub fn skipped(unit: Unit, artifacts: Vec<PathBuf>) -> Self {
        ProcessingResult {
            skipped: true,
            ..ProcessingResult::success(unit, artifacts)
        }
    }

    pub fn failure(unit: Unit, reason: FailureReason) -> Self {
        ProcessingResult {
            unit,
            status: UnitStatus::Failure,
            artifacts: Vec::new(),
            skipped: false,
            error: Some(reason),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == UnitStatus::Success
    }
}

/// Aggregate of a batch run, built by folding results in processing order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub successful: usize,
    pub failed: usize,
    pub failed_units: Vec<Unit>,
    pub results: Vec<ProcessingResult>,
}

impl BatchSummary {
    /// Fold one more result into the summary.
    #[must_use]
    pub fn record(mut self, result: ProcessingResult) -> BatchSummary {
        if result.is_success() {
            self.successful += 1;
        } else {
            self.failed += 1;
            self.failed_units.push(result.unit);
        }
        self.results.push(result);
        self
    }

    pub fn attempted(&self) -> usize {
        self.results.len()
    }

    /// 0 when nothing failed, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.failed == 0 {
            0
        } else {
            1
        }
    }

    /// Human-readable summary block printed at the end of a run.
    pub fn report(&self, heading: &str, repo: &str) -> String {
        let rule = "=".repeat(60);
        let mut out = format!("{rule}\n{heading}\n{rule}\n");
        out.push_str(&format!("Succeeded: {} unit(s)\n", self.successful));
        let succeeded: Vec<String> = self
            .results
            .iter()
            .filter(|r| r.is_success())
            .map(|r| {
                let name = r.unit.display_name(repo);
                if r.skipped {
                    format!("{} (existing)", name)
                } else {
                    name
                }
            })
            .collect();
        if !succeeded.is_empty() {
            out.push_str(&format!("  {}\n", succeeded.join(", ")));
        }
        if self.failed > 0 {
            out.push_str(&format!("Failed: {} unit(s)\n", self.failed));
            for r in self.results.iter().filter(|r| !r.is_success()) {
                let reason = r
                    .error
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_default();
                let reason: String = reason.chars().take(80).collect();
                out.push_str(&format!("  {}: {}\n", r.unit.display_name(repo), reason));
            }
        }
        out.push_str(&rule);
        out.push('\n');
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book(code: &str) -> Unit {
        Unit::Book(BookCode::parse(code).expect("known code"))
    }

    #[test]
    fn fold_counts_and_keeps_order() {
        let summary = [
            ProcessingResult::success(book("mat"), vec![]),
            ProcessingResult::failure(book("mrk"), FailureReason::Transport("dns".into())),
            ProcessingResult::skipped(book("luk"), vec![PathBuf::from("x.pdf")]),
        ]
        .into_iter()
        .fold(BatchSummary::default(), BatchSummary::record);

        assert_eq!(summary.successful, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.failed_units, vec![book("mrk")]);
        assert_eq!(summary.attempted(), 3);
        assert_eq!(summary.results[2].unit, book("luk"));
        assert_eq!(summary.exit_code(), 1);
    }

    #[test]
    fn empty_and_all_success_exit_zero() {
        assert_eq!(BatchSummary::default().exit_code(), 0);
        let summary = BatchSummary::default()
            .record(ProcessingResult::success(book("mat"), vec![]))
            .record(ProcessingResult::success(book("mrk"), vec![]));
        assert_eq!(summary.exit_code(), 0);
        assert!(summary.failed_units.is_empty());
    }

    #[test]
    fn display_name_for_bookless_uses_repo() {
        assert_eq!(Unit::Bookless.display_name("en_ta"), "EN_TA");
        assert_eq!(book("1jn").display_name("en_ult"), "1JN");
        assert_eq!(Unit::Bookless.verse_count(), 0);
    }

    #[test]
    fn timeout_reason_kind_and_message() {
        let reason = FailureReason::Timeout {
            stage: "cache-html".into(),
            after: Duration::from_secs(454),
        };
        assert_eq!(reason.kind(), "timeout");
        assert_eq!(reason.to_string(), "timeout: cache-html after 454s");
    }

    #[test]
    fn report_lists_failures_with_reasons() {
        let summary = BatchSummary::default()
            .record(ProcessingResult::success(book("gen"), vec![]))
            .record(ProcessingResult::failure(
                book("exo"),
                FailureReason::Render("paged.js crashed".into()),
            ));
        let report = summary.report("EXPORT SUMMARY", "en_ult");
        assert!(report.contains("Succeeded: 1 unit(s)\n  GEN\n"));
        assert!(report.contains("Failed: 1 unit(s)\n  EXO: render: paged.js crashed\n"));
    }
}
