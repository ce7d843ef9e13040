//! Batch controller: runs the processor over every unit in order, one at a time.

use crate::engine::{EngineLauncher, LaunchError};
use crate::interrupt::Interrupt;
use crate::model::{BatchSummary, ProcessingResult, Unit};
use crate::processor::{process, Mode, RunConfig};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{error, info, warn};

/// Why a batch stopped before attempting every unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortCause {
    Launch(LaunchError),
    Interrupted,
}

/// Errors that end a batch. Unit failures are never reported here.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("output directory {} is not usable: {source}", .path.display())]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Stopped after `summary.attempted()` of `total` units.
    #[error("{}", abort_message(.cause, .summary, .total))]
    Aborted {
        cause: AbortCause,
        summary: BatchSummary,
        total: usize,
    },
}

fn abort_message(cause: &AbortCause, summary: &BatchSummary, total: &usize) -> String {
    match cause {
        AbortCause::Launch(e) => format!(
            "render engine failed to start: {} (aborted after {} of {} unit(s))",
            e,
            summary.attempted(),
            total
        ),
        AbortCause::Interrupted => format!(
            "interrupted after {} of {} unit(s)",
            summary.attempted(),
            total
        ),
    }
}

impl BatchError {
    /// Results recorded before the batch stopped, if any.
    pub fn partial_summary(&self) -> Option<&BatchSummary> {
        match self {
            BatchError::Aborted { summary, .. } => Some(summary),
            BatchError::OutputDir { .. } => None,
        }
    }
}

/// Process `units` in order and fold the results into a summary.
///
/// `progress` is called after each unit with `(done, total, result)`.
pub fn run_batch(
    units: &[Unit],
    config: &RunConfig,
    launcher: &dyn EngineLauncher,
    interrupt: &Interrupt,
    progress: Option<&dyn Fn(usize, usize, &ProcessingResult)>,
) -> Result<BatchSummary, BatchError> {
    if matches!(config.mode, Mode::Pdf { .. }) {
        check_output_dir(&config.output_dir)?;
    }

    let total = units.len();
    let repo = &config.target.repo;
    let mut summary = BatchSummary::default();
    for (i, &unit) in units.iter().enumerate() {
        if interrupt.is_raised() {
            return Err(aborted(AbortCause::Interrupted, summary, total));
        }
        let name = unit.display_name(repo);
        info!("[{}/{}] Processing {}", i + 1, total, name);

        let result = match process(unit, config, launcher) {
            Ok(result) => result,
            Err(e) => {
                error!("Failed to start render engine for {}: {}", name, e);
                return Err(aborted(AbortCause::Launch(e), summary, total));
            }
        };
        match &result.error {
            None => info!("[{}/{}] {} done", i + 1, total, name),
            Some(reason) => warn!("[{}/{}] {} failed: {}", i + 1, total, name, reason),
        }
        if let Some(cb) = progress {
            cb(i + 1, total, &result);
        }
        summary = summary.record(result);

        // A unit cut short by a signal is recorded, but nothing after it starts.
        if interrupt.is_raised() {
            return Err(aborted(AbortCause::Interrupted, summary, total));
        }
    }
    Ok(summary)
}

/// Create `dir` if needed and confirm a file can be written inside it.
fn check_output_dir(dir: &Path) -> Result<(), BatchError> {
    let fail = |source| BatchError::OutputDir {
        path: dir.to_path_buf(),
        source,
    };
    std::fs::create_dir_all(dir).map_err(fail)?;
    tempfile::tempfile_in(dir).map_err(fail)?;
    Ok(())
}

fn aborted(cause: AbortCause, summary: BatchSummary, total: usize) -> BatchError {
    BatchError::Aborted {
        cause,
        summary,
        total,
    }
}
