//! Migrates artifacts written under the legacy naming scheme
//! `unfoldingWord--<repo>--<ref>--<BOOK>--<SIZE>.<ext>` to `<repo>_<NN>-<BOOK>_<ref>_<SIZE>.<ext>`.

use crate::catalog::BookCode;
use regex::Regex;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

const LEGACY_NAME: &str = r"^unfoldingWord--(?P<repo>[^-]+)--(?P<ref>[^-]+)--(?P<book>[A-Z0-9]+)--(?P<size>A4|LETTER)\.(?P<ext>pdf|html)$";

#[derive(Debug, Error)]
pub enum RenameError {
    #[error("Not a directory: {}", .0.display())]
    NotADirectory(PathBuf),

    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid legacy name pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// Files renamed (or that would be renamed in a dry run) and legacy names left alone.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RenameReport {
    pub renamed: Vec<(PathBuf, PathBuf)>,
    pub skipped: usize,
}

/// Recognises legacy artifact names.
pub struct LegacyNames(Regex);

impl LegacyNames {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(LegacyNames(Regex::new(LEGACY_NAME)?))
    }

    /// Whether `name` follows the legacy scheme, known book or not.
    pub fn is_legacy(&self, name: &str) -> bool {
        self.0.is_match(name)
    }

    /// New file name for a legacy name; `None` if the name is not legacy or the book is unknown.
    pub fn target_name(&self, name: &str) -> Option<String> {
        let caps = self.0.captures(name)?;
        let book = &caps["book"];
        let Some(code) = BookCode::parse(book) else {
            warn!("Unknown book code '{}' in {}", book, name);
            return None;
        };
        Some(format!(
            "{}_{:02}-{}_{}_{}.{}",
            &caps["repo"],
            code.number(),
            code,
            &caps["ref"],
            &caps["size"],
            &caps["ext"]
        ))
    }
}

/// Rename legacy artifacts in `dir` (and below it when `recursive`). With `apply` false
/// nothing on disk changes; the report lists what would happen.
pub fn rename_legacy(dir: &Path, apply: bool, recursive: bool) -> Result<RenameReport, RenameError> {
    if !dir.is_dir() {
        return Err(RenameError::NotADirectory(dir.to_path_buf()));
    }
    let names = LegacyNames::new()?;
    let mut files = Vec::new();
    collect_files(dir, recursive, &mut files)?;

    let mut report = RenameReport::default();
    for path in files {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !names.is_legacy(name) {
            continue;
        }
        let Some(new_name) = names.target_name(name) else {
            report.skipped += 1;
            continue;
        };
        let target = path.with_file_name(&new_name);
        if target.exists() && target != path {
            warn!("Target already exists: {}", target.display());
            report.skipped += 1;
            continue;
        }
        if apply {
            std::fs::rename(&path, &target).map_err(|source| RenameError::Io {
                path: path.clone(),
                source,
            })?;
            debug!(from = %path.display(), to = %target.display(), "renamed");
        }
        report.renamed.push((path, target));
    }
    Ok(report)
}

/// Regular files under `dir`, sorted by path.
fn collect_files(dir: &Path, recursive: bool, out: &mut Vec<PathBuf>) -> Result<(), RenameError> {
    let io_err = |source| RenameError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(io_err)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<_, _>>()
        .map_err(io_err)?;
    entries.sort();
    for path in entries {
        if path.is_file() {
            out.push(path);
        } else if recursive && path.is_dir() {
            collect_files(&path, recursive, out)?;
        }
    }
    Ok(())
}
