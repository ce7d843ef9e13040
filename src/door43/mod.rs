//! Door43 specifics: preview page URLs, artifact names, and catalog entry lookup.

mod client;
mod error;

pub use client::{ApiClient, ApiClientBuilder};
pub use error::CatalogError;

use crate::catalog::{BookCode, BookSelection};
use crate::model::Unit;
use reqwest::Url;
use serde::Deserialize;
use tracing::{debug, info, warn};

pub const DEFAULT_BASE_URL: &str = "https://preview.door43.org";
pub const DEFAULT_CATALOG_API: &str = "https://git.door43.org/api/v1";
pub const DEFAULT_OWNER: &str = "unfoldingWord";
pub const DEFAULT_REF: &str = "master";

/// Path of the preview service's cache-write endpoint, relative to the base URL.
const CACHE_HTML_PATH: &str = "/.netlify/functions/cache-html";

/// One `owner/repo@ref` on one preview service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewTarget {
    pub base_url: String,
    pub owner: String,
    pub repo: String,
    pub git_ref: String,
}

impl PreviewTarget {
    pub fn new(
        base_url: impl Into<String>,
        owner: impl Into<String>,
        repo: impl Into<String>,
        git_ref: impl Into<String>,
    ) -> Self {
        let base_url: String = base_url.into();
        PreviewTarget {
            base_url: base_url.trim_end_matches('/').to_string(),
            owner: owner.into(),
            repo: repo.into(),
            git_ref: git_ref.into(),
        }
    }

    /// Preview page for a unit. `rerender` asks the service to rebuild its cached copy.
    pub fn page_url(&self, unit: Unit, rerender: bool) -> String {
        let root = format!(
            "{}/u/{}/{}/{}/",
            self.base_url, self.owner, self.repo, self.git_ref
        );
        match (unit, rerender) {
            (Unit::Book(code), false) => format!("{}?book={}", root, code.as_str()),
            (Unit::Book(code), true) => format!("{}?book={}&rerender=1", root, code.as_str()),
            (Unit::Bookless, false) => root,
            (Unit::Bookless, true) => format!("{}?rerender=1", root),
        }
    }

    /// URL prefix of the cache-write requests the preview page issues.
    pub fn cache_html_url(&self) -> String {
        format!("{}{}", self.base_url, CACHE_HTML_PATH)
    }

    /// Fragment that identifies the cache write for this unit's main document.
    pub fn cache_marker(&self, unit: Unit) -> String {
        match unit {
            Unit::Book(code) => format!("/{}.json.gz", code.as_str()),
            Unit::Bookless => format!("/{}.json.gz", self.repo),
        }
    }

    /// Artifact file prefix: `en_tn_01-GEN_v87`, or `en_ta_v87` for bookless resources.
    /// File name stem for a unit's artifacts. A `/` in the ref becomes `-`.
    pub fn output_prefix(&self, unit: Unit) -> String {
        let git_ref = self.git_ref.replace('/', "-");
        match unit {
            Unit::Book(code) => format!("{}_{:02}-{}_{}", self.repo, code.number(), code, git_ref),
            Unit::Bookless => format!("{}_{}", self.repo, git_ref),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    #[serde(default)]
    ingredients: Vec<Ingredient>,
}

#[derive(Debug, Deserialize)]
struct Ingredient {
    #[serde(default)]
    identifier: Option<serde_json::Value>,
}

/// Known book codes listed as ingredients, in entry order, de-duplicated.
/// Non-book ingredients (front matter, articles) are ignored.
pub fn parse_catalog_entry(json: &str) -> Result<Vec<BookCode>, CatalogError> {
    let entry: CatalogEntry =
        serde_json::from_str(json).map_err(|source| CatalogError::InvalidJson { source })?;
    let mut available = Vec::new();
    for ingredient in entry.ingredients {
        let identifier = match ingredient.identifier {
            Some(serde_json::Value::String(s)) => s,
            Some(other) => other.to_string(),
            None => continue,
        };
        if let Some(code) = BookCode::parse(&identifier) {
            if !available.contains(&code) {
                available.push(code);
            }
        }
    }
    Ok(available)
}

/// Fetch the catalog entry for `owner/repo@ref` and return the books it provides.
pub fn fetch_available_books(
    client: &ApiClient,
    api_base: &str,
    target: &PreviewTarget,
) -> Result<Vec<BookCode>, CatalogError> {
    let url = format!(
        "{}/catalog/entry/{}/{}/{}",
        api_base.trim_end_matches('/'),
        target.owner,
        target.repo,
        target.git_ref
    );
    Url::parse(&url).map_err(|e| CatalogError::InvalidUrl {
        input: url.clone(),
        reason: e.to_string(),
    })?;
    debug!(%url, "fetching catalog entry");
    let response = client
        .get_with_retry(&url)
        .map_err(|source| CatalogError::Network {
            url: url.clone(),
            source,
        })?;
    let status = response.status();
    if status.as_u16() == 404 {
        return Err(CatalogError::NotFound {
            owner: target.owner.clone(),
            repo: target.repo.clone(),
            git_ref: target.git_ref.clone(),
        });
    }
    if !status.is_success() {
        return Err(CatalogError::HttpStatus {
            status: status.as_u16(),
            url,
        });
    }
    let body = response
        .text()
        .map_err(|source| CatalogError::BodyRead { source })?;
    let available = parse_catalog_entry(&body)?;
    debug!(count = available.len(), "catalog provides Bible books");
    Ok(available)
}

/// Decide the units to process from the selection and the books the repository has.
///
/// A repository with no books is a single bookless unit. Otherwise requested books
/// missing from the entry are skipped with a warning, and an empty remainder is an error.
pub fn plan_units(
    selection: &BookSelection,
    available: &[BookCode],
    target: &PreviewTarget,
) -> Result<Vec<Unit>, CatalogError> {
    if available.is_empty() {
        info!(repo = %target.repo, "repo has no books, treating it as a single-page resource");
        return Ok(vec![Unit::Bookless]);
    }
    let (kept, missing) = selection.partition_available(available);
    if !missing.is_empty() {
        let names: Vec<String> = missing.iter().map(|c| c.to_string()).collect();
        warn!(
            "Skipping {} unavailable book(s): {}",
            missing.len(),
            names.join(", ")
        );
    }
    if kept.is_empty() {
        return Err(CatalogError::NoRequestedBooks {
            owner: target.owner.clone(),
            repo: target.repo.clone(),
            git_ref: target.git_ref.clone(),
        });
    }
    Ok(kept.into_iter().map(Unit::Book).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> PreviewTarget {
        PreviewTarget::new("https://preview.door43.org/", "unfoldingWord", "en_tn", "v87")
    }

    fn book(code: &str) -> Unit {
        Unit::Book(BookCode::parse(code).expect("known code"))
    }

    #[test]
    fn page_urls_for_books_and_bookless() {
        let t = target();
        assert_eq!(
            t.page_url(book("gen"), false),
            "https://preview.door43.org/u/unfoldingWord/en_tn/v87/?book=gen"
        );
        assert_eq!(
            t.page_url(book("gen"), true),
            "https://preview.door43.org/u/unfoldingWord/en_tn/v87/?book=gen&rerender=1"
        );
        assert_eq!(
            t.page_url(Unit::Bookless, false),
            "https://preview.door43.org/u/unfoldingWord/en_tn/v87/"
        );
        assert_eq!(
            t.page_url(Unit::Bookless, true),
            "https://preview.door43.org/u/unfoldingWord/en_tn/v87/?rerender=1"
        );
    }

    #[test]
    fn output_prefix_pads_book_number() {
        let t = target();
        assert_eq!(t.output_prefix(book("gen")), "en_tn_01-GEN_v87");
        assert_eq!(t.output_prefix(book("act")), "en_tn_45-ACT_v87");
        assert_eq!(t.output_prefix(Unit::Bookless), "en_tn_v87");
    }

    #[test]
    fn branch_ref_with_slash_stays_in_url_but_not_in_file_names() {
        let t = PreviewTarget::new(
            "https://preview.door43.org",
            "unfoldingWord",
            "en_tn",
            "release/v1",
        );
        assert_eq!(
            t.page_url(Unit::Bookless, false),
            "https://preview.door43.org/u/unfoldingWord/en_tn/release/v1/"
        );
        assert_eq!(t.output_prefix(book("tit")), "en_tn_56-TIT_release-v1");
        assert_eq!(t.output_prefix(Unit::Bookless), "en_tn_release-v1");
    }

    #[test]
    fn cache_markers() {
        let t = target();
        assert_eq!(
            t.cache_html_url(),
            "https://preview.door43.org/.netlify/functions/cache-html"
        );
        assert_eq!(t.cache_marker(book("MAT")), "/mat.json.gz");
        assert_eq!(t.cache_marker(Unit::Bookless), "/en_tn.json.gz");
    }

    #[test]
    fn catalog_entry_keeps_known_books_in_order() -> Result<(), CatalogError> {
        let json = r#"{
            "ingredients": [
                {"identifier": "front"},
                {"identifier": "MAT"},
                {"identifier": "gen"},
                {"identifier": "mat"},
                {"title": "no identifier"},
                {"identifier": 42}
            ]
        }"#;
        let books = parse_catalog_entry(json)?;
        let codes: Vec<&str> = books.iter().map(|c| c.as_str()).collect();
        assert_eq!(codes, vec!["mat", "gen"]);
        Ok(())
    }

    #[test]
    fn catalog_entry_without_ingredients_is_bookless() -> Result<(), CatalogError> {
        assert!(parse_catalog_entry("{}")?.is_empty());
        Ok(())
    }

    #[test]
    fn catalog_entry_invalid_json_errors() {
        assert!(matches!(
            parse_catalog_entry("<html>"),
            Err(CatalogError::InvalidJson { .. })
        ));
    }

    #[test]
    fn plan_units_bookless_when_repo_has_no_books() -> Result<(), CatalogError> {
        let sel = BookSelection::resolve(&["gen"]).expect("valid selection");
        assert_eq!(plan_units(&sel, &[], &target())?, vec![Unit::Bookless]);
        Ok(())
    }

    #[test]
    fn plan_units_filters_to_available() -> Result<(), CatalogError> {
        let sel = BookSelection::resolve(&["mrk", "mat", "gen"]).expect("valid selection");
        let available = vec![
            BookCode::parse("mat").expect("known"),
            BookCode::parse("mrk").expect("known"),
        ];
        assert_eq!(
            plan_units(&sel, &available, &target())?,
            vec![book("mrk"), book("mat")]
        );
        Ok(())
    }

    #[test]
    fn plan_units_errors_when_nothing_requested_is_available() {
        let sel = BookSelection::resolve(&["gen"]).expect("valid selection");
        let available = vec![BookCode::parse("mat").expect("known")];
        assert!(matches!(
            plan_units(&sel, &available, &target()),
            Err(CatalogError::NoRequestedBooks { .. })
        ));
    }
}
