//! Errors from the Door43 catalog API.

use thiserror::Error;

/// Failure to determine which books a repository provides. Always fatal: raised
/// before any unit is processed.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Invalid catalog URL: {input}: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("Catalog entry not found for {owner}/{repo}@{git_ref}")]
    NotFound {
        owner: String,
        repo: String,
        git_ref: String,
    },

    #[error("Network error: could not reach {url}: {source}")]
    Network { url: String, source: reqwest::Error },

    #[error("Failed to fetch catalog entry (HTTP {status}) from {url}")]
    HttpStatus { status: u16, url: String },

    #[error("Failed to read catalog response body: {source}")]
    BodyRead { source: reqwest::Error },

    #[error("Catalog entry response was not valid JSON: {source}")]
    InvalidJson { source: serde_json::Error },

    #[error("None of the requested books are available in catalog entry {owner}/{repo}@{git_ref}")]
    NoRequestedBooks {
        owner: String,
        repo: String,
        git_ref: String,
    },
}
