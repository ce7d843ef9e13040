//! Optional config file loading. Search order: ./door43-preview.toml, then
//! $XDG_CONFIG_HOME/door43-preview/config.toml (or ~/.config/door43-preview/config.toml).

use serde::Deserialize;
use std::path::PathBuf;

/// Config file contents. All fields optional; only present keys override defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct Config {
    /// Preview service base URL (default https://preview.door43.org).
    pub base_url: Option<String>,
    /// Repository owner when --owner is not set (default unfoldingWord).
    pub owner: Option<String>,
    /// Door43 API base used for catalog lookups (default https://git.door43.org/api/v1).
    pub catalog_api: Option<String>,
    /// Default PDF output directory when --output-dir is not set. Relative to CWD.
    pub output_dir: Option<PathBuf>,
    pub navigation_timeout_secs: Option<u64>,
    pub navigation_timeout_per_verse: Option<f64>,
    pub cache_timeout_secs: Option<u64>,
    pub cache_timeout_per_verse: Option<f64>,
    pub render_timeout_secs: Option<u64>,
    pub render_timeout_per_verse: Option<f64>,
    /// Seconds to wait after Paged.js has settled, before printing (default 5; fractions allowed).
    pub sleep_after_ready_secs: Option<f64>,
    /// Readiness poll interval in milliseconds (default 500).
    pub poll_interval_ms: Option<u64>,
    /// PDF backend: chromium (default) or weasyprint.
    pub backend: Option<String>,
    /// Page size: a4, letter, or both (default).
    pub page: Option<String>,
    /// Browser binary. Auto-detected when not set.
    pub chrome_path: Option<PathBuf>,
    /// WeasyPrint executable (default `weasyprint` on PATH).
    pub weasyprint_path: Option<PathBuf>,
    /// HTTP User-Agent header for catalog requests.
    pub user_agent: Option<String>,
    /// Catalog request timeout in seconds.
    pub timeout_secs: Option<u64>,
    /// Number of HTTP attempts for transient catalog failures (default 3).
    pub retry_count: Option<u32>,
    /// Delay in seconds before each retry (e.g. [1, 2, 4]). If not set, default [1, 2] is used.
    pub retry_backoff_secs: Option<Vec<u64>>,
}

/// Search order: (1) ./door43-preview.toml, (2) $XDG_CONFIG_HOME/door43-preview/config.toml.
/// Missing file returns Ok(None). Invalid TOML or I/O error reading a present file returns Err.
pub fn load_config() -> Result<Option<Config>, String> {
    let cwd = std::env::current_dir()
        .map_err(|e| format!("Cannot determine current directory: {}", e))?;
    let mut paths = vec![cwd.join("door43-preview.toml")];
    if let Some(d) = dirs::config_dir() {
        paths.push(d.join("door43-preview").join("config.toml"));
    }
    for path in &paths {
        if path.exists() {
            let s = std::fs::read_to_string(path)
                .map_err(|e| format!("Cannot read config {}: {}", path.display(), e))?;
            let config: Config = toml::from_str(&s)
                .map_err(|e| format!("Invalid config {}: {}", path.display(), e))?;
            tracing::debug!(path = %path.display(), "loaded config");
            return Ok(Some(config));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_empty_config() {
        let c: Config = toml::from_str("").unwrap();
        assert!(c.base_url.is_none());
        assert!(c.owner.is_none());
        assert!(c.output_dir.is_none());
        assert!(c.render_timeout_secs.is_none());
        assert!(c.backend.is_none());
        assert!(c.retry_backoff_secs.is_none());
    }

    #[test]
    fn parse_full_config() {
        let s = r#"
            base_url = "https://preview.example.org"
            owner = "Door43-Catalog"
            catalog_api = "https://git.example.org/api/v1"
            output_dir = "pdfs"
            navigation_timeout_secs = 120
            navigation_timeout_per_verse = 0.1
            cache_timeout_secs = 400
            cache_timeout_per_verse = 0.2
            render_timeout_secs = 900
            render_timeout_per_verse = 0.25
            sleep_after_ready_secs = 2.5
            poll_interval_ms = 250
            backend = "weasyprint"
            page = "letter"
            chrome_path = "/usr/bin/chromium"
            weasyprint_path = "/opt/bin/weasyprint"
            user_agent = "Custom/1.0"
            timeout_secs = 60
            retry_count = 5
            retry_backoff_secs = [1, 2, 4, 8]
        "#;
        let c: Config = toml::from_str(s).unwrap();
        assert_eq!(c.base_url.as_deref(), Some("https://preview.example.org"));
        assert_eq!(c.owner.as_deref(), Some("Door43-Catalog"));
        assert_eq!(c.output_dir.as_deref(), Some(std::path::Path::new("pdfs")));
        assert_eq!(c.navigation_timeout_secs, Some(120));
        assert_eq!(c.cache_timeout_per_verse, Some(0.2));
        assert_eq!(c.render_timeout_secs, Some(900));
        assert_eq!(c.sleep_after_ready_secs, Some(2.5));
        assert_eq!(c.poll_interval_ms, Some(250));
        assert_eq!(c.backend.as_deref(), Some("weasyprint"));
        assert_eq!(c.page.as_deref(), Some("letter"));
        assert_eq!(
            c.weasyprint_path.as_deref(),
            Some(std::path::Path::new("/opt/bin/weasyprint"))
        );
        assert_eq!(c.retry_count, Some(5));
        assert_eq!(
            c.retry_backoff_secs.as_deref(),
            Some([1, 2, 4, 8].as_slice())
        );
    }

    #[test]
    fn parse_partial_config() {
        let c: Config = toml::from_str("cache_timeout_secs = 600").unwrap();
        assert_eq!(c.cache_timeout_secs, Some(600));
        assert!(c.cache_timeout_per_verse.is_none());
        assert!(c.navigation_timeout_secs.is_none());
    }

    #[test]
    fn invalid_toml_errors() {
        assert!(toml::from_str::<Config>("output_dir = [").is_err());
        assert!(toml::from_str::<Config>("render_timeout_secs = \"soon\"").is_err());
    }
}
