//! Console configuration, loaded from TOML.
//!
//! Every field has a default, so an empty or missing file is a valid
//! configuration. A file that exists but does not parse is an error.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{ConnectError, Result};
use crate::navigation::NavigationContext;
use crate::resolver::DEFAULT_CANDIDATES;

/// Settings for one console instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    /// The console's own location. Relative agent paths resolve against it.
    pub page_url: String,
    /// Base path relative candidates are joined onto.
    pub document_base: String,
    /// Discovery candidates, most specific first.
    pub candidates: Vec<String>,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    /// SQLite file for profiles and settings. In-memory when absent.
    pub storage_path: Option<PathBuf>,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            page_url: "http://localhost:8080/hawtio/".to_string(),
            document_base: "/hawtio/".to_string(),
            candidates: DEFAULT_CANDIDATES.iter().map(|c| c.to_string()).collect(),
            connect_timeout_ms: 3_000,
            request_timeout_ms: 10_000,
            storage_path: None,
        }
    }
}

impl ConsoleConfig {
    /// Parse a TOML document.
    ///
    /// # Errors
    ///
    /// Returns `Err(ConnectError::Config)` if the TOML does not parse or
    /// [`validate`](Self::validate) rejects it.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw).map_err(|e| ConnectError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path`, or the defaults when the file does not exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(raw) => Self::from_toml_str(&raw)
                .map_err(|e| ConnectError::Config(format!("{}: {e}", path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// # Errors
    ///
    /// Returns `Err` if:
    /// - `page_url` is not an absolute URL
    /// - `candidates` is empty
    /// - either timeout is zero
    pub fn validate(&self) -> Result<()> {
        Url::parse(&self.page_url)
            .map_err(|e| ConnectError::Config(format!("page_url '{}': {e}", self.page_url)))?;
        if self.candidates.is_empty() {
            return Err(ConnectError::Config("candidates must not be empty".into()));
        }
        if self.connect_timeout_ms == 0 || self.request_timeout_ms == 0 {
            return Err(ConnectError::Config("timeouts must be positive".into()));
        }
        Ok(())
    }

    pub fn with_page_url(mut self, page_url: impl Into<String>) -> Self {
        self.page_url = page_url.into();
        self
    }

    pub fn with_storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage_path = Some(path.into());
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// The navigation context of the configured page.
    pub fn navigation(&self) -> Result<NavigationContext> {
        NavigationContext::parse(&self.page_url, self.document_base.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_document_is_default() {
        assert_eq!(ConsoleConfig::from_toml_str("").unwrap(), ConsoleConfig::default());
    }

    #[test]
    fn partial_document_keeps_other_defaults() {
        let config = ConsoleConfig::from_toml_str(
            r#"
            page_url = "https://ops.example.com/console/"
            document_base = "/console/"
            request_timeout_ms = 2500
            "#,
        )
        .unwrap();
        assert_eq!(config.document_base, "/console/");
        assert_eq!(config.request_timeout(), Duration::from_millis(2500));
        assert_eq!(config.connect_timeout_ms, 3_000);
        assert_eq!(config.candidates.len(), 3);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(ConsoleConfig::from_toml_str("candidates = []").is_err());
        assert!(ConsoleConfig::from_toml_str("page_url = \"not a url\"").is_err());
        assert!(ConsoleConfig::from_toml_str("connect_timeout_ms = 0").is_err());
        assert!(ConsoleConfig::from_toml_str("page_url = [").is_err());
    }

    #[test]
    fn missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConsoleConfig::load(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, ConsoleConfig::default());
    }

    #[test]
    fn load_reads_file_and_reports_path_on_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "storage_path = \"/var/lib/console.db\"").unwrap();
        let config = ConsoleConfig::load(file.path()).unwrap();
        assert_eq!(config.storage_path, Some(PathBuf::from("/var/lib/console.db")));

        let mut bad = tempfile::NamedTempFile::new().unwrap();
        writeln!(bad, "candidates = 5").unwrap();
        let err = ConsoleConfig::load(bad.path()).unwrap_err().to_string();
        assert!(err.contains(&bad.path().display().to_string()));
    }

    #[test]
    fn builders_override() {
        let config = ConsoleConfig::default()
            .with_page_url("http://other:9000/hawtio/")
            .with_storage_path("/tmp/x.db");
        assert_eq!(config.navigation().unwrap().location().port(), Some(9000));
        assert_eq!(config.storage_path, Some(PathBuf::from("/tmp/x.db")));
    }
}
