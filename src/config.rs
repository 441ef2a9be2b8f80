use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default)]
    pub dedupe: DedupeConfig,

    #[serde(default)]
    pub hydrus: HydrusConfig,

    #[serde(default)]
    pub library: LibraryConfig,
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from(".local/share"))
        .join("vidupe")
        .join("catalog.db")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupeConfig {
    /// Minimum similarity (0-100) for two files to count as duplicates
    #[serde(default = "default_threshold")]
    pub threshold: f64,

    /// Fingerprinting workers
    #[serde(default = "default_job_count")]
    pub job_count: usize,

    /// Extra search terms passed to the media store
    #[serde(default)]
    pub query: Vec<String>,

    #[serde(default)]
    pub skip_hashing: bool,

    /// Fingerprint every listed file again, even ones already catalogued
    #[serde(default)]
    pub overwrite: bool,
}

fn default_threshold() -> f64 {
    50.0
}

fn default_job_count() -> usize {
    // rayon's global pool is sized to the machine's CPUs
    rayon::current_num_threads().saturating_sub(1).max(1)
}

impl Default for DedupeConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            job_count: default_job_count(),
            query: Vec::new(),
            skip_hashing: false,
            overwrite: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HydrusConfig {
    #[serde(default = "default_api_url")]
    pub api_url: String,

    #[serde(default)]
    pub api_key: Option<String>,

    /// File services to search. Empty means "all local files".
    #[serde(default)]
    pub file_service_keys: Vec<String>,

    /// Page that files which fail to fingerprint are sent to
    #[serde(default)]
    pub failed_page_name: Option<String>,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// PEM certificate to verify the client API against. Without one the
    /// server's certificate is not checked.
    #[serde(default)]
    pub verify_cert: Option<PathBuf>,
}

fn default_api_url() -> String {
    "https://localhost:45869".to_string()
}

fn default_timeout_secs() -> u64 {
    60
}

impl Default for HydrusConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            api_key: None,
            file_service_keys: Vec::new(),
            failed_page_name: None,
            timeout_secs: default_timeout_secs(),
            verify_cert: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryConfig {
    /// Local directory to deduplicate instead of a Hydrus client
    #[serde(default)]
    pub path: Option<PathBuf>,

    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,

    /// Where duplicate pairs are written; defaults to `duplicates.csv` next to the catalog
    #[serde(default)]
    pub report_path: Option<PathBuf>,
}

fn default_extensions() -> Vec<String> {
    ["gif", "apng", "png", "webp", "jpg", "jpeg", "bmp"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            path: None,
            extensions: default_extensions(),
            report_path: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            dedupe: DedupeConfig::default(),
            hydrus: HydrusConfig::default(),
            library: LibraryConfig::default(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            // Create default config
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("vidupe")
    }

    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Overlay settings from the environment.
    pub fn apply_env(&mut self) {
        self.apply_vars(|name| std::env::var(name).ok());
    }

    fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(key) = var("HYDRUS_API_KEY") {
            self.hydrus.api_key = Some(key);
        }
        if let Some(url) = var("HYDRUS_API_URL") {
            self.hydrus.api_url = url;
        }
        if let Some(path) = var("VIDUPE_DATABASE") {
            self.db_path = PathBuf::from(path);
        }
        if let Some(query) = var("VIDUPE_QUERY") {
            self.dedupe.query = query
                .split(',')
                .map(|term| term.trim().to_string())
                .filter(|term| !term.is_empty())
                .collect();
        }
        if let Some(path) = var("HYDRUS_VERIFY_CERT") {
            self.hydrus.verify_cert = Some(PathBuf::from(path));
        }
        if let Some(page) = var("FAILED_PAGE_NAME") {
            self.hydrus.failed_page_name = Some(page);
        }
    }

    pub fn validate(&self) -> crate::Result<()> {
        let threshold = self.dedupe.threshold;
        if !(0.0..=100.0).contains(&threshold) {
            return Err(Error::Config(format!(
                "threshold must be between 0 and 100, got {}",
                threshold
            )));
        }
        if self.dedupe.job_count == 0 {
            return Err(Error::Config("job_count must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Duplicate report used by the local directory store.
    pub fn report_path(&self) -> PathBuf {
        self.library.report_path.clone().unwrap_or_else(|| {
            self.db_path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default()
                .join("duplicates.csv")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [dedupe]
            threshold = 80.0

            [hydrus]
            api_key = "secret"
            "#,
        )
        .unwrap();

        assert_eq!(config.dedupe.threshold, 80.0);
        assert!(config.dedupe.job_count >= 1);
        assert_eq!(config.hydrus.api_key.as_deref(), Some("secret"));
        assert_eq!(config.hydrus.api_url, "https://localhost:45869");
        assert_eq!(config.hydrus.verify_cert, None);
        assert_eq!(config.hydrus.timeout_secs, 60);
        assert!(config.library.extensions.contains(&"gif".to_string()));
    }

    #[test]
    fn test_save_and_load_from_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("conf").join("config.toml");
        let mut config = Config::default();
        config.dedupe.query = vec!["system:width > 400".to_string()];
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.dedupe.query, config.dedupe.query);
        assert_eq!(loaded.db_path, config.db_path);
    }

    #[test]
    fn test_environment_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("HYDRUS_API_KEY", "abc"),
            ("VIDUPE_DATABASE", "/tmp/other.db"),
            ("VIDUPE_QUERY", "character:foo, ,series:bar"),
        ]);
        let mut config = Config::default();
        config.apply_vars(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(config.hydrus.api_key.as_deref(), Some("abc"));
        assert_eq!(config.db_path, PathBuf::from("/tmp/other.db"));
        assert_eq!(config.dedupe.query, vec!["character:foo", "series:bar"]);
        assert_eq!(config.hydrus.failed_page_name, None);
    }

    #[test]
    fn test_threshold_validation() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());
        config.dedupe.threshold = 101.0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
        config.dedupe.threshold = 100.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_report_path_defaults_next_to_catalog() {
        let mut config = Config::default();
        config.db_path = PathBuf::from("/data/vidupe/catalog.db");
        assert_eq!(config.report_path(), PathBuf::from("/data/vidupe/duplicates.csv"));
    }
}
