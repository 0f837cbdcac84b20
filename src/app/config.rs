//! Scan configuration.
//!
//! Everything the scanner needs is carried by one [`ScanConfig`] value that is handed
//! to the orchestrator. It is read from a TOML file (every table is optional) and then
//! patched with command-line overrides.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::ConfigError;
use super::types::{Cli, TargetDomain};

pub const DEFAULT_CONFIG_FILE: &str = "scamscan.toml";

pub const DEFAULT_USER_AGENT: &str = concat!(
    "scamscan/",
    env!("CARGO_PKG_VERSION"),
    " (+security scanner)"
);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub reference: ReferenceSite,
    pub targets: Vec<TargetDomain>,
    pub limits: ScanLimits,
    pub fetch: FetchSettings,
    pub screenshots: ScreenshotSettings,
    pub output: OutputPaths,
    pub logging: LoggingConfig,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            reference: ReferenceSite::default(),
            targets: default_targets(),
            limits: ScanLimits::default(),
            fetch: FetchSettings::default(),
            screenshots: ScreenshotSettings::default(),
            output: OutputPaths::default(),
            logging: LoggingConfig::default(),
        }
    }
}

fn default_targets() -> Vec<TargetDomain> {
    vec![
        TargetDomain::new("classyclothes.com.bd", "ClassyClothes.com.bd").with_sitemaps([
            "https://classyclothes.com.bd/wp-sitemap.xml",
            "https://classyclothes.com.bd/wp-sitemap-post-post-1.xml",
            "https://classyclothes.com.bd/wp-sitemap-posts-page-1.xml",
            "https://classyclothes.com.bd/wp-sitemap-posts-product-1.xml",
            "https://classyclothes.com.bd/wp-sitemap-posts-featured_item-1.xml",
            "https://classyclothes.com.bd/wp-sitemap-taxonomies-category-1.xml",
            "https://classyclothes.com.bd/wp-sitemap-taxonomies-product_cat-1.xml",
            "https://classyclothes.com.bd/wp-sitemap-taxonomies-featured_item_category-1.xml",
            "https://classyclothes.com.bd/wp-sitemap-users-1.xml",
        ]),
        TargetDomain::new("classy-clothes-bd.com", "Classy-Clothes-BD.com").with_sitemaps([
            "https://classy-clothes-bd.com/sitemap.xml",
            "https://classy-clothes-bd.com/sitemap-post-1.xml",
            "https://classy-clothes-bd.com/sitemap-pages-1.xml",
            "https://classy-clothes-bd.com/sitemap-products-1.xml",
        ]),
    ]
}

/// The official site all candidates are compared against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferenceSite {
    pub url: String,
    pub brand_name: String,
    /// Strings whose presence in a page body counts as a reference to the brand.
    pub brand_signatures: Vec<String>,
}

impl Default for ReferenceSite {
    fn default() -> Self {
        Self {
            url: "https://classyclothes.coupons".to_string(),
            brand_name: "Classy Clothes".to_string(),
            brand_signatures: vec![
                "Classy Clothes Official".to_string(),
                "classyclothes.coupons".to_string(),
            ],
        }
    }
}

impl ReferenceSite {
    /// Host of the reference URL without a leading `www.`.
    pub fn domain(&self) -> String {
        url::Url::parse(&self.url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.trim_start_matches("www.").to_string()))
            .unwrap_or_else(|| self.url.clone())
    }
}

/// Sampling caps and detection thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanLimits {
    pub max_nested_sitemaps: usize,
    pub max_urls_per_sitemap: usize,
    pub max_pages_per_domain: usize,
    pub content_threshold: f64,
    pub structured_data_threshold: f64,
}

impl Default for ScanLimits {
    fn default() -> Self {
        Self {
            max_nested_sitemaps: 3,
            max_urls_per_sitemap: 5,
            max_pages_per_domain: 20,
            content_threshold: 0.40,
            structured_data_threshold: 0.50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchSettings {
    pub user_agent: String,
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_jitter_ms: u64,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout_secs: 10,
            max_attempts: 3,
            base_delay_ms: 2000,
            max_jitter_ms: 1000,
        }
    }
}

impl FetchSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Browser {
    Chrome,
    Firefox,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScreenshotSettings {
    pub enabled: bool,
    pub webdriver_url: String,
    /// Driver binary to spawn when `webdriver_url` points at an unreachable local port.
    pub driver_binary: Option<String>,
    pub browser: Browser,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub page_timeout_secs: u64,
    pub settle_ms: u64,
    pub thumbnail_width: u32,
    pub thumbnail_height: u32,
    /// Web path under which the evidence directory is served.
    pub public_prefix: String,
}

impl Default for ScreenshotSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            webdriver_url: "http://localhost:4444".to_string(),
            driver_binary: None,
            browser: Browser::Chrome,
            viewport_width: 1280,
            viewport_height: 800,
            page_timeout_secs: 30,
            settle_ms: 2000,
            thumbnail_width: 400,
            thumbnail_height: 300,
            public_prefix: "/images/scam-evidence".to_string(),
        }
    }
}

impl ScreenshotSettings {
    pub fn page_timeout(&self) -> Duration {
        Duration::from_secs(self.page_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputPaths {
    pub data_dir: PathBuf,
    pub evidence_dir: PathBuf,
    pub scam_sitemap: PathBuf,
    /// Existing sitemap index that should reference the scam sitemap, if present.
    pub main_sitemap: PathBuf,
    pub report: Option<PathBuf>,
}

impl Default for OutputPaths {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data/scams"),
            evidence_dir: PathBuf::from("public/images/scam-evidence"),
            scam_sitemap: PathBuf::from("public/scam-sitemap.xml"),
            main_sitemap: PathBuf::from("public/sitemap.xml"),
            report: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
    pub level: LogLevel,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Text,
            level: LogLevel::Info,
        }
    }
}

impl ScanConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Explicit path first, then `scamscan.toml` in the working directory, then defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        let fallback = Path::new(DEFAULT_CONFIG_FILE);
        if fallback.is_file() {
            return Self::load(fallback);
        }
        Ok(Self::default())
    }

    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(dir) = &cli.data_dir {
            self.output.data_dir = dir.clone();
        }
        if let Some(dir) = &cli.evidence_dir {
            self.output.evidence_dir = dir.clone();
        }
        if let Some(path) = &cli.sitemap_out {
            self.output.scam_sitemap = path.clone();
        }
        if let Some(path) = &cli.report {
            self.output.report = Some(path.clone());
        }
        if cli.no_screenshots {
            self.screenshots.enabled = false;
        }
        if let Some(endpoint) = &cli.webdriver_url {
            self.screenshots.webdriver_url = endpoint.clone();
        }
        match cli.verbose {
            0 => {}
            1 => self.logging.level = LogLevel::Debug,
            _ => self.logging.level = LogLevel::Trace,
        }
    }

    /// Collects every problem so they can all be fixed in one pass.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if url::Url::parse(&self.reference.url).is_err() {
            errors.push(format!("reference.url '{}' is not a URL", self.reference.url));
        }
        if self.reference.brand_name.trim().is_empty() {
            errors.push("reference.brand_name must not be empty".to_string());
        }
        let reference_domain = self.reference.domain();
        for (idx, target) in self.targets.iter().enumerate() {
            let host = target.host();
            if host.is_empty() {
                errors.push(format!("targets[{idx}].domain must not be empty"));
            } else if host.trim_start_matches("www.") == reference_domain {
                errors.push(format!("targets[{idx}] is the reference site itself"));
            }
        }
        for (name, value) in [
            ("limits.content_threshold", self.limits.content_threshold),
            (
                "limits.structured_data_threshold",
                self.limits.structured_data_threshold,
            ),
        ] {
            if !(0.0..=1.0).contains(&value) {
                errors.push(format!("{name} must be within [0, 1], got {value}"));
            }
        }
        if self.limits.max_pages_per_domain == 0 {
            errors.push("limits.max_pages_per_domain must be positive".to_string());
        }
        if self.fetch.max_attempts == 0 {
            errors.push("fetch.max_attempts must be positive".to_string());
        }
        if self.fetch.timeout_secs == 0 {
            errors.push("fetch.timeout_secs must be positive".to_string());
        }
        if self.screenshots.thumbnail_width == 0 || self.screenshots.thumbnail_height == 0 {
            errors.push("screenshots thumbnail dimensions must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_carry_the_known_targets_and_caps() {
        let config = ScanConfig::default();
        assert_eq!(config.targets.len(), 2);
        assert_eq!(config.targets[0].slug(), "classyclothes-com-bd");
        assert_eq!(config.limits.max_nested_sitemaps, 3);
        assert_eq!(config.limits.max_urls_per_sitemap, 5);
        assert_eq!(config.limits.max_pages_per_domain, 20);
        assert_eq!(config.fetch.max_attempts, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_toml_keeps_defaults_for_missing_tables() {
        let config = ScanConfig::from_toml_str(
            r#"
            [reference]
            url = "https://official.test"
            brand_name = "Official"

            [[targets]]
            domain = "fake.test"
            display_name = "Fake"
            sitemap_urls = ["https://fake.test/sitemap.xml"]

            [limits]
            content_threshold = 0.25
            "#,
        )
        .unwrap();

        assert_eq!(config.reference.brand_name, "Official");
        assert_eq!(config.reference.brand_signatures.len(), 2);
        assert_eq!(config.targets.len(), 1);
        assert_eq!(config.targets[0].description, None);
        assert_eq!(config.limits.content_threshold, 0.25);
        assert_eq!(config.limits.structured_data_threshold, 0.50);
        assert_eq!(config.fetch.timeout_secs, 10);
    }

    #[test]
    fn validate_reports_every_problem() {
        let mut config = ScanConfig::default();
        config.reference.url = "nope".to_string();
        config.limits.content_threshold = 1.5;
        config.fetch.max_attempts = 0;
        config.targets.push(TargetDomain::new("", "Empty"));

        let Err(ConfigError::Invalid(errors)) = config.validate() else {
            panic!("expected validation failure");
        };
        assert_eq!(errors.len(), 4);
    }

    #[test]
    fn cli_overrides_paths_and_switches() {
        let mut config = ScanConfig::default();
        let cli = Cli {
            data_dir: Some(PathBuf::from("/tmp/records")),
            no_screenshots: true,
            verbose: 1,
            ..Cli::default()
        };
        config.apply_cli(&cli);
        assert_eq!(config.output.data_dir, PathBuf::from("/tmp/records"));
        assert!(!config.screenshots.enabled);
        assert_eq!(config.logging.level, LogLevel::Debug);
    }

    #[test]
    fn reference_domain_drops_www() {
        let reference = ReferenceSite {
            url: "https://www.official.test/path".to_string(),
            ..ReferenceSite::default()
        };
        assert_eq!(reference.domain(), "official.test");
    }

    #[test]
    fn reference_site_cannot_be_a_target() {
        let mut config = ScanConfig::default();
        config.reference.url = "https://official.test".to_string();
        config.targets = vec![TargetDomain::new("www.official.test", "Self")];

        let Err(ConfigError::Invalid(errors)) = config.validate() else {
            panic!("expected validation failure");
        };
        assert_eq!(errors, vec!["targets[0] is the reference site itself".to_string()]);
    }
}
