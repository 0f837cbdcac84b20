use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("invalid URL {0}")]
    InvalidUrl(String),

    #[error("http client setup failed: {0}")]
    Client(String),

    #[error("request to {url} failed: {reason}")]
    Transport { url: String, reason: String },

    #[error("request to {url} timed out after {timeout:?}")]
    Timeout { url: String, timeout: Duration },

    #[error("{url} answered with HTTP {status}")]
    ServerStatus { url: String, status: u16 },

    #[error("reading body of {url} failed: {reason}")]
    Body { url: String, reason: String },
}

/// Last failure of a fetch whose retries were exhausted.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("gave up after {attempts} attempts: {last}")]
pub struct RetryExhausted<E: std::error::Error> {
    pub attempts: u32,
    #[source]
    pub last: E,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SitemapError {
    #[error("empty document")]
    Empty,

    #[error("malformed XML: {0}")]
    Malformed(String),

    #[error("unexpected root element <{0}>")]
    UnknownRoot(String),

    #[error("rendering sitemap failed: {0}")]
    Render(String),
}

#[derive(Debug, Error)]
pub enum ScreenshotError {
    #[error("screenshots are disabled")]
    Disabled,

    #[error("webdriver: {0}")]
    WebDriver(String),

    #[error("page render timed out after {0:?}")]
    Timeout(Duration),

    #[error("screenshot payload could not be decoded: {0}")]
    Decode(String),

    #[error("image processing failed: {0}")]
    Image(#[from] image::ImageError),

    #[error("writing {path} failed: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("filesystem operation on {path} failed: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("record encoding failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error(transparent)]
    Sitemap(#[from] SitemapError),

    #[error("report export failed: {0}")]
    Report(#[from] csv::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("target '{0}' has no usable host")]
    InvalidTarget(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Fetch(#[from] FetchError),
}
