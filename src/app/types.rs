use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::{ArgAction, Parser};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

#[derive(Debug, Parser, Clone, Default)]
#[command(
    name = "scamscan",
    version,
    about = "Scans impersonating storefronts through their sitemaps and records evidence"
)]
pub struct Cli {
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[arg(long, value_name = "DIR")]
    pub data_dir: Option<PathBuf>,

    #[arg(long, value_name = "DIR")]
    pub evidence_dir: Option<PathBuf>,

    #[arg(long, value_name = "FILE")]
    pub sitemap_out: Option<PathBuf>,

    #[arg(long, default_value_t = false)]
    pub no_screenshots: bool,

    #[arg(long, value_name = "URL")]
    pub webdriver_url: Option<String>,

    #[arg(long, value_name = "FILE")]
    pub report: Option<PathBuf>,

    /// Analyze a single URL against the reference site and print the result as JSON.
    #[arg(long, value_name = "URL")]
    pub inspect: Option<String>,

    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

/// A domain known to impersonate the reference site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetDomain {
    pub domain: String,
    pub display_name: String,
    #[serde(default)]
    pub sitemap_urls: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl TargetDomain {
    pub fn new(domain: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            display_name: display_name.into(),
            sitemap_urls: Vec::new(),
            description: None,
        }
    }

    pub fn with_sitemaps<I, S>(mut self, sitemaps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sitemap_urls = sitemaps.into_iter().map(Into::into).collect();
        self
    }

    /// Host part of `domain`, tolerating a scheme or trailing slash in the config value.
    pub fn host(&self) -> String {
        let trimmed = self.domain.trim();
        let without_scheme = trimmed
            .strip_prefix("https://")
            .or_else(|| trimmed.strip_prefix("http://"))
            .unwrap_or(trimmed);
        without_scheme
            .split('/')
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase()
    }

    pub fn origin(&self) -> String {
        format!("https://{}", self.host())
    }

    pub fn homepage_url(&self) -> String {
        format!("{}/", self.origin())
    }

    pub fn checkout_url(&self) -> String {
        format!("{}/checkout/", self.origin())
    }

    pub fn slug(&self) -> String {
        slugify(&self.domain)
    }
}

/// Lower-cases `value`, drops the scheme and trailing slash, and collapses every run of
/// non-alphanumeric characters into a single `-`.
pub fn slugify(value: &str) -> String {
    let lowered = value.trim().to_ascii_lowercase();
    let stripped = lowered
        .strip_prefix("https://")
        .or_else(|| lowered.strip_prefix("http://"))
        .unwrap_or(&lowered)
        .trim_end_matches('/');

    let mut slug = String::with_capacity(stripped.len());
    let mut pending_dash = false;
    for ch in stripped.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch);
        } else {
            pending_dash = true;
        }
    }
    slug
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SitemapEntry {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_freq: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
}

impl SitemapEntry {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            last_modified: None,
            change_freq: None,
            priority: None,
        }
    }
}

/// A parsed sitemap document: either an index of other sitemaps or a set of page URLs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SitemapDocument {
    Index(Vec<String>),
    UrlSet(Vec<SitemapEntry>),
}

impl Default for SitemapDocument {
    fn default() -> Self {
        SitemapDocument::UrlSet(Vec::new())
    }
}

impl SitemapDocument {
    pub fn len(&self) -> usize {
        match self {
            SitemapDocument::Index(children) => children.len(),
            SitemapDocument::UrlSet(entries) => entries.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PageType {
    Homepage,
    Product,
    Category,
    Tag,
    Shop,
    Blog,
    Info,
    Checkout,
    #[default]
    Page,
}

impl PageType {
    pub fn label(self) -> &'static str {
        match self {
            PageType::Homepage => "homepage",
            PageType::Product => "product",
            PageType::Category => "category",
            PageType::Tag => "tag",
            PageType::Shop => "shop",
            PageType::Blog => "blog",
            PageType::Info => "info",
            PageType::Checkout => "checkout",
            PageType::Page => "page",
        }
    }

    /// Classifies a page by the first segment of its URL path.
    pub fn from_url(url: &str) -> Self {
        let Ok(parsed) = Url::parse(url) else {
            return PageType::Page;
        };
        let first = parsed
            .path_segments()
            .and_then(|mut segments| segments.find(|segment| !segment.is_empty()))
            .map(str::to_ascii_lowercase);

        match first.as_deref() {
            None => PageType::Homepage,
            Some("product") => PageType::Product,
            Some("category" | "product-category") => PageType::Category,
            Some("tag" | "product-tag") => PageType::Tag,
            Some("shop") => PageType::Shop,
            Some("blog" | "news" | "post") => PageType::Blog,
            Some("about" | "about-us" | "contact") => PageType::Info,
            Some("checkout" | "cart") => PageType::Checkout,
            Some(_) => PageType::Page,
        }
    }
}

/// Heuristic signals extracted from a page body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageIndicators {
    pub has_checkout: bool,
    pub has_payment_system: bool,
    pub has_bengali_text: bool,
    pub has_product_listings: bool,
    pub has_pricing: bool,
    pub has_brand_reference: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageAnalysis {
    pub url: String,
    pub title: String,
    pub description: String,
    pub text_content: String,
    pub images: Vec<String>,
    pub links: Vec<String>,
    pub structured_data: Vec<Value>,
    pub meta_tags: BTreeMap<String, String>,
    pub page_type: PageType,
    pub indicators: PageIndicators,
}

impl PageAnalysis {
    pub fn empty(url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            page_type: PageType::from_url(&url),
            url,
            ..Self::default()
        }
    }

    /// True when nothing was extracted, which is what a failed fetch produces.
    pub fn is_blank(&self) -> bool {
        self.title.is_empty()
            && self.description.is_empty()
            && self.text_content.is_empty()
            && self.images.is_empty()
            && self.links.is_empty()
            && self.structured_data.is_empty()
            && self.meta_tags.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    Title,
    MetaDescription,
    Content,
    Images,
    StructuredData,
}

impl EvidenceKind {
    pub fn label(self) -> &'static str {
        match self {
            EvidenceKind::Title => "title",
            EvidenceKind::MetaDescription => "meta_description",
            EvidenceKind::Content => "content",
            EvidenceKind::Images => "images",
            EvidenceKind::StructuredData => "structured_data",
        }
    }

    pub fn requires_similarity(self) -> bool {
        matches!(self, EvidenceKind::Content | EvidenceKind::StructuredData)
    }
}

/// One piece of detected similarity between a candidate page and the reference site.
///
/// `similarity` is private so that every value stored in it went through
/// [`clamp_probability`], and scored kinds always carry one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "StoredEvidenceItem")]
pub struct EvidenceItem {
    pub kind: EvidenceKind,
    pub original_url: String,
    pub fake_url: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    similarity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence_text: Option<String>,
}

impl EvidenceItem {
    /// Evidence without a score. Only meaningful for kinds that do not require one.
    pub fn observed(
        kind: EvidenceKind,
        original_url: impl Into<String>,
        fake_url: impl Into<String>,
        description: impl Into<String>,
        evidence_text: Option<String>,
    ) -> Self {
        Self {
            kind,
            original_url: original_url.into(),
            fake_url: fake_url.into(),
            description: description.into(),
            similarity: if kind.requires_similarity() {
                Some(0.0)
            } else {
                None
            },
            evidence_text,
        }
    }

    pub fn scored(
        kind: EvidenceKind,
        original_url: impl Into<String>,
        fake_url: impl Into<String>,
        description: impl Into<String>,
        similarity: f64,
    ) -> Self {
        Self {
            kind,
            original_url: original_url.into(),
            fake_url: fake_url.into(),
            description: description.into(),
            similarity: Some(clamp_probability(similarity)),
            evidence_text: None,
        }
    }

    pub fn similarity(&self) -> Option<f64> {
        self.similarity
    }
}

pub fn clamp_probability(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Wire shape of [`EvidenceItem`] before its score is normalized.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredEvidenceItem {
    kind: EvidenceKind,
    original_url: String,
    fake_url: String,
    description: String,
    #[serde(default)]
    similarity: Option<f64>,
    #[serde(default)]
    evidence_text: Option<String>,
}

impl From<StoredEvidenceItem> for EvidenceItem {
    fn from(raw: StoredEvidenceItem) -> Self {
        let similarity = match raw.similarity {
            Some(value) => Some(clamp_probability(value)),
            None if raw.kind.requires_similarity() => Some(0.0),
            None => None,
        };
        Self {
            kind: raw.kind,
            original_url: raw.original_url,
            fake_url: raw.fake_url,
            description: raw.description,
            similarity,
            evidence_text: raw.evidence_text,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScreenshotKind {
    Homepage,
    Checkout,
    Page,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenshotRecord {
    pub kind: ScreenshotKind,
    pub label: String,
    pub full_image_path: String,
    pub thumbnail_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
}

/// Per-page digest stored in a record instead of the full analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageSummary {
    pub url: String,
    pub title: String,
    pub description: String,
    pub page_type: PageType,
    pub indicators: PageIndicators,
    pub image_count: usize,
    pub link_count: usize,
    pub structured_data_count: usize,
    #[serde(default)]
    pub evidence: Vec<EvidenceItem>,
}

impl PageSummary {
    pub fn from_analysis(analysis: &PageAnalysis, evidence: Vec<EvidenceItem>) -> Self {
        Self {
            url: analysis.url.clone(),
            title: analysis.title.clone(),
            description: analysis.description.clone(),
            page_type: analysis.page_type,
            indicators: analysis.indicators,
            image_count: analysis.images.len(),
            link_count: analysis.links.len(),
            structured_data_count: analysis.structured_data.len(),
            evidence,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordEvidence {
    #[serde(default)]
    pub screenshots: Vec<ScreenshotRecord>,
    #[serde(default)]
    pub analyses: Vec<PageSummary>,
    #[serde(default)]
    pub links: Vec<String>,
}

/// The persisted unit: everything collected about one impersonating domain in one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScamRecord {
    pub url: String,
    pub name: String,
    pub slug: String,
    pub description: String,
    pub detected_date: String,
    #[serde(default)]
    pub evidence: RecordEvidence,
    #[serde(default)]
    pub warning_details: Vec<String>,
}

/// Result of checking a single URL against the reference site.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Inspection {
    pub analysis: PageAnalysis,
    pub evidence: Vec<EvidenceItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub records_written: usize,
    pub domains_failed: usize,
    pub started_at: String,
    pub finished_at: String,
}
