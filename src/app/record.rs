use std::collections::HashSet;
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use tracing::{debug, info, warn};
use url::Url;

use super::analyze::PageAnalyzer;
use super::config::{ReferenceSite, ScanLimits};
use super::error::{ScanError, ScreenshotError};
use super::fetch::RetryingFetcher;
use super::screenshot::Screenshotter;
use super::similarity::SimilarityEngine;
use super::sitemap::{collect_entries, discover_sitemap_sources};
use super::store::EvidenceStore;
use super::types::{
    PageAnalysis, PageIndicators, PageSummary, RecordEvidence, ScamRecord, ScreenshotKind,
    ScreenshotRecord, SitemapEntry, TargetDomain, slugify,
};

const CHECKOUT_WARNING: &str =
    "The site has a checkout system that could collect your payment details.";
const BENGALI_WARNING: &str =
    "The site targets Bengali-speaking customers, primarily in Bangladesh.";
const PRICING_WARNING: &str = "The site lists its prices in Bangladeshi Taka.";
const COPIED_WARNING: &str = "Content copied from the official site was found on this domain.";

const PAGE_SLUG_LEN: usize = 30;

#[derive(Clone)]
pub struct RecordBuilder {
    fetcher: RetryingFetcher,
    analyzer: PageAnalyzer,
    engine: SimilarityEngine,
    screenshotter: Arc<dyn Screenshotter>,
    store: EvidenceStore,
    reference: ReferenceSite,
    limits: ScanLimits,
}

impl RecordBuilder {
    pub fn new(
        fetcher: RetryingFetcher,
        screenshotter: Arc<dyn Screenshotter>,
        store: EvidenceStore,
        reference: ReferenceSite,
        limits: ScanLimits,
    ) -> Self {
        let analyzer = PageAnalyzer::new(fetcher.clone(), reference.brand_signatures.clone());
        let engine = SimilarityEngine::new(&reference, &limits);
        Self {
            fetcher,
            analyzer,
            engine,
            screenshotter,
            store,
            reference,
            limits,
        }
    }

    pub fn analyzer(&self) -> &PageAnalyzer {
        &self.analyzer
    }

    pub fn engine(&self) -> &SimilarityEngine {
        &self.engine
    }

    /// Scans `target` and persists its record. `reference` is the analysis of the
    /// official homepage, computed once per run by the caller.
    pub async fn build_and_persist(
        &self,
        target: &TargetDomain,
        reference: &PageAnalysis,
    ) -> Result<ScamRecord, ScanError> {
        let host = target.host();
        if host.is_empty() {
            return Err(ScanError::InvalidTarget(target.domain.clone()));
        }
        let slug = target.slug();
        info!(domain = %host, slug = %slug, "scanning domain");

        let sources = if target.sitemap_urls.is_empty() {
            discover_sitemap_sources(&self.fetcher, &target.origin()).await
        } else {
            target.sitemap_urls.clone()
        };
        let entries = collect_entries(&self.fetcher, &sources, &self.limits).await;
        let candidates = candidate_urls(target, &entries, self.limits.max_pages_per_domain);
        debug!(domain = %host, sitemap_entries = entries.len(), candidates = candidates.len(), "candidates selected");

        let homepage = target.homepage_url();
        let checkout = target.checkout_url();
        let mut evidence = RecordEvidence::default();
        let mut warnings = self.template_warnings(&host);
        let mut seen_links = HashSet::new();

        for url in &candidates {
            let analysis = self.analyzer.analyze(url).await;

            if *url == homepage {
                self.push_screenshot(
                    &mut evidence,
                    ScreenshotKind::Homepage,
                    "Homepage".to_string(),
                    url,
                    &format!("{slug}-homepage.jpg"),
                )
                .await;
            }
            if analysis.is_blank() {
                debug!(url = %url, "nothing fetched, page skipped");
                continue;
            }

            let items = self.engine.compare(&analysis, reference);
            warnings.extend(situational_warnings(&analysis.indicators, !items.is_empty()));

            if *url == checkout {
                self.push_screenshot(
                    &mut evidence,
                    ScreenshotKind::Checkout,
                    "Checkout page".to_string(),
                    url,
                    &format!("{slug}-checkout.jpg"),
                )
                .await;
            } else if *url != homepage
                && (analysis.indicators.has_product_listings || analysis.indicators.has_checkout)
            {
                let label = if analysis.title.is_empty() {
                    url.clone()
                } else {
                    analysis.title.clone()
                };
                let page_slug: String = slugify(url).chars().take(PAGE_SLUG_LEN).collect();
                self.push_screenshot(
                    &mut evidence,
                    ScreenshotKind::Page,
                    label,
                    url,
                    &format!("{slug}-{page_slug}.jpg"),
                )
                .await;
            }

            if seen_links.insert(analysis.url.clone()) {
                evidence.links.push(analysis.url.clone());
            }
            evidence.analyses.push(PageSummary::from_analysis(&analysis, items));
        }

        let record = ScamRecord {
            url: target.origin(),
            name: target.display_name.clone(),
            slug,
            description: target
                .description
                .clone()
                .unwrap_or_else(|| self.default_description()),
            detected_date: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            evidence,
            warning_details: dedup_preserving_order(warnings),
        };
        self.store.persist(&record)?;
        Ok(record)
    }

    async fn push_screenshot(
        &self,
        evidence: &mut RecordEvidence,
        kind: ScreenshotKind,
        label: String,
        url: &str,
        file_name: &str,
    ) {
        match self.screenshotter.capture(url, file_name).await {
            Ok(paths) => evidence.screenshots.push(ScreenshotRecord {
                kind,
                label,
                full_image_path: paths.full,
                thumbnail_path: paths.thumbnail,
                source_url: Some(url.to_string()),
            }),
            Err(ScreenshotError::Disabled) => {}
            Err(e) => warn!(url, error = %e, "screenshot skipped"),
        }
    }

    fn default_description(&self) -> String {
        format!(
            "This website is a fraudulent copy of the official {} website ({}). It impersonates the brand to collect customer information and payments.",
            self.reference.brand_name, self.reference.url
        )
    }

    fn template_warnings(&self, host: &str) -> Vec<String> {
        let brand = &self.reference.brand_name;
        vec![
            format!("This fake website ({host}) impersonates the official {brand} brand."),
            format!("The website uses {brand} product images and descriptions without permission."),
            "The checkout process may collect your personal and financial information for fraudulent purposes."
                .to_string(),
            format!(
                "The domain name is designed to look like the official domain but is NOT affiliated with {brand}."
            ),
            format!("The only official website is {}.", self.reference.url),
        ]
    }
}

/// Homepage and checkout first, always, then sitemap URLs on the target host while the
/// list is shorter than `max`.
pub fn candidate_urls(target: &TargetDomain, entries: &[SitemapEntry], max: usize) -> Vec<String> {
    let host = target.host();
    let www = format!("www.{host}");
    let on_host = |url: &str| {
        Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
            .is_some_and(|h| h == host || h == www)
    };

    let fixed = [target.homepage_url(), target.checkout_url()];
    let mut seen: HashSet<String> = fixed.iter().cloned().collect();
    let budget = max.saturating_sub(fixed.len());
    let sampled = entries
        .iter()
        .map(|e| e.url.clone())
        .filter(|url| on_host(url))
        .filter(|url| seen.insert(url.clone()))
        .take(budget);

    fixed.into_iter().chain(sampled).collect()
}

fn situational_warnings(indicators: &PageIndicators, copied: bool) -> Vec<String> {
    let mut out = Vec::new();
    if indicators.has_checkout {
        out.push(CHECKOUT_WARNING.to_string());
    }
    if indicators.has_bengali_text {
        out.push(BENGALI_WARNING.to_string());
    }
    if indicators.has_pricing {
        out.push(PRICING_WARNING.to_string());
    }
    if copied || indicators.has_brand_reference {
        out.push(COPIED_WARNING.to_string());
    }
    out
}

pub fn dedup_preserving_order(items: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.clone()))
        .collect()
}
