use std::collections::{BTreeMap, HashSet};

use scraper::{ElementRef, Html, Selector};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use super::fetch::RetryingFetcher;
use super::types::{PageAnalysis, PageIndicators, PageType};

const PAYMENT_PATTERNS: [&str; 6] = [
    "payment",
    "pay",
    "checkout",
    "credit card",
    "debit card",
    "cash on delivery",
];

const PRICING_MARKERS: [&str; 3] = ["৳", "BDT", "টাকা"];

#[derive(Clone)]
pub struct PageAnalyzer {
    fetcher: RetryingFetcher,
    brand_signatures: Vec<String>,
}

impl PageAnalyzer {
    pub fn new(fetcher: RetryingFetcher, brand_signatures: Vec<String>) -> Self {
        Self {
            fetcher,
            brand_signatures,
        }
    }

    /// Fetches and analyzes `url`. A failed fetch yields [`PageAnalysis::empty`].
    pub async fn analyze(&self, url: &str) -> PageAnalysis {
        match self.fetcher.fetch(url).await {
            Some(html) => analyze_html(url, &html, &self.brand_signatures),
            None => PageAnalysis::empty(url),
        }
    }
}

pub fn analyze_html(url: &str, html: &str, brand_signatures: &[String]) -> PageAnalysis {
    let doc = Html::parse_document(html);
    let base = Url::parse(url).ok();

    let text_content = extract_body_text(&doc);
    let indicators = PageIndicators {
        has_checkout: url.contains("/checkout")
            || element_text_contains(&doc, "form", "checkout")
            || element_text_contains(&doc, "button", "checkout"),
        has_payment_system: {
            let lowered = text_content.to_lowercase();
            PAYMENT_PATTERNS.iter().any(|p| lowered.contains(p))
        },
        has_bengali_text: text_content.chars().any(is_bengali),
        has_product_listings: count_elements(&doc, "body .product, body [class*=\"product\"]") > 0,
        has_pricing: PRICING_MARKERS.iter().any(|m| text_content.contains(m)),
        has_brand_reference: brand_signatures
            .iter()
            .any(|s| !s.is_empty() && text_content.contains(s.as_str())),
    };

    let analysis = PageAnalysis {
        url: url.to_string(),
        title: extract_title(&doc),
        description: extract_meta_description(&doc),
        images: extract_images(&doc, base.as_ref()),
        links: extract_links(&doc, url),
        structured_data: extract_structured_data(&doc, url),
        meta_tags: extract_meta_tags(&doc),
        page_type: PageType::from_url(url),
        indicators,
        text_content,
    };
    debug!(
        url,
        images = analysis.images.len(),
        links = analysis.links.len(),
        "page analyzed"
    );
    analysis
}

fn is_bengali(ch: char) -> bool {
    ('\u{0980}'..='\u{09FF}').contains(&ch)
}

fn extract_first_text(doc: &Html, selector: &str) -> String {
    let selector = match Selector::parse(selector) {
        Ok(s) => s,
        Err(_) => return String::new(),
    };

    for el in doc.select(&selector) {
        let text = normalize_text(&el.text().collect::<Vec<_>>().join(" "));
        if !text.is_empty() {
            return text;
        }
    }

    String::new()
}

fn normalize_text(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn extract_meta_content(doc: &Html, selector: &str) -> String {
    let selector = match Selector::parse(selector) {
        Ok(s) => s,
        Err(_) => return String::new(),
    };

    doc.select(&selector)
        .find_map(|el| el.value().attr("content"))
        .map(normalize_text)
        .unwrap_or_default()
}

fn extract_title(doc: &Html) -> String {
    let title = extract_first_text(doc, "title");
    if !title.is_empty() {
        return title;
    }
    let og_title = extract_meta_content(doc, "meta[property=\"og:title\"]");
    if !og_title.is_empty() {
        return og_title;
    }
    extract_meta_content(doc, "meta[name=\"twitter:title\"]")
}

fn extract_meta_description(doc: &Html) -> String {
    let description = extract_meta_content(doc, "meta[name=\"description\"]");
    if !description.is_empty() {
        return description;
    }
    extract_meta_content(doc, "meta[property=\"og:description\"]")
}

/// Visible body text with whitespace collapsed; script and style contents are skipped.
fn extract_body_text(doc: &Html) -> String {
    let Ok(body_sel) = Selector::parse("body") else {
        return String::new();
    };
    let Some(body) = doc.select(&body_sel).next() else {
        return String::new();
    };

    let mut raw = String::new();
    for node in body.descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node.ancestors().any(|a| {
            a.value()
                .as_element()
                .is_some_and(|e| matches!(e.name(), "script" | "style" | "noscript" | "template"))
        });
        if !hidden {
            raw.push_str(text);
            raw.push(' ');
        }
    }
    normalize_text(&raw)
}

fn element_text_contains(doc: &Html, selector: &str, needle: &str) -> bool {
    let Ok(selector) = Selector::parse(selector) else {
        return false;
    };
    doc.select(&selector).any(|el| {
        el.text()
            .collect::<String>()
            .to_lowercase()
            .contains(needle)
    })
}

fn count_elements(doc: &Html, selector: &str) -> usize {
    Selector::parse(selector)
        .ok()
        .map(|sel| doc.select(&sel).count())
        .unwrap_or(0)
}

fn extract_images(doc: &Html, base: Option<&Url>) -> Vec<String> {
    let Ok(selector) = Selector::parse("img[src]") else {
        return Vec::new();
    };
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    for el in doc.select(&selector) {
        let src = el.value().attr("src").unwrap_or_default().trim();
        if src.is_empty() || src.starts_with("data:") {
            continue;
        }
        let resolved = match base {
            Some(base) => base.join(src).ok(),
            None => Url::parse(src).ok(),
        };
        if let Some(resolved) = resolved.map(String::from) {
            if seen.insert(resolved.clone()) {
                out.push(resolved);
            }
        }
    }
    out
}

fn extract_links(doc: &Html, page_url: &str) -> Vec<String> {
    let Ok(selector) = Selector::parse("a[href]") else {
        return Vec::new();
    };
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    for el in doc.select(&selector) {
        let href = el.value().attr("href").unwrap_or_default().trim();
        let Some(resolved) = resolve_href(page_url, href) else {
            continue;
        };
        if seen.insert(resolved.clone()) {
            out.push(resolved);
        }
    }
    out
}

fn resolve_href(page_url: &str, href: &str) -> Option<String> {
    if href.is_empty()
        || href.starts_with('#')
        || href.starts_with("mailto:")
        || href.starts_with("javascript:")
        || href.starts_with("tel:")
    {
        return None;
    }

    let resolved = if href.starts_with("http://") || href.starts_with("https://") {
        href.to_string()
    } else {
        let base = Url::parse(page_url).ok()?;
        base.join(href).ok()?.to_string()
    };
    normalize_link(&resolved)
}

/// Drops the fragment and tracking parameters; only http(s) links survive.
pub fn normalize_link(raw: &str) -> Option<String> {
    let mut url = Url::parse(raw.trim()).ok()?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return None;
    }

    let kept_params = url
        .query_pairs()
        .filter(|(k, _)| !is_tracking_query_param(k))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect::<Vec<_>>();
    if kept_params.is_empty() {
        url.set_query(None);
    } else {
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (k, v) in kept_params {
            serializer.append_pair(&k, &v);
        }
        url.set_query(Some(&serializer.finish()));
    }

    url.set_fragment(None);
    Some(url.to_string())
}

fn is_tracking_query_param(param: &str) -> bool {
    let name = param.to_ascii_lowercase();
    if name.starts_with("utm_") {
        return true;
    }
    matches!(name.as_str(), "gclid" | "fbclid" | "_gl" | "mc_cid" | "mc_eid")
}

fn extract_structured_data(doc: &Html, page_url: &str) -> Vec<Value> {
    let Ok(selector) = Selector::parse("script[type=\"application/ld+json\"]") else {
        return Vec::new();
    };
    doc.select(&selector)
        .filter_map(|el| {
            let raw = el.text().collect::<String>();
            if raw.trim().is_empty() {
                return None;
            }
            match serde_json::from_str::<Value>(&raw) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!(url = page_url, error = %e, "skipping malformed JSON-LD block");
                    None
                }
            }
        })
        .collect()
}

fn extract_meta_tags(doc: &Html) -> BTreeMap<String, String> {
    let Ok(selector) = Selector::parse("meta") else {
        return BTreeMap::new();
    };
    doc.select(&selector)
        .filter_map(|el: ElementRef<'_>| {
            let attrs = el.value();
            let key = attrs.attr("name").or_else(|| attrs.attr("property"))?.trim();
            let content = attrs.attr("content")?.trim();
            (!key.is_empty() && !content.is_empty()).then(|| (key.to_string(), content.to_string()))
        })
        .collect()
}
