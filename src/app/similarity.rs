use std::collections::HashSet;

use serde_json::Value;
use tracing::debug;
use url::Url;

use super::analyze::PageAnalyzer;
use super::config::{ReferenceSite, ScanLimits};
use super::types::{EvidenceItem, EvidenceKind, Inspection, PageAnalysis};

/// Jaccard index of the lower-cased whitespace token sets. Zero when either side is empty.
pub fn jaccard_similarity(a: &str, b: &str) -> f64 {
    let left = token_set(a);
    let right = token_set(b);
    if left.is_empty() || right.is_empty() {
        return 0.0;
    }
    let intersection = left.intersection(&right).count();
    let union = left.union(&right).count();
    intersection as f64 / union as f64
}

fn token_set(text: &str) -> HashSet<String> {
    text.split_whitespace().map(str::to_lowercase).collect()
}

pub fn structured_data_similarity(a: &[Value], b: &[Value]) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let (Ok(left), Ok(right)) = (serde_json::to_string(a), serde_json::to_string(b)) else {
        return 0.0;
    };
    jaccard_similarity(&left, &right)
}

/// Candidate images that also appear on the reference page, matched by URL or by path.
pub fn image_overlap(candidate: &[String], reference: &[String]) -> Vec<String> {
    candidate
        .iter()
        .filter(|img| reference.iter().any(|ours| images_match(img, ours)))
        .cloned()
        .collect()
}

fn images_match(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    let contains_path = |haystack: &str, url: &str| {
        significant_path(url).is_some_and(|path| haystack.contains(path.as_str()))
    };
    contains_path(a, b) || contains_path(b, a)
}

fn significant_path(url: &str) -> Option<String> {
    let path = Url::parse(url).ok()?.path().to_string();
    (path.len() > 1).then_some(path)
}

#[derive(Debug, Clone)]
pub struct SimilarityEngine {
    reference_url: String,
    brand_name: String,
    content_threshold: f64,
    structured_data_threshold: f64,
}

impl SimilarityEngine {
    pub fn new(reference: &ReferenceSite, limits: &ScanLimits) -> Self {
        Self {
            reference_url: reference.url.clone(),
            brand_name: reference.brand_name.clone(),
            content_threshold: limits.content_threshold,
            structured_data_threshold: limits.structured_data_threshold,
        }
    }

    pub fn reference_url(&self) -> &str {
        &self.reference_url
    }

    /// Analyzes the candidate and the reference homepage and compares the two.
    pub async fn detect_copied_content(
        &self,
        analyzer: &PageAnalyzer,
        candidate_url: &str,
    ) -> Vec<EvidenceItem> {
        self.inspect(analyzer, candidate_url).await.evidence
    }

    /// Like [`Self::detect_copied_content`] but keeps the candidate's analysis.
    pub async fn inspect(&self, analyzer: &PageAnalyzer, candidate_url: &str) -> Inspection {
        let analysis = analyzer.analyze(candidate_url).await;
        if analysis.is_blank() {
            return Inspection {
                analysis,
                evidence: Vec::new(),
            };
        }
        let reference = analyzer.analyze(&self.reference_url).await;
        let evidence = self.compare(&analysis, &reference);
        Inspection { analysis, evidence }
    }

    pub fn compare(&self, candidate: &PageAnalysis, reference: &PageAnalysis) -> Vec<EvidenceItem> {
        let mut evidence = Vec::new();
        let fake_url = candidate.url.as_str();

        let uses_brand = !self.brand_name.is_empty() && candidate.title.contains(&self.brand_name);
        let title_copied =
            !candidate.title.is_empty() && reference.title.contains(&candidate.title);
        if uses_brand || title_copied {
            evidence.push(EvidenceItem::observed(
                EvidenceKind::Title,
                &self.reference_url,
                fake_url,
                format!(
                    "The page title impersonates the \"{}\" brand.",
                    self.brand_name
                ),
                Some(candidate.title.clone()),
            ));
        }

        let (ours, theirs) = (&reference.description, &candidate.description);
        if !ours.is_empty() && !theirs.is_empty() && (theirs.contains(ours) || ours.contains(theirs))
        {
            evidence.push(EvidenceItem::observed(
                EvidenceKind::MetaDescription,
                &self.reference_url,
                fake_url,
                "The page reuses the official meta description.",
                Some(theirs.clone()),
            ));
        }

        let content = jaccard_similarity(&candidate.text_content, &reference.text_content);
        if content > self.content_threshold {
            evidence.push(EvidenceItem::scored(
                EvidenceKind::Content,
                &self.reference_url,
                fake_url,
                format!(
                    "The page shares {}% of its wording with the official homepage.",
                    (content * 100.0).round()
                ),
                content,
            ));
        }

        let images = image_overlap(&candidate.images, &reference.images);
        if !images.is_empty() {
            evidence.push(EvidenceItem::observed(
                EvidenceKind::Images,
                &self.reference_url,
                fake_url,
                format!("The page uses {} images taken from the official site.", images.len()),
                Some(images.join(", ")),
            ));
        }

        if !candidate.structured_data.is_empty() && !reference.structured_data.is_empty() {
            let structured =
                structured_data_similarity(&candidate.structured_data, &reference.structured_data);
            if structured > self.structured_data_threshold {
                evidence.push(EvidenceItem::scored(
                    EvidenceKind::StructuredData,
                    &self.reference_url,
                    fake_url,
                    "The page carries JSON-LD structured data close to the official site's.",
                    structured,
                ));
            }
        }

        debug!(url = fake_url, items = evidence.len(), "similarity compared");
        evidence
    }
}
