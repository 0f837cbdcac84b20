use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use scamscan::app::Orchestrator;
use scamscan::app::config::ScanConfig;
use scamscan::app::error::{FetchError, ScanError, ScreenshotError};
use scamscan::app::fetch::{Fetcher, RetryPolicy, RetryingFetcher};
use scamscan::app::screenshot::{ScreenshotPaths, Screenshotter};
use scamscan::app::types::{EvidenceKind, ScreenshotKind, TargetDomain};

const OFFICIAL: &str = r#"<html><head>
<title>Classy Clothes - Premium Ethnic Wear</title>
<meta name="description" content="Premium ethnic wear from Classy Clothes.">
</head><body>
<img src="https://official.test/images/eid-dress.jpg">
<p>Welcome to Classy Clothes Official store for premium ethnic wear and lawn suits</p>
</body></html>"#;

const FAKE_HOME: &str = r#"<html><head>
<title>Classy Clothes BD</title>
<meta name="description" content="Premium ethnic wear from Classy Clothes.">
</head><body>
<img src="/images/eid-dress.jpg">
<p>Welcome to Classy Clothes Official store for premium ethnic wear and lawn suits</p>
<p>নতুন কালেকশন ৳ 2,450</p>
</body></html>"#;

const FAKE_CHECKOUT: &str = r#"<html><head><title>Checkout</title></head><body>
<form><button>Proceed to Checkout</button></form>
<p>Cash on delivery only</p>
</body></html>"#;

const FAKE_PRODUCT: &str = r#"<html><head><title>Lawn Suit</title></head><body>
<div class="product"><span>Lawn three piece</span></div>
</body></html>"#;

/// Serves fixed bodies and records every requested URL.
#[derive(Default)]
struct SiteFetcher {
    pages: HashMap<String, String>,
    requested: Mutex<Vec<String>>,
}

impl SiteFetcher {
    fn with(mut self, url: &str, body: impl Into<String>) -> Self {
        self.pages.insert(url.to_string(), body.into());
        self
    }

    fn requested(&self) -> Vec<String> {
        self.requested.lock().unwrap().clone()
    }
}

#[async_trait]
impl Fetcher for SiteFetcher {
    async fn get(&self, url: &str) -> Result<String, FetchError> {
        self.requested.lock().unwrap().push(url.to_string());
        self.pages
            .get(url)
            .cloned()
            .ok_or_else(|| FetchError::ServerStatus {
                url: url.to_string(),
                status: 503,
            })
    }
}

#[derive(Default)]
struct RecordingScreenshotter {
    captured: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl Screenshotter for RecordingScreenshotter {
    async fn capture(&self, url: &str, file_name: &str) -> Result<ScreenshotPaths, ScreenshotError> {
        self.captured
            .lock()
            .unwrap()
            .push((url.to_string(), file_name.to_string()));
        Ok(ScreenshotPaths {
            full: format!("/images/scam-evidence/{file_name}"),
            thumbnail: format!("/images/scam-evidence/thumb-{file_name}"),
        })
    }
}

fn urlset(urls: &[String]) -> String {
    let body: String = urls
        .iter()
        .map(|u| format!("<url><loc>{u}</loc></url>"))
        .collect();
    format!(r#"<urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">{body}</urlset>"#)
}

fn index(children: &[String]) -> String {
    let body: String = children
        .iter()
        .map(|u| format!("<sitemap><loc>{u}</loc></sitemap>"))
        .collect();
    format!(r#"<sitemapindex xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">{body}</sitemapindex>"#)
}

fn config(root: &Path, targets: Vec<TargetDomain>) -> ScanConfig {
    let mut config = ScanConfig::default();
    config.reference.url = "https://official.test".to_string();
    config.targets = targets;
    config.output.data_dir = root.join("data/scams");
    config.output.evidence_dir = root.join("public/images/scam-evidence");
    config.output.scam_sitemap = root.join("public/scam-sitemap.xml");
    config.output.main_sitemap = root.join("public/sitemap.xml");
    config
}

fn orchestrator(
    config: ScanConfig,
    fetcher: Arc<SiteFetcher>,
    screenshotter: Arc<RecordingScreenshotter>,
) -> Orchestrator {
    let policy = RetryPolicy {
        max_attempts: 1,
        base_delay: Duration::ZERO,
        max_jitter: Duration::ZERO,
    };
    Orchestrator::with_fetcher(config, RetryingFetcher::new(fetcher, policy), screenshotter)
}

/// A storefront whose sitemap index lists four children with two products each.
fn storefront(host: &str) -> SiteFetcher {
    let children: Vec<String> = (1..=4)
        .map(|i| format!("https://{host}/sitemap-{i}.xml"))
        .collect();
    let mut fetcher = SiteFetcher::default()
        .with("https://official.test", OFFICIAL)
        .with(&format!("https://{host}/"), FAKE_HOME)
        .with(&format!("https://{host}/checkout/"), FAKE_CHECKOUT)
        .with(&format!("https://{host}/sitemap.xml"), index(&children));
    for (i, child) in children.iter().enumerate() {
        let products: Vec<String> = (1..=2)
            .map(|j| format!("https://{host}/product/p{}-{j}/", i + 1))
            .collect();
        for product in &products {
            fetcher = fetcher.with(product, FAKE_PRODUCT);
        }
        fetcher = fetcher.with(child, urlset(&products));
    }
    fetcher
}

#[tokio::test]
async fn full_scan_persists_record_screenshots_and_sitemap() {
    let dir = tempfile::tempdir().unwrap();
    let target = TargetDomain::new("fake.test", "Fake.test")
        .with_sitemaps(["https://fake.test/sitemap.xml"]);
    let fetcher = Arc::new(storefront("fake.test"));
    let screenshots = Arc::new(RecordingScreenshotter::default());
    let config = config(dir.path(), vec![target]);
    let scam_sitemap = config.output.scam_sitemap.clone();

    let orchestrator = orchestrator(config, Arc::clone(&fetcher), Arc::clone(&screenshots));
    let records = orchestrator.run().await.unwrap();

    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.slug, "fake-test");
    assert_eq!(record.url, "https://fake.test");

    // Homepage, checkout, then two products from each of the first three children.
    let analyzed: Vec<&str> = record
        .evidence
        .analyses
        .iter()
        .map(|a| a.url.as_str())
        .collect();
    assert_eq!(analyzed.len(), 8);
    assert_eq!(analyzed[0], "https://fake.test/");
    assert_eq!(analyzed[1], "https://fake.test/checkout/");
    assert!(analyzed.iter().all(|url| !url.contains("/p4-")));
    assert!(!fetcher
        .requested()
        .contains(&"https://fake.test/sitemap-4.xml".to_string()));

    let home = &record.evidence.analyses[0];
    let kinds: Vec<EvidenceKind> = home.evidence.iter().map(|e| e.kind).collect();
    assert!(kinds.contains(&EvidenceKind::Title));
    assert!(kinds.contains(&EvidenceKind::MetaDescription));
    assert!(kinds.contains(&EvidenceKind::Images));

    let shots = &record.evidence.screenshots;
    assert_eq!(shots[0].kind, ScreenshotKind::Homepage);
    assert_eq!(shots[0].full_image_path, "/images/scam-evidence/fake-test-homepage.jpg");
    assert_eq!(shots[1].kind, ScreenshotKind::Checkout);
    assert_eq!(shots[1].thumbnail_path, "/images/scam-evidence/thumb-fake-test-checkout.jpg");
    assert_eq!(shots.len(), 8);
    assert!(shots[2..].iter().all(|s| s.kind == ScreenshotKind::Page));
    assert_eq!(screenshots.captured.lock().unwrap().len(), 8);

    assert!(record
        .warning_details
        .iter()
        .any(|w| w.contains("Bengali-speaking")));
    let unique: std::collections::HashSet<&String> = record.warning_details.iter().collect();
    assert_eq!(unique.len(), record.warning_details.len());

    let stored = orchestrator.store().load("fake-test").unwrap();
    assert_eq!(stored.detected_date, record.detected_date);
    assert_eq!(stored.evidence.screenshots, record.evidence.screenshots);
    let xml = fs::read_to_string(scam_sitemap).unwrap();
    assert!(xml.contains("<loc>https://official.test/scam/fake-test</loc>"));
}

#[tokio::test]
async fn failing_domain_does_not_stop_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let targets = vec![
        TargetDomain::new("a.test", "A").with_sitemaps(["https://a.test/sitemap.xml"]),
        TargetDomain::new("b.test", "B").with_sitemaps(["https://b.test/sitemap.xml"]),
    ];
    let config = config(dir.path(), targets);
    // A directory where the record file belongs makes persisting fail.
    fs::create_dir_all(config.output.data_dir.join("a-test.json")).unwrap();

    let fetcher = SiteFetcher::default()
        .with("https://official.test", OFFICIAL)
        .with("https://a.test/", FAKE_HOME)
        .with("https://b.test/", FAKE_HOME);
    let orchestrator = orchestrator(
        config,
        Arc::new(fetcher),
        Arc::new(RecordingScreenshotter::default()),
    );

    let records = orchestrator.run().await.unwrap();

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].slug, "b-test");
    assert!(orchestrator.store().record_path("b-test").is_file());
}

#[tokio::test]
async fn malformed_sitemap_leaves_homepage_and_checkout() {
    let dir = tempfile::tempdir().unwrap();
    let target =
        TargetDomain::new("fake.test", "Fake").with_sitemaps(["https://fake.test/sitemap.xml"]);
    let fetcher = SiteFetcher::default()
        .with("https://official.test", OFFICIAL)
        .with("https://fake.test/", FAKE_HOME)
        .with("https://fake.test/checkout/", FAKE_CHECKOUT)
        .with("https://fake.test/sitemap.xml", "<urlset><url><loc>https://fake.test/x");
    let orchestrator = orchestrator(
        config(dir.path(), vec![target]),
        Arc::new(fetcher),
        Arc::new(RecordingScreenshotter::default()),
    );

    let records = orchestrator.run().await.unwrap();

    let analyzed: Vec<&str> = records[0]
        .evidence
        .analyses
        .iter()
        .map(|a| a.url.as_str())
        .collect();
    assert_eq!(analyzed, vec!["https://fake.test/", "https://fake.test/checkout/"]);
}

#[tokio::test]
async fn unreachable_domain_still_gets_a_record() {
    let dir = tempfile::tempdir().unwrap();
    let target = TargetDomain::new("gone.test", "Gone");
    let fetcher = SiteFetcher::default().with("https://official.test", OFFICIAL);
    let screenshots = Arc::new(RecordingScreenshotter::default());
    let orchestrator = orchestrator(
        config(dir.path(), vec![target]),
        Arc::new(fetcher),
        Arc::clone(&screenshots),
    );

    let records = orchestrator.run().await.unwrap();

    let record = &records[0];
    assert!(record.evidence.analyses.is_empty());
    assert_eq!(record.warning_details.len(), 5);
    // The homepage is captured even when it could not be fetched.
    assert_eq!(
        *screenshots.captured.lock().unwrap(),
        vec![("https://gone.test/".to_string(), "gone-test-homepage.jpg".to_string())]
    );
}

#[tokio::test]
async fn second_run_replaces_the_record_and_writes_the_report() {
    let dir = tempfile::tempdir().unwrap();
    let target = TargetDomain::new("fake.test", "Fake.test")
        .with_sitemaps(["https://fake.test/sitemap.xml"]);
    let mut config = config(dir.path(), vec![target]);
    let report = dir.path().join("reports/scan.csv");
    config.output.report = Some(report.clone());

    let fetcher = Arc::new(storefront("fake.test"));
    let screenshots = Arc::new(RecordingScreenshotter::default());
    let orchestrator = orchestrator(config, fetcher, screenshots);

    orchestrator.run().await.unwrap();
    let records = orchestrator.run().await.unwrap();

    assert_eq!(orchestrator.store().list_slugs().unwrap(), vec!["fake-test".to_string()]);
    let stored = orchestrator.store().load("fake-test").unwrap();
    assert_eq!(stored.detected_date, records[0].detected_date);
    assert_eq!(stored.evidence.analyses.len(), 8);
    assert_eq!(stored.evidence.screenshots.len(), 8);
    assert_eq!(stored.evidence.links.len(), 8);
    let csv = fs::read_to_string(report).unwrap();
    assert_eq!(csv.lines().count(), 1 + records[0].evidence.analyses.len());
}

#[tokio::test]
async fn unwritable_data_dir_aborts_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), vec![TargetDomain::new("fake.test", "Fake")]);
    fs::create_dir_all(dir.path().join("data")).unwrap();
    fs::write(&config.output.data_dir, "not a directory").unwrap();

    let orchestrator = orchestrator(
        config,
        Arc::new(SiteFetcher::default()),
        Arc::new(RecordingScreenshotter::default()),
    );

    let err = orchestrator.run().await.unwrap_err();
    assert!(matches!(err, ScanError::Store(_)));
}

#[tokio::test]
async fn inspect_reports_copied_content() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = SiteFetcher::default()
        .with("https://official.test", OFFICIAL)
        .with("https://fake.test/", FAKE_HOME);
    let orchestrator = orchestrator(
        config(dir.path(), Vec::new()),
        Arc::new(fetcher),
        Arc::new(RecordingScreenshotter::default()),
    );

    let inspection = orchestrator.inspect("https://fake.test/").await;

    assert!(inspection.analysis.indicators.has_bengali_text);
    assert!(inspection
        .evidence
        .iter()
        .any(|e| e.kind == EvidenceKind::Content));
}
