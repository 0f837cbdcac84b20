use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use clap::Parser;
use tracing::{error, info, warn};

use super::config::ScanConfig;
use super::error::{ScanError, StoreError};
use super::fetch::{Fetcher, HttpFetcher, RetryPolicy, RetryingFetcher};
use super::logging;
use super::record::RecordBuilder;
use super::report::CsvReport;
use super::screenshot::{DisabledScreenshotter, ManagedDriver, Screenshotter, WebDriverScreenshotter};
use super::store::EvidenceStore;
use super::types::{Cli, Inspection, RunSummary, ScamRecord};

/// Drives one scan: every configured target, then the warning sitemap and the optional report.
pub struct Orchestrator {
    config: ScanConfig,
    store: EvidenceStore,
    builder: RecordBuilder,
}

impl Orchestrator {
    pub fn new(
        config: ScanConfig,
        fetcher: Arc<dyn Fetcher>,
        screenshotter: Arc<dyn Screenshotter>,
    ) -> Self {
        let retrying = RetryingFetcher::new(fetcher, RetryPolicy::from(&config.fetch));
        Self::with_fetcher(config, retrying, screenshotter)
    }

    pub fn with_fetcher(
        config: ScanConfig,
        fetcher: RetryingFetcher,
        screenshotter: Arc<dyn Screenshotter>,
    ) -> Self {
        let store = EvidenceStore::from_output(&config.output);
        let builder = RecordBuilder::new(
            fetcher,
            screenshotter,
            store.clone(),
            config.reference.clone(),
            config.limits.clone(),
        );
        Self {
            config,
            store,
            builder,
        }
    }

    pub fn store(&self) -> &EvidenceStore {
        &self.store
    }

    /// Scans every target in order. A failing domain is logged and skipped; only a
    /// store that cannot create its directories aborts the run.
    pub async fn run(&self) -> Result<Vec<ScamRecord>, ScanError> {
        let started_at = Utc::now();
        self.store.ensure_dirs()?;

        let reference_url = self.builder.engine().reference_url().to_string();
        let reference = self.builder.analyzer().analyze(&reference_url).await;
        if reference.is_blank() {
            warn!(url = %reference_url, "reference homepage unavailable; only brand and indicator checks apply");
        }

        let mut records = Vec::with_capacity(self.config.targets.len());
        let mut domains_failed = 0;
        for target in &self.config.targets {
            match self.builder.build_and_persist(target, &reference).await {
                Ok(record) => {
                    info!(
                        slug = %record.slug,
                        pages = record.evidence.analyses.len(),
                        screenshots = record.evidence.screenshots.len(),
                        "domain scanned"
                    );
                    records.push(record);
                }
                Err(e) => {
                    domains_failed += 1;
                    error!(domain = %target.domain, error = %e, "domain scan failed");
                }
            }
        }

        let output = &self.config.output;
        let today = Utc::now().format("%Y-%m-%d").to_string();
        if let Err(e) = self.store.write_warning_sitemap(
            &self.config.reference.url,
            &output.scam_sitemap,
            &output.main_sitemap,
            &today,
        ) {
            warn!(path = %output.scam_sitemap.display(), error = %e, "warning sitemap not written");
        }

        if let Some(path) = &output.report {
            match write_report(path, &records) {
                Ok(rows) => info!(path = %path.display(), rows, "report written"),
                Err(e) => warn!(path = %path.display(), error = %e, "report not written"),
            }
        }

        let summary = RunSummary {
            records_written: records.len(),
            domains_failed,
            started_at: started_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            finished_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        };
        info!(
            records_written = summary.records_written,
            domains_failed = summary.domains_failed,
            started_at = %summary.started_at,
            finished_at = %summary.finished_at,
            "scan finished"
        );
        Ok(records)
    }

    pub async fn inspect(&self, url: &str) -> Inspection {
        self.builder.engine().inspect(self.builder.analyzer(), url).await
    }
}

fn write_report(path: &std::path::Path, records: &[ScamRecord]) -> Result<usize, StoreError> {
    let mut report = CsvReport::create(path)?;
    for record in records {
        report.write_record(record)?;
    }
    report.finish()
}

async fn prepare_screenshotter(
    config: &ScanConfig,
) -> (Arc<dyn Screenshotter>, Option<ManagedDriver>) {
    if !config.screenshots.enabled {
        info!("screenshots disabled");
        return (Arc::new(DisabledScreenshotter), None);
    }

    let driver = match ManagedDriver::ensure(&config.screenshots).await {
        Ok(driver) => driver,
        Err(e) => {
            warn!(error = %e, "webdriver autostart failed");
            None
        }
    };
    let screenshotter: Arc<dyn Screenshotter> =
        match WebDriverScreenshotter::new(&config.screenshots, &config.output.evidence_dir) {
            Ok(screenshotter) => Arc::new(screenshotter),
            Err(e) => {
                warn!(error = %e, "screenshots unavailable for this run");
                Arc::new(DisabledScreenshotter)
            }
        };
    (screenshotter, driver)
}

pub async fn run() -> Result<(), ScanError> {
    let cli = Cli::parse();
    let mut config = ScanConfig::resolve(cli.config.as_deref())?;
    config.apply_cli(&cli);
    config.validate()?;
    logging::init(&config.logging);

    let fetcher: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new(&config.fetch)?);

    if let Some(url) = cli.inspect.as_deref() {
        let orchestrator = Orchestrator::new(config, fetcher, Arc::new(DisabledScreenshotter));
        let inspection = orchestrator.inspect(url).await;
        let json = serde_json::to_string_pretty(&inspection).map_err(StoreError::from)?;
        println!("{json}");
        return Ok(());
    }

    let (screenshotter, driver) = prepare_screenshotter(&config).await;
    let orchestrator = Orchestrator::new(config, fetcher, screenshotter);
    let result = orchestrator.run().await;
    if let Some(driver) = driver {
        driver.stop().await;
    }

    let records = result?;
    eprintln!("scamscan: {} record(s) written", records.len());
    Ok(())
}
