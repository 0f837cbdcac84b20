use std::fs::File;
use std::path::{Path, PathBuf};

use super::error::StoreError;
use super::types::{EvidenceKind, PageSummary, ScamRecord};

const CSV_HEADERS: [&str; 15] = [
    "domain",
    "url",
    "page_type",
    "title",
    "description",
    "image_count",
    "link_count",
    "structured_data_count",
    "has_checkout",
    "has_payment_system",
    "has_bengali_text",
    "has_product_listings",
    "has_pricing",
    "has_brand_reference",
    "evidence",
];

pub struct CsvReport {
    writer: csv::Writer<File>,
    path: PathBuf,
    rows: usize,
}

impl CsvReport {
    pub fn create(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let file = File::create(path).map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut writer = csv::Writer::from_writer(file);
        writer.write_record(CSV_HEADERS)?;
        Ok(Self {
            writer,
            path: path.to_path_buf(),
            rows: 0,
        })
    }

    pub fn write_record(&mut self, record: &ScamRecord) -> Result<(), StoreError> {
        for page in &record.evidence.analyses {
            self.write_page(&record.slug, page)?;
        }
        Ok(())
    }

    fn write_page(&mut self, domain: &str, page: &PageSummary) -> Result<(), StoreError> {
        let flags = page.indicators;
        self.writer.write_record([
            domain.to_string(),
            page.url.clone(),
            page.page_type.label().to_string(),
            page.title.clone(),
            page.description.clone(),
            page.image_count.to_string(),
            page.link_count.to_string(),
            page.structured_data_count.to_string(),
            flags.has_checkout.to_string(),
            flags.has_payment_system.to_string(),
            flags.has_bengali_text.to_string(),
            flags.has_product_listings.to_string(),
            flags.has_pricing.to_string(),
            flags.has_brand_reference.to_string(),
            evidence_to_csv(
                &page
                    .evidence
                    .iter()
                    .map(|item| item.kind)
                    .collect::<Vec<_>>(),
            ),
        ])?;
        self.rows += 1;
        Ok(())
    }

    /// Flushes and returns the number of page rows written.
    pub fn finish(mut self) -> Result<usize, StoreError> {
        self.writer.flush().map_err(|source| StoreError::Io {
            path: self.path.clone(),
            source,
        })?;
        Ok(self.rows)
    }
}

fn evidence_to_csv(kinds: &[EvidenceKind]) -> String {
    kinds
        .iter()
        .map(|kind| kind.label())
        .collect::<Vec<_>>()
        .join("|")
}
