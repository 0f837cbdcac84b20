use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::config::OutputPaths;
use super::error::StoreError;
use super::sitemap::{link_sitemap_index, render_warning_sitemap};
use super::types::ScamRecord;

#[derive(Debug, Clone)]
pub struct EvidenceStore {
    data_dir: PathBuf,
    evidence_dir: PathBuf,
}

impl EvidenceStore {
    pub fn new(data_dir: impl Into<PathBuf>, evidence_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            evidence_dir: evidence_dir.into(),
        }
    }

    pub fn from_output(output: &OutputPaths) -> Self {
        Self::new(&output.data_dir, &output.evidence_dir)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn evidence_dir(&self) -> &Path {
        &self.evidence_dir
    }

    pub fn ensure_dirs(&self) -> Result<(), StoreError> {
        for dir in [&self.data_dir, &self.evidence_dir] {
            fs::create_dir_all(dir).map_err(|source| StoreError::Io {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(())
    }

    pub fn record_path(&self, slug: &str) -> PathBuf {
        self.data_dir.join(format!("{slug}.json"))
    }

    /// Writes `record` as pretty JSON, replacing any earlier record for the same slug.
    pub fn persist(&self, record: &ScamRecord) -> Result<PathBuf, StoreError> {
        let path = self.record_path(&record.slug);
        let mut body = serde_json::to_vec_pretty(record)?;
        body.push(b'\n');
        write_atomic(&path, &body)?;
        info!(slug = %record.slug, path = %path.display(), "record persisted");
        Ok(path)
    }

    pub fn load(&self, slug: &str) -> Result<ScamRecord, StoreError> {
        let path = self.record_path(slug);
        let content = fs::read_to_string(&path).map_err(|source| StoreError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Slugs of every persisted record, sorted.
    pub fn list_slugs(&self) -> Result<Vec<String>, StoreError> {
        let entries = fs::read_dir(&self.data_dir).map_err(|source| StoreError::Io {
            path: self.data_dir.clone(),
            source,
        })?;

        let mut slugs = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| StoreError::Io {
                path: self.data_dir.clone(),
                source,
            })?;
            let path = entry.path();
            if !path.is_file() || path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if !stem.starts_with('.') {
                    slugs.push(stem.to_string());
                }
            }
        }
        slugs.sort();
        slugs.dedup();
        Ok(slugs)
    }

    /// Regenerates the warning sitemap from every persisted slug and links it into
    /// `main_sitemap` when that file is a sitemap index.
    pub fn write_warning_sitemap(
        &self,
        site_url: &str,
        out_path: &Path,
        main_sitemap: &Path,
        today: &str,
    ) -> Result<usize, StoreError> {
        let slugs = self.list_slugs()?;
        let xml = render_warning_sitemap(site_url, &slugs, today)?;
        if let Some(parent) = out_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        write_atomic(out_path, xml.as_bytes())?;
        info!(path = %out_path.display(), records = slugs.len(), "warning sitemap written");

        if main_sitemap.is_file() {
            let main_xml = fs::read_to_string(main_sitemap).map_err(|source| StoreError::Io {
                path: main_sitemap.to_path_buf(),
                source,
            })?;
            let file_name = out_path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("scam-sitemap.xml");
            let scam_url = format!("{}/{file_name}", site_url.trim_end_matches('/'));
            match link_sitemap_index(&main_xml, &scam_url, today) {
                Some(updated) => {
                    write_atomic(main_sitemap, updated.as_bytes())?;
                    info!(path = %main_sitemap.display(), "sitemap index linked");
                }
                None => debug!(path = %main_sitemap.display(), "sitemap index unchanged"),
            }
        }
        Ok(slugs.len())
    }
}

/// Write to a sibling temp file, then rename over the target.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{file_name}.tmp"));

    fs::write(&tmp, bytes).map_err(|source| StoreError::Io {
        path: tmp.clone(),
        source,
    })?;
    fs::rename(&tmp, path).map_err(|source| {
        let _ = fs::remove_file(&tmp);
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    })
}
