//! Study manifest: per-file content hashes recorded when a study is drained

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::hash;
use crate::key::StudyKey;

pub const MANIFEST_FILE: &str = "manifest.json";

pub const CURRENT_FORMAT_VERSION: u32 = 1;

/// Manifest stored alongside an archived study.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudyManifest {
    pub format_version: u32,
    pub key: StudyKey,
    /// Series directory → instance count. Instances stored directly under the
    /// study are counted under `""`.
    pub series: BTreeMap<String, usize>,
    /// Relative path → full blake3 hex hash.
    pub file_hashes: BTreeMap<String, String>,
    /// Combined hash over all files in path order.
    pub content_hash: String,
    pub drained_at: chrono::DateTime<chrono::Utc>,
    /// Processor that handled the study.
    pub processor: String,
}

/// Files of a study tree, sorted by path, excluding the manifest itself and
/// hidden bookkeeping files.
pub fn study_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let pattern = dir.join("**/*");
    let pattern_str = pattern.to_string_lossy();

    let mut files: Vec<_> = glob::glob(&pattern_str)
        .context("invalid glob pattern")?
        .filter_map(|e| e.ok())
        .filter(|p| {
            p.is_file()
                && p.file_name().is_none_or(|n| {
                    n != MANIFEST_FILE && !n.to_string_lossy().starts_with('.')
                })
        })
        .collect();

    // Sort for deterministic hash order
    files.sort();
    Ok(files)
}

/// Instance count per series directory.
pub fn series_counts(dir: &Path, files: &[PathBuf]) -> BTreeMap<String, usize> {
    let mut series = BTreeMap::new();
    for path in files {
        let rel = path.strip_prefix(dir).unwrap_or(path);
        let name = match rel.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_string_lossy().into_owned(),
            _ => String::new(),
        };
        *series.entry(name).or_insert(0) += 1;
    }
    series
}

impl StudyManifest {
    /// Hash every file of the study at `dir`.
    pub fn compute(key: &StudyKey, dir: &Path, processor: &str) -> Result<Self> {
        let files = study_files(dir)?;

        let mut file_hashes = BTreeMap::new();
        let mut all_hashes = Vec::with_capacity(files.len());
        for path in &files {
            let h = hash::hash_file(path)
                .with_context(|| format!("failed to hash {}", path.display()))?;
            let rel = path
                .strip_prefix(dir)
                .unwrap_or(path)
                .to_string_lossy()
                .into_owned();
            file_hashes.insert(rel, h.to_hex().to_string());
            all_hashes.push(h);
        }

        let content_hash = if all_hashes.is_empty() {
            hash::hash_bytes(b"empty")
        } else {
            hash::combine_hashes(&all_hashes)
        };

        Ok(Self {
            format_version: CURRENT_FORMAT_VERSION,
            key: key.clone(),
            series: series_counts(dir, &files),
            file_hashes,
            content_hash: content_hash.to_hex().to_string(),
            drained_at: chrono::Utc::now(),
            processor: processor.to_string(),
        })
    }

    pub fn instance_count(&self) -> usize {
        self.file_hashes.len()
    }

    /// Write manifest to dir/manifest.json
    pub fn write_to(&self, dir: &Path) -> Result<()> {
        let path = dir.join(MANIFEST_FILE);
        let json = serde_json::to_string_pretty(self).context("failed to serialize manifest")?;
        std::fs::write(&path, json)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    /// Read manifest from dir/manifest.json
    pub fn read_from(dir: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST_FILE);
        let json = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let manifest: Self =
            serde_json::from_str(&json).with_context(|| "failed to parse manifest.json")?;
        Ok(manifest)
    }
}
