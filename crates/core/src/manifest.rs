//! Write-once run summaries emitted by each pipeline stage.
//!
//! Manifests are observability artifacts: never read back by the pipeline
//! itself, except for the embed manifest which the serving API surfaces
//! through its info endpoint.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlManifest {
    pub generated_at: DateTime<Utc>,
    pub scopes: Vec<CrawlScopeOutcome>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlScopeOutcome {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crawl_id: Option<String>,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    pub saved_rows: Option<usize>,
    pub output_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanManifest {
    pub generated_at: DateTime<Utc>,
    pub cleaning_version: String,
    pub files: Vec<CleanFileStats>,
    pub totals: CleanTotals,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanFileStats {
    pub source: String,
    pub output: String,
    pub read_records: usize,
    pub written_records: usize,
    pub raw_chars: usize,
    pub clean_chars: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanTotals {
    pub read_records: usize,
    pub written_records: usize,
    pub raw_chars: usize,
    pub clean_chars: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkManifest {
    pub generated_at: DateTime<Utc>,
    pub chunking_version: String,
    pub files: Vec<ChunkFileStats>,
    pub totals: ChunkTotals,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkFileStats {
    pub source: String,
    pub records: usize,
    pub chunks: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkTotals {
    pub records: usize,
    pub chunks: usize,
    pub avg_chunk_chars: f64,
    pub min_chunk_chars: usize,
    pub max_chunk_chars: usize,
    pub elapsed_seconds: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedManifest {
    pub generated_at: DateTime<Utc>,
    pub embed_version: String,
    pub embedding_model: String,
    pub total_chunks_indexed: usize,
    pub languages: BTreeMap<String, u64>,
    pub page_types: BTreeMap<String, u64>,
    pub index_path: String,
    pub source_chunks: String,
    pub elapsed_seconds: f64,
}

pub fn write_manifest<T: Serialize>(path: &Path, manifest: &T) -> Result<(), PipelineError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let serialized = serde_json::to_string_pretty(manifest)?;
    fs::write(path, serialized)?;
    Ok(())
}

/// Loads the embed manifest when present; a missing manifest is not an
/// error, the serving API just reports unknown index metadata.
pub fn load_embed_manifest(path: &Path) -> Result<Option<EmbedManifest>, PipelineError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&raw)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn embed_manifest_round_trips_from_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("manifests/embed_manifest.json");

        let manifest = EmbedManifest {
            generated_at: Utc::now(),
            embed_version: "v1.0".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
            total_chunks_indexed: 42,
            languages: BTreeMap::from([("en".to_string(), 30), ("ar".to_string(), 12)]),
            page_types: BTreeMap::from([("product".to_string(), 42)]),
            index_path: "vectorstore/index.db".to_string(),
            source_chunks: "chunks/semantic_chunks.jsonl".to_string(),
            elapsed_seconds: 1.5,
        };
        write_manifest(&path, &manifest).unwrap();

        let loaded = load_embed_manifest(&path).unwrap().unwrap();
        assert_eq!(loaded.total_chunks_indexed, 42);
        assert_eq!(loaded.languages.get("ar"), Some(&12));
    }

    #[test]
    fn missing_embed_manifest_is_none() {
        let dir = tempdir().unwrap();
        let loaded = load_embed_manifest(&dir.path().join("absent.json")).unwrap();
        assert!(loaded.is_none());
    }
}
