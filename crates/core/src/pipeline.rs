//! Offline stage runners: clean, chunk, embed. Each stage reads the
//! previous stage's shards, writes its own artifact plus a manifest, and
//! contains per-record failures so a bad page never sinks a whole file.

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::Utc;
use tracing::{info, warn};

use crate::chunker::{chunk_record, make_doc_id, CHUNKING_VERSION};
use crate::cleaner::{clean_record, CLEANING_VERSION};
use crate::embedder::Embedder;
use crate::error::PipelineError;
use crate::index::SqliteVectorIndex;
use crate::manifest::{
    write_manifest, ChunkFileStats, ChunkManifest, ChunkTotals, CleanFileStats, CleanManifest,
    CleanTotals, EmbedManifest,
};
use crate::models::{ChunkRecord, CleanedRecord, PageRecord};
use crate::shard::{discover_shards, read_shard, write_shard};
use crate::splitter::SemanticSplitter;

pub const EMBED_VERSION: &str = "v1.0";

/// Chunks per embedding request, sized for provider payload limits.
pub const EMBED_BATCH_SIZE: usize = 50;

/// Cleans every raw shard into a parallel cleaned shard.
pub fn run_clean_stage(
    raw_dir: &Path,
    clean_dir: &Path,
    manifest_path: &Path,
) -> Result<CleanManifest, PipelineError> {
    let shards = discover_shards(raw_dir)?;
    fs::create_dir_all(clean_dir)?;

    let mut files = Vec::with_capacity(shards.len());
    let mut totals = CleanTotals::default();

    for source in &shards {
        let contents = read_shard::<PageRecord>(source)?;
        let read_records = contents.records.len() + contents.skipped_lines;

        let mut cleaned: Vec<CleanedRecord> = Vec::with_capacity(contents.records.len());
        let mut raw_chars = 0usize;
        let mut clean_chars = 0usize;
        for record in &contents.records {
            raw_chars += record.markdown.chars().count();
            if let Some(survivor) = clean_record(record) {
                clean_chars += survivor.clean_char_count;
                cleaned.push(survivor);
            }
        }

        let file_name = source
            .file_name()
            .ok_or_else(|| PipelineError::MissingInput(format!("shard has no file name: {}", source.display())))?;
        let output = clean_dir.join(file_name);
        write_shard(&output, &cleaned)?;
        info!(
            source = %source.display(),
            read = read_records,
            written = cleaned.len(),
            "cleaned shard"
        );

        totals.read_records += read_records;
        totals.written_records += cleaned.len();
        totals.raw_chars += raw_chars;
        totals.clean_chars += clean_chars;
        files.push(CleanFileStats {
            source: source.display().to_string(),
            output: output.display().to_string(),
            read_records,
            written_records: cleaned.len(),
            raw_chars,
            clean_chars,
        });
    }

    let manifest = CleanManifest {
        generated_at: Utc::now(),
        cleaning_version: CLEANING_VERSION.to_string(),
        files,
        totals,
    };
    write_manifest(manifest_path, &manifest)?;
    Ok(manifest)
}

/// Persisted set of processed doc ids, so an interrupted chunk run picks up
/// where it stopped instead of re-paying the embedding calls.
pub struct ResumeLog {
    path: PathBuf,
    processed: HashSet<String>,
}

impl ResumeLog {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, PipelineError> {
        let path = path.into();
        let processed = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            serde_json::from_str::<Vec<String>>(&raw)?.into_iter().collect()
        } else {
            HashSet::new()
        };
        Ok(Self { path, processed })
    }

    pub fn contains(&self, doc_id: &str) -> bool {
        self.processed.contains(doc_id)
    }

    pub fn mark(&mut self, doc_id: &str) -> Result<(), PipelineError> {
        if !self.processed.insert(doc_id.to_string()) {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let ids: Vec<&String> = self.processed.iter().collect();
        fs::write(&self.path, serde_json::to_string(&ids)?)?;
        Ok(())
    }
}

/// Splits every cleaned shard into one chunk file. Failing records are
/// logged and skipped; already-processed documents are skipped via the
/// resume log.
pub async fn run_chunk_stage<S>(
    clean_dir: &Path,
    chunks_path: &Path,
    resume_path: &Path,
    manifest_path: &Path,
    splitter: &S,
) -> Result<ChunkManifest, PipelineError>
where
    S: SemanticSplitter + ?Sized,
{
    let shards = discover_shards(clean_dir)?;
    if let Some(parent) = chunks_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let mut resume = ResumeLog::load(resume_path)?;
    let fresh_run = resume.processed.is_empty();
    let mut out = OpenOptions::new()
        .create(true)
        .append(!fresh_run)
        .truncate(fresh_run)
        .write(true)
        .open(chunks_path)?;

    let started = Instant::now();
    let mut files = Vec::with_capacity(shards.len());
    let mut totals_records = 0usize;
    let mut chunk_sizes: Vec<usize> = Vec::new();
    let mut total_chunks = 0usize;

    for source in &shards {
        let contents = read_shard::<CleanedRecord>(source)?;
        let mut file_records = 0usize;
        let mut file_chunks = 0usize;

        for record in contents.records {
            file_records += 1;
            let doc_id = make_doc_id(record.page_type, &record.url);
            if resume.contains(&doc_id) {
                continue;
            }

            let chunks = match chunk_record(&record, splitter).await {
                Ok(chunks) => chunks,
                Err(error) => {
                    warn!(url = %record.url, %error, "skipping record that failed to chunk");
                    continue;
                }
            };

            for chunk in &chunks {
                serde_json::to_writer(&mut out, chunk)?;
                out.write_all(b"\n")?;
                chunk_sizes.push(chunk.char_count);
                file_chunks += 1;
            }
            out.flush()?;
            resume.mark(&doc_id)?;
        }

        info!(
            source = %source.display(),
            records = file_records,
            chunks = file_chunks,
            "chunked shard"
        );
        totals_records += file_records;
        total_chunks += file_chunks;
        files.push(ChunkFileStats {
            source: source.display().to_string(),
            records: file_records,
            chunks: file_chunks,
        });
    }

    let manifest = ChunkManifest {
        generated_at: Utc::now(),
        chunking_version: CHUNKING_VERSION.to_string(),
        files,
        totals: ChunkTotals {
            records: totals_records,
            chunks: total_chunks,
            avg_chunk_chars: if chunk_sizes.is_empty() {
                0.0
            } else {
                chunk_sizes.iter().sum::<usize>() as f64 / chunk_sizes.len() as f64
            },
            min_chunk_chars: chunk_sizes.iter().copied().min().unwrap_or(0),
            max_chunk_chars: chunk_sizes.iter().copied().max().unwrap_or(0),
            elapsed_seconds: started.elapsed().as_secs_f64(),
        },
    };
    write_manifest(manifest_path, &manifest)?;
    Ok(manifest)
}

/// Embeds the chunk file in fixed batches into the on-disk vector index and
/// writes the embed manifest.
pub async fn run_embed_stage<E>(
    chunks_path: &Path,
    index_path: &Path,
    manifest_path: &Path,
    embedder: &E,
) -> Result<EmbedManifest, PipelineError>
where
    E: Embedder,
{
    if !chunks_path.exists() {
        return Err(PipelineError::MissingInput(format!(
            "chunk file not found: {} (run the chunk stage first)",
            chunks_path.display()
        )));
    }

    let contents = read_shard::<ChunkRecord>(chunks_path)?;
    if contents.records.is_empty() {
        return Err(PipelineError::MissingInput(format!(
            "chunk file is empty: {}",
            chunks_path.display()
        )));
    }

    if let Some(parent) = index_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let started = Instant::now();
    let index = SqliteVectorIndex::open(index_path).await?;

    let total = contents.records.len();
    let batches = total.div_ceil(EMBED_BATCH_SIZE);
    for (number, batch) in contents.records.chunks(EMBED_BATCH_SIZE).enumerate() {
        let texts: Vec<String> = batch.iter().map(|chunk| chunk.text.clone()).collect();
        let embeddings = embedder.embed_batch(&texts).await?;
        index
            .append_batch(batch.iter().cloned().zip(embeddings).collect())
            .await?;
        info!(batch = number + 1, batches, "embedded batch");
    }

    let mut languages = std::collections::BTreeMap::new();
    let mut page_types = std::collections::BTreeMap::new();
    for chunk in &contents.records {
        *languages.entry(chunk.language.as_str().to_string()).or_insert(0u64) += 1;
        *page_types.entry(chunk.page_type.as_str().to_string()).or_insert(0u64) += 1;
    }

    let manifest = EmbedManifest {
        generated_at: Utc::now(),
        embed_version: EMBED_VERSION.to_string(),
        embedding_model: embedder.model_id().to_string(),
        total_chunks_indexed: total,
        languages,
        page_types,
        index_path: index_path.display().to_string(),
        source_chunks: chunks_path.display().to_string(),
        elapsed_seconds: started.elapsed().as_secs_f64(),
    };
    write_manifest(manifest_path, &manifest)?;
    Ok(manifest)
}
