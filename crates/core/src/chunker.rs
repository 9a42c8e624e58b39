//! Turns cleaned documents into ordered chunk records.

use sha2::{Digest, Sha256};

use crate::error::PipelineError;
use crate::models::{ChunkRecord, CleanedRecord, PageType};
use crate::splitter::SemanticSplitter;

pub const CHUNKING_VERSION: &str = "v1.0-semantic";

/// Documents below this length become a single chunk without splitting.
pub const MIN_DOC_CHARS: usize = 100;

/// Post-split floor: fragments below this are merged into their neighbour.
pub const MIN_CHUNK_CHARS: usize = 50;

/// Stable document id from page type plus a URL hash.
pub fn make_doc_id(page_type: PageType, url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("{}_{}", page_type.as_str(), &digest[..8])
}

/// Merges spans smaller than `min_chars` forward into the next span; a
/// trailing remainder attaches to the last emitted chunk.
pub fn merge_small_chunks(spans: Vec<String>, min_chars: usize) -> Vec<String> {
    let mut merged: Vec<String> = Vec::with_capacity(spans.len());
    let mut buffer = String::new();

    for span in spans {
        if buffer.is_empty() {
            buffer = span;
        } else {
            buffer.push_str("\n\n");
            buffer.push_str(&span);
        }

        if buffer.chars().count() >= min_chars {
            merged.push(std::mem::take(&mut buffer));
        }
    }

    if !buffer.is_empty() {
        match merged.last_mut() {
            Some(last) => {
                last.push_str("\n\n");
                last.push_str(&buffer);
            }
            None => merged.push(buffer),
        }
    }

    merged
}

/// Splits one cleaned record into ordered chunk records.
///
/// Short documents are not worth splitting and yield exactly one chunk.
pub async fn chunk_record<S>(
    record: &CleanedRecord,
    splitter: &S,
) -> Result<Vec<ChunkRecord>, PipelineError>
where
    S: SemanticSplitter + ?Sized,
{
    let doc_id = make_doc_id(record.page_type, &record.url);

    let texts = if record.text.chars().count() < MIN_DOC_CHARS {
        vec![record.text.clone()]
    } else {
        let spans = splitter.split(&record.text).await?;
        merge_small_chunks(spans, MIN_CHUNK_CHARS)
    };

    Ok(texts
        .into_iter()
        .enumerate()
        .map(|(index, text)| ChunkRecord {
            chunk_id: format!("{doc_id}_c{index}"),
            doc_id: doc_id.clone(),
            chunk_index: index,
            url: record.url.clone(),
            language: record.language,
            page_type: record.page_type,
            source_title: record.title.clone(),
            crawled_at: record.crawled_at,
            char_count: text.chars().count(),
            text,
        })
        .collect())
}
