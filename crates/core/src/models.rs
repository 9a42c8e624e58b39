use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    En,
    Ar,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::En => "en",
            Language::Ar => "ar",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageType {
    Product,
    Category,
    PolicySupport,
    BrandCampaign,
    Other,
}

impl PageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PageType::Product => "product",
            PageType::Category => "category",
            PageType::PolicySupport => "policy_support",
            PageType::BrandCampaign => "brand_campaign",
            PageType::Other => "other",
        }
    }
}

/// One crawled page as written to a raw shard. Immutable once persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageRecord {
    pub url: String,
    pub title: String,
    pub language: Language,
    pub page_type: PageType,
    pub markdown: String,
    pub crawled_at: DateTime<Utc>,
    pub crawl_job_id: String,
}

/// A page after boilerplate removal. Records below the minimum text length
/// are dropped before they reach the cleaned shard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanedRecord {
    pub url: String,
    pub title: String,
    pub language: Language,
    pub page_type: PageType,
    pub text: String,
    pub crawled_at: DateTime<Utc>,
    pub crawl_job_id: String,
    pub cleaned_at: DateTime<Utc>,
    pub cleaning_version: String,
    pub raw_char_count: usize,
    pub clean_char_count: usize,
}

/// A contiguous span of one cleaned document, sized for embedding.
///
/// `chunk_index` values are contiguous from 0 within a `doc_id`;
/// concatenating chunks in index order covers the full cleaned text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub doc_id: String,
    pub chunk_id: String,
    pub chunk_index: usize,
    pub url: String,
    pub language: Language,
    pub page_type: PageType,
    pub source_title: String,
    pub crawled_at: DateTime<Utc>,
    pub text: String,
    pub char_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// A retrieval candidate: a stored chunk, its cosine similarity to the
/// query, and the stored embedding (kept for diversity re-ranking).
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub record: ChunkRecord,
    pub similarity: f32,
    pub embedding: Vec<f32>,
}

/// Full response for one answered question.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatAnswer {
    pub answer: String,
    pub citations: Vec<String>,
    pub language: Language,
    pub as_of: DateTime<Utc>,
    pub chunks_used: usize,
    pub session_id: String,
}

/// Trailing metadata delivered after the last token of a streamed answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerMetadata {
    pub citations: Vec<String>,
    pub language: Language,
    pub as_of: DateTime<Utc>,
    pub chunks_used: usize,
    pub session_id: String,
}

/// Snapshot of the serving index reported by the info endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexInfo {
    pub embedding_model: String,
    pub indexed_at: String,
    pub total_vectors: usize,
    pub languages: BTreeMap<String, u64>,
    pub page_types: BTreeMap<String, u64>,
    pub active_sessions: usize,
}
