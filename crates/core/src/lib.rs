pub mod chat;
pub mod chunker;
pub mod cleaner;
pub mod embedder;
pub mod engine;
pub mod error;
pub mod index;
pub mod loader;
pub mod manifest;
pub mod models;
pub mod pipeline;
pub mod session;
pub mod shard;
pub mod splitter;

pub use chat::{ChatModel, OpenAiChatModel, PromptMessage, TokenStream, DEFAULT_CHAT_MODEL};
pub use chunker::{
    chunk_record, make_doc_id, merge_small_chunks, CHUNKING_VERSION, MIN_CHUNK_CHARS, MIN_DOC_CHARS,
};
pub use cleaner::{clean_markdown, clean_record, CLEANING_VERSION, MIN_CLEAN_CHARS};
pub use embedder::{Embedder, OpenAiEmbedder, DEFAULT_EMBEDDING_MODEL};
pub use engine::{
    detect_language, mmr_select, AnswerEvent, AnswerStream, QueryEngine, FETCH_K, MMR_LAMBDA,
    RETRIEVE_K,
};
pub use error::{PipelineError, ProviderError, QueryError};
pub use index::{ChunkRetriever, Facet, SqliteVectorIndex};
pub use loader::{
    default_scopes, language_from_url, page_type_from_url, run_crawl, CrawlClient, CrawlConfig,
    CrawlScope, RetryPolicy,
};
pub use manifest::{
    load_embed_manifest, write_manifest, ChunkManifest, CleanManifest, CrawlManifest, EmbedManifest,
};
pub use models::{
    AnswerMetadata, ChatAnswer, ChatMessage, ChatRole, ChunkRecord, CleanedRecord, IndexInfo,
    Language, PageRecord, PageType, ScoredChunk,
};
pub use pipeline::{
    run_chunk_stage, run_clean_stage, run_embed_stage, ResumeLog, EMBED_BATCH_SIZE, EMBED_VERSION,
};
pub use session::{InMemorySessionStore, SessionStore, MAX_HISTORY_TURNS};
pub use splitter::{EmbeddingSplitter, SemanticSplitter};
