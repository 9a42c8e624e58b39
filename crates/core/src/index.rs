//! On-disk vector index: chunk metadata plus embeddings in one SQLite file,
//! cosine KNN provided by the sqlite-vec extension.
//!
//! The indexer writes it offline; the query engine holds a read-only handle
//! for the process lifetime, so serve-time reads need no coordination.

use std::collections::BTreeMap;
use std::os::raw::c_char;
use std::path::Path;
use std::sync::Once;

use async_trait::async_trait;
use chrono::DateTime;
use tokio_rusqlite::{ffi, Connection};

use crate::error::{PipelineError, QueryError};
use crate::models::{ChunkRecord, Language, PageType, ScoredChunk};

/// Capability the query engine retrieves through.
#[async_trait]
pub trait ChunkRetriever: Send + Sync {
    /// Returns the `fetch_k` nearest chunks with similarities and stored
    /// vectors, most similar first.
    async fn nearest(&self, query: &[f32], fetch_k: usize) -> Result<Vec<ScoredChunk>, QueryError>;

    async fn total_vectors(&self) -> Result<usize, QueryError>;
}

#[derive(Clone)]
pub struct SqliteVectorIndex {
    conn: Connection,
}

impl SqliteVectorIndex {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        register_sqlite_vec()?;

        let conn = Connection::open(path.as_ref().to_path_buf())
            .await
            .map_err(|err| PipelineError::Storage(err.to_string()))?;

        conn.call(|conn| {
            conn.query_row("SELECT vec_version()", [], |row| row.get::<_, String>(0))
                .map_err(tokio_rusqlite::Error::Error)?;
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS chunks (
                    chunk_id TEXT PRIMARY KEY,
                    doc_id TEXT NOT NULL,
                    chunk_index INTEGER NOT NULL,
                    url TEXT NOT NULL,
                    language TEXT NOT NULL,
                    page_type TEXT NOT NULL,
                    source_title TEXT NOT NULL,
                    crawled_at TEXT NOT NULL,
                    char_count INTEGER NOT NULL,
                    text TEXT NOT NULL,
                    embedding BLOB NOT NULL
                );
                CREATE INDEX IF NOT EXISTS chunks_language ON chunks(language);
                CREATE INDEX IF NOT EXISTS chunks_page_type ON chunks(page_type);",
            )
            .map_err(tokio_rusqlite::Error::Error)?;
            Ok(())
        })
        .await
        .map_err(|err| PipelineError::Storage(err.to_string()))?;

        Ok(Self { conn })
    }

    /// Appends one batch of chunks with their embeddings, atomically.
    pub async fn append_batch(
        &self,
        chunks: Vec<(ChunkRecord, Vec<f32>)>,
    ) -> Result<(), PipelineError> {
        if chunks.is_empty() {
            return Ok(());
        }

        let rows: Vec<(ChunkRecord, String)> = chunks
            .into_iter()
            .map(|(record, embedding)| {
                let serialized = serde_json::to_string(&embedding)?;
                Ok((record, serialized))
            })
            .collect::<Result<_, serde_json::Error>>()?;

        self.conn
            .call(move |conn| {
                let tx = conn.transaction().map_err(tokio_rusqlite::Error::Error)?;
                {
                    let mut stmt = tx
                        .prepare(
                            "INSERT OR REPLACE INTO chunks (
                                chunk_id, doc_id, chunk_index, url, language, page_type,
                                source_title, crawled_at, char_count, text, embedding
                            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, vec_f32(?11))",
                        )
                        .map_err(tokio_rusqlite::Error::Error)?;

                    for (record, embedding_json) in rows {
                        stmt.execute(tokio_rusqlite::params![
                            record.chunk_id,
                            record.doc_id,
                            record.chunk_index as i64,
                            record.url,
                            record.language.as_str(),
                            record.page_type.as_str(),
                            record.source_title,
                            record.crawled_at.to_rfc3339(),
                            record.char_count as i64,
                            record.text,
                            embedding_json,
                        ])
                        .map_err(tokio_rusqlite::Error::Error)?;
                    }
                }
                tx.commit().map_err(tokio_rusqlite::Error::Error)?;
                Ok(())
            })
            .await
            .map_err(|err| PipelineError::Storage(err.to_string()))
    }

    pub async fn count(&self) -> Result<usize, PipelineError> {
        self.conn
            .call(|conn| {
                let count: i64 = conn
                    .query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))
                    .map_err(tokio_rusqlite::Error::Error)?;
                Ok(count as usize)
            })
            .await
            .map_err(|err| PipelineError::Storage(err.to_string()))
    }

    pub async fn facet_counts(&self, column: Facet) -> Result<BTreeMap<String, u64>, PipelineError> {
        self.conn
            .call(move |conn| {
                let sql = match column {
                    Facet::Language => "SELECT language, COUNT(*) FROM chunks GROUP BY language",
                    Facet::PageType => "SELECT page_type, COUNT(*) FROM chunks GROUP BY page_type",
                };
                let mut stmt = conn.prepare(sql).map_err(tokio_rusqlite::Error::Error)?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
                    })
                    .map_err(tokio_rusqlite::Error::Error)?;

                let mut counts = BTreeMap::new();
                for row in rows {
                    let (key, count) = row.map_err(tokio_rusqlite::Error::Error)?;
                    counts.insert(key, count);
                }
                Ok(counts)
            })
            .await
            .map_err(|err| PipelineError::Storage(err.to_string()))
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Facet {
    Language,
    PageType,
}

#[async_trait]
impl ChunkRetriever for SqliteVectorIndex {
    async fn nearest(&self, query: &[f32], fetch_k: usize) -> Result<Vec<ScoredChunk>, QueryError> {
        let query_json =
            serde_json::to_string(query).map_err(|err| QueryError::Storage(err.to_string()))?;

        self.conn
            .call(move |conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT chunk_id, doc_id, chunk_index, url, language, page_type,
                                source_title, crawled_at, char_count, text,
                                vec_to_json(embedding),
                                vec_distance_cosine(embedding, vec_f32(?1)) AS distance
                         FROM chunks
                         ORDER BY distance ASC
                         LIMIT ?2",
                    )
                    .map_err(tokio_rusqlite::Error::Error)?;

                let rows = stmt
                    .query_map(
                        tokio_rusqlite::params![query_json, fetch_k as i64],
                        |row| {
                            let language: String = row.get(4)?;
                            let page_type: String = row.get(5)?;
                            let crawled_at: String = row.get(7)?;
                            let embedding_json: String = row.get(10)?;
                            let distance: f32 = row.get(11)?;

                            let record = ChunkRecord {
                                chunk_id: row.get(0)?,
                                doc_id: row.get(1)?,
                                chunk_index: row.get::<_, i64>(2)? as usize,
                                url: row.get(3)?,
                                language: parse_language(&language),
                                page_type: parse_page_type(&page_type),
                                source_title: row.get(6)?,
                                crawled_at: DateTime::parse_from_rfc3339(&crawled_at)
                                    .map(|parsed| parsed.to_utc())
                                    .unwrap_or(DateTime::<chrono::Utc>::MIN_UTC),
                                char_count: row.get::<_, i64>(8)? as usize,
                                text: row.get(9)?,
                            };
                            let embedding: Vec<f32> =
                                serde_json::from_str(&embedding_json).unwrap_or_default();

                            Ok(ScoredChunk {
                                record,
                                similarity: 1.0 - distance,
                                embedding,
                            })
                        },
                    )
                    .map_err(tokio_rusqlite::Error::Error)?;

                let mut results = Vec::new();
                for row in rows {
                    results.push(row.map_err(tokio_rusqlite::Error::Error)?);
                }
                Ok(results)
            })
            .await
            .map_err(|err| QueryError::Storage(err.to_string()))
    }

    async fn total_vectors(&self) -> Result<usize, QueryError> {
        self.count()
            .await
            .map_err(|err| QueryError::Storage(err.to_string()))
    }
}

fn parse_language(raw: &str) -> Language {
    match raw {
        "ar" => Language::Ar,
        _ => Language::En,
    }
}

fn parse_page_type(raw: &str) -> PageType {
    match raw {
        "product" => PageType::Product,
        "category" => PageType::Category,
        "policy_support" => PageType::PolicySupport,
        "brand_campaign" => PageType::BrandCampaign,
        _ => PageType::Other,
    }
}

fn register_sqlite_vec() -> Result<(), PipelineError> {
    use std::sync::Mutex;

    static INIT: Once = Once::new();
    static INIT_RESULT: Mutex<Option<Result<(), String>>> = Mutex::new(None);

    INIT.call_once(|| {
        let result = unsafe {
            type SqliteExtensionInit = unsafe extern "C" fn(
                *mut ffi::sqlite3,
                *mut *mut c_char,
                *const ffi::sqlite3_api_routines,
            ) -> i32;

            let init: unsafe extern "C" fn() = sqlite_vec::sqlite3_vec_init;
            let init_fn: SqliteExtensionInit =
                std::mem::transmute::<unsafe extern "C" fn(), SqliteExtensionInit>(init);
            let rc = ffi::sqlite3_auto_extension(Some(init_fn));
            if rc != 0 {
                Err(format!("failed to register sqlite-vec extension (code {rc})"))
            } else {
                Ok(())
            }
        };
        *INIT_RESULT.lock().expect("init result mutex poisoned") = Some(result);
    });

    INIT_RESULT
        .lock()
        .expect("init result mutex poisoned")
        .clone()
        .expect("init was called but result not set")
        .map_err(PipelineError::Storage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Language, PageType};
    use chrono::Utc;
    use tempfile::tempdir;

    fn chunk(id: &str, language: Language, text: &str) -> ChunkRecord {
        ChunkRecord {
            doc_id: "product_abcd1234".to_string(),
            chunk_id: id.to_string(),
            chunk_index: 0,
            url: format!("https://store.example/product/{id}"),
            language,
            page_type: PageType::Product,
            source_title: "Phone X".to_string(),
            crawled_at: Utc::now(),
            text: text.to_string(),
            char_count: text.len(),
        }
    }

    #[tokio::test]
    async fn append_then_nearest_orders_by_similarity() {
        let dir = tempdir().unwrap();
        let index = SqliteVectorIndex::open(dir.path().join("index.db")).await.unwrap();

        index
            .append_batch(vec![
                (chunk("a", Language::En, "phones"), vec![1.0, 0.0, 0.0]),
                (chunk("b", Language::En, "tablets"), vec![0.0, 1.0, 0.0]),
                (chunk("c", Language::Ar, "chargers"), vec![0.7, 0.7, 0.0]),
            ])
            .await
            .unwrap();

        let hits = index.nearest(&[1.0, 0.0, 0.0], 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].record.chunk_id, "a");
        assert_eq!(hits[1].record.chunk_id, "c");
        assert!(hits[0].similarity > hits[1].similarity);
        assert_eq!(hits[0].embedding, vec![1.0, 0.0, 0.0]);
    }

    #[tokio::test]
    async fn counts_cover_both_facets() {
        let dir = tempdir().unwrap();
        let index = SqliteVectorIndex::open(dir.path().join("index.db")).await.unwrap();

        index
            .append_batch(vec![
                (chunk("a", Language::En, "phones"), vec![1.0, 0.0]),
                (chunk("b", Language::Ar, "هواتف"), vec![0.0, 1.0]),
            ])
            .await
            .unwrap();

        assert_eq!(index.count().await.unwrap(), 2);
        let languages = index.facet_counts(Facet::Language).await.unwrap();
        assert_eq!(languages.get("en"), Some(&1));
        assert_eq!(languages.get("ar"), Some(&1));
        let types = index.facet_counts(Facet::PageType).await.unwrap();
        assert_eq!(types.get("product"), Some(&2));
    }
}
