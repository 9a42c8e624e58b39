//! Conversational query engine: rewrite follow-ups, retrieve with a
//! diversity-aware selection, generate a grounded answer, remember the turn.

use std::pin::Pin;

use chrono::Utc;
use futures_util::{Stream, StreamExt};

use crate::chat::{ChatModel, PromptMessage};
use crate::embedder::Embedder;
use crate::error::QueryError;
use crate::index::ChunkRetriever;
use crate::manifest::EmbedManifest;
use crate::models::{
    AnswerMetadata, ChatAnswer, ChatMessage, ChatRole, IndexInfo, Language, ScoredChunk,
};
use crate::session::SessionStore;
use crate::splitter::cosine_similarity;

/// Results returned to the model per question.
pub const RETRIEVE_K: usize = 8;

/// Candidates fetched before diversity re-ranking.
pub const FETCH_K: usize = 40;

/// Relevance/diversity balance for maximal-marginal-relevance selection.
pub const MMR_LAMBDA: f32 = 0.5;

/// Messages of history used for rewriting and prompting (3 turns).
const HISTORY_WINDOW_MESSAGES: usize = 6;

const SYSTEM_PROMPT: &str = "\
You are the Cell Avenue Store AI assistant.
You help customers with questions about products, pricing, shipping, returns, and store policies.

RULES — follow these strictly:
1. Answer ONLY from the provided context below. Never invent information.
2. If the answer is not in the context, say: \"I'm sorry, I don't have that information. Please contact Cell Avenue support for help.\"
3. Include the source URL(s) for every claim you make. Place them naturally in your answer or list them at the end as \"Sources:\".
4. Match the language of the user's question. If they ask in Arabic, reply in Arabic. If in English, reply in English.
5. Be concise, friendly, and professional.
6. When listing products or prices, use bullet points for clarity.
7. Always mention the currency (KWD/\u{062f}\u{064a}\u{0646}\u{0627}\u{0631} \u{0643}\u{0648}\u{064a}\u{062a}\u{064a}) when discussing prices.

CONTEXT:
{context}";

const REWRITE_PROMPT: &str = "\
Given the following conversation history and a follow-up question, rewrite the follow-up question as a standalone question that captures the full intent. Keep it concise.

Conversation history:
{chat_history}

Follow-up question: {question}

Standalone question:";

/// Event stream emitted by [`QueryEngine::answer_stream`]: ordered tokens,
/// then exactly one metadata event.
#[derive(Debug, Clone)]
pub enum AnswerEvent {
    Token(String),
    Metadata(AnswerMetadata),
}

pub type AnswerStream = Pin<Box<dyn Stream<Item = Result<AnswerEvent, QueryError>> + Send>>;

pub struct QueryEngine<E, C, R, S> {
    embedder: E,
    chat: C,
    retriever: R,
    sessions: S,
    manifest: Option<EmbedManifest>,
}

impl<E, C, R, S> QueryEngine<E, C, R, S>
where
    E: Embedder,
    C: ChatModel,
    R: ChunkRetriever,
    S: SessionStore + Clone + 'static,
{
    pub fn new(embedder: E, chat: C, retriever: R, sessions: S) -> Self {
        Self {
            embedder,
            chat,
            retriever,
            sessions,
            manifest: None,
        }
    }

    /// Attaches the embed manifest written by the indexer, for the info
    /// endpoint.
    pub fn with_manifest(mut self, manifest: Option<EmbedManifest>) -> Self {
        self.manifest = manifest;
        self
    }

    pub fn sessions(&self) -> &S {
        &self.sessions
    }

    /// Answers one question in a single blocking completion.
    pub async fn answer(
        &self,
        question: &str,
        session_id: Option<&str>,
    ) -> Result<ChatAnswer, QueryError> {
        let prepared = self.prepare(question, session_id).await?;
        let answer = self.chat.complete(&prepared.messages).await?;

        // History is only touched once generation has fully succeeded.
        self.sessions
            .append(&prepared.session_id, ChatRole::User, question.to_string());
        self.sessions
            .append(&prepared.session_id, ChatRole::Assistant, answer.clone());

        Ok(ChatAnswer {
            answer,
            citations: prepared.citations,
            language: prepared.language,
            as_of: Utc::now(),
            chunks_used: prepared.chunks_used,
            session_id: prepared.session_id,
        })
    }

    /// Answers one question as an ordered token stream followed by exactly
    /// one metadata event. The session is updated only after the provider
    /// stream is fully drained; a mid-stream failure leaves it untouched.
    pub async fn answer_stream(
        &self,
        question: &str,
        session_id: Option<&str>,
    ) -> Result<AnswerStream, QueryError> {
        let prepared = self.prepare(question, session_id).await?;
        let tokens = self.chat.stream(&prepared.messages).await?;

        let tail = StreamTail {
            sessions: self.sessions.clone(),
            question: question.to_string(),
            answer: String::new(),
            metadata: AnswerMetadata {
                citations: prepared.citations,
                language: prepared.language,
                as_of: Utc::now(),
                chunks_used: prepared.chunks_used,
                session_id: prepared.session_id,
            },
        };

        let events = futures_util::stream::unfold(
            (tokens, tail, false),
            |(mut tokens, mut tail, finished)| async move {
                if finished {
                    return None;
                }
                match tokens.next().await {
                    Some(Ok(token)) => {
                        tail.answer.push_str(&token);
                        Some((Ok(AnswerEvent::Token(token)), (tokens, tail, false)))
                    }
                    Some(Err(error)) => {
                        Some((Err(QueryError::Provider(error)), (tokens, tail, true)))
                    }
                    None => {
                        tail.sessions.append(
                            &tail.metadata.session_id,
                            ChatRole::User,
                            tail.question.clone(),
                        );
                        tail.sessions.append(
                            &tail.metadata.session_id,
                            ChatRole::Assistant,
                            tail.answer.clone(),
                        );
                        let metadata = AnswerMetadata {
                            as_of: Utc::now(),
                            ..tail.metadata.clone()
                        };
                        Some((Ok(AnswerEvent::Metadata(metadata)), (tokens, tail, true)))
                    }
                }
            },
        );

        Ok(Box::pin(events))
    }

    pub async fn index_info(&self) -> Result<IndexInfo, QueryError> {
        let total_vectors = self.retriever.total_vectors().await?;
        let (embedding_model, indexed_at, languages, page_types) = match &self.manifest {
            Some(manifest) => (
                manifest.embedding_model.clone(),
                manifest.generated_at.to_rfc3339(),
                manifest.languages.clone(),
                manifest.page_types.clone(),
            ),
            None => (
                "unknown".to_string(),
                "unknown".to_string(),
                Default::default(),
                Default::default(),
            ),
        };

        Ok(IndexInfo {
            embedding_model,
            indexed_at,
            total_vectors,
            languages,
            page_types,
            active_sessions: self.sessions.len(),
        })
    }

    /// Pre-processing shared by both entry points: resolve the session,
    /// rewrite the question against recent history, retrieve context and
    /// assemble the prompt.
    async fn prepare(
        &self,
        question: &str,
        session_id: Option<&str>,
    ) -> Result<Prepared, QueryError> {
        if question.trim().is_empty() {
            return Err(QueryError::InvalidRequest("question is empty".to_string()));
        }

        let session_id = match session_id {
            Some(id) => id.to_string(),
            None => self.sessions.create(),
        };
        let history = self.sessions.get(&session_id);

        let search_query = self.rewrite_with_history(question, &history).await?;
        let query_vector = self.embedder.embed(&search_query).await?;

        let candidates = self.retriever.nearest(&query_vector, FETCH_K).await?;
        let selected = mmr_select(candidates, RETRIEVE_K, MMR_LAMBDA);

        let context = format_context(&selected);
        let citations = extract_citations(&selected);
        let language = detect_language(question);

        let mut messages = Vec::with_capacity(HISTORY_WINDOW_MESSAGES + 2);
        messages.push(PromptMessage::system(
            SYSTEM_PROMPT.replace("{context}", &context),
        ));
        for message in recent(&history, HISTORY_WINDOW_MESSAGES) {
            messages.push(match message.role {
                ChatRole::User => PromptMessage::user(message.content.clone()),
                ChatRole::Assistant => PromptMessage::assistant(message.content.clone()),
            });
        }
        // The model sees the original question; only retrieval uses the rewrite.
        messages.push(PromptMessage::user(question));

        Ok(Prepared {
            session_id,
            chunks_used: selected.len(),
            citations,
            language,
            messages,
        })
    }

    /// Embedding retrieval cannot resolve pronouns ("tell me more about
    /// them"), so follow-ups are rewritten into standalone queries before
    /// retrieval. A blank rewrite falls back to the question verbatim.
    async fn rewrite_with_history(
        &self,
        question: &str,
        history: &[ChatMessage],
    ) -> Result<String, QueryError> {
        if history.is_empty() {
            return Ok(question.to_string());
        }

        let transcript = recent(history, HISTORY_WINDOW_MESSAGES)
            .iter()
            .map(|message| {
                let speaker = match message.role {
                    ChatRole::User => "User",
                    ChatRole::Assistant => "Assistant",
                };
                format!("{speaker}: {}", message.content)
            })
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = REWRITE_PROMPT
            .replace("{chat_history}", &transcript)
            .replace("{question}", question);
        let rewritten = self.chat.complete(&[PromptMessage::user(prompt)]).await?;

        let trimmed = rewritten.trim();
        if trimmed.is_empty() {
            Ok(question.to_string())
        } else {
            Ok(trimmed.to_string())
        }
    }
}

struct Prepared {
    session_id: String,
    chunks_used: usize,
    citations: Vec<String>,
    language: Language,
    messages: Vec<PromptMessage>,
}

struct StreamTail<S> {
    sessions: S,
    question: String,
    answer: String,
    metadata: AnswerMetadata,
}

fn recent(history: &[ChatMessage], window: usize) -> &[ChatMessage] {
    &history[history.len().saturating_sub(window)..]
}

/// Greedy maximal-marginal-relevance selection: query relevance (the stored
/// cosine similarity) traded against similarity to already-picked chunks.
/// E-commerce corpora are full of near-duplicate variant descriptions; plain
/// top-k would return the same paragraph eight times.
pub fn mmr_select(mut candidates: Vec<ScoredChunk>, k: usize, lambda: f32) -> Vec<ScoredChunk> {
    let mut selected: Vec<ScoredChunk> = Vec::with_capacity(k.min(candidates.len()));

    while selected.len() < k && !candidates.is_empty() {
        let mut best = 0;
        let mut best_score = f32::NEG_INFINITY;

        for (position, candidate) in candidates.iter().enumerate() {
            let redundancy = selected
                .iter()
                .map(|picked| cosine_similarity(&candidate.embedding, &picked.embedding))
                .fold(0.0_f32, f32::max);
            let score = lambda * candidate.similarity - (1.0 - lambda) * redundancy;
            if score > best_score {
                best_score = score;
                best = position;
            }
        }

        selected.push(candidates.remove(best));
    }

    selected
}

fn format_context(chunks: &[ScoredChunk]) -> String {
    chunks
        .iter()
        .enumerate()
        .map(|(position, chunk)| {
            let record = &chunk.record;
            format!(
                "--- Document {} ---\nTitle: {}\nURL: {}\nType: {} | Language: {}\n\n{}\n",
                position + 1,
                record.source_title,
                record.url,
                record.page_type.as_str(),
                record.language.as_str(),
                record.text,
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Unique source URLs in first-retrieval order.
fn extract_citations(chunks: &[ScoredChunk]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut urls = Vec::new();
    for chunk in chunks {
        let url = &chunk.record.url;
        if !url.is_empty() && seen.insert(url.clone()) {
            urls.push(url.clone());
        }
    }
    urls
}

/// Tags the question by Arabic codepoint presence. Informational only; the
/// system prompt separately instructs the model to mirror the question's
/// language.
pub fn detect_language(question: &str) -> Language {
    if question.chars().any(|ch| ('\u{0600}'..='\u{06FF}').contains(&ch)) {
        Language::Ar
    } else {
        Language::En
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::TokenStream;
    use crate::error::ProviderError;
    use crate::models::{ChunkRecord, PageType};
    use crate::session::InMemorySessionStore;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct FakeEmbedder {
        queries: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Embedder for FakeEmbedder {
        fn model_id(&self) -> &str {
            "fake-embedding"
        }

        async fn embed_batch(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
            self.queries.lock().unwrap().extend(inputs.iter().cloned());
            Ok(inputs.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    #[derive(Clone, Default)]
    struct FakeChat {
        replies: Arc<Mutex<VecDeque<String>>>,
        prompts: Arc<Mutex<Vec<Vec<PromptMessage>>>>,
        fail_stream: bool,
    }

    impl FakeChat {
        fn scripted(replies: &[&str]) -> Self {
            Self {
                replies: Arc::new(Mutex::new(
                    replies.iter().map(|reply| reply.to_string()).collect(),
                )),
                prompts: Arc::default(),
                fail_stream: false,
            }
        }
    }

    #[async_trait]
    impl ChatModel for FakeChat {
        async fn complete(&self, messages: &[PromptMessage]) -> Result<String, ProviderError> {
            self.prompts.lock().unwrap().push(messages.to_vec());
            Ok(self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| "default answer".to_string()))
        }

        async fn stream(&self, messages: &[PromptMessage]) -> Result<TokenStream, ProviderError> {
            self.prompts.lock().unwrap().push(messages.to_vec());
            if self.fail_stream {
                let items: Vec<Result<String, ProviderError>> = vec![
                    Ok("partial".to_string()),
                    Err(ProviderError::Decode("stream died".to_string())),
                ];
                return Ok(Box::pin(futures_util::stream::iter(items)));
            }
            let reply = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| "streamed answer".to_string());
            let tokens: Vec<Result<String, ProviderError>> = reply
                .split_inclusive(' ')
                .map(|piece| Ok(piece.to_string()))
                .collect();
            Ok(Box::pin(futures_util::stream::iter(tokens)))
        }
    }

    #[derive(Clone)]
    struct FakeRetriever {
        hits: Vec<ScoredChunk>,
    }

    #[async_trait]
    impl ChunkRetriever for FakeRetriever {
        async fn nearest(
            &self,
            _query: &[f32],
            fetch_k: usize,
        ) -> Result<Vec<ScoredChunk>, QueryError> {
            Ok(self.hits.iter().take(fetch_k).cloned().collect())
        }

        async fn total_vectors(&self) -> Result<usize, QueryError> {
            Ok(self.hits.len())
        }
    }

    fn hit(url: &str, similarity: f32, embedding: Vec<f32>) -> ScoredChunk {
        ScoredChunk {
            record: ChunkRecord {
                doc_id: "product_abcd1234".to_string(),
                chunk_id: format!("product_abcd1234_c{}", url.len()),
                chunk_index: 0,
                url: url.to_string(),
                language: Language::En,
                page_type: PageType::Product,
                source_title: "Phone X".to_string(),
                crawled_at: Utc::now(),
                text: "Phone X costs 89.900 KWD.".to_string(),
                char_count: 25,
            },
            similarity,
            embedding,
        }
    }

    fn engine(
        chat: FakeChat,
        hits: Vec<ScoredChunk>,
    ) -> QueryEngine<FakeEmbedder, FakeChat, FakeRetriever, InMemorySessionStore> {
        QueryEngine::new(
            FakeEmbedder::default(),
            chat,
            FakeRetriever { hits },
            InMemorySessionStore::new(),
        )
    }

    #[tokio::test]
    async fn first_question_mints_a_fresh_session() {
        let engine = engine(FakeChat::scripted(&["We carry Phone X."]), vec![hit(
            "https://store.example/product/phone-x",
            0.9,
            vec![1.0, 0.0],
        )]);

        let answer = engine.answer("What phones do you have?", None).await.unwrap();
        assert_eq!(answer.answer, "We carry Phone X.");
        assert_eq!(answer.session_id.len(), 12);
        assert_eq!(answer.chunks_used, 1);

        let history = engine.sessions().get(&answer.session_id);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "What phones do you have?");
    }

    #[tokio::test]
    async fn follow_up_rewrites_with_prior_turn() {
        let chat = FakeChat::scripted(&[
            "We carry Phone X.",
            "What phones does the store sell?",
            "Phone X has 256 GB.",
        ]);
        let engine = engine(chat.clone(), vec![hit(
            "https://store.example/product/phone-x",
            0.9,
            vec![1.0, 0.0],
        )]);

        let first = engine.answer("What phones do you have?", None).await.unwrap();
        let second = engine
            .answer("Tell me more about them", Some(&first.session_id))
            .await
            .unwrap();
        assert_eq!(second.session_id, first.session_id);

        let prompts = chat.prompts.lock().unwrap();
        // answer 1, rewrite, answer 2
        assert_eq!(prompts.len(), 3);
        let rewrite = &prompts[1];
        assert_eq!(rewrite.len(), 1);
        assert!(rewrite[0].content.contains("What phones do you have?"));
        assert!(rewrite[0].content.contains("Follow-up question: Tell me more about them"));

        // Retrieval used the rewrite, the final prompt kept the original.
        let embedded = engine.embedder.queries.lock().unwrap();
        assert_eq!(embedded.last().unwrap(), "What phones does the store sell?");
        let final_prompt = prompts.last().unwrap();
        assert_eq!(final_prompt.last().unwrap().content, "Tell me more about them");
    }

    #[tokio::test]
    async fn blank_rewrite_falls_back_to_original_question() {
        let chat = FakeChat::scripted(&["We carry Phone X.", "   ", "More details."]);
        let engine = engine(chat, vec![hit(
            "https://store.example/product/phone-x",
            0.9,
            vec![1.0, 0.0],
        )]);

        let first = engine.answer("What phones do you have?", None).await.unwrap();
        engine
            .answer("Tell me more about them", Some(&first.session_id))
            .await
            .unwrap();

        let embedded = engine.embedder.queries.lock().unwrap();
        assert_eq!(embedded.last().unwrap(), "Tell me more about them");
    }

    #[tokio::test]
    async fn citations_are_deduped_in_first_seen_order() {
        let hits = vec![
            hit("https://store.example/product/phone-x", 0.9, vec![1.0, 0.0]),
            hit("https://store.example/product/phone-y", 0.8, vec![0.0, 1.0]),
            hit("https://store.example/product/phone-x", 0.7, vec![0.9, 0.1]),
        ];
        let engine = engine(FakeChat::scripted(&["answer"]), hits);

        let answer = engine.answer("phones?", None).await.unwrap();
        assert_eq!(
            answer.citations,
            vec![
                "https://store.example/product/phone-x".to_string(),
                "https://store.example/product/phone-y".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn arabic_questions_are_tagged_arabic() {
        let engine = engine(FakeChat::scripted(&["مرحبا"]), vec![]);
        let answer = engine.answer("هل يوجد توصيل؟", None).await.unwrap();
        assert_eq!(answer.language, Language::Ar);
    }

    #[tokio::test]
    async fn empty_question_is_rejected() {
        let engine = engine(FakeChat::scripted(&[]), vec![]);
        let result = engine.answer("   ", None).await;
        assert!(matches!(result, Err(QueryError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn stream_tokens_concatenate_to_the_answer() {
        let engine = engine(FakeChat::scripted(&["We carry Phone X and Phone Y."]), vec![
            hit("https://store.example/product/phone-x", 0.9, vec![1.0, 0.0]),
        ]);

        let mut stream = engine.answer_stream("What phones do you have?", None).await.unwrap();
        let mut tokens = String::new();
        let mut metadata = None;
        while let Some(event) = stream.next().await {
            match event.unwrap() {
                AnswerEvent::Token(token) => {
                    assert!(metadata.is_none(), "token after metadata");
                    tokens.push_str(&token);
                }
                AnswerEvent::Metadata(found) => {
                    assert!(metadata.is_none(), "second metadata event");
                    metadata = Some(found);
                }
            }
        }

        assert_eq!(tokens, "We carry Phone X and Phone Y.");
        let metadata = metadata.expect("metadata event missing");
        assert_eq!(metadata.chunks_used, 1);

        let history = engine.sessions().get(&metadata.session_id);
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].content, "We carry Phone X and Phone Y.");
    }

    #[tokio::test]
    async fn failed_stream_leaves_history_untouched() {
        let chat = FakeChat {
            fail_stream: true,
            ..FakeChat::default()
        };
        let engine = engine(chat, vec![]);
        let session_id = engine.sessions().create();

        let mut stream = engine.answer_stream("phones?", Some(&session_id)).await.unwrap();
        let mut saw_error = false;
        let mut saw_metadata = false;
        while let Some(event) = stream.next().await {
            match event {
                Ok(AnswerEvent::Token(_)) => {}
                Ok(AnswerEvent::Metadata(_)) => saw_metadata = true,
                Err(_) => saw_error = true,
            }
        }

        assert!(saw_error);
        assert!(!saw_metadata, "metadata must not follow a failure");
        assert!(engine.sessions().get(&session_id).is_empty());
    }

    #[test]
    fn mmr_prefers_diverse_chunks() {
        let candidates = vec![
            hit("https://store.example/a", 0.95, vec![1.0, 0.0]),
            hit("https://store.example/a-variant", 0.94, vec![0.999, 0.01]),
            hit("https://store.example/b", 0.6, vec![0.0, 1.0]),
        ];
        let selected = mmr_select(candidates, 2, MMR_LAMBDA);
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].record.url, "https://store.example/a");
        assert_eq!(selected[1].record.url, "https://store.example/b");
    }

    #[test]
    fn mmr_handles_empty_candidate_sets() {
        let selected = mmr_select(vec![], 4, MMR_LAMBDA);
        assert!(selected.is_empty());
    }
}
