//! Semantic boundary detection over sentence embeddings.
//!
//! The splitter embeds every sentence, measures cosine distance between
//! neighbours and breaks wherever the distance exceeds the 95th percentile
//! of all observed distances. Boundary quality therefore comes entirely from
//! the embedding model; this module only arranges the calls.

use async_trait::async_trait;

use crate::embedder::Embedder;
use crate::error::ProviderError;

/// Distance percentile above which two adjacent sentences start new spans.
const BREAKPOINT_PERCENTILE: f64 = 95.0;

/// Capability: split text into semantically coherent spans, in order.
#[async_trait]
pub trait SemanticSplitter: Send + Sync {
    async fn split(&self, text: &str) -> Result<Vec<String>, ProviderError>;
}

/// Splitter backed by an embedding model.
pub struct EmbeddingSplitter<E> {
    embedder: E,
}

impl<E> EmbeddingSplitter<E>
where
    E: Embedder,
{
    pub fn new(embedder: E) -> Self {
        Self { embedder }
    }
}

#[async_trait]
impl<E> SemanticSplitter for EmbeddingSplitter<E>
where
    E: Embedder,
{
    async fn split(&self, text: &str) -> Result<Vec<String>, ProviderError> {
        let sentences = split_sentences(text);
        if sentences.len() < 2 {
            return Ok(vec![text.trim().to_string()]);
        }

        let embeddings = self.embedder.embed_batch(&sentences).await?;
        if embeddings.len() != sentences.len() {
            return Err(ProviderError::Decode(format!(
                "{} embeddings for {} sentences",
                embeddings.len(),
                sentences.len()
            )));
        }

        let distances: Vec<f32> = embeddings
            .windows(2)
            .map(|pair| 1.0 - cosine_similarity(&pair[0], &pair[1]))
            .collect();
        let threshold = percentile(&distances, BREAKPOINT_PERCENTILE);

        let mut spans = Vec::new();
        let mut current: Vec<&str> = vec![&sentences[0]];
        for (sentence, distance) in sentences[1..].iter().zip(&distances) {
            if *distance > threshold {
                spans.push(current.join(" "));
                current = Vec::new();
            }
            current.push(sentence);
        }
        if !current.is_empty() {
            spans.push(current.join(" "));
        }

        Ok(spans)
    }
}

/// Splits on sentence-terminal punctuation (Latin and Arabic) and paragraph
/// breaks. Keeps terminators attached to their sentence.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut terminated = false;

    for ch in text.chars() {
        if ch == '\n' {
            flush(&mut sentences, &mut current);
            terminated = false;
            continue;
        }

        if terminated && ch.is_whitespace() {
            flush(&mut sentences, &mut current);
            terminated = false;
            continue;
        }

        current.push(ch);
        terminated = matches!(ch, '.' | '!' | '?' | '؟' | '۔');
    }
    flush(&mut sentences, &mut current);

    sentences
}

fn flush(sentences: &mut Vec<String>, current: &mut String) {
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        sentences.push(trimmed.to_string());
    }
    current.clear();
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Linearly interpolated percentile, so the threshold sits strictly below
/// the maximum whenever the distances are not all equal.
fn percentile(values: &[f32], pct: f64) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|left, right| left.total_cmp(right));

    let position = (pct / 100.0) * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    if lower == upper {
        return sorted[lower];
    }
    let weight = (position - lower as f64) as f32;
    sorted[lower] + (sorted[upper] - sorted[lower]) * weight
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AxisEmbedder {
        vectors: Vec<Vec<f32>>,
    }

    #[async_trait]
    impl Embedder for AxisEmbedder {
        fn model_id(&self) -> &str {
            "axis-test"
        }

        async fn embed_batch(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
            Ok(self.vectors[..inputs.len()].to_vec())
        }
    }

    #[test]
    fn sentences_split_on_terminators_and_newlines() {
        let sentences = split_sentences("Fast delivery. Easy returns!\nContact us anytime");
        assert_eq!(
            sentences,
            vec!["Fast delivery.", "Easy returns!", "Contact us anytime"]
        );
    }

    #[test]
    fn arabic_question_mark_terminates() {
        let sentences = split_sentences("هل يوجد توصيل؟ نعم يوجد.");
        assert_eq!(sentences, vec!["هل يوجد توصيل؟", "نعم يوجد."]);
    }

    #[tokio::test]
    async fn single_sentence_yields_whole_text() {
        let splitter = EmbeddingSplitter::new(AxisEmbedder { vectors: vec![] });
        let spans = splitter.split("just one sentence").await.unwrap();
        assert_eq!(spans, vec!["just one sentence"]);
    }

    #[tokio::test]
    async fn breaks_at_the_largest_distance() {
        // Two tight groups on different axes: the single cross-group gap is
        // the top-percentile distance.
        let splitter = EmbeddingSplitter::new(AxisEmbedder {
            vectors: vec![
                vec![1.0, 0.0],
                vec![0.99, 0.01],
                vec![0.0, 1.0],
                vec![0.01, 0.99],
            ],
        });
        let spans = splitter
            .split("Phones ship fast. Phones have warranty. Returns take a week. Returns need receipts.")
            .await
            .unwrap();
        assert_eq!(spans.len(), 2);
        assert!(spans[0].contains("Phones ship fast."));
        assert!(spans[1].contains("Returns take a week."));
    }

    #[test]
    fn cosine_similarity_handles_zero_vectors() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
    }
}
