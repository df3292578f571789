//! Text embeddings for hybrid retrieval.
//!
//! Two backends implement [`Embedder`]:
//! - [`HashingEmbedder`]: deterministic feature hashing (identifier tokens and
//!   character trigrams), no network and no model weights.
//! - [`RemoteEmbedder`]: an OpenAI-compatible `/embeddings` endpoint, e.g. a
//!   LiteLLM proxy serving a sentence-transformers model.

use async_trait::async_trait;
use ndarray::{Array1, Array2};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::error::RetrievalError;

/// Default embedding dimension for the hashing embedder.
const DEFAULT_DIMENSION: usize = 384;

/// Texts sent per `/embeddings` request.
const REMOTE_BATCH_SIZE: usize = 64;

/// Produces one embedding row per input text.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Array2<f64>, RetrievalError>;
}

/// Feature-hashing embedder.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_DIMENSION)
    }
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(4),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Embed a single text.
    ///
    /// The first half of the vector holds identifier-token counts, the second
    /// half character trigram counts. The result is L2-normalized.
    pub fn embed_text(&self, text: &str) -> Array1<f64> {
        let mut embedding = Array1::zeros(self.dimension);
        if text.is_empty() {
            return embedding;
        }

        let lower = text.to_lowercase();

        let word_dim = self.dimension / 2;
        let words: Vec<&str> = lower
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();
        for word in &words {
            let pos = hash_to_index(word, word_dim);
            embedding[pos] += 1.0;
        }

        let trigram_dim = self.dimension - word_dim;
        let chars: Vec<char> = lower.chars().filter(|c| !c.is_whitespace()).collect();
        for window in chars.windows(3) {
            let trigram: String = window.iter().collect();
            let pos = word_dim + hash_to_index(&trigram, trigram_dim);
            embedding[pos] += 0.5;
        }

        normalize(&mut embedding);
        embedding
    }

    /// Embed every text, one row each.
    pub fn embed_all(&self, texts: &[String]) -> Array2<f64> {
        let mut result = Array2::zeros((texts.len(), self.dimension));
        for (i, text) in texts.iter().enumerate() {
            result.row_mut(i).assign(&self.embed_text(text));
        }
        result
    }
}

/// Hashing is CPU bound, so it runs on a blocking thread.
#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Array2<f64>, RetrievalError> {
        let embedder = self.clone();
        let texts = texts.to_vec();
        Ok(tokio::task::spawn_blocking(move || embedder.embed_all(&texts)).await?)
    }
}

/// Client for an OpenAI-compatible embeddings endpoint.
pub struct RemoteEmbedder {
    api_base: String,
    api_key: Option<String>,
    model: String,
    http_client: Client,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: usize,
    embedding: Vec<f64>,
}

impl RemoteEmbedder {
    pub fn new(api_base: impl Into<String>, api_key: Option<String>, model: impl Into<String>) -> Self {
        let api_base: String = api_base.into();
        Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
            http_client: Client::builder()
                .timeout(Duration::from_secs(120))
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn embed_batch(&self, batch: &[String]) -> Result<Vec<Vec<f64>>, RetrievalError> {
        let url = format!("{}/embeddings", self.api_base);
        let mut request = self.http_client.post(&url).json(&EmbeddingRequest {
            model: &self.model,
            input: batch,
        });
        if let Some(ref key) = self.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let response = request
            .send()
            .await
            .map_err(|e| RetrievalError::Embedding(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RetrievalError::Embedding(format!(
                "embeddings endpoint returned {}: {}",
                status, body
            )));
        }

        let mut parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| RetrievalError::Embedding(format!("invalid response: {}", e)))?;
        if parsed.data.len() != batch.len() {
            return Err(RetrievalError::Embedding(format!(
                "expected {} embeddings, got {}",
                batch.len(),
                parsed.data.len()
            )));
        }
        parsed.data.sort_by_key(|d| d.index);
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}

#[async_trait]
impl Embedder for RemoteEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Array2<f64>, RetrievalError> {
        let mut rows: Vec<Vec<f64>> = Vec::with_capacity(texts.len());
        for batch in texts.chunks(REMOTE_BATCH_SIZE) {
            rows.extend(self.embed_batch(batch).await?);
        }

        let dimension = rows.first().map(Vec::len).unwrap_or(0);
        if rows.iter().any(|r| r.len() != dimension) {
            return Err(RetrievalError::Embedding(
                "embeddings have inconsistent dimensions".to_string(),
            ));
        }

        let flat: Vec<f64> = rows.into_iter().flatten().collect();
        Array2::from_shape_vec((texts.len(), dimension), flat)
            .map_err(|e| RetrievalError::Embedding(e.to_string()))
    }
}

/// Normalize each row of `matrix` to unit length. Zero rows stay zero.
pub fn normalize_rows(matrix: &mut Array2<f64>) {
    for mut row in matrix.rows_mut() {
        let norm = row.dot(&row).sqrt();
        if norm > 1e-10 {
            row.mapv_inplace(|x| x / norm);
        }
    }
}

fn normalize(v: &mut Array1<f64>) {
    let norm: f64 = v.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm > 1e-10 {
        v.mapv_inplace(|x| x / norm);
    }
}

/// Hashes a string to an index in [0, max_index).
fn hash_to_index(input: &str, max_index: usize) -> usize {
    if max_index == 0 {
        return 0;
    }
    let hash_bytes = Sha256::digest(input.as_bytes());
    let hash_val = u32::from_be_bytes([hash_bytes[0], hash_bytes[1], hash_bytes[2], hash_bytes[3]]);
    hash_val as usize % max_index
}
