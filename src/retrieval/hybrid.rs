//! Hybrid chunk retrieval: embedding similarity blended with BM25.

use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::bm25::{rank_descending, tokenize, Bm25Okapi, DEFAULT_TOP_K};
use super::corpus::{collect_documents, compile_pattern, CorpusFilter};
use super::embeddings::{normalize_rows, Embedder};
use crate::error::RetrievalError;

pub const DEFAULT_CHUNK_SIZE: usize = 512;
pub const DEFAULT_CHUNK_OVERLAP: usize = 50;
pub const DEFAULT_EMBEDDING_WEIGHT: f64 = 0.7;
pub const DEFAULT_BM25_WEIGHT: f64 = 0.3;
pub const DEFAULT_EMBEDDING_MODEL: &str = "sentence-transformers/all-MiniLM-L6-v2";

/// A character span of a repository file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub path: String,
    /// Character offset of the first character.
    pub start: usize,
    /// Character offset one past the last character.
    pub end: usize,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct HybridOptions {
    pub top_k: usize,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub embedding_weight: f64,
    pub bm25_weight: f64,
    pub index_all_files: bool,
    pub file_extensions: Vec<String>,
    pub source_path_prefix: Option<String>,
    pub filter_pattern: Option<String>,
}

impl Default for HybridOptions {
    fn default() -> Self {
        Self {
            top_k: DEFAULT_TOP_K,
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
            embedding_weight: DEFAULT_EMBEDDING_WEIGHT,
            bm25_weight: DEFAULT_BM25_WEIGHT,
            index_all_files: true,
            file_extensions: vec![".py".to_string()],
            source_path_prefix: None,
            filter_pattern: None,
        }
    }
}

/// Split `text` into windows of `chunk_size` characters that overlap by
/// `overlap` characters. Returns `(start, end, content)` triples.
pub fn chunk_text(
    text: &str,
    chunk_size: usize,
    overlap: usize,
) -> Result<Vec<(usize, usize, String)>, RetrievalError> {
    if chunk_size == 0 || overlap >= chunk_size {
        return Err(RetrievalError::InvalidChunking {
            chunk_size,
            overlap,
        });
    }

    let chars: Vec<char> = text.chars().collect();
    let step = chunk_size - overlap;
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let end = (start + chunk_size).min(chars.len());
        chunks.push((start, end, chars[start..end].iter().collect()));
        start += step;
    }
    Ok(chunks)
}

/// Chunk every candidate file of `repo`.
pub fn collect_chunks(
    repo: &Path,
    options: &HybridOptions,
) -> Result<Vec<RetrievedChunk>, RetrievalError> {
    let filter_pattern = compile_pattern(options.filter_pattern.as_deref())?;
    let documents = collect_documents(
        repo,
        &CorpusFilter {
            index_all_files: options.index_all_files,
            file_extensions: &options.file_extensions,
            source_path_prefix: options.source_path_prefix.as_deref(),
            path_pattern: filter_pattern.as_ref(),
        },
    )?;

    let mut chunks = Vec::new();
    for doc in documents {
        for (start, end, content) in chunk_text(&doc.content, options.chunk_size, options.chunk_overlap)? {
            chunks.push(RetrievedChunk {
                path: doc.path.clone(),
                start,
                end,
                content,
            });
        }
    }
    Ok(chunks)
}

/// Rank `chunks` against `task` and return the best `top_k`.
///
/// Only the embedder call stays on the async runtime. Similarity, BM25 and
/// blending run on a blocking thread.
pub async fn rank_chunks(
    task: &str,
    chunks: Vec<RetrievedChunk>,
    embedder: &dyn Embedder,
    options: &HybridOptions,
) -> Result<Vec<RetrievedChunk>, RetrievalError> {
    if chunks.is_empty() || options.top_k == 0 {
        return Ok(Vec::new());
    }

    let mut texts = Vec::with_capacity(chunks.len() + 1);
    texts.push(task.to_string());
    texts.extend(chunks.iter().map(|c| c.content.clone()));

    let embeddings = embedder.embed(&texts).await?;
    if embeddings.nrows() != texts.len() {
        return Err(RetrievalError::Embedding(format!(
            "expected {} embeddings, got {}",
            texts.len(),
            embeddings.nrows()
        )));
    }

    let task = task.to_string();
    let opts = options.clone();
    Ok(tokio::task::spawn_blocking(move || blend_scores(&task, chunks, embeddings, &opts)).await?)
}

/// Cosine top-2k candidates re-scored with min-max normalized BM25.
/// Row 0 of `embeddings` is the query, row `i + 1` is `chunks[i]`.
fn blend_scores(
    task: &str,
    chunks: Vec<RetrievedChunk>,
    mut embeddings: Array2<f64>,
    options: &HybridOptions,
) -> Vec<RetrievedChunk> {
    normalize_rows(&mut embeddings);

    let query = embeddings.row(0).to_owned();
    let chunk_embeddings = embeddings.slice_axis(Axis(0), (1..).into());
    let similarities: Array1<f64> = chunk_embeddings.dot(&query);
    let similarities = similarities.to_vec();

    let n_candidates = (2 * options.top_k).min(chunks.len());
    let candidates: Vec<usize> = rank_descending(&similarities)
        .into_iter()
        .take(n_candidates)
        .collect();

    let tokenized: Vec<Vec<String>> = chunks.iter().map(|c| tokenize(&c.content)).collect();
    let bm25_scores = min_max_normalize(&Bm25Okapi::new(&tokenized).get_scores(&tokenize(task)));

    let scored: Vec<(usize, f64)> = candidates
        .into_iter()
        .map(|i| {
            let score =
                options.embedding_weight * similarities[i] + options.bm25_weight * bm25_scores[i];
            (i, score)
        })
        .filter(|(_, score)| *score > 0.0)
        .collect();
    let scores: Vec<f64> = scored.iter().map(|(_, s)| *s).collect();

    let mut chunks: Vec<Option<RetrievedChunk>> = chunks.into_iter().map(Some).collect();
    rank_descending(&scores)
        .into_iter()
        .take(options.top_k)
        .filter_map(|j| chunks[scored[j].0].take())
        .collect()
}

fn min_max_normalize(scores: &[f64]) -> Vec<f64> {
    let min = scores.iter().copied().fold(f64::INFINITY, f64::min);
    let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    scores
        .iter()
        .map(|s| (s - min) / (max - min + 1e-10))
        .collect()
}

/// Chunk `repo` and rank the chunks against `task`.
///
/// Walking, chunking and scoring happen on blocking threads.
pub async fn run_hybrid_retrieval(
    task: &str,
    repo: &Path,
    embedder: &dyn Embedder,
    options: &HybridOptions,
) -> Result<Vec<RetrievedChunk>, RetrievalError> {
    let repo_owned = repo.to_path_buf();
    let opts = options.clone();
    let chunks = tokio::task::spawn_blocking(move || collect_chunks(&repo_owned, &opts)).await??;

    tracing::debug!(chunks = chunks.len(), "Ranking hybrid retrieval chunks");
    rank_chunks(task, chunks, embedder, options).await
}
