//! Similarity retriever over the vector index.
//!
//! Embeds the query through the configured provider, then runs a
//! k-nearest-neighbor search against the index. Whitespace-only chunks are
//! filtered out, so an "empty" retrieval genuinely means there is nothing
//! to ground an answer on.

use anyhow::Result;
use std::sync::Arc;

use crate::embedding::{embed_query, EmbeddingProvider};
use crate::index::VectorIndex;
use crate::models::Chunk;

/// A retrieved chunk with its similarity score.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f32,
}

pub struct Retriever {
    index: Arc<VectorIndex>,
    provider: Arc<dyn EmbeddingProvider>,
}

impl Retriever {
    pub fn new(index: Arc<VectorIndex>, provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self { index, provider }
    }

    /// Return the top-k most similar chunks, descending by similarity.
    ///
    /// Never errors on an empty index: returns an empty vector instead.
    /// Repeated calls for the same query return identical orderings.
    pub async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<ScoredChunk>> {
        if self.index.is_empty() {
            return Ok(Vec::new());
        }

        let query_vec = embed_query(self.provider.as_ref(), query).await?;

        let results = self
            .index
            .search(&query_vec, k)
            .into_iter()
            .filter(|(chunk, _)| !chunk.text.trim().is_empty())
            .map(|(chunk, score)| ScoredChunk {
                chunk: chunk.clone(),
                score,
            })
            .collect();

        Ok(results)
    }
}
