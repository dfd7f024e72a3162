//! Vector index: build, persist, load, and search.
//!
//! The index is a flat collection of (chunk, embedding) pairs held in
//! memory, built once from the whole corpus and persisted to a SQLite file
//! as a unit. It is read-only after load and safe to share across sessions
//! behind an `Arc`. There is no incremental insert: adding documents means
//! rebuilding the full index.

use anyhow::Result;
use sqlx::Row;
use std::path::Path;
use std::sync::Arc;

use crate::db;
use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob, EmbeddingProvider};
use crate::models::Chunk;

/// Failures loading a persisted index.
#[derive(Debug)]
pub enum IndexError {
    /// No index exists at the configured location.
    NotFound(String),
    /// The stored format could not be parsed.
    Corrupt(String),
}

impl std::fmt::Display for IndexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexError::NotFound(path) => write!(f, "no index found at {}", path),
            IndexError::Corrupt(msg) => write!(f, "index is corrupt: {}", msg),
        }
    }
}

impl std::error::Error for IndexError {}

/// One indexed chunk with its embedding.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub chunk: Chunk,
    pub embedding: Vec<f32>,
}

/// In-memory nearest-neighbor index over chunk embeddings.
#[derive(Debug)]
pub struct VectorIndex {
    entries: Vec<IndexEntry>,
    model: String,
    dims: usize,
}

impl VectorIndex {
    /// Compute one embedding per chunk and assemble the index.
    ///
    /// This is a one-time batch operation: chunks are embedded in batches of
    /// `batch_size` through the provider and paired with their vectors.
    pub async fn build(
        chunks: Vec<Chunk>,
        provider: &dyn EmbeddingProvider,
        batch_size: usize,
    ) -> Result<Self> {
        let mut entries = Vec::with_capacity(chunks.len());

        for batch in chunks.chunks(batch_size.max(1)) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let vectors = provider.embed(&texts).await?;
            if vectors.len() != batch.len() {
                anyhow::bail!(
                    "embedding provider returned {} vectors for {} texts",
                    vectors.len(),
                    batch.len()
                );
            }
            for (chunk, embedding) in batch.iter().cloned().zip(vectors) {
                entries.push(IndexEntry { chunk, embedding });
            }
        }

        Ok(Self {
            entries,
            model: provider.model_name().to_string(),
            dims: provider.dims(),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn model_name(&self) -> &str {
        &self.model
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    /// An index with no entries; used for fallback-only operation.
    pub fn empty() -> Arc<Self> {
        Arc::new(Self {
            entries: Vec::new(),
            model: String::new(),
            dims: 0,
        })
    }

    /// k-nearest-neighbor search by cosine similarity.
    ///
    /// Results are ordered by similarity descending with a deterministic
    /// tie-break (document path, then chunk index), so repeated searches
    /// over the same index return identical orderings.
    pub fn search(&self, query_vec: &[f32], k: usize) -> Vec<(&Chunk, f32)> {
        let mut scored: Vec<(&Chunk, f32)> = self
            .entries
            .iter()
            .map(|e| (&e.chunk, cosine_similarity(query_vec, &e.embedding)))
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.document.cmp(&b.0.document))
                .then_with(|| a.0.chunk_index.cmp(&b.0.chunk_index))
        });
        scored.truncate(k);
        scored
    }

    /// Persist the index to `path` as a unit, replacing any previous index.
    pub async fn save(&self, path: &Path) -> Result<()> {
        // A save is a full rewrite; drop the old file first.
        if path.exists() {
            std::fs::remove_file(path)?;
        }

        let pool = db::connect(path, true).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS index_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chunks (
                id TEXT PRIMARY KEY,
                document TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                start_offset INTEGER NOT NULL,
                text TEXT NOT NULL,
                hash TEXT NOT NULL,
                embedding BLOB NOT NULL,
                UNIQUE(document, chunk_index)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let mut tx = pool.begin().await?;

        for (key, value) in [
            ("model", self.model.clone()),
            ("dims", self.dims.to_string()),
            ("built_at", chrono::Utc::now().timestamp().to_string()),
            ("entries", self.entries.len().to_string()),
        ] {
            sqlx::query("INSERT INTO index_meta (key, value) VALUES (?, ?)")
                .bind(key)
                .bind(value)
                .execute(&mut *tx)
                .await?;
        }

        for entry in &self.entries {
            sqlx::query(
                r#"
                INSERT INTO chunks (id, document, chunk_index, start_offset, text, hash, embedding)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&entry.chunk.id)
            .bind(&entry.chunk.document)
            .bind(entry.chunk.chunk_index)
            .bind(entry.chunk.offset as i64)
            .bind(&entry.chunk.text)
            .bind(&entry.chunk.hash)
            .bind(vec_to_blob(&entry.embedding))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        pool.close().await;
        Ok(())
    }

    /// Load a persisted index wholesale into memory.
    ///
    /// Fails with [`IndexError::NotFound`] when nothing exists at `path`
    /// and [`IndexError::Corrupt`] when the stored format cannot be parsed.
    pub async fn load(path: &Path) -> Result<Self, IndexError> {
        if !path.exists() {
            return Err(IndexError::NotFound(path.display().to_string()));
        }

        let corrupt = |e: &dyn std::fmt::Display| IndexError::Corrupt(e.to_string());

        let pool = db::connect(path, false)
            .await
            .map_err(|e| corrupt(&e))?;

        let meta_rows = sqlx::query("SELECT key, value FROM index_meta")
            .fetch_all(&pool)
            .await
            .map_err(|e| corrupt(&e))?;

        let mut model = None;
        let mut dims = None;
        for row in &meta_rows {
            let key: String = row.get("key");
            let value: String = row.get("value");
            match key.as_str() {
                "model" => model = Some(value),
                "dims" => {
                    dims = Some(value.parse::<usize>().map_err(|e| corrupt(&e))?);
                }
                _ => {}
            }
        }
        let model = model.ok_or_else(|| IndexError::Corrupt("missing model metadata".into()))?;
        let dims = dims.ok_or_else(|| IndexError::Corrupt("missing dims metadata".into()))?;

        let rows = sqlx::query(
            "SELECT id, document, chunk_index, start_offset, text, hash, embedding \
             FROM chunks ORDER BY document, chunk_index",
        )
        .fetch_all(&pool)
        .await
        .map_err(|e| corrupt(&e))?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in &rows {
            let blob: Vec<u8> = row.get("embedding");
            if blob.len() % 4 != 0 || (dims > 0 && blob.len() != dims * 4) {
                pool.close().await;
                return Err(IndexError::Corrupt(format!(
                    "embedding blob has {} bytes, expected {}",
                    blob.len(),
                    dims * 4
                )));
            }
            let offset: i64 = row.get("start_offset");
            entries.push(IndexEntry {
                chunk: Chunk {
                    id: row.get("id"),
                    document: row.get("document"),
                    chunk_index: row.get("chunk_index"),
                    offset: offset as usize,
                    text: row.get("text"),
                    hash: row.get("hash"),
                },
                embedding: blob_to_vec(&blob),
            });
        }

        pool.close().await;
        Ok(Self {
            entries,
            model,
            dims,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::BTreeSet;

    /// Deterministic test embedder: maps each text to a fixed 4-dim vector
    /// derived from its bytes.
    struct TestEmbedder;

    #[async_trait]
    impl EmbeddingProvider for TestEmbedder {
        fn model_name(&self) -> &str {
            "test-embedder"
        }

        fn dims(&self) -> usize {
            4
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|t| {
                    let sum: u32 = t.bytes().map(u32::from).sum();
                    vec![
                        t.len() as f32,
                        (sum % 97) as f32,
                        (sum % 13) as f32,
                        1.0,
                    ]
                })
                .collect())
        }
    }

    fn chunk(document: &str, index: i64, text: &str) -> Chunk {
        Chunk {
            id: format!("{}-{}", document, index),
            document: document.to_string(),
            chunk_index: index,
            offset: (index as usize) * 10,
            text: text.to_string(),
            hash: format!("hash-{}", index),
        }
    }

    async fn build_test_index() -> VectorIndex {
        let chunks = vec![
            chunk("a.pdf", 0, "Rent is tax deductible under Section X."),
            chunk("a.pdf", 1, "Medical expenses are partially deductible."),
            chunk("b.pdf", 0, "Capital gains are taxed at a flat rate."),
        ];
        VectorIndex::build(chunks, &TestEmbedder, 2).await.unwrap()
    }

    #[tokio::test]
    async fn build_pairs_every_chunk_with_an_embedding() {
        let index = build_test_index().await;
        assert_eq!(index.len(), 3);
        assert_eq!(index.dims(), 4);
        for entry in index.entries() {
            assert_eq!(entry.embedding.len(), 4);
        }
    }

    #[tokio::test]
    async fn save_load_roundtrip_preserves_pairs() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("index.sqlite");

        let index = build_test_index().await;
        index.save(&path).await.unwrap();
        let loaded = VectorIndex::load(&path).await.unwrap();

        assert_eq!(loaded.model_name(), "test-embedder");
        assert_eq!(loaded.dims(), 4);

        let as_pairs = |ix: &VectorIndex| -> BTreeSet<(String, Vec<u8>)> {
            ix.entries()
                .iter()
                .map(|e| (e.chunk.text.clone(), vec_to_blob(&e.embedding)))
                .collect()
        };
        assert_eq!(as_pairs(&index), as_pairs(&loaded));
    }

    #[tokio::test]
    async fn save_replaces_previous_index() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("index.sqlite");

        build_test_index().await.save(&path).await.unwrap();

        let smaller = VectorIndex::build(
            vec![chunk("c.pdf", 0, "Only one chunk now.")],
            &TestEmbedder,
            8,
        )
        .await
        .unwrap();
        smaller.save(&path).await.unwrap();

        let loaded = VectorIndex::load(&path).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.entries()[0].chunk.document, "c.pdf");
    }

    #[tokio::test]
    async fn load_missing_index_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let err = VectorIndex::load(&tmp.path().join("absent.sqlite"))
            .await
            .unwrap_err();
        assert!(matches!(err, IndexError::NotFound(_)));
    }

    #[tokio::test]
    async fn load_garbage_file_is_corrupt() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("index.sqlite");
        std::fs::write(&path, b"this is not a sqlite database at all").unwrap();

        let err = VectorIndex::load(&path).await.unwrap_err();
        assert!(matches!(err, IndexError::Corrupt(_)));
    }

    #[tokio::test]
    async fn search_orders_by_similarity_then_deterministic_tiebreak() {
        let index = build_test_index().await;
        let query = index.entries()[0].embedding.clone();

        let first = index.search(&query, 3);
        let second = index.search(&query, 3);

        assert_eq!(first.len(), 3);
        for pair in first.windows(2) {
            assert!(pair[0].1 >= pair[1].1);
        }
        let ids = |r: &[(&Chunk, f32)]| r.iter().map(|(c, _)| c.id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(&first), ids(&second));
    }

    #[tokio::test]
    async fn search_truncates_to_k() {
        let index = build_test_index().await;
        let query = vec![1.0, 1.0, 1.0, 1.0];
        assert_eq!(index.search(&query, 2).len(), 2);
        assert!(VectorIndex::empty().search(&query, 5).is_empty());
    }
}
