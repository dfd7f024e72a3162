//! Index build pipeline: corpus scan → extraction → chunking → embedding →
//! persistence.
//!
//! This is a one-time batch operation; adding documents later means running
//! it again (the persisted index is replaced as a unit).

use anyhow::Result;

use crate::chunk;
use crate::config::Config;
use crate::corpus;
use crate::embedding;
use crate::index::VectorIndex;

pub async fn run_index(config: &Config) -> Result<()> {
    let documents = corpus::load_corpus(&config.corpus)?;
    println!("loaded {} documents from {}", documents.len(), config.corpus.dir.display());

    let mut chunks = Vec::new();
    for document in &documents {
        let mut doc_chunks = chunk::split(
            document,
            config.chunking.chunk_size,
            config.chunking.overlap,
        )?;
        chunks.append(&mut doc_chunks);
    }
    println!("split into {} chunks", chunks.len());

    let provider = embedding::create_provider(&config.embedding)?;
    let index = VectorIndex::build(chunks, provider.as_ref(), config.embedding.batch_size).await?;
    index.save(&config.index.path).await?;

    println!("index build");
    println!("  documents: {}", documents.len());
    println!("  chunks embedded: {}", index.len());
    println!("  model: {} ({} dims)", index.model_name(), index.dims());
    println!("  saved to: {}", config.index.path.display());
    println!("ok");

    Ok(())
}
