//! Fixed-size overlapping text chunker.
//!
//! Splits document text into [`Chunk`]s of at most `chunk_size` characters,
//! where consecutive chunks from the same document share `overlap` characters.
//! The overlap means no information sitting on a chunk boundary is lost
//! entirely to one side.
//!
//! Each chunk receives a UUID, the byte offset of its start within the
//! document, and a SHA-256 hash of its text.

use anyhow::{bail, Result};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::{Chunk, Document};

/// Split a document into overlapping chunks.
///
/// `chunk_size` and `overlap` are measured in characters; boundaries never
/// split a UTF-8 code point. Requires `overlap < chunk_size`. Chunks cover
/// the full document with no gaps; the last chunk may be shorter than
/// `chunk_size`. Splitting is deterministic.
pub fn split(document: &Document, chunk_size: usize, overlap: usize) -> Result<Vec<Chunk>> {
    if chunk_size == 0 {
        bail!("chunk_size must be > 0");
    }
    if overlap >= chunk_size {
        bail!(
            "overlap ({}) must be smaller than chunk_size ({})",
            overlap,
            chunk_size
        );
    }

    let text = &document.text;
    if text.is_empty() {
        return Ok(Vec::new());
    }

    // Byte offset of every char boundary, plus the end of the text.
    let bounds: Vec<usize> = text
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .collect();
    let n_chars = bounds.len() - 1;

    let step = chunk_size - overlap;
    let mut chunks = Vec::new();
    let mut start = 0usize;
    let mut index: i64 = 0;

    while start < n_chars {
        let end = (start + chunk_size).min(n_chars);
        let byte_start = bounds[start];
        let byte_end = bounds[end];

        chunks.push(make_chunk(
            &document.path,
            index,
            byte_start,
            &text[byte_start..byte_end],
        ));
        index += 1;

        if end == n_chars {
            break;
        }
        start += step;
    }

    Ok(chunks)
}

fn make_chunk(document: &str, index: i64, offset: usize, text: &str) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Chunk {
        id: Uuid::new_v4().to_string(),
        document: document.to_string(),
        chunk_index: index,
        offset,
        text: text.to_string(),
        hash,
    }
}
