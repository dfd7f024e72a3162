//! Core data models used throughout the answering engine.
//!
//! These types represent the documents, chunks, conversation turns, and
//! answers that flow through the indexing and question-answering pipeline.

/// A raw document loaded from the corpus, before chunking.
///
/// Documents are transient: they exist between the corpus scan and the
/// chunking step and are not persisted as their own entity.
#[derive(Debug, Clone)]
pub struct Document {
    /// Source path relative to the corpus root.
    pub path: String,
    /// Full extracted text of the document.
    pub text: String,
}

/// A bounded, contiguous segment of a document's text.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub id: String,
    /// Source document path.
    pub document: String,
    pub chunk_index: i64,
    /// Byte offset of the chunk's start within the source document.
    pub offset: usize,
    pub text: String,
    /// SHA-256 hash of the chunk text.
    pub hash: String,
}

/// One question/answer exchange retained in conversation memory.
#[derive(Debug, Clone)]
pub struct ConversationTurn {
    pub question: String,
    pub answer: String,
}

impl ConversationTurn {
    pub fn new(question: impl Into<String>, answer: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            answer: answer.into(),
        }
    }
}

/// Reference back to a retrieved source chunk, kept alongside grounded answers.
#[derive(Debug, Clone)]
pub struct SourceRef {
    pub document: String,
    pub chunk_index: i64,
    pub score: f32,
}

/// The label inserted between the grounded and supplemental sections of a
/// hybrid answer.
pub const SUPPLEMENTAL_LABEL: &str = "Additional information:";

/// Result of answering a single query.
///
/// Grounded answers carry provenance back to the retrieved chunks; hybrid
/// answers augment a partial grounded answer with fallback-model text;
/// fallback answers have no retrieval grounding at all.
#[derive(Debug, Clone)]
pub enum Answer {
    Grounded { text: String, sources: Vec<SourceRef> },
    Hybrid { grounded: String, supplemental: String },
    Fallback { text: String },
    Error { message: String },
}

impl Answer {
    /// The user-visible answer text. Hybrid answers concatenate the grounded
    /// text with a labeled supplemental section.
    pub fn text(&self) -> String {
        match self {
            Answer::Grounded { text, .. } => text.clone(),
            Answer::Hybrid {
                grounded,
                supplemental,
            } => format!("{}\n\n{}\n{}", grounded, SUPPLEMENTAL_LABEL, supplemental),
            Answer::Fallback { text } => text.clone(),
            Answer::Error { message } => message.clone(),
        }
    }

    /// Provenance tag exposed at the caller boundary.
    pub fn provenance(&self) -> &'static str {
        match self {
            Answer::Grounded { .. } => "retrieved",
            Answer::Hybrid { .. } => "hybrid",
            Answer::Fallback { .. } => "fallback",
            Answer::Error { .. } => "error",
        }
    }
}
