//! The answering engine: sufficiency evaluation and hybrid composition.
//!
//! Each query walks a small state machine. Retrieval first; an empty or
//! content-free result falls straight through to the fallback model. A
//! grounded generation whose text admits it cannot answer from the provided
//! context (detected by substring markers) is hybridized with a fallback
//! completion. Whatever path is taken, the caller always receives an
//! answer, and the turn is recorded in conversation memory.
//!
//! Grounded answers are preferred for their provenance; the hybrid and
//! fallback paths trade provenance for availability.

use anyhow::Result;
use std::sync::Arc;

use crate::config::Config;
use crate::embedding;
use crate::index::VectorIndex;
use crate::llm::{self, ChatModel, RetryPolicy};
use crate::memory::ConversationMemory;
use crate::models::{Answer, ConversationTurn, SourceRef};
use crate::retriever::{Retriever, ScoredChunk};

/// Markers in a grounded answer that flag insufficient retrieval context.
///
/// Substring match, case-insensitive. A heuristic kept for compatibility:
/// no numeric confidence score is available from the underlying model.
pub const INSUFFICIENT_CONTEXT_MARKERS: &[&str] = &["not mention", "does not contain"];

/// Check a grounded answer for insufficient-context markers.
pub fn is_insufficient(text: &str) -> bool {
    let lowered = text.to_lowercase();
    INSUFFICIENT_CONTEXT_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
}

pub struct AnsweringEngine {
    /// `None` means fallback-only operation (index unavailable but the
    /// configuration allows degraded start-up).
    retriever: Option<Retriever>,
    chat: Arc<dyn ChatModel>,
    policy: RetryPolicy,
    top_k: usize,
}

impl AnsweringEngine {
    /// Construct an engine from injected collaborators.
    pub fn new(
        retriever: Option<Retriever>,
        chat: Arc<dyn ChatModel>,
        policy: RetryPolicy,
        top_k: usize,
    ) -> Self {
        Self {
            retriever,
            chat,
            policy,
            top_k,
        }
    }

    /// Assemble an engine from configuration: load the persisted index,
    /// create the embedding provider and chat model.
    ///
    /// A missing or corrupt index is fatal unless
    /// `llm.on_missing_index = "fallback-only"`, in which case the engine
    /// starts without a retriever and answers everything through the
    /// fallback model.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let chat = llm::create_chat_model(&config.llm)?;
        let policy = RetryPolicy::from_config(&config.llm);

        let retriever = match VectorIndex::load(&config.index.path).await {
            Ok(index) => {
                let provider = embedding::create_provider(&config.embedding)?;
                Some(Retriever::new(Arc::new(index), provider))
            }
            Err(e) => {
                if config.llm.fallback_only_allowed() {
                    tracing::warn!("{}; running in fallback-only mode", e);
                    None
                } else {
                    return Err(anyhow::anyhow!(
                        "{} (run `taxqa index` first, or set llm.on_missing_index = \"fallback-only\")",
                        e
                    ));
                }
            }
        };

        Ok(Self::new(retriever, chat, policy, config.retrieval.top_k))
    }

    pub fn is_fallback_only(&self) -> bool {
        self.retriever.is_none()
    }

    /// Answer a single query, updating conversation memory.
    pub async fn answer(&self, query: &str, memory: &mut ConversationMemory) -> Answer {
        if query.trim().is_empty() {
            return Answer::Error {
                message: "Please enter a question.".to_string(),
            };
        }

        let retrieved = self.retrieve(query).await;

        let answer = if retrieved.is_empty() {
            self.fallback_only(query).await
        } else {
            self.grounded(query, &retrieved, memory).await
        };

        memory.append(ConversationTurn::new(query, answer.text()));
        answer
    }

    /// Retrieve, absorbing failures into the empty result: a retrieval
    /// error degrades to the fallback path rather than surfacing.
    async fn retrieve(&self, query: &str) -> Vec<ScoredChunk> {
        let Some(retriever) = &self.retriever else {
            return Vec::new();
        };
        match retriever.retrieve(query, self.top_k).await {
            Ok(results) => results,
            Err(e) => {
                tracing::warn!("retrieval failed: {}; falling back", e);
                Vec::new()
            }
        }
    }

    async fn grounded(
        &self,
        query: &str,
        retrieved: &[ScoredChunk],
        memory: &ConversationMemory,
    ) -> Answer {
        let prompt = build_grounded_prompt(query, retrieved, memory);

        let grounded_text =
            match llm::generate_with_retry(self.chat.as_ref(), &prompt, &self.policy).await {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!("grounded generation failed: {}; falling back", e);
                    return self.fallback_only(query).await;
                }
            };

        if is_insufficient(&grounded_text) {
            let supplemental =
                llm::generate_lenient(self.chat.as_ref(), query, &self.policy).await;
            return Answer::Hybrid {
                grounded: grounded_text,
                supplemental,
            };
        }

        let sources = retrieved
            .iter()
            .map(|s| SourceRef {
                document: s.chunk.document.clone(),
                chunk_index: s.chunk.chunk_index,
                score: s.score,
            })
            .collect();

        Answer::Grounded {
            text: grounded_text,
            sources,
        }
    }

    async fn fallback_only(&self, query: &str) -> Answer {
        let text = llm::generate_lenient(self.chat.as_ref(), query, &self.policy).await;
        Answer::Fallback { text }
    }
}

/// Build the context-conditioned prompt for grounded generation.
///
/// The instruction to state plainly when the documents do not contain the
/// answer is what makes the insufficiency markers fire reliably.
fn build_grounded_prompt(
    query: &str,
    retrieved: &[ScoredChunk],
    memory: &ConversationMemory,
) -> String {
    let mut prompt = String::from(
        "You are a tax assistant. Answer the question using only the excerpts below. \
         If the excerpts do not contain the answer, say that the documents do not \
         contain that information.\n",
    );

    if !memory.is_empty() {
        prompt.push_str("\nConversation so far:\n");
        for turn in memory.history() {
            prompt.push_str("User: ");
            prompt.push_str(&turn.question);
            prompt.push_str("\nAssistant: ");
            prompt.push_str(&turn.answer);
            prompt.push('\n');
        }
    }

    prompt.push_str("\nExcerpts:\n");
    for scored in retrieved {
        prompt.push_str(&format!(
            "[{} #{}]\n{}\n\n",
            scored.chunk.document, scored.chunk.chunk_index, scored.chunk.text
        ));
    }

    prompt.push_str("Question: ");
    prompt.push_str(query);
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::EmbeddingProvider;
    use crate::llm::{ChatModel, LlmError, UNAVAILABLE_MESSAGE};
    use crate::models::Chunk;
    use async_trait::async_trait;
    use std::time::Duration;

    struct UnitEmbedder;

    #[async_trait]
    impl EmbeddingProvider for UnitEmbedder {
        fn model_name(&self) -> &str {
            "unit"
        }

        fn dims(&self) -> usize {
            2
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    /// Chat model scripted per call site: grounded prompts (which embed the
    /// excerpt header) get `grounded_reply`; raw queries get `fallback_reply`.
    struct StubChat {
        grounded_reply: Result<String, ()>,
        fallback_reply: String,
    }

    impl StubChat {
        fn new(grounded_reply: Result<&str, ()>, fallback_reply: &str) -> Self {
            Self {
                grounded_reply: grounded_reply.map(String::from),
                fallback_reply: fallback_reply.to_string(),
            }
        }
    }

    #[async_trait]
    impl ChatModel for StubChat {
        fn model_name(&self) -> &str {
            "stub"
        }

        async fn generate(&self, prompt: &str) -> Result<String, LlmError> {
            if prompt.contains("Excerpts:") {
                self.grounded_reply
                    .clone()
                    .map_err(|_| LlmError::Api("grounded generation broke".into()))
            } else {
                Ok(self.fallback_reply.clone())
            }
        }
    }

    fn chunk(text: &str, index: i64) -> Chunk {
        Chunk {
            id: format!("c{}", index),
            document: "guide.pdf".to_string(),
            chunk_index: index,
            offset: 0,
            text: text.to_string(),
            hash: String::new(),
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
        }
    }

    async fn engine_with(chunks: Vec<Chunk>, chat: Arc<dyn ChatModel>) -> AnsweringEngine {
        let index = VectorIndex::build(chunks, &UnitEmbedder, 16).await.unwrap();
        let retriever = Retriever::new(Arc::new(index), Arc::new(UnitEmbedder));
        AnsweringEngine::new(Some(retriever), chat, policy(), 5)
    }

    #[tokio::test]
    async fn empty_index_always_falls_back() {
        let chat = Arc::new(StubChat::new(Ok("unused"), "France's capital is Paris."));
        let engine = engine_with(vec![], chat).await;
        let mut memory = ConversationMemory::new(500);

        let answer = engine.answer("What is the capital of France?", &mut memory).await;
        assert!(matches!(answer, Answer::Fallback { .. }));
        assert_eq!(answer.provenance(), "fallback");
        assert_eq!(answer.text(), "France's capital is Paris.");
    }

    #[tokio::test]
    async fn grounded_answer_carries_sources() {
        let chat = Arc::new(StubChat::new(
            Ok("Rent is tax deductible under Section X."),
            "unused",
        ));
        let engine = engine_with(
            vec![chunk("Rent is tax deductible under Section X.", 0)],
            chat,
        )
        .await;
        let mut memory = ConversationMemory::new(500);

        let answer = engine.answer("Is rent tax deductible?", &mut memory).await;
        assert_eq!(answer.provenance(), "retrieved");
        assert!(answer.text().contains("Section X"));
        match answer {
            Answer::Grounded { sources, .. } => {
                assert_eq!(sources.len(), 1);
                assert_eq!(sources[0].document, "guide.pdf");
            }
            other => panic!("expected grounded answer, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn insufficient_grounded_answer_is_hybridized() {
        let chat = Arc::new(StubChat::new(
            Ok("The documents does not contain information about France."),
            "Paris is the capital of France.",
        ));
        let engine = engine_with(vec![chunk("Tax rates for 2023.", 0)], chat).await;
        let mut memory = ConversationMemory::new(500);

        let answer = engine.answer("What is the capital of France?", &mut memory).await;
        assert_eq!(answer.provenance(), "hybrid");
        let text = answer.text();
        assert!(text.contains("does not contain"));
        assert!(text.contains("Paris is the capital"));
    }

    #[tokio::test]
    async fn grounded_failure_degrades_to_fallback() {
        let chat = Arc::new(StubChat::new(Err(()), "Fallback answer."));
        let engine = engine_with(vec![chunk("Some tax text.", 0)], chat).await;
        let mut memory = ConversationMemory::new(500);

        let answer = engine.answer("Anything?", &mut memory).await;
        assert!(matches!(answer, Answer::Fallback { .. }));
        assert_eq!(answer.text(), "Fallback answer.");
    }

    #[tokio::test]
    async fn answers_are_recorded_in_memory() {
        let chat = Arc::new(StubChat::new(Ok("Grounded reply."), "unused"));
        let engine = engine_with(vec![chunk("Relevant text.", 0)], chat).await;
        let mut memory = ConversationMemory::new(500);

        engine.answer("First question?", &mut memory).await;
        assert_eq!(memory.len(), 1);
        let turn = memory.history().next().unwrap();
        assert_eq!(turn.question, "First question?");
        assert_eq!(turn.answer, "Grounded reply.");
    }

    #[tokio::test]
    async fn empty_query_is_an_error_answer_and_not_recorded() {
        let chat = Arc::new(StubChat::new(Ok("unused"), "unused"));
        let engine = engine_with(vec![], chat).await;
        let mut memory = ConversationMemory::new(500);

        let answer = engine.answer("   ", &mut memory).await;
        assert!(matches!(answer, Answer::Error { .. }));
        assert!(memory.is_empty());
    }

    #[tokio::test]
    async fn fallback_only_engine_never_retrieves() {
        let chat = Arc::new(StubChat::new(Ok("unused"), "Model-only answer."));
        let engine = AnsweringEngine::new(None, chat, policy(), 5);
        assert!(engine.is_fallback_only());
        let mut memory = ConversationMemory::new(500);

        let answer = engine.answer("Is rent deductible?", &mut memory).await;
        assert_eq!(answer.provenance(), "fallback");
        assert_eq!(answer.text(), "Model-only answer.");
    }

    #[tokio::test]
    async fn rate_limited_fallback_yields_unavailable_message() {
        struct RateLimitedChat;

        #[async_trait]
        impl ChatModel for RateLimitedChat {
            fn model_name(&self) -> &str {
                "limited"
            }

            async fn generate(&self, _prompt: &str) -> Result<String, LlmError> {
                Err(LlmError::RateLimited("429".into()))
            }
        }

        let engine = AnsweringEngine::new(None, Arc::new(RateLimitedChat), policy(), 5);
        let mut memory = ConversationMemory::new(500);
        let answer = engine.answer("Anything?", &mut memory).await;
        assert_eq!(answer.text(), UNAVAILABLE_MESSAGE);
    }

    #[test]
    fn insufficiency_markers_match_case_insensitively() {
        assert!(is_insufficient("The text Does Not Contain the answer."));
        assert!(is_insufficient("The excerpts do NOT MENTION rent."));
        assert!(!is_insufficient("Rent is deductible under Section X."));
    }
}
