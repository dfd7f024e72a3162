//! # taxqa
//!
//! A hybrid retrieval-augmented answering engine for tax documents.
//!
//! taxqa answers natural-language questions about a fixed corpus of tax
//! PDFs by combining a local similarity-search retriever with a hosted
//! large-language-model fallback, producing a grounded answer, a hybrid
//! (grounded + supplemented) answer, or a pure-model answer when retrieval
//! is unavailable or insufficient.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌─────────────┐   ┌───────────┐
//! │  Corpus  │──▶│ Chunk+Embed │──▶│  SQLite   │   (build time, once)
//! │  (PDFs)  │   │   pipeline  │   │   index   │
//! └──────────┘   └─────────────┘   └─────┬─────┘
//!                                        │ load wholesale
//!                                        ▼
//!                ┌───────────┐    ┌─────────────┐    ┌──────────────┐
//!   question ──▶ │ Retriever │──▶ │  Answering  │──▶ │ answer text  │
//!                └───────────┘    │   Engine    │    │ + provenance │
//!                                 └──────┬──────┘    └──────────────┘
//!                                        │ insufficient / empty
//!                                        ▼
//!                                 ┌─────────────┐
//!                                 │ Fallback LLM│ (retry + backoff)
//!                                 └─────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`corpus`] | PDF corpus scanning and text extraction |
//! | [`chunk`] | Fixed-size overlapping text chunking |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`index`] | Vector index build, persistence, and search |
//! | [`retriever`] | Top-k similarity retrieval |
//! | [`memory`] | Bounded conversation memory |
//! | [`llm`] | Chat-model clients and retry/backoff controller |
//! | [`engine`] | Answering state machine |
//! | [`server`] | HTTP question-answering endpoint |
//! | [`repl`] | Interactive chat loop |
//! | [`expense`] | Receipt-image field extraction |

pub mod chunk;
pub mod config;
pub mod corpus;
pub mod db;
pub mod embedding;
pub mod engine;
pub mod expense;
pub mod index;
pub mod index_cmd;
pub mod llm;
pub mod memory;
pub mod models;
pub mod repl;
pub mod retriever;
pub mod server;
