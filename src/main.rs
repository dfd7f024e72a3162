//! # taxqa CLI
//!
//! The `taxqa` binary answers natural-language questions about a corpus of
//! tax PDFs, grounding answers in retrieved document chunks and falling
//! back to a hosted model when retrieval comes up short.
//!
//! ## Usage
//!
//! ```bash
//! taxqa --config ./config/taxqa.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `taxqa index` | Build the vector index from the PDF corpus |
//! | `taxqa ask "<question>"` | Answer a single question |
//! | `taxqa chat` | Interactive chat session with conversation memory |
//! | `taxqa serve` | Start the HTTP question-answering endpoint |
//! | `taxqa extract-expense` | Extract receipt fields from a base64 image on stdin |
//!
//! ## Examples
//!
//! ```bash
//! # Build the index (one-time, repeat after corpus changes)
//! taxqa index --config ./config/taxqa.toml
//!
//! # One-shot question
//! taxqa ask "Is rent tax deductible?" --config ./config/taxqa.toml
//!
//! # Interactive session
//! taxqa chat --config ./config/taxqa.toml
//!
//! # HTTP endpoint
//! taxqa serve --config ./config/taxqa.toml
//!
//! # Receipt extraction
//! base64 receipt.jpg | taxqa extract-expense --config ./config/taxqa.toml
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use taxqa::config;
use taxqa::engine::AnsweringEngine;
use taxqa::expense;
use taxqa::index_cmd;
use taxqa::memory::ConversationMemory;
use taxqa::repl;
use taxqa::server;

/// taxqa — a hybrid retrieval-augmented answering engine for tax documents.
#[derive(Parser)]
#[command(
    name = "taxqa",
    about = "taxqa — a hybrid retrieval-augmented answering engine for tax documents",
    version,
    long_about = "taxqa indexes a directory of tax PDFs into a vector index and answers \
    questions against it, supplementing or replacing retrieved answers with a hosted \
    fallback model when the documents come up short."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/taxqa.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Build the vector index from the PDF corpus.
    ///
    /// Scans the corpus directory, extracts text from each PDF, splits it
    /// into overlapping chunks, embeds every chunk, and persists the index.
    /// Replaces any previous index as a unit.
    Index,

    /// Answer a single question and print the answer with its provenance.
    Ask {
        /// The question to answer.
        question: String,
    },

    /// Start an interactive chat session.
    ///
    /// Maintains bounded conversation memory across turns. Type `exit`
    /// to quit.
    Chat,

    /// Start the HTTP question-answering endpoint.
    ///
    /// Serves `POST /ask` and `GET /health` on the configured bind address.
    Serve,

    /// Extract structured fields from a receipt or bill image.
    ///
    /// Reads a base64-encoded image from stdin and prints a single JSON
    /// object with the extracted fields, or `{"error": ...}` on failure.
    ExtractExpense,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Index => {
            index_cmd::run_index(&cfg).await?;
        }
        Commands::Ask { question } => {
            let engine = AnsweringEngine::from_config(&cfg).await?;
            let mut memory = ConversationMemory::new(cfg.memory.max_tokens);
            let answer = engine.answer(&question, &mut memory).await;
            println!("{}", answer.text());
            println!("[provenance: {}]", answer.provenance());
        }
        Commands::Chat => {
            repl::run_chat(&cfg).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::ExtractExpense => {
            expense::run_extract(&cfg).await?;
        }
    }

    Ok(())
}
