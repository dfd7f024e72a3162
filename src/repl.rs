//! Interactive read-print loop.
//!
//! Feeds stdin lines to the answering engine and prints the answer with
//! its provenance tag. The whole session owns one conversation memory.

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::config::Config;
use crate::engine::AnsweringEngine;
use crate::memory::ConversationMemory;

pub async fn run_chat(config: &Config) -> Result<()> {
    let engine = AnsweringEngine::from_config(config).await?;
    if engine.is_fallback_only() {
        println!("warning: no usable index; answers will come from the fallback model only");
    }

    let mut memory = ConversationMemory::new(config.memory.max_tokens);

    println!("Tax chatbot ready. Type 'exit' to stop.");

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    let mut stdout = tokio::io::stdout();

    loop {
        stdout.write_all(b"You: ").await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let query = line.trim();

        if query.eq_ignore_ascii_case("exit") {
            println!("Goodbye.");
            break;
        }
        if query.is_empty() {
            continue;
        }

        let answer = engine.answer(query, &mut memory).await;
        println!("Bot [{}]: {}", answer.provenance(), answer.text());
    }

    Ok(())
}
