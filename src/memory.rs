//! Bounded conversation memory.
//!
//! Retains an ordered log of prior question/answer turns, truncated by an
//! approximate token budget. Eviction is FIFO: once the cumulative size
//! exceeds the budget, the oldest turns are dropped. The most recent turn
//! is always retained, even when it alone exceeds the budget.

use std::collections::VecDeque;

use crate::models::ConversationTurn;

/// Approximate chars-per-token ratio used for the budget estimate.
const CHARS_PER_TOKEN: usize = 4;

#[derive(Debug)]
pub struct ConversationMemory {
    turns: VecDeque<ConversationTurn>,
    max_tokens: usize,
}

impl ConversationMemory {
    pub fn new(max_tokens: usize) -> Self {
        Self {
            turns: VecDeque::new(),
            max_tokens,
        }
    }

    /// Append a turn, then evict oldest turns until the budget holds.
    pub fn append(&mut self, turn: ConversationTurn) {
        self.turns.push_back(turn);
        while self.total_tokens() > self.max_tokens && self.turns.len() > 1 {
            self.turns.pop_front();
        }
    }

    /// Retained turns, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &ConversationTurn> {
        self.turns.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    fn total_tokens(&self) -> usize {
        self.turns.iter().map(approx_tokens).sum()
    }
}

fn approx_tokens(turn: &ConversationTurn) -> usize {
    (turn.question.len() + turn.answer.len()).div_ceil(CHARS_PER_TOKEN)
}
