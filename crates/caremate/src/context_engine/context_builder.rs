//! Assembles bounded generation contexts from persona, the owner's long-term
//! memory, rolling summary and the un-summarized tail of a session.

use tracing::debug;

use super::budget::{estimate_turn, estimate_turns, truncate_from_start, truncate_to_fit, TURN_OVERHEAD};
use super::prompts::{MEMORY_PREFIX, REDACTED_MARKER, SUMMARY_PREFIX};
use crate::memory::Turn;
use crate::memory_db::{SafetyFlag, StoredMessage, Summary};

/// A context ready to hand to the backend router.
#[derive(Debug, Clone)]
pub struct AssembledContext {
    pub turns: Vec<Turn>,
    pub tokens: usize,
    /// How many tail messages made it in (newest first when counting).
    pub included_messages: usize,
    pub truncated_newest: bool,
}

/// Builds contexts that never exceed `budget` estimated tokens.
#[derive(Debug, Clone, Copy)]
pub struct ContextBuilder {
    budget: usize,
}

impl ContextBuilder {
    pub fn new(budget: usize) -> Self {
        Self { budget }
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    /// The turn a stored message contributes; withheld text never leaves the store.
    pub fn message_turn(message: &StoredMessage) -> Turn {
        if message.safety_flag == SafetyFlag::CrisisIntercepted {
            Turn::new(message.role, REDACTED_MARKER)
        } else {
            Turn::new(message.role, message.content.as_str())
        }
    }

    pub fn summary_turn(summary: &Summary) -> Turn {
        Turn::system(format!("{}\n{}", SUMMARY_PREFIX, summary.summary_text))
    }

    pub fn memory_turn(digest: &str) -> Turn {
        Turn::system(format!("{}\n{}", MEMORY_PREFIX, digest))
    }

    /// Size of persona, memory, summary and the whole tail with nothing dropped.
    pub fn full_size(
        &self,
        persona: &str,
        memory: Option<&str>,
        summary: Option<&Summary>,
        tail: &[StoredMessage],
    ) -> usize {
        let mut tokens = estimate_turn(&Turn::system(persona));
        if let Some(digest) = memory {
            tokens += estimate_turn(&Self::memory_turn(digest));
        }
        if let Some(summary) = summary {
            tokens += estimate_turn(&Self::summary_turn(summary));
        }
        tokens + tail.iter().map(|m| estimate_turn(&Self::message_turn(m))).sum::<usize>()
    }

    pub fn build(
        &self,
        persona: &str,
        summary: Option<&Summary>,
        tail: &[StoredMessage],
        trailing_instruction: Option<&str>,
    ) -> AssembledContext {
        self.build_with_memory(persona, None, summary, tail, trailing_instruction)
    }

    /// `[persona] + [memory] + [summary] + [longest fitting suffix of tail] + [instruction]`.
    ///
    /// The session summary claims room before the long-term memory. If even
    /// the newest message does not fit on its own, its oldest text is cut so
    /// that the most recent words still reach the model.
    pub fn build_with_memory(
        &self,
        persona: &str,
        memory: Option<&str>,
        summary: Option<&Summary>,
        tail: &[StoredMessage],
        trailing_instruction: Option<&str>,
    ) -> AssembledContext {
        let persona_turn = Turn::system(persona);
        let trailing_turn = trailing_instruction.map(Turn::system);

        let mut fixed = estimate_turn(&persona_turn)
            + trailing_turn.as_ref().map(estimate_turn).unwrap_or(0);

        let summary_turn = summary.and_then(|s| self.fit_system_turn(Self::summary_turn(s), fixed));
        fixed += summary_turn.as_ref().map(estimate_turn).unwrap_or(0);
        let memory_turn = memory.and_then(|d| self.fit_system_turn(Self::memory_turn(d), fixed));
        fixed += memory_turn.as_ref().map(estimate_turn).unwrap_or(0);

        let mut remaining = self.budget.saturating_sub(fixed);
        let mut selected: Vec<Turn> = Vec::new();
        let mut truncated_newest = false;

        for (position, message) in tail.iter().rev().enumerate() {
            let turn = Self::message_turn(message);
            let cost = estimate_turn(&turn);
            if cost <= remaining {
                remaining -= cost;
                selected.push(turn);
                continue;
            }
            if position == 0 && remaining > TURN_OVERHEAD {
                let kept = truncate_from_start(&turn.content, remaining - TURN_OVERHEAD);
                selected.push(Turn::new(turn.role, kept));
                truncated_newest = true;
            }
            break;
        }
        selected.reverse();

        let included_messages = selected.len();
        let mut turns = Vec::with_capacity(included_messages + 4);
        turns.push(persona_turn);
        turns.extend(memory_turn);
        turns.extend(summary_turn);
        turns.extend(selected);
        turns.extend(trailing_turn);

        let tokens = estimate_turns(&turns);
        debug!(
            "Assembled context: {} turns, {} of {} tail messages, {}/{} tokens",
            turns.len(),
            included_messages,
            tail.len(),
            tokens,
            self.budget
        );
        AssembledContext {
            turns,
            tokens,
            included_messages,
            truncated_newest,
        }
    }

    /// The turn as is, cut to the room left after `fixed`, or nothing.
    fn fit_system_turn(&self, turn: Turn, fixed: usize) -> Option<Turn> {
        let room = self.budget.saturating_sub(fixed + TURN_OVERHEAD);
        if estimate_turn(&turn) <= self.budget.saturating_sub(fixed) {
            Some(turn)
        } else if room > 0 {
            Some(Turn::system(truncate_to_fit(&turn.content, room)))
        } else {
            None
        }
    }
}
