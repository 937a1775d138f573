//! Rolling summarizer.
//!
//! Folds a run of messages into the session's summary through the backend
//! router. Long runs are folded chunk by chunk, each prompt carrying the
//! summary so far, so no single summarizer prompt outgrows the context.

use std::sync::Arc;
use tracing::{debug, info};

use super::budget::{estimate_tokens, estimate_turn, estimate_turns, truncate_from_start, truncate_to_fit, TURN_OVERHEAD};
use super::context_builder::ContextBuilder;
use super::prompts::{SUMMARY_INSTRUCTION, SUMMARY_PREFIX};
use crate::config::Config;
use crate::error::{CareError, CareResult};
use crate::memory::{Role, Turn};
use crate::memory_db::{StoredMessage, Summary};
use crate::model_runtime::{BackendRouter, GenerationParams};

/// A folded summary that has not been stored yet.
#[derive(Debug, Clone)]
pub struct SummaryDraft {
    pub text: String,
    pub tokens: usize,
    pub first_message_id: i64,
    pub last_message_id: i64,
    /// Generation calls spent producing it.
    pub calls: usize,
}

pub struct Summarizer {
    router: Arc<BackendRouter>,
    max_context_length: usize,
    summary_max_tokens: usize,
    temperature: f32,
    top_p: f32,
}

impl Summarizer {
    pub fn new(router: Arc<BackendRouter>, max_context_length: usize, summary_max_tokens: u32) -> Self {
        Self {
            router,
            max_context_length,
            summary_max_tokens: summary_max_tokens as usize,
            temperature: 0.3,
            top_p: 0.85,
        }
    }

    pub fn from_config(router: Arc<BackendRouter>, cfg: &Config) -> Self {
        Self {
            top_p: cfg.top_p,
            ..Self::new(router, cfg.max_context_length, cfg.summary_max_tokens)
        }
    }

    /// Prompt room once the summary's own reply is reserved.
    pub fn prompt_budget(&self) -> usize {
        self.max_context_length.saturating_sub(self.summary_max_tokens)
    }

    /// Folds `messages` into `previous`, returning the replacement summary.
    pub async fn fold(&self, previous: Option<&Summary>, messages: &[StoredMessage]) -> CareResult<SummaryDraft> {
        let (first, last) = match (messages.first(), messages.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => return Err(CareError::SummarizationFailed("no messages to summarize".to_string())),
        };
        let first_message_id = previous.map(|s| s.first_message_id).unwrap_or(first.id);

        let room = self.transcript_room();
        if room == 0 {
            return Err(CareError::SummarizationFailed(
                "context too small to hold a summarizer prompt".to_string(),
            ));
        }
        let chunks = chunk_transcript(messages, room);
        info!(
            "Folding {} messages ({}..={}) into summary in {} chunk(s)",
            messages.len(),
            first.id,
            last.id,
            chunks.len()
        );

        let mut running = previous.map(|s| truncate_to_fit(&s.summary_text, self.summary_max_tokens).to_string());
        for (idx, chunk) in chunks.iter().enumerate() {
            let turns = self.prompt(running.as_deref(), chunk);
            debug_assert!(estimate_turns(&turns) <= self.prompt_budget());
            debug!("Summarizer chunk {} uses {} tokens", idx + 1, estimate_turns(&turns));

            let output = self
                .router
                .generate(turns, self.params())
                .await
                .map_err(|e| CareError::SummarizationFailed(format!("chunk {}: {}", idx + 1, e)))?;
            let output = output.trim();
            if output.is_empty() {
                return Err(CareError::SummarizationFailed(format!(
                    "chunk {}: engine returned an empty summary",
                    idx + 1
                )));
            }
            running = Some(truncate_to_fit(output, self.summary_max_tokens).to_string());
        }

        let text = running.unwrap_or_default();
        Ok(SummaryDraft {
            tokens: estimate_tokens(&text),
            text,
            first_message_id,
            last_message_id: last.id,
            calls: chunks.len(),
        })
    }

    fn params(&self) -> GenerationParams {
        GenerationParams {
            max_new_tokens: self.summary_max_tokens as u32,
            temperature: self.temperature,
            top_p: self.top_p,
            stop_sequences: Vec::new(),
        }
    }

    fn prompt(&self, running: Option<&str>, transcript: &str) -> Vec<Turn> {
        let mut turns = vec![Turn::system(SUMMARY_INSTRUCTION)];
        if let Some(running) = running {
            turns.push(Turn::system(format!("{}\n{}", SUMMARY_PREFIX, running)));
        }
        turns.push(Turn::user(transcript));
        turns
    }

    /// Transcript room per chunk, assuming the running summary is at its cap.
    fn transcript_room(&self) -> usize {
        let fixed = estimate_turn(&Turn::system(SUMMARY_INSTRUCTION))
            + estimate_tokens(SUMMARY_PREFIX)
            + 1
            + self.summary_max_tokens
            + TURN_OVERHEAD
            + TURN_OVERHEAD;
        self.prompt_budget().saturating_sub(fixed)
    }
}

fn speaker(role: Role) -> &'static str {
    match role {
        Role::User => "User",
        Role::Assistant => "CareMate",
        Role::System => "Note",
    }
}

/// Splits the transcript greedily into pieces of at most `room` tokens.
/// A single line too long for a chunk keeps only its most recent part.
fn chunk_transcript(messages: &[StoredMessage], room: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();

    for message in messages {
        let turn = ContextBuilder::message_turn(message);
        let line = format!("{}: {}", speaker(turn.role), turn.content);

        if !current.is_empty() {
            let candidate = format!("{}\n{}", current, line);
            if estimate_tokens(&candidate) <= room {
                current = candidate;
                continue;
            }
            chunks.push(std::mem::take(&mut current));
        }
        current = truncate_from_start(&line, room).to_string();
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_db::SafetyFlag;
    use crate::test_support::{replying, scripted_router};
    use chrono::Utc;

    fn message(id: i64, role: Role, content: &str, flag: SafetyFlag) -> StoredMessage {
        StoredMessage {
            id,
            session_id: "s".to_string(),
            message_index: id,
            role,
            content: content.to_string(),
            tokens: 0,
            safety_flag: flag,
            timestamp: Utc::now(),
        }
    }

    fn previous_summary(text: &str) -> Summary {
        Summary {
            id: 7,
            session_id: "s".to_string(),
            summary_text: text.to_string(),
            first_message_id: 1,
            last_message_id: 4,
            tokens: 0,
            ruleset_version: "v1".to_string(),
            is_current: true,
            generated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_single_chunk_fold_extends_previous_range() {
        let (router, recorder) = scripted_router(replying("User walked in the park and felt better."));
        let summarizer = Summarizer::new(router, 2048, 200);
        let messages = vec![
            message(5, Role::User, "I walked in the park", SafetyFlag::None),
            message(6, Role::Assistant, "That sounds lovely", SafetyFlag::None),
        ];

        let draft = summarizer
            .fold(Some(&previous_summary("User had a hard week.")), &messages)
            .await
            .unwrap();

        assert_eq!(draft.first_message_id, 1);
        assert_eq!(draft.last_message_id, 6);
        assert_eq!(draft.calls, 1);
        assert!(draft.text.contains("park"));

        let requests = recorder.requests();
        let prompt = &requests[0].turns;
        assert!(prompt[1].content.contains("hard week"));
        assert!(prompt[2].content.contains("CareMate: That sounds lovely"));
        assert_eq!(requests[0].params.max_new_tokens, 200);
    }

    #[tokio::test]
    async fn test_long_runs_are_folded_in_chunks_within_budget() {
        let (router, recorder) = scripted_router(replying("rolling summary"));
        let summarizer = Summarizer::new(router, 512, 64);
        let messages: Vec<_> = (1..=30)
            .map(|i| message(i, Role::User, &"I talked about my garden again ".repeat(4), SafetyFlag::None))
            .collect();

        let draft = summarizer.fold(None, &messages).await.unwrap();

        assert!(draft.calls > 1);
        assert_eq!(recorder.calls(), draft.calls);
        for request in recorder.requests() {
            assert!(estimate_turns(&request.turns) <= summarizer.prompt_budget());
        }
        // Later chunks carry the summary produced so far.
        assert!(recorder.requests()[1].turns[1].content.contains("rolling summary"));
    }

    #[tokio::test]
    async fn test_crisis_text_never_reaches_the_summarizer() {
        let (router, recorder) = scripted_router(replying("summary"));
        let summarizer = Summarizer::new(router, 2048, 200);
        let messages = vec![
            message(1, Role::User, "I want to end it all", SafetyFlag::CrisisIntercepted),
            message(2, Role::User, "I am calmer now", SafetyFlag::None),
        ];
        summarizer.fold(None, &messages).await.unwrap();
        let transcript = &recorder.requests()[0].turns[1].content;
        assert!(!transcript.contains("end it all"));
        assert!(transcript.contains("calmer"));
    }

    #[tokio::test]
    async fn test_output_is_capped() {
        let (router, _) = scripted_router(Arc::new(|_| Ok("word ".repeat(500))));
        let summarizer = Summarizer::new(router, 2048, 50);
        let messages = vec![message(1, Role::User, "hello", SafetyFlag::None)];
        let draft = summarizer.fold(None, &messages).await.unwrap();
        assert!(draft.tokens <= 50);
    }

    #[tokio::test]
    async fn test_empty_output_and_engine_errors_fail() {
        let messages = vec![message(1, Role::User, "hello", SafetyFlag::None)];

        let (router, _) = scripted_router(replying("   "));
        let err = Summarizer::new(router, 2048, 200).fold(None, &messages).await.unwrap_err();
        assert_eq!(err.category(), "summarization_failed");

        let (router, _) = scripted_router(Arc::new(|_| Err(anyhow::anyhow!("engine crashed"))));
        let err = Summarizer::new(router, 2048, 200).fold(None, &messages).await.unwrap_err();
        assert_eq!(err.category(), "summarization_failed");
        assert!(!err.to_string().contains("engine crashed"));
    }

    #[tokio::test]
    async fn test_nothing_to_fold() {
        let (router, _) = scripted_router(replying("x"));
        let err = Summarizer::new(router, 2048, 200).fold(None, &[]).await.unwrap_err();
        assert!(matches!(err, CareError::SummarizationFailed(_)));
    }

    #[test]
    fn test_oversized_line_keeps_latest_words() {
        let messages = vec![message(1, Role::User, &format!("{} tail words", "a".repeat(4000)), SafetyFlag::None)];
        let chunks = chunk_transcript(&messages, 20);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].ends_with("tail words"));
        assert!(estimate_tokens(&chunks[0]) <= 20);
    }
}
