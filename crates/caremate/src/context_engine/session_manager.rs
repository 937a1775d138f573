//! Session Manager
//!
//! Owns sessions and their message logs. Each turn runs under a per-session
//! async mutex: user text is checked by the safety filter, stored, folded
//! into the rolling summary when the tail outgrows the context, sent to the
//! backend router, and the reply is checked again before it is stored.
//!
//! Each owner also carries a long-term memory: a digest of their other
//! recent sessions, rebuilt when stale and shown ahead of the session summary.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::budget::{estimate_tokens, estimate_turn, TURN_OVERHEAD};
use super::context_builder::{AssembledContext, ContextBuilder};
use super::prompts::{TimeOfDay, DEFAULT_PERSONA, MEMORY_PREFIX, SUMMARY_PREFIX};
use super::summarizer::Summarizer;
use crate::config::Config;
use crate::error::{CareError, CareResult};
use crate::memory::{Role, Turn};
use crate::memory_db::*;
use crate::metrics;
use crate::model_runtime::{BackendRouter, GenerationParams};
use crate::safety::{sanitize_for_storage, SafetyFilter, SafetyVerdict};
use crate::utils::TextUtils;

const TITLE_MAX_CHARS: usize = 30;

/// Room left over for conversation turns once the fixed parts are in.
const MIN_TAIL_TOKENS: usize = 64;

/// Result of one user turn.
#[derive(Debug, Clone, Serialize)]
pub struct ChatExchange {
    pub user_message: StoredMessage,
    pub reply: StoredMessage,
    /// The reply is the fixed safety response.
    pub intercepted: bool,
}

/// A self-initiated message, as handed to scheduler subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct ProactiveDelivery {
    pub owner_id: String,
    pub session_id: String,
    pub message: StoredMessage,
    pub intercepted: bool,
}

pub struct SessionManager {
    db: Arc<MemoryDatabase>,
    router: Arc<BackendRouter>,
    safety: SafetyFilter,
    summarizer: Summarizer,
    builder: ContextBuilder,
    persona: String,
    params: GenerationParams,
    retention: Duration,
    memory_refresh: Duration,
    memory_max_messages: usize,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl SessionManager {
    pub fn new(db: Arc<MemoryDatabase>, router: Arc<BackendRouter>, cfg: &Config) -> CareResult<Self> {
        let safety = SafetyFilter::new(&cfg.safety_ruleset_version)?;
        let persona = cfg
            .persona_prompt
            .clone()
            .unwrap_or_else(|| DEFAULT_PERSONA.to_string());
        let budget = cfg.max_context_length.saturating_sub(cfg.max_new_tokens as usize);

        let longest_instruction = [TimeOfDay::Morning, TimeOfDay::Noon, TimeOfDay::Evening]
            .iter()
            .map(|t| estimate_turn(&Turn::system(t.check_in_instruction())))
            .max()
            .unwrap_or(0);
        // The summarizer caps both the session summary and the memory digest.
        let capped_turn = |prefix: &str| estimate_tokens(prefix) + 1 + cfg.summary_max_tokens as usize + TURN_OVERHEAD;
        let fixed = estimate_turn(&Turn::system(persona.as_str()))
            + capped_turn(SUMMARY_PREFIX)
            + capped_turn(MEMORY_PREFIX)
            + longest_instruction;
        if fixed + MIN_TAIL_TOKENS > budget {
            return Err(CareError::InvalidConfig(format!(
                "context of {} tokens leaves no room for conversation: persona, memory, summary \
                 and instructions need {} of the {} available after reserving the reply",
                cfg.max_context_length, fixed, budget
            )));
        }

        info!(
            "Session manager ready: prompt budget {} tokens, safety rules {}",
            budget,
            safety.ruleset_version()
        );
        Ok(Self {
            summarizer: Summarizer::from_config(Arc::clone(&router), cfg),
            db,
            router,
            safety,
            builder: ContextBuilder::new(budget),
            persona,
            params: GenerationParams {
                max_new_tokens: cfg.max_new_tokens,
                temperature: cfg.temperature,
                top_p: cfg.top_p,
                stop_sequences: Vec::new(),
            },
            retention: Duration::days(cfg.session_retention_days),
            memory_refresh: Duration::hours(cfg.memory_refresh_hours),
            memory_max_messages: cfg.memory_max_messages,
            locks: DashMap::new(),
        })
    }

    pub fn database(&self) -> &Arc<MemoryDatabase> {
        &self.db
    }

    pub fn safety(&self) -> &SafetyFilter {
        &self.safety
    }

    pub fn create_session(&self, owner_id: &str) -> CareResult<Session> {
        let owner_id = require_owner(owner_id)?;
        self.db.conversations.create_session(owner_id)
    }

    pub fn list_sessions(&self, owner_id: &str) -> CareResult<Vec<Session>> {
        self.db.conversations.list_sessions(owner_id)
    }

    pub fn get_history(&self, owner_id: &str, session_id: &str) -> CareResult<Vec<StoredMessage>> {
        self.owned_session(owner_id, session_id)?;
        self.db.conversations.get_messages(session_id)
    }

    pub fn list_summaries(&self, owner_id: &str) -> CareResult<Vec<Summary>> {
        self.db.summaries.list_current_for_owner(owner_id)
    }

    pub fn export_session(&self, owner_id: &str, session_id: &str) -> CareResult<SessionExport> {
        let session = self.owned_session(owner_id, session_id)?;
        Ok(SessionExport {
            messages: self.db.conversations.get_messages(session_id)?,
            summaries: self.db.summaries.list_for_session(session_id)?,
            session,
            exported_at: Utc::now(),
        })
    }

    /// Makes the session read-only. Waits for an in-flight turn to finish.
    pub async fn archive_session(&self, owner_id: &str, session_id: &str) -> CareResult<Session> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;
        let mut session = self.owned_session(owner_id, session_id)?;
        self.db.conversations.set_status(session_id, SessionStatus::Archived)?;
        session.status = SessionStatus::Archived;
        info!("Archived session {}", session_id);
        Ok(session)
    }

    pub async fn delete_session(&self, owner_id: &str, session_id: &str) -> CareResult<()> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;
        self.owned_session(owner_id, session_id)?;
        self.db.conversations.delete_session(session_id)?;
        self.locks.remove(session_id);
        info!("Deleted session {}", session_id);
        Ok(())
    }

    /// Deletes sessions idle for more than `days`; returns how many went.
    pub fn cleanup_old_sessions(&self, days: i64) -> CareResult<usize> {
        let cutoff = Utc::now() - Duration::days(days);
        let deleted = self.db.conversations.delete_inactive_since(cutoff)?;
        let forgotten = self.db.memories.delete_orphaned()?;
        if forgotten > 0 {
            debug!("Dropped long-term memory of {} owners without sessions", forgotten);
        }
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        Ok(deleted)
    }

    /// Most recent active session used within the retention window, or a new one.
    pub fn active_session_for(&self, owner_id: &str) -> CareResult<Session> {
        let owner_id = require_owner(owner_id)?;
        let since = Utc::now() - self.retention;
        match self.db.conversations.most_recent_active(owner_id, since)? {
            Some(session) => Ok(session),
            None => {
                debug!("No recent active session for {}, opening one", owner_id);
                self.db.conversations.create_session(owner_id)
            }
        }
    }

    /// Current context for a session, as the next generation would see it.
    pub fn assemble_context(&self, session_id: &str, trailing_instruction: Option<&str>) -> CareResult<AssembledContext> {
        let memory = self.memory_for_session(session_id)?;
        let summary = self.db.summaries.current(session_id)?;
        let after = summary.as_ref().map(|s| s.last_message_id).unwrap_or(0);
        let tail = self.db.conversations.get_messages_after(session_id, after)?;
        Ok(self.builder.build_with_memory(
            &self.persona,
            memory.as_ref().map(|m| m.digest.as_str()),
            summary.as_ref(),
            &tail,
            trailing_instruction,
        ))
    }

    /// The owner's long-term memory as last stored, if any.
    pub fn owner_memory(&self, owner_id: &str) -> CareResult<Option<OwnerMemory>> {
        self.db.memories.get(owner_id)
    }

    /// Rebuilds the owner's memory digest from their other recent sessions
    /// when it is missing or older than the refresh interval. `force` also
    /// rebuilds a fresh digest if newer messages exist, as when a session
    /// starts. Failures are logged and the previous digest is kept.
    pub async fn ensure_memory_fresh(&self, owner_id: &str, session_id: &str, force: bool) -> CareResult<()> {
        let now = Utc::now();
        let existing = self.db.memories.get(owner_id)?;
        let stale = existing
            .as_ref()
            .map_or(true, |m| now - m.refreshed_at >= self.memory_refresh);
        if !stale && !force {
            return Ok(());
        }

        let messages = self.db.conversations.recent_owner_messages(
            owner_id,
            session_id,
            now - self.retention,
            self.memory_max_messages,
        )?;
        let Some(newest) = messages.last().map(|m| m.id) else {
            return Ok(());
        };
        if existing.as_ref().is_some_and(|m| m.last_source_message_id >= newest) {
            debug!("Long-term memory for {} already covers message {}", owner_id, newest);
            return Ok(());
        }

        info!("Refreshing long-term memory for {} from {} messages", owner_id, messages.len());
        let draft = match self.summarizer.fold(None, &messages).await {
            Ok(draft) => draft,
            Err(e) => {
                warn!("Keeping previous long-term memory for {}: {}", owner_id, e);
                metrics::inc_summarization("memory_failed");
                return Ok(());
            }
        };
        if self.safety.evaluate(&draft.text, Role::Assistant).is_crisis() {
            warn!("Discarding long-term memory for {} that tripped the safety filter", owner_id);
            metrics::inc_summarization("memory_rejected");
            return Ok(());
        }

        self.db.memories.upsert(&OwnerMemory {
            owner_id: owner_id.to_string(),
            digest: draft.text,
            tokens: draft.tokens as i64,
            source_messages: messages.len() as i64,
            last_source_message_id: newest,
            ruleset_version: self.safety.ruleset_version().to_string(),
            refreshed_at: now,
        })?;
        metrics::inc_summarization("memory_ok");
        Ok(())
    }

    pub async fn send_message(&self, owner_id: &str, session_id: &str, text: &str) -> CareResult<ChatExchange> {
        let text = sanitize_for_storage(text);
        if text.trim().is_empty() {
            return Err(CareError::InvalidInput("message text is empty".to_string()));
        }

        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;
        let session = self.writable_session(owner_id, session_id)?;

        let verdict = self.safety.evaluate(&text, Role::User);
        let user_message = self.append(session_id, Role::User, &text, SafetyFlag::from_category(verdict.category))?;

        if verdict.is_crisis() {
            self.record_incident(session_id, Some(user_message.id), IncidentSite::UserInput, &verdict, None)?;
            let reply = self.append(
                session_id,
                Role::Assistant,
                self.safety.safety_response(),
                SafetyFlag::CrisisIntercepted,
            )?;
            warn!("Crisis input intercepted in session {}; no generation", session_id);
            return Ok(ChatExchange {
                user_message,
                reply,
                intercepted: true,
            });
        }
        self.derive_title(&session, &text)?;

        self.ensure_memory_fresh(&session.owner_id, session_id, user_message.message_index == 0)
            .await?;
        self.maybe_summarize(session_id, user_message.id).await?;
        let context = self.assemble_context(session_id, None)?;
        let raw = self.router.generate(context.turns, self.params.clone()).await?;
        let (reply, intercepted) = self.store_reply(session_id, &raw)?;
        self.maybe_summarize(session_id, reply.id).await?;

        Ok(ChatExchange {
            user_message,
            reply,
            intercepted,
        })
    }

    /// Generates and stores a check-in for the owner's active session.
    ///
    /// The session is picked again once its lock is held: one archived or
    /// deleted while we waited is passed over for the next active session.
    pub async fn deliver_proactive(&self, owner_id: &str, instruction: &str) -> CareResult<ProactiveDelivery> {
        let mut session = self.active_session_for(owner_id)?;
        let (session, _guard) = loop {
            let lock = self.session_lock(&session.id);
            let guard = lock.lock_owned().await;
            match self.writable_session(owner_id, &session.id) {
                Ok(current) => break (current, guard),
                Err(CareError::SessionArchived(_)) | Err(CareError::NotFound { .. }) => {
                    debug!("Session {} closed before check-in for {}, picking again", session.id, owner_id);
                    drop(guard);
                    session = self.active_session_for(owner_id)?;
                }
                Err(e) => return Err(e),
            }
        };

        let first_message = self.db.conversations.count_messages(&session.id)? == 0;
        self.ensure_memory_fresh(owner_id, &session.id, first_message).await?;
        let context = self.assemble_context(&session.id, Some(instruction))?;
        let raw = self.router.generate(context.turns, self.params.clone()).await?;
        let (message, intercepted) = self.store_reply(&session.id, &raw)?;
        self.maybe_summarize(&session.id, message.id).await?;

        info!("Delivered proactive message {} to {}", message.id, owner_id);
        Ok(ProactiveDelivery {
            owner_id: owner_id.to_string(),
            session_id: session.id,
            message,
            intercepted,
        })
    }

    fn memory_for_session(&self, session_id: &str) -> CareResult<Option<OwnerMemory>> {
        match self.db.conversations.get_session(session_id)? {
            Some(session) => self.db.memories.get(&session.owner_id),
            None => Ok(None),
        }
    }

    fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        Arc::clone(self.locks.entry(session_id.to_string()).or_default().value())
    }

    fn owned_session(&self, owner_id: &str, session_id: &str) -> CareResult<Session> {
        let session = self
            .db
            .conversations
            .get_session(session_id)?
            .ok_or_else(|| CareError::NotFound {
                kind: "session",
                id: session_id.to_string(),
            })?;
        if session.owner_id != owner_id {
            warn!("Owner {} denied access to session {}", owner_id, session_id);
            return Err(CareError::Forbidden {
                kind: "session",
                id: session_id.to_string(),
                owner_id: owner_id.to_string(),
            });
        }
        Ok(session)
    }

    fn writable_session(&self, owner_id: &str, session_id: &str) -> CareResult<Session> {
        let session = self.owned_session(owner_id, session_id)?;
        if session.status == SessionStatus::Archived {
            return Err(CareError::SessionArchived(session_id.to_string()));
        }
        Ok(session)
    }

    fn append(&self, session_id: &str, role: Role, content: &str, safety_flag: SafetyFlag) -> CareResult<StoredMessage> {
        let message = self.db.conversations.append_message(NewMessage {
            session_id,
            role,
            content,
            tokens: estimate_tokens(content) as i64,
            safety_flag,
        })?;
        metrics::inc_message(role.as_str());
        Ok(message)
    }

    /// Stores a generated reply, substituting the safety response for a crisis.
    fn store_reply(&self, session_id: &str, raw: &str) -> CareResult<(StoredMessage, bool)> {
        let raw = sanitize_for_storage(raw.trim());
        if raw.is_empty() {
            return Err(CareError::ModelUnavailable("the engine returned an empty reply".to_string()));
        }
        let verdict = self.safety.evaluate(&raw, Role::Assistant);
        if !verdict.is_crisis() {
            let reply = self.append(session_id, Role::Assistant, &raw, SafetyFlag::from_category(verdict.category))?;
            return Ok((reply, false));
        }

        let reply = self.append(
            session_id,
            Role::Assistant,
            self.safety.safety_response(),
            SafetyFlag::CrisisIntercepted,
        )?;
        self.record_incident(
            session_id,
            Some(reply.id),
            IncidentSite::GeneratedReply,
            &verdict,
            Some(&raw),
        )?;
        warn!("Generated reply withheld in session {}", session_id);
        Ok((reply, true))
    }

    fn record_incident(
        &self,
        session_id: &str,
        message_id: Option<i64>,
        site: IncidentSite,
        verdict: &SafetyVerdict,
        discarded_text: Option<&str>,
    ) -> CareResult<()> {
        self.db.incidents.record(NewIncident {
            session_id,
            message_id,
            site,
            category: verdict.category,
            matched_signal: verdict.matched_signal.as_deref(),
            discarded_text,
            ruleset_version: &verdict.ruleset_version,
        })?;
        Ok(())
    }

    fn derive_title(&self, session: &Session, text: &str) -> CareResult<()> {
        if session.metadata.title_derived {
            return Ok(());
        }
        let normalized = TextUtils::normalize_whitespace(text);
        let title = TextUtils::truncate_chars(&normalized, TITLE_MAX_CHARS);
        if title.is_empty() {
            return Ok(());
        }
        let metadata = SessionMetadata {
            title: title.into_owned(),
            title_derived: true,
        };
        self.db.conversations.update_metadata(&session.id, &metadata)
    }

    /// Folds every tail message older than `trigger_id` into the summary once
    /// the full tail no longer fits. A failed fold keeps the old summary.
    async fn maybe_summarize(&self, session_id: &str, trigger_id: i64) -> CareResult<()> {
        let summary = self.db.summaries.current(session_id)?;
        let after = summary.as_ref().map(|s| s.last_message_id).unwrap_or(0);
        let tail = self.db.conversations.get_messages_after(session_id, after)?;

        let memory = self.memory_for_session(session_id)?;
        let size = self.builder.full_size(
            &self.persona,
            memory.as_ref().map(|m| m.digest.as_str()),
            summary.as_ref(),
            &tail,
        );
        if size <= self.builder.budget() {
            return Ok(());
        }
        let to_fold: Vec<StoredMessage> = tail.into_iter().filter(|m| m.id < trigger_id).collect();
        if to_fold.is_empty() {
            debug!("Session {} over budget ({}) but nothing older to fold", session_id, size);
            return Ok(());
        }

        info!(
            "Session {} context at {} of {} tokens, summarizing {} messages",
            session_id,
            size,
            self.builder.budget(),
            to_fold.len()
        );
        let draft = match self.summarizer.fold(summary.as_ref(), &to_fold).await {
            Ok(draft) => draft,
            Err(e) => {
                warn!("Keeping previous summary for session {}: {}", session_id, e);
                metrics::inc_summarization("failed");
                return Ok(());
            }
        };
        if self.safety.evaluate(&draft.text, Role::Assistant).is_crisis() {
            warn!("Discarding summary for session {} that tripped the safety filter", session_id);
            metrics::inc_summarization("rejected");
            return Ok(());
        }

        self.db.summaries.replace_current(NewSummary {
            session_id,
            summary_text: &draft.text,
            first_message_id: draft.first_message_id,
            last_message_id: draft.last_message_id,
            tokens: draft.tokens as i64,
            ruleset_version: self.safety.ruleset_version(),
        })?;
        metrics::inc_summarization("ok");
        Ok(())
    }
}

fn require_owner(owner_id: &str) -> CareResult<&str> {
    let owner_id = owner_id.trim();
    if owner_id.is_empty() {
        return Err(CareError::InvalidInput("owner_id is required".to_string()));
    }
    Ok(owner_id)
}

/// Check-in instruction for the local time of `now` in `tz`.
pub fn check_in_instruction_at<Tz: chrono::TimeZone>(now: DateTime<Utc>, tz: &Tz) -> String {
    TimeOfDay::of(&now.with_timezone(tz)).check_in_instruction()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context_engine::budget::estimate_turns;
    use crate::context_engine::prompts::{REDACTED_MARKER, SUMMARY_INSTRUCTION};
    use crate::safety::{SafetyCategory, SAFETY_RESPONSE};
    use crate::test_support::{replying, scripted_router, scripted_router_with_delay, Recorder, Responder};

    fn small_config() -> Config {
        Config {
            max_context_length: 512,
            max_new_tokens: 64,
            summary_max_tokens: 48,
            persona_prompt: Some("You are a kind companion.".to_string()),
            ..Config::default()
        }
    }

    fn manager_with(cfg: &Config, responder: Responder) -> (SessionManager, Arc<Recorder>) {
        let (router, recorder) = scripted_router(responder);
        let db = Arc::new(MemoryDatabase::new_in_memory().unwrap());
        (SessionManager::new(db, router, cfg).unwrap(), recorder)
    }

    fn manager(responder: Responder) -> (SessionManager, Arc<Recorder>) {
        manager_with(&Config::default(), responder)
    }

    #[tokio::test]
    async fn test_normal_turn_stores_both_messages() {
        let (manager, recorder) = manager(replying("It is good to hear from you."));
        let session = manager.create_session("alice").unwrap();

        let exchange = manager
            .send_message("alice", &session.id, "Good morning!   I slept well today and feel rested")
            .await
            .unwrap();

        assert!(!exchange.intercepted);
        assert_eq!(exchange.reply.content, "It is good to hear from you.");
        assert_eq!(exchange.reply.role, Role::Assistant);
        assert_eq!(recorder.calls(), 1);

        let history = manager.get_history("alice", &session.id).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].message_index, 0);
        assert_eq!(history[1].message_index, 1);

        let prompt = &recorder.requests()[0].turns;
        assert_eq!(prompt[0].content, DEFAULT_PERSONA);
        assert_eq!(prompt.last().unwrap().role, Role::User);

        let stored = manager.database().conversations.get_session(&session.id).unwrap().unwrap();
        assert_eq!(stored.metadata.title, "Good morning! I slept well tod");
        assert!(stored.metadata.title_derived);
    }

    #[tokio::test]
    async fn test_crisis_input_never_reaches_the_model() {
        let (manager, recorder) = manager(replying("should not be used"));
        let session = manager.create_session("alice").unwrap();

        let exchange = manager
            .send_message("alice", &session.id, "I want to end it all")
            .await
            .unwrap();

        assert!(exchange.intercepted);
        assert_eq!(recorder.calls(), 0);
        assert_eq!(exchange.user_message.safety_flag, SafetyFlag::CrisisIntercepted);
        assert_eq!(exchange.reply.safety_flag, SafetyFlag::CrisisIntercepted);
        assert_eq!(exchange.reply.content, SAFETY_RESPONSE);

        let incidents = manager.database().incidents.list_for_session(&session.id).unwrap();
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].category, SafetyCategory::Crisis);
        assert_eq!(incidents[0].site, IncidentSite::UserInput);
        assert_eq!(incidents[0].message_id, Some(exchange.user_message.id));

        let stored = manager.database().conversations.get_session(&session.id).unwrap().unwrap();
        assert_eq!(stored.metadata.title, DEFAULT_SESSION_TITLE);
    }

    #[tokio::test]
    async fn test_crisis_text_is_redacted_in_later_calls() {
        let (manager, recorder) = manager(replying("I'm here with you."));
        let session = manager.create_session("alice").unwrap();

        manager.send_message("alice", &session.id, "I want to end it all").await.unwrap();
        manager.send_message("alice", &session.id, "Thank you, I feel a bit better").await.unwrap();

        let requests = recorder.requests();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].turns.iter().all(|t| !t.content.contains("end it all")));
        assert!(requests[0].turns.iter().any(|t| t.content == REDACTED_MARKER));
    }

    #[tokio::test]
    async fn test_crisis_reply_is_discarded_and_recorded() {
        let (manager, _) = manager(replying("Maybe you should hurt them back."));
        let session = manager.create_session("bob").unwrap();

        let exchange = manager.send_message("bob", &session.id, "My neighbour was rude").await.unwrap();

        assert!(exchange.intercepted);
        assert_eq!(exchange.reply.content, SAFETY_RESPONSE);
        assert_eq!(exchange.user_message.safety_flag, SafetyFlag::None);

        let incidents = manager.database().incidents.list_for_session(&session.id).unwrap();
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].site, IncidentSite::GeneratedReply);
        assert_eq!(
            incidents[0].discarded_text.as_deref(),
            Some("Maybe you should hurt them back.")
        );
        let history = manager.get_history("bob", &session.id).unwrap();
        assert!(history.iter().all(|m| !m.content.contains("hurt them")));
    }

    #[tokio::test]
    async fn test_concern_is_delivered_with_soft_warning() {
        let (manager, recorder) = manager(replying("I'm sorry you feel that way. I'm here."));
        let session = manager.create_session("carol").unwrap();

        let exchange = manager
            .send_message("carol", &session.id, "I feel so lonely these days")
            .await
            .unwrap();

        assert_eq!(recorder.calls(), 1);
        assert_eq!(exchange.user_message.safety_flag, SafetyFlag::SoftWarning);
        assert!(!exchange.intercepted);
    }

    #[tokio::test]
    async fn test_ownership_and_status_are_enforced() {
        let (manager, recorder) = manager(replying("ok"));
        let session = manager.create_session("alice").unwrap();

        let err = manager.send_message("mallory", &session.id, "hi").await.unwrap_err();
        assert_eq!(err.category(), "forbidden");
        let err = manager.get_history("mallory", &session.id).unwrap_err();
        assert_eq!(err.category(), "forbidden");
        let err = manager.send_message("alice", "missing", "hi").await.unwrap_err();
        assert_eq!(err.category(), "not_found");
        let err = manager.send_message("alice", &session.id, "  \u{0007} ").await.unwrap_err();
        assert_eq!(err.category(), "invalid_input");

        let archived = manager.archive_session("alice", &session.id).await.unwrap();
        assert_eq!(archived.status, SessionStatus::Archived);
        let err = manager.send_message("alice", &session.id, "hi").await.unwrap_err();
        assert_eq!(err.category(), "session_archived");
        assert_eq!(manager.get_history("alice", &session.id).unwrap().len(), 0);
        assert_eq!(recorder.calls(), 0);

        assert!(manager.delete_session("mallory", &session.id).await.is_err());
        manager.delete_session("alice", &session.id).await.unwrap();
        assert_eq!(manager.get_history("alice", &session.id).unwrap_err().category(), "not_found");
    }

    #[tokio::test]
    async fn test_tail_overflow_summarizes_and_keeps_context_bounded() {
        let cfg = small_config();
        let (manager, recorder) = manager_with(&cfg, replying("Thank you for telling me about your day."));
        let session = manager.create_session("alice").unwrap();

        for i in 0..20 {
            let text = format!("Day {}: I went to the market, cooked dinner and called my daughter", i);
            manager.send_message("alice", &session.id, &text).await.unwrap();
        }

        let summaries = manager.database().summaries.list_for_session(&session.id).unwrap();
        assert!(!summaries.is_empty());
        assert_eq!(summaries.iter().filter(|s| s.is_current).count(), 1);

        let current = manager.database().summaries.current(&session.id).unwrap().unwrap();
        let tail = manager
            .database()
            .conversations
            .get_messages_after(&session.id, current.last_message_id)
            .unwrap();
        assert!(tail.len() < 40);
        assert_eq!(current.first_message_id, 1);

        for request in recorder.requests() {
            let size = estimate_turns(&request.turns) + request.params.max_new_tokens as usize;
            assert!(size <= cfg.max_context_length, "request of {} tokens", size);
        }
        assert!(recorder
            .requests()
            .iter()
            .any(|r| r.turns[0].content == SUMMARY_INSTRUCTION));

        let context = manager.assemble_context(&session.id, None).unwrap();
        assert!(context.turns[1].content.starts_with(SUMMARY_PREFIX));
    }

    #[tokio::test]
    async fn test_failed_summarization_does_not_fail_the_turn() {
        let cfg = small_config();
        let responder: Responder = Arc::new(|turns: &[Turn]| {
            if turns[0].content == SUMMARY_INSTRUCTION {
                Err(anyhow::anyhow!("summarizer engine fault"))
            } else {
                Ok("I hear you.".to_string())
            }
        });
        let (manager, _) = manager_with(&cfg, responder);
        let session = manager.create_session("alice").unwrap();

        for i in 0..20 {
            let text = format!("Day {}: I went to the market, cooked dinner and called my daughter", i);
            let exchange = manager.send_message("alice", &session.id, &text).await.unwrap();
            assert_eq!(exchange.reply.content, "I hear you.");
        }
        assert!(manager.database().summaries.current(&session.id).unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_turns_on_one_session_never_interleave() {
        let (router, recorder) =
            scripted_router_with_delay(replying("reply"), std::time::Duration::from_millis(200));
        let db = Arc::new(MemoryDatabase::new_in_memory().unwrap());
        let manager = Arc::new(SessionManager::new(db, router, &Config::default()).unwrap());
        let session = manager.create_session("alice").unwrap();

        let handles: Vec<_> = (0..3)
            .map(|i| {
                let manager = Arc::clone(&manager);
                let id = session.id.clone();
                tokio::spawn(async move { manager.send_message("alice", &id, &format!("message {}", i)).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let roles: Vec<Role> = manager
            .get_history("alice", &session.id)
            .unwrap()
            .iter()
            .map(|m| m.role)
            .collect();
        assert_eq!(
            roles,
            vec![Role::User, Role::Assistant, Role::User, Role::Assistant, Role::User, Role::Assistant]
        );
        assert_eq!(recorder.max_active(), 1);
    }

    #[tokio::test]
    async fn test_proactive_delivery_reuses_active_session() {
        let (manager, recorder) = manager(replying("Good morning! How did you sleep?"));

        let first = manager
            .deliver_proactive("dora", &TimeOfDay::Morning.check_in_instruction())
            .await
            .unwrap();
        let second = manager
            .deliver_proactive("dora", &TimeOfDay::Evening.check_in_instruction())
            .await
            .unwrap();

        assert_eq!(first.session_id, second.session_id);
        assert_eq!(first.message.role, Role::Assistant);
        let history = manager.get_history("dora", &first.session_id).unwrap();
        assert_eq!(history.len(), 2);

        let request = &recorder.requests()[0];
        assert!(request.turns.iter().all(|t| t.role != Role::User));
        assert!(request.turns.last().unwrap().content.contains("Good morning"));
    }

    #[tokio::test]
    async fn test_proactive_delivery_skips_archived_session() {
        let (manager, _) = manager(replying("Good evening! How was your day?"));
        let session = manager.create_session("dora").unwrap();
        manager.send_message("dora", &session.id, "Just got home").await.unwrap();

        // Archived while the check-in waits on the session lock.
        let lock = manager.session_lock(&session.id);
        let guard = lock.lock().await;
        let delivery = {
            let instruction = TimeOfDay::Evening.check_in_instruction();
            let deliver = manager.deliver_proactive("dora", &instruction);
            tokio::pin!(deliver);
            assert!(futures_poll_once(deliver.as_mut()).await.is_none());
            manager.db.conversations.set_status(&session.id, SessionStatus::Archived).unwrap();
            drop(guard);
            deliver.await.unwrap()
        };

        assert_ne!(delivery.session_id, session.id);
        assert_eq!(manager.get_history("dora", &session.id).unwrap().len(), 2);
        assert_eq!(manager.get_history("dora", &delivery.session_id).unwrap().len(), 1);
    }

    /// Polls a future once, returning its output if it finished.
    async fn futures_poll_once<F: std::future::Future + Unpin>(mut fut: F) -> Option<F::Output> {
        std::future::poll_fn(|cx| match std::future::Future::poll(std::pin::Pin::new(&mut fut), cx) {
            std::task::Poll::Ready(out) => std::task::Poll::Ready(Some(out)),
            std::task::Poll::Pending => std::task::Poll::Ready(None),
        })
        .await
    }

    #[tokio::test]
    async fn test_refolding_a_summary_keeps_context_in_budget() {
        let cfg = small_config();
        let (manager, _) = manager_with(&cfg, replying("Thank you for telling me about your day."));
        let session = manager.create_session("alice").unwrap();
        for i in 0..20 {
            let text = format!("Day {}: I went to the market, cooked dinner and called my daughter", i);
            manager.send_message("alice", &session.id, &text).await.unwrap();
        }

        for _ in 0..2 {
            let current = manager.database().summaries.current(&session.id).unwrap().unwrap();
            let covered: Vec<StoredMessage> = manager
                .database()
                .conversations
                .get_messages(&session.id)
                .unwrap()
                .into_iter()
                .filter(|m| m.id <= current.last_message_id)
                .collect();
            let draft = manager.summarizer.fold(Some(&current), &covered).await.unwrap();
            manager
                .database()
                .summaries
                .replace_current(NewSummary {
                    session_id: &session.id,
                    summary_text: &draft.text,
                    first_message_id: draft.first_message_id,
                    last_message_id: draft.last_message_id,
                    tokens: draft.tokens as i64,
                    ruleset_version: "v1",
                })
                .unwrap();
        }

        let context = manager.assemble_context(&session.id, None).unwrap();
        assert!(context.tokens <= manager.builder.budget());
        let with_check_in = manager
            .assemble_context(&session.id, Some(&TimeOfDay::Evening.check_in_instruction()))
            .unwrap();
        assert!(with_check_in.tokens <= manager.builder.budget());
    }

    fn remembering(digest: &'static str, reply: &'static str) -> Responder {
        Arc::new(move |turns: &[Turn]| {
            if turns[0].content == SUMMARY_INSTRUCTION {
                Ok(digest.to_string())
            } else {
                Ok(reply.to_string())
            }
        })
    }

    fn summarizer_calls(recorder: &Recorder) -> usize {
        recorder
            .requests()
            .iter()
            .filter(|r| r.turns[0].content == SUMMARY_INSTRUCTION)
            .count()
    }

    #[tokio::test]
    async fn test_new_session_remembers_earlier_sessions() {
        let (manager, recorder) = manager(remembering("Alice grows tomatoes on her balcony.", "How lovely."));
        let first = manager.create_session("alice").unwrap();
        manager
            .send_message("alice", &first.id, "My tomatoes are finally turning red")
            .await
            .unwrap();
        assert!(manager.owner_memory("alice").unwrap().is_none());

        let second = manager.create_session("alice").unwrap();
        manager.send_message("alice", &second.id, "Good morning").await.unwrap();
        manager.send_message("alice", &second.id, "It is sunny today").await.unwrap();

        let memory = manager.owner_memory("alice").unwrap().unwrap();
        assert_eq!(memory.digest, "Alice grows tomatoes on her balcony.");
        assert_eq!(memory.source_messages, 2);
        assert_eq!(memory.last_source_message_id, 2);
        // Fresh digest, nothing newer elsewhere: the second turn does not rebuild it.
        assert_eq!(summarizer_calls(&recorder), 1);

        let chat = recorder.requests().into_iter().last().unwrap();
        assert!(chat.turns[1].content.starts_with(MEMORY_PREFIX));
        assert!(chat.turns[1].content.contains("tomatoes on her balcony"));

        // Other owners never see it.
        let bob = manager.create_session("bob").unwrap();
        let context = manager.assemble_context(&bob.id, None).unwrap();
        assert!(context.turns.iter().all(|t| !t.content.contains("tomatoes")));
    }

    #[tokio::test]
    async fn test_stale_memory_is_rebuilt() {
        let (manager, recorder) = manager(remembering("Alice walks every morning.", "Nice."));
        let first = manager.create_session("alice").unwrap();
        manager.send_message("alice", &first.id, "I walked to the lake").await.unwrap();
        let second = manager.create_session("alice").unwrap();
        manager.send_message("alice", &second.id, "Back again").await.unwrap();
        assert_eq!(summarizer_calls(&recorder), 1);

        let mut memory = manager.owner_memory("alice").unwrap().unwrap();
        memory.refreshed_at = Utc::now() - Duration::hours(7);
        manager.database().memories.upsert(&memory).unwrap();

        manager.send_message("alice", &first.id, "And to the market").await.unwrap();
        assert_eq!(summarizer_calls(&recorder), 2);
        let refreshed = manager.owner_memory("alice").unwrap().unwrap();
        assert!(refreshed.refreshed_at > memory.refreshed_at);
        assert_eq!(refreshed.last_source_message_id, 4);
    }

    #[tokio::test]
    async fn test_memory_failure_keeps_the_conversation_going() {
        let responder: Responder = Arc::new(|turns: &[Turn]| {
            if turns[0].content == SUMMARY_INSTRUCTION {
                Err(anyhow::anyhow!("summarizer engine fault"))
            } else {
                Ok("I'm listening.".to_string())
            }
        });
        let (manager, _) = manager(responder);
        let first = manager.create_session("alice").unwrap();
        manager.send_message("alice", &first.id, "Hello").await.unwrap();
        let second = manager.create_session("alice").unwrap();

        let exchange = manager.send_message("alice", &second.id, "Hello again").await.unwrap();
        assert_eq!(exchange.reply.content, "I'm listening.");
        assert!(manager.owner_memory("alice").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_export_summaries_and_cleanup() {
        let (manager, _) = manager(replying("Lovely."));
        let session = manager.create_session("erin").unwrap();
        manager.send_message("erin", &session.id, "I baked bread").await.unwrap();

        let export = manager.export_session("erin", &session.id).unwrap();
        assert_eq!(export.session.id, session.id);
        assert_eq!(export.messages.len(), 2);
        let json = serde_json::to_string(&export).unwrap();
        assert!(json.contains("I baked bread"));

        assert!(manager.list_summaries("erin").unwrap().is_empty());
        assert_eq!(manager.list_sessions("erin").unwrap().len(), 1);
        assert!(manager.export_session("frank", &session.id).is_err());

        assert_eq!(manager.cleanup_old_sessions(1).unwrap(), 0);
        assert_eq!(manager.cleanup_old_sessions(-1).unwrap(), 1);
        assert!(manager.list_sessions("erin").unwrap().is_empty());
    }

    #[test]
    fn test_context_too_small_for_persona_is_rejected() {
        let cfg = Config {
            max_context_length: 512,
            max_new_tokens: 200,
            ..Config::default()
        };
        let (router, _) = scripted_router(replying("x"));
        let db = Arc::new(MemoryDatabase::new_in_memory().unwrap());
        let err = SessionManager::new(db, router, &cfg).err().unwrap();
        assert_eq!(err.category(), "invalid_config");
    }

    #[test]
    fn test_check_in_follows_owner_timezone() {
        use chrono::TimeZone;
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 0, 30, 0).unwrap();
        let shanghai: chrono_tz::Tz = "Asia/Shanghai".parse().unwrap();
        assert!(check_in_instruction_at(now, &shanghai).contains("Good morning"));
        assert!(check_in_instruction_at(now, &chrono_tz::UTC).contains("Good evening"));
    }
}
