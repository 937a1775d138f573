//! Row types for the care database
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::memory::Role;
use crate::safety::SafetyCategory;

pub const DEFAULT_SESSION_TITLE: &str = "New conversation";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Archived,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Archived => "archived",
        }
    }
}

impl FromStr for SessionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SessionStatus::Active),
            "archived" => Ok(SessionStatus::Archived),
            other => Err(anyhow::anyhow!("unknown session status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub owner_id: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub metadata: SessionMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub title: String,
    /// False until the title has been derived from the first user message.
    #[serde(default)]
    pub title_derived: bool,
}

impl Default for SessionMetadata {
    fn default() -> Self {
        Self {
            title: DEFAULT_SESSION_TITLE.to_string(),
            title_derived: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyFlag {
    None,
    SoftWarning,
    CrisisIntercepted,
}

impl SafetyFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            SafetyFlag::None => "none",
            SafetyFlag::SoftWarning => "soft_warning",
            SafetyFlag::CrisisIntercepted => "crisis_intercepted",
        }
    }

    /// Flag stored on a message given the verdict on its text.
    pub fn from_category(category: SafetyCategory) -> Self {
        match category {
            SafetyCategory::None => SafetyFlag::None,
            SafetyCategory::Concern => SafetyFlag::SoftWarning,
            SafetyCategory::Crisis => SafetyFlag::CrisisIntercepted,
        }
    }
}

impl FromStr for SafetyFlag {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(SafetyFlag::None),
            "soft_warning" => Ok(SafetyFlag::SoftWarning),
            "crisis_intercepted" => Ok(SafetyFlag::CrisisIntercepted),
            other => Err(anyhow::anyhow!("unknown safety flag '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: i64,
    pub session_id: String,
    pub message_index: i64,
    pub role: Role,
    pub content: String,
    pub tokens: i64,
    pub safety_flag: SafetyFlag,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewMessage<'a> {
    pub session_id: &'a str,
    pub role: Role,
    pub content: &'a str,
    pub tokens: i64,
    pub safety_flag: SafetyFlag,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    pub id: i64,
    pub session_id: String,
    pub summary_text: String,
    /// Covered message ids, inclusive on both ends.
    pub first_message_id: i64,
    pub last_message_id: i64,
    pub tokens: i64,
    pub ruleset_version: String,
    pub is_current: bool,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub id: String,
    pub owner_id: String,
    pub trigger_spec: String,
    pub timezone: String,
    pub enabled: bool,
    pub last_fired: Option<DateTime<Utc>>,
    pub next_fire: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentSite {
    UserInput,
    GeneratedReply,
}

impl IncidentSite {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentSite::UserInput => "user_input",
            IncidentSite::GeneratedReply => "generated_reply",
        }
    }
}

impl fmt::Display for IncidentSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IncidentSite {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user_input" => Ok(IncidentSite::UserInput),
            "generated_reply" => Ok(IncidentSite::GeneratedReply),
            other => Err(anyhow::anyhow!("unknown incident site '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyIncident {
    pub id: i64,
    pub session_id: String,
    pub message_id: Option<i64>,
    pub site: IncidentSite,
    pub category: SafetyCategory,
    pub matched_signal: Option<String>,
    /// Generated text that was withheld from the user.
    pub discarded_text: Option<String>,
    pub ruleset_version: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewIncident<'a> {
    pub session_id: &'a str,
    pub message_id: Option<i64>,
    pub site: IncidentSite,
    pub category: SafetyCategory,
    pub matched_signal: Option<&'a str>,
    pub discarded_text: Option<&'a str>,
    pub ruleset_version: &'a str,
}

/// Digest of an owner's recent conversations, carried into other sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OwnerMemory {
    pub owner_id: String,
    pub digest: String,
    pub tokens: i64,
    pub source_messages: i64,
    /// Newest message folded into the digest.
    pub last_source_message_id: i64,
    pub ruleset_version: String,
    pub refreshed_at: DateTime<Utc>,
}

/// Everything stored for one session, as handed to the owner on export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionExport {
    pub session: Session,
    pub messages: Vec<StoredMessage>,
    pub summaries: Vec<Summary>,
    pub exported_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatabaseStats {
    pub total_sessions: i64,
    pub total_messages: i64,
    pub total_summaries: i64,
    pub total_schedules: i64,
    pub total_incidents: i64,
    pub database_size_bytes: i64,
}
