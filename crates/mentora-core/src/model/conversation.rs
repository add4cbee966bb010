use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{MentoraError, Result};

/// Maximum accepted length of a learner message, in bytes.
pub const MAX_MESSAGE_LENGTH: usize = 4_000;

/// Validate a learner message before any quota check. Returns the trimmed text.
pub fn validate_message(text: &str) -> Result<&str> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(MentoraError::InvalidInput("message cannot be empty".into()));
    }
    if trimmed.len() > MAX_MESSAGE_LENGTH {
        return Err(MentoraError::InvalidInput(format!(
            "message exceeds maximum length of {MAX_MESSAGE_LENGTH} characters"
        )));
    }
    Ok(trimmed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = MentoraError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            other => Err(MentoraError::InvalidInput(format!("unknown role: {other}"))),
        }
    }
}

/// Where a turn's content came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnSource {
    /// Typed by the learner.
    #[default]
    Learner,
    /// Produced by the remote generation capability.
    Remote,
    /// Produced locally because the remote capability failed.
    Fallback,
}

impl std::fmt::Display for TurnSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Learner => write!(f, "learner"),
            Self::Remote => write!(f, "remote"),
            Self::Fallback => write!(f, "fallback"),
        }
    }
}

impl std::str::FromStr for TurnSource {
    type Err = MentoraError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "learner" => Ok(Self::Learner),
            "remote" => Ok(Self::Remote),
            "fallback" => Ok(Self::Fallback),
            other => Err(MentoraError::InvalidInput(format!(
                "unknown turn source: {other}"
            ))),
        }
    }
}

/// One message in a conversation. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub source: TurnSource,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            timestamp: Utc::now(),
            source: TurnSource::Learner,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            timestamp: Utc::now(),
            source: TurnSource::Remote,
        }
    }

    /// Locally generated assistant turn written when the remote call failed.
    pub fn fallback(content: impl Into<String>) -> Self {
        Self {
            source: TurnSource::Fallback,
            ..Self::assistant(content)
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// An ordered, append-only group of turns belonging to one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub turns: Vec<Turn>,
}

impl Session {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            user_id: user_id.into(),
            created_at: Utc::now(),
            turns: Vec::new(),
        }
    }

    /// Keep only the `max_turns` most recent turns, preserving order.
    pub fn truncate_to_recent(&mut self, max_turns: usize) {
        if self.turns.len() > max_turns {
            let skip = self.turns.len() - max_turns;
            self.turns.drain(..skip);
        }
    }
}

/// Lightweight listing entry for operator tooling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub turn_count: usize,
    pub last_turn_at: Option<DateTime<Utc>>,
}
