use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::NaiveDate;
use uuid::Uuid;

use super::StorageBackend;
use crate::error::{MentoraError, Result};
use crate::model::*;

#[derive(Default)]
struct MemoryState {
    quota: HashMap<(String, NaiveDate), u32>,
    /// Insertion order; ties on `created_at` resolve to the later insert.
    sessions: Vec<Session>,
}

impl MemoryState {
    fn session_mut(&mut self, user_id: &str, session_id: Uuid) -> Result<&mut Session> {
        self.sessions
            .iter_mut()
            .find(|s| s.id == session_id && s.user_id == user_id)
            .ok_or_else(|| MentoraError::NotFound(format!("session {session_id} for user {user_id}")))
    }

    fn consume(&mut self, user_id: &str, day: NaiveDate, limit: Option<u32>) -> Option<u32> {
        let used = self.quota.entry((user_id.to_string(), day)).or_insert(0);
        match limit {
            Some(limit) if *used >= limit => None,
            _ => {
                *used += 1;
                Some(*used)
            }
        }
    }

    fn latest(&self, user_id: &str) -> Option<&Session> {
        self.sessions
            .iter()
            .filter(|s| s.user_id == user_id)
            .fold(None, |best: Option<&Session>, s| match best {
                Some(b) if b.created_at > s.created_at => Some(b),
                _ => Some(s),
            })
    }
}

/// Process-local storage. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStorage {
    state: Mutex<MemoryState>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|e| MentoraError::Storage(format!("memory store lock poisoned: {e}")))
    }
}

impl StorageBackend for MemoryStorage {
    async fn quota_used(&self, user_id: &str, day: NaiveDate) -> Result<u32> {
        let mut state = self.lock()?;
        Ok(*state.quota.entry((user_id.to_string(), day)).or_insert(0))
    }

    async fn try_consume(
        &self,
        user_id: &str,
        day: NaiveDate,
        limit: Option<u32>,
    ) -> Result<Option<u32>> {
        Ok(self.lock()?.consume(user_id, day, limit))
    }

    async fn create_session(&self, session: &Session) -> Result<()> {
        let mut state = self.lock()?;
        if state.sessions.iter().any(|s| s.id == session.id) {
            return Err(MentoraError::Storage(format!(
                "session {} already exists",
                session.id
            )));
        }
        state.sessions.push(session.clone());
        Ok(())
    }

    async fn latest_session(&self, user_id: &str, max_turns: usize) -> Result<Option<Session>> {
        let state = self.lock()?;
        Ok(state.latest(user_id).cloned().map(|mut s| {
            s.truncate_to_recent(max_turns);
            s
        }))
    }

    async fn list_sessions(&self, user_id: &str, limit: usize) -> Result<Vec<SessionSummary>> {
        let state = self.lock()?;
        let mut owned: Vec<(usize, &Session)> = state
            .sessions
            .iter()
            .enumerate()
            .filter(|(_, s)| s.user_id == user_id)
            .collect();
        owned.sort_by(|(ia, a), (ib, b)| b.created_at.cmp(&a.created_at).then(ib.cmp(ia)));
        Ok(owned
            .into_iter()
            .take(limit)
            .map(|(_, s)| SessionSummary {
                id: s.id,
                created_at: s.created_at,
                turn_count: s.turns.len(),
                last_turn_at: s.turns.iter().map(|t| t.timestamp).max(),
            })
            .collect())
    }

    async fn append_turns(&self, user_id: &str, session_id: Uuid, turns: &[Turn]) -> Result<()> {
        let mut state = self.lock()?;
        state
            .session_mut(user_id, session_id)?
            .turns
            .extend_from_slice(turns);
        Ok(())
    }

    async fn commit_exchange(
        &self,
        user_id: &str,
        session_id: Uuid,
        turns: &[Turn],
        day: NaiveDate,
        limit: Option<u32>,
    ) -> Result<Option<u32>> {
        let mut state = self.lock()?;
        // Validate the session before touching quota so a failure leaves both untouched.
        state.session_mut(user_id, session_id)?;
        let Some(used) = state.consume(user_id, day, limit) else {
            return Ok(None);
        };
        state
            .session_mut(user_id, session_id)?
            .turns
            .extend_from_slice(turns);
        Ok(Some(used))
    }

    async fn ping(&self) -> Result<()> {
        self.lock().map(|_| ())
    }
}
