//! Append-only conversation history, grouped into sessions.
//!
//! There is deliberately no update or delete: a correction is a new turn.

use std::sync::Arc;

use uuid::Uuid;

use crate::error::Result;
use crate::model::{Session, SessionSummary, Turn};
use crate::storage::StorageBackend;

pub struct HistoryStore<S> {
    store: Arc<S>,
}

impl<S: StorageBackend> HistoryStore<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Append one turn. With `session_id = None` the turn goes to the user's
    /// latest session, which is created first if the user has none.
    /// Returns the session the turn landed in.
    pub async fn append_turn(
        &self,
        user_id: &str,
        session_id: Option<Uuid>,
        turn: Turn,
    ) -> Result<Uuid> {
        let session_id = match session_id {
            Some(id) => id,
            None => self.current_session_id(user_id).await?,
        };
        self.store
            .append_turns(user_id, session_id, std::slice::from_ref(&turn))
            .await?;
        Ok(session_id)
    }

    /// Most recent session with at most `max_turns` of its latest turns.
    pub async fn latest_session(&self, user_id: &str, max_turns: usize) -> Result<Option<Session>> {
        self.store.latest_session(user_id, max_turns).await
    }

    /// Open a fresh, empty session. It becomes the one resumed on load.
    pub async fn start_session(&self, user_id: &str) -> Result<Session> {
        let session = Session::new(user_id);
        self.store.create_session(&session).await?;
        tracing::info!(user = user_id, session_id = %session.id, "started coaching session");
        Ok(session)
    }

    pub async fn list_sessions(&self, user_id: &str, limit: usize) -> Result<Vec<SessionSummary>> {
        self.store.list_sessions(user_id, limit).await
    }

    /// Id of the latest session, creating one if the user has none yet.
    pub async fn current_session_id(&self, user_id: &str) -> Result<Uuid> {
        match self.store.latest_session(user_id, 0).await? {
            Some(session) => Ok(session.id),
            None => Ok(self.start_session(user_id).await?.id),
        }
    }
}
