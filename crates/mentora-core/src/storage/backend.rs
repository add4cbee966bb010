use chrono::NaiveDate;
use uuid::Uuid;

use crate::error::Result;
use crate::model::*;

/// Abstract storage backend holding the two shared resources: quota records
/// and session history. SQLite is the primary implementation; the in-memory
/// backend serves tests and throwaway deployments.
pub trait StorageBackend: Send + Sync {
    // -- Quota --

    /// Today's `used` count for a user. Lazily creates the record at zero.
    fn quota_used(
        &self,
        user_id: &str,
        day: NaiveDate,
    ) -> impl std::future::Future<Output = Result<u32>> + Send;

    /// Conditional increment: bumps `used` by one only if it is below `limit`
    /// (always, when `limit` is `None`). Returns the new `used`, or `None`
    /// when the limit was already reached and nothing changed.
    fn try_consume(
        &self,
        user_id: &str,
        day: NaiveDate,
        limit: Option<u32>,
    ) -> impl std::future::Future<Output = Result<Option<u32>>> + Send;

    // -- History --

    fn create_session(
        &self,
        session: &Session,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Most recently created session for the user, holding at most the
    /// `max_turns` most recent turns in append order.
    fn latest_session(
        &self,
        user_id: &str,
        max_turns: usize,
    ) -> impl std::future::Future<Output = Result<Option<Session>>> + Send;

    /// Session summaries, newest first.
    fn list_sessions(
        &self,
        user_id: &str,
        limit: usize,
    ) -> impl std::future::Future<Output = Result<Vec<SessionSummary>>> + Send;

    /// Append turns in order. All or nothing. Fails with `NotFound` if the
    /// session does not exist or belongs to another user.
    fn append_turns(
        &self,
        user_id: &str,
        session_id: Uuid,
        turns: &[Turn],
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    // -- Combined --

    /// Atomically consume one unit of quota and append `turns`. If the
    /// conditional increment is refused, nothing is written and `None` is
    /// returned. Otherwise returns the new `used`.
    fn commit_exchange(
        &self,
        user_id: &str,
        session_id: Uuid,
        turns: &[Turn],
        day: NaiveDate,
        limit: Option<u32>,
    ) -> impl std::future::Future<Output = Result<Option<u32>>> + Send;

    /// Cheap connectivity check for health endpoints.
    fn ping(&self) -> impl std::future::Future<Output = Result<()>> + Send;
}
