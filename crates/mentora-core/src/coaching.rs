//! Coaching orchestrator: composes quota, history, directory and generator
//! into the three request-scoped operations the surfaces expose.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use serde::Serialize;
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use crate::clock::{DayBoundary, QuotaCalendar, SystemClock};
use crate::config::{CoachingConfig, MentoraConfig};
use crate::directory::Directory;
use crate::error::{MentoraError, Result};
use crate::fallback::{select_welcome, CHAT_APOLOGY, GENERIC_WELCOME, RECOMMENDATION_UNAVAILABLE};
use crate::generator::Generator;
use crate::history::HistoryStore;
use crate::model::{validate_message, ProgressSnapshot, QuotaRecord, Remaining, Session, SessionSummary, Turn};
use crate::quota::QuotaTracker;
use crate::storage::StorageBackend;

/// Lifecycle of one outgoing message. Only `Delivered` consumes quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    Drafted,
    QuotaChecked,
    SentPending,
    Delivered,
    Failed,
}

impl MessageState {
    pub fn can_transition_to(self, next: MessageState) -> bool {
        use MessageState::*;
        matches!(
            (self, next),
            (Drafted, QuotaChecked)
                | (Drafted, Failed)
                | (QuotaChecked, SentPending)
                | (QuotaChecked, Failed)
                | (SentPending, Delivered)
                | (SentPending, Failed)
        )
    }

    pub fn consumes_quota(self) -> bool {
        self == MessageState::Delivered
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, MessageState::Delivered | MessageState::Failed)
    }

    fn advance(&mut self, next: MessageState, user_id: &str) {
        let from = *self;
        debug_assert!(from.can_transition_to(next), "{from:?} -> {next:?}");
        tracing::debug!(user = user_id, from = ?from, to = ?next, "message state");
        *self = next;
    }
}

/// Quota snapshot returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaStatus {
    pub day: NaiveDate,
    pub limit: Option<u32>,
    pub used: u32,
    pub remaining: Remaining,
}

impl From<&QuotaRecord> for QuotaStatus {
    fn from(record: &QuotaRecord) -> Self {
        Self {
            day: record.day,
            limit: record.limit,
            used: record.used,
            remaining: record.remaining(),
        }
    }
}

/// Which tier of the welcome fallback chain produced the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WelcomeSource {
    Remote,
    Rules,
    Generic,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub welcome_message: String,
    pub welcome_source: WelcomeSource,
    /// `None` until the user's first exchange creates a session.
    pub session_id: Option<Uuid>,
    pub history: Vec<Turn>,
    pub quota: QuotaStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SendOutcome {
    Delivered {
        session_id: Uuid,
        reply: Turn,
        quota: QuotaStatus,
    },
    QuotaExceeded {
        quota: QuotaStatus,
    },
    GenerationFailed {
        session_id: Uuid,
        fallback_turn: Turn,
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RecommendationOutcome {
    Delivered {
        recommendation: String,
        quota: QuotaStatus,
    },
    QuotaExceeded {
        quota: QuotaStatus,
    },
    GenerationFailed {
        message: String,
        reason: String,
    },
}

pub struct CoachingService<S, G, D> {
    store: Arc<S>,
    quota: QuotaTracker<S>,
    history: HistoryStore<S>,
    generator: G,
    directory: D,
    calendar: QuotaCalendar,
    settings: CoachingConfig,
    generation_timeout: Duration,
    fallback_limit: Option<u32>,
}

impl<S, G, D> CoachingService<S, G, D>
where
    S: StorageBackend + 'static,
    G: Generator,
    D: Directory,
{
    pub fn new(store: Arc<S>, generator: G, directory: D, config: &MentoraConfig) -> Result<Self> {
        let boundary = DayBoundary::from_config(&config.quota)?;
        Ok(Self {
            quota: QuotaTracker::new(Arc::clone(&store)),
            history: HistoryStore::new(Arc::clone(&store)),
            store,
            generator,
            directory,
            calendar: QuotaCalendar::new(boundary, Arc::new(SystemClock)),
            generation_timeout: Duration::from_secs(config.coaching.generation_timeout_secs),
            settings: config.coaching.clone(),
            fallback_limit: config.quota.default_limit(),
        })
    }

    pub fn with_calendar(mut self, calendar: QuotaCalendar) -> Self {
        self.calendar = calendar;
        self
    }

    pub fn with_generation_timeout(mut self, timeout: Duration) -> Self {
        self.generation_timeout = timeout;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn generator(&self) -> &G {
        &self.generator
    }

    pub fn calendar(&self) -> &QuotaCalendar {
        &self.calendar
    }

    pub async fn health(&self) -> Result<()> {
        self.store.ping().await
    }

    // -- Operations --

    /// Everything the coaching panel needs on open. Never fails: every
    /// collaborator failure degrades to a default and is logged.
    pub async fn load_session(&self, user_id: &str) -> SessionView {
        let day = self.calendar.today();
        let (progress, limit, used, latest) = tokio::join!(
            self.directory.progress(user_id),
            self.daily_limit(user_id),
            self.quota.record(user_id, day, None),
            self.history.latest_session(user_id, self.settings.history_max_turns),
        );

        let used = match used {
            Ok(record) => record.used,
            Err(e) => {
                tracing::warn!(user = user_id, %day, "quota read failed, showing zero usage: {e}");
                0
            }
        };
        let quota = QuotaStatus::from(&QuotaRecord::new(user_id, day, limit, used));

        let (session_id, history) = match latest {
            Ok(Some(session)) => (Some(session.id), session.turns),
            Ok(None) => (None, Vec::new()),
            Err(e) => {
                tracing::warn!(user = user_id, "history unavailable, starting empty: {e}");
                (None, Vec::new())
            }
        };

        let progress = match progress {
            Ok(p) => Some(p),
            Err(e) => {
                tracing::warn!(user = user_id, "progress unavailable: {e}");
                None
            }
        };
        let (welcome_message, welcome_source) = self.welcome(user_id, progress.as_ref()).await;

        SessionView {
            welcome_message,
            welcome_source,
            session_id,
            history,
            quota,
        }
    }

    pub async fn send_message(&self, user_id: &str, text: &str) -> Result<SendOutcome> {
        let text = validate_message(text)?;
        let mut state = MessageState::Drafted;
        let user_turn = Turn::user(text);

        let day = self.calendar.today();
        let guard = self.quota.lock(user_id, day).await?;
        let limit = self.daily_limit(user_id).await;
        let record = self.quota.record(user_id, day, limit).await?;
        if !record.can_consume() {
            state.advance(MessageState::Failed, user_id);
            tracing::info!(user = user_id, %day, used = record.used, "quota exhausted, message not sent");
            return Ok(SendOutcome::QuotaExceeded {
                quota: QuotaStatus::from(&record),
            });
        }
        state.advance(MessageState::QuotaChecked, user_id);

        let progress = self.progress_or_default(user_id).await;
        let (session_id, context) = self.context_for(user_id).await?;

        state.advance(MessageState::SentPending, user_id);
        let generated = self
            .timed(self.generator.generate_chat_reply(text, &progress, &context))
            .await;

        match generated {
            Ok(reply) => {
                let reply_turn = Turn::assistant(reply);
                let committed = self
                    .commit_detached(
                        guard,
                        user_id,
                        session_id,
                        vec![user_turn, reply_turn.clone()],
                        day,
                        limit,
                    )
                    .await?;
                match committed {
                    Some(used) => {
                        state.advance(MessageState::Delivered, user_id);
                        let record = QuotaRecord::new(user_id, day, limit, used);
                        tracing::info!(user = user_id, %session_id, used, "message delivered");
                        Ok(SendOutcome::Delivered {
                            session_id,
                            reply: reply_turn,
                            quota: QuotaStatus::from(&record),
                        })
                    }
                    None => {
                        state.advance(MessageState::Failed, user_id);
                        tracing::warn!(user = user_id, %day, "quota taken by a concurrent writer, reply discarded");
                        let record = self.quota.record(user_id, day, limit).await?;
                        Ok(SendOutcome::QuotaExceeded {
                            quota: QuotaStatus::from(&record),
                        })
                    }
                }
            }
            Err(e) => {
                state.advance(MessageState::Failed, user_id);
                tracing::warn!(user = user_id, %session_id, "chat generation failed: {e}");
                let fallback_turn = Turn::fallback(CHAT_APOLOGY);
                if let Err(write_err) = self
                    .store
                    .append_turns(user_id, session_id, &[user_turn, fallback_turn.clone()])
                    .await
                {
                    tracing::error!(user = user_id, %session_id, "could not record failed exchange: {write_err}");
                }
                drop(guard);
                Ok(SendOutcome::GenerationFailed {
                    session_id,
                    fallback_turn,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// One recommendation for the user's next step. Consumes quota on
    /// success only and does not touch history.
    pub async fn get_recommendation(&self, user_id: &str) -> Result<RecommendationOutcome> {
        let day = self.calendar.today();
        let guard = self.quota.lock(user_id, day).await?;
        let limit = self.daily_limit(user_id).await;
        let record = self.quota.record(user_id, day, limit).await?;
        if !record.can_consume() {
            tracing::info!(user = user_id, %day, used = record.used, "quota exhausted, no recommendation");
            return Ok(RecommendationOutcome::QuotaExceeded {
                quota: QuotaStatus::from(&record),
            });
        }

        let progress = self.progress_or_default(user_id).await;
        match self.timed(self.generator.generate_recommendation(&progress)).await {
            Ok(recommendation) => {
                let store = Arc::clone(&self.store);
                let user = user_id.to_string();
                let consumed = tokio::spawn(async move {
                    let _guard = guard;
                    store.try_consume(&user, day, limit).await
                })
                .await
                .map_err(|e| MentoraError::Persistence(format!("quota commit task failed: {e}")))?
                .map_err(MentoraError::into_persistence)?;

                match consumed {
                    Some(used) => Ok(RecommendationOutcome::Delivered {
                        recommendation,
                        quota: QuotaStatus::from(&QuotaRecord::new(user_id, day, limit, used)),
                    }),
                    None => {
                        let record = self.quota.record(user_id, day, limit).await?;
                        Ok(RecommendationOutcome::QuotaExceeded {
                            quota: QuotaStatus::from(&record),
                        })
                    }
                }
            }
            Err(e) => {
                tracing::warn!(user = user_id, "recommendation generation failed: {e}");
                Ok(RecommendationOutcome::GenerationFailed {
                    message: RECOMMENDATION_UNAVAILABLE.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    pub async fn start_session(&self, user_id: &str) -> Result<Session> {
        self.history.start_session(user_id).await
    }

    pub async fn list_sessions(&self, user_id: &str, limit: usize) -> Result<Vec<SessionSummary>> {
        self.history.list_sessions(user_id, limit).await
    }

    pub async fn quota_status(&self, user_id: &str) -> Result<QuotaStatus> {
        let day = self.calendar.today();
        let limit = self.daily_limit(user_id).await;
        let record = self.quota.record(user_id, day, limit).await?;
        Ok(QuotaStatus::from(&record))
    }

    // -- Internals --

    async fn welcome(&self, user_id: &str, progress: Option<&ProgressSnapshot>) -> (String, WelcomeSource) {
        let Some(progress) = progress else {
            tracing::info!(user = user_id, tier = "generic", "welcome without progress");
            return (GENERIC_WELCOME.to_string(), WelcomeSource::Generic);
        };
        match self.timed(self.generator.generate_welcome(progress)).await {
            Ok(message) => {
                tracing::debug!(user = user_id, tier = "remote", "welcome generated");
                (message, WelcomeSource::Remote)
            }
            Err(e) => {
                tracing::info!(user = user_id, tier = "rules", "remote welcome unavailable: {e}");
                (select_welcome(progress), WelcomeSource::Rules)
            }
        }
    }

    /// Subscription limit, or the default tier's when the lookup fails.
    async fn daily_limit(&self, user_id: &str) -> Option<u32> {
        match self.directory.subscription_quota(user_id).await {
            Ok(sub) => sub.daily_limit,
            Err(e) => {
                tracing::warn!(user = user_id, "subscription lookup failed, using default tier: {e}");
                self.fallback_limit
            }
        }
    }

    async fn progress_or_default(&self, user_id: &str) -> ProgressSnapshot {
        self.directory.progress(user_id).await.unwrap_or_else(|e| {
            tracing::warn!(user = user_id, "progress unavailable, prompting without it: {e}");
            ProgressSnapshot::default()
        })
    }

    /// Current session id plus its most recent turns for generator context.
    /// Creates the session when the user has none.
    async fn context_for(&self, user_id: &str) -> Result<(Uuid, Vec<Turn>)> {
        match self
            .history
            .latest_session(user_id, self.settings.context_turns)
            .await
        {
            Ok(Some(session)) => Ok((session.id, session.turns)),
            Ok(None) => Ok((self.history.start_session(user_id).await?.id, Vec::new())),
            Err(e) => {
                tracing::warn!(user = user_id, "history unavailable, generating without context: {e}");
                Ok((self.history.current_session_id(user_id).await?, Vec::new()))
            }
        }
    }

    /// Bound a generator call. Empty output counts as a failure.
    async fn timed(
        &self,
        call: impl std::future::Future<Output = Result<String>>,
    ) -> Result<String> {
        let text = tokio::time::timeout(self.generation_timeout, call)
            .await
            .map_err(|_| MentoraError::Timeout(self.generation_timeout.as_secs()))??;
        let text = text.trim();
        if text.is_empty() {
            return Err(MentoraError::Generation("empty response".into()));
        }
        Ok(text.to_string())
    }

    /// Run the atomic turns-plus-consume commit on its own task so a caller
    /// dropped mid-commit cannot leave it half done. The quota lock travels
    /// with the task and is released when the commit finishes.
    async fn commit_detached(
        &self,
        guard: OwnedMutexGuard<()>,
        user_id: &str,
        session_id: Uuid,
        turns: Vec<Turn>,
        day: NaiveDate,
        limit: Option<u32>,
    ) -> Result<Option<u32>> {
        let store = Arc::clone(&self.store);
        let user = user_id.to_string();
        tokio::spawn(async move {
            let _guard = guard;
            store
                .commit_exchange(&user, session_id, &turns, day, limit)
                .await
        })
        .await
        .map_err(|e| MentoraError::Persistence(format!("commit task failed: {e}")))?
        .map_err(MentoraError::into_persistence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::fallback::FIRST_TIME_WELCOME;
    use crate::model::{Role, SubscriptionQuota, TurnSource};
    use crate::storage::MemoryStorage;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    // -- Fakes --

    #[derive(Default)]
    struct FakeGenerator {
        reply: Option<String>,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl FakeGenerator {
        fn replying(reply: &str) -> Self {
            Self {
                reply: Some(reply.to_string()),
                ..Default::default()
            }
        }

        fn failing() -> Self {
            Self::default()
        }

        fn slow(reply: &str, delay: Duration) -> Self {
            Self {
                reply: Some(reply.to_string()),
                delay,
                ..Default::default()
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        async fn respond(&self) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.reply
                .clone()
                .ok_or_else(|| MentoraError::Generation("model offline".into()))
        }
    }

    impl Generator for FakeGenerator {
        async fn generate_welcome(&self, _progress: &ProgressSnapshot) -> Result<String> {
            self.respond().await
        }

        async fn generate_chat_reply(
            &self,
            _text: &str,
            _progress: &ProgressSnapshot,
            _history: &[Turn],
        ) -> Result<String> {
            self.respond().await
        }

        async fn generate_recommendation(&self, _progress: &ProgressSnapshot) -> Result<String> {
            self.respond().await
        }
    }

    struct FakeDirectory {
        progress: Option<ProgressSnapshot>,
        limit: Option<u32>,
        subscription_up: bool,
    }

    impl FakeDirectory {
        fn with_limit(limit: Option<u32>) -> Self {
            Self {
                progress: Some(ProgressSnapshot::default()),
                limit,
                subscription_up: true,
            }
        }
    }

    impl Directory for FakeDirectory {
        async fn progress(&self, _user_id: &str) -> Result<ProgressSnapshot> {
            self.progress
                .clone()
                .ok_or_else(|| MentoraError::Storage("analytics down".into()))
        }

        async fn subscription_quota(&self, _user_id: &str) -> Result<SubscriptionQuota> {
            if self.subscription_up {
                Ok(SubscriptionQuota {
                    daily_limit: self.limit,
                })
            } else {
                Err(MentoraError::Storage("billing down".into()))
            }
        }
    }

    /// Memory store whose reads or commits can be switched to fail, and
    /// whose commits can be slowed down.
    #[derive(Default)]
    struct FlakyStorage {
        inner: MemoryStorage,
        fail_reads: AtomicBool,
        fail_commit: AtomicBool,
        commit_delay: Duration,
    }

    impl FlakyStorage {
        fn check(flag: &AtomicBool, what: &str) -> Result<()> {
            if flag.load(Ordering::SeqCst) {
                return Err(MentoraError::Storage(format!("{what} failed: disk I/O error")));
            }
            Ok(())
        }
    }

    impl StorageBackend for FlakyStorage {
        async fn quota_used(&self, user_id: &str, day: NaiveDate) -> Result<u32> {
            Self::check(&self.fail_reads, "quota read")?;
            self.inner.quota_used(user_id, day).await
        }

        async fn try_consume(&self, user_id: &str, day: NaiveDate, limit: Option<u32>) -> Result<Option<u32>> {
            Self::check(&self.fail_commit, "consume")?;
            self.inner.try_consume(user_id, day, limit).await
        }

        async fn create_session(&self, session: &Session) -> Result<()> {
            self.inner.create_session(session).await
        }

        async fn latest_session(&self, user_id: &str, max_turns: usize) -> Result<Option<Session>> {
            Self::check(&self.fail_reads, "history read")?;
            self.inner.latest_session(user_id, max_turns).await
        }

        async fn list_sessions(&self, user_id: &str, limit: usize) -> Result<Vec<SessionSummary>> {
            self.inner.list_sessions(user_id, limit).await
        }

        async fn append_turns(&self, user_id: &str, session_id: Uuid, turns: &[Turn]) -> Result<()> {
            self.inner.append_turns(user_id, session_id, turns).await
        }

        async fn commit_exchange(
            &self,
            user_id: &str,
            session_id: Uuid,
            turns: &[Turn],
            day: NaiveDate,
            limit: Option<u32>,
        ) -> Result<Option<u32>> {
            Self::check(&self.fail_commit, "commit")?;
            if !self.commit_delay.is_zero() {
                tokio::time::sleep(self.commit_delay).await;
            }
            self.inner
                .commit_exchange(user_id, session_id, turns, day, limit)
                .await
        }

        async fn ping(&self) -> Result<()> {
            self.inner.ping().await
        }
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, 2).unwrap()
    }

    fn calendar() -> QuotaCalendar {
        let noon = Utc.with_ymd_and_hms(2025, 6, 2, 12, 0, 0).unwrap();
        QuotaCalendar::new(DayBoundary::Utc, Arc::new(ManualClock::new(noon)))
    }

    fn service<S: StorageBackend + 'static>(
        store: Arc<S>,
        generator: FakeGenerator,
        directory: FakeDirectory,
    ) -> CoachingService<S, FakeGenerator, FakeDirectory> {
        CoachingService::new(store, generator, directory, &MentoraConfig::default_config())
            .unwrap()
            .with_calendar(calendar())
            .with_generation_timeout(Duration::from_millis(200))
    }

    async fn preconsume<S: StorageBackend>(store: &S, n: u32) {
        for _ in 0..n {
            store.try_consume("ada", today(), None).await.unwrap();
        }
    }

    // -- Message lifecycle --

    #[test]
    fn test_state_transitions() {
        use MessageState::*;
        assert!(Drafted.can_transition_to(QuotaChecked));
        assert!(SentPending.can_transition_to(Delivered));
        assert!(!Drafted.can_transition_to(Delivered));
        assert!(!Delivered.can_transition_to(Failed));
        assert!(Delivered.consumes_quota());
        assert!(!Failed.consumes_quota());
        assert!(Failed.is_terminal() && !SentPending.is_terminal());
    }

    // -- send_message --

    #[tokio::test]
    async fn test_exhausted_quota_skips_remote_call() {
        let store = Arc::new(MemoryStorage::new());
        preconsume(&*store, 5).await;
        let svc = service(Arc::clone(&store), FakeGenerator::replying("hi"), FakeDirectory::with_limit(Some(5)));

        let outcome = svc.send_message("ada", "hello").await.unwrap();
        match outcome {
            SendOutcome::QuotaExceeded { quota } => {
                assert_eq!(quota.used, 5);
                assert_eq!(quota.remaining, Remaining::Limited(0));
            }
            other => panic!("expected QuotaExceeded, got {other:?}"),
        }
        assert_eq!(svc.generator().calls(), 0);
        assert_eq!(store.quota_used("ada", today()).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_last_unit_delivers_and_records_turns() {
        let store = Arc::new(MemoryStorage::new());
        preconsume(&*store, 4).await;
        let svc = service(Arc::clone(&store), FakeGenerator::replying("Keep going!"), FakeDirectory::with_limit(Some(5)));

        let outcome = svc.send_message("ada", "hello").await.unwrap();
        let SendOutcome::Delivered { reply, quota, session_id } = outcome else {
            panic!("expected Delivered");
        };
        assert_eq!(reply.content, "Keep going!");
        assert_eq!(quota.used, 5);
        assert_eq!(store.quota_used("ada", today()).await.unwrap(), 5);

        let session = store.latest_session("ada", 10).await.unwrap().unwrap();
        assert_eq!(session.id, session_id);
        let tail: Vec<_> = session.turns.iter().map(|t| (t.role, t.content.as_str())).collect();
        assert_eq!(tail, vec![(Role::User, "hello"), (Role::Assistant, "Keep going!")]);
    }

    #[tokio::test]
    async fn test_failed_generation_writes_apology_without_consuming() {
        let store = Arc::new(MemoryStorage::new());
        preconsume(&*store, 1).await;
        let svc = service(Arc::clone(&store), FakeGenerator::failing(), FakeDirectory::with_limit(Some(5)));

        let outcome = svc.send_message("ada", "are you there?").await.unwrap();
        let SendOutcome::GenerationFailed { fallback_turn, reason, .. } = outcome else {
            panic!("expected GenerationFailed");
        };
        assert!(!fallback_turn.content.is_empty());
        assert_eq!(fallback_turn.source, TurnSource::Fallback);
        assert!(reason.contains("model offline"));
        assert_eq!(store.quota_used("ada", today()).await.unwrap(), 1);

        let session = store.latest_session("ada", 10).await.unwrap().unwrap();
        assert_eq!(session.turns.len(), 2);
        assert_eq!(session.turns[0].content, "are you there?");
        assert_eq!(session.turns[1].content, CHAT_APOLOGY);
    }

    #[tokio::test]
    async fn test_generation_timeout_is_a_failure() {
        let store = Arc::new(MemoryStorage::new());
        let svc = service(
            Arc::clone(&store),
            FakeGenerator::slow("too late", Duration::from_secs(5)),
            FakeDirectory::with_limit(Some(5)),
        )
        .with_generation_timeout(Duration::from_millis(20));

        let outcome = svc.send_message("ada", "hello").await.unwrap();
        assert!(matches!(outcome, SendOutcome::GenerationFailed { .. }));
        assert_eq!(store.quota_used("ada", today()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_empty_reply_is_a_failure() {
        let store = Arc::new(MemoryStorage::new());
        let svc = service(Arc::clone(&store), FakeGenerator::replying("   "), FakeDirectory::with_limit(None));
        let outcome = svc.send_message("ada", "hello").await.unwrap();
        assert!(matches!(outcome, SendOutcome::GenerationFailed { .. }));
        assert_eq!(store.quota_used("ada", today()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_blank_message_rejected() {
        let svc = service(Arc::new(MemoryStorage::new()), FakeGenerator::replying("hi"), FakeDirectory::with_limit(Some(5)));
        let err = svc.send_message("ada", "  \n ").await.unwrap_err();
        assert!(matches!(err, MentoraError::InvalidInput(_)));
        assert_eq!(svc.generator().calls(), 0);
    }

    #[tokio::test]
    async fn test_commit_failure_is_persistence_error() {
        let store = Arc::new(FlakyStorage::default());
        store.fail_commit.store(true, Ordering::SeqCst);
        let svc = service(Arc::clone(&store), FakeGenerator::replying("ok"), FakeDirectory::with_limit(Some(5)));

        let err = svc.send_message("ada", "hello").await.unwrap_err();
        assert!(matches!(err, MentoraError::Persistence(_)));
        assert_eq!(store.inner.quota_used("ada", today()).await.unwrap(), 0);
        let session = store.inner.latest_session("ada", 10).await.unwrap().unwrap();
        assert!(session.turns.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_sends_never_exceed_remaining() {
        let store = Arc::new(MemoryStorage::new());
        preconsume(&*store, 2).await;
        let svc = Arc::new(service(
            Arc::clone(&store),
            FakeGenerator::slow("sure", Duration::from_millis(5)),
            FakeDirectory::with_limit(Some(5)),
        ));

        let mut handles = Vec::new();
        for i in 0..10 {
            let svc = Arc::clone(&svc);
            handles.push(tokio::spawn(async move {
                svc.send_message("ada", &format!("question {i}")).await.unwrap()
            }));
        }
        let mut delivered = 0;
        let mut exceeded = 0;
        for h in handles {
            match h.await.unwrap() {
                SendOutcome::Delivered { .. } => delivered += 1,
                SendOutcome::QuotaExceeded { .. } => exceeded += 1,
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(delivered, 3);
        assert_eq!(exceeded, 7);
        assert_eq!(store.quota_used("ada", today()).await.unwrap(), 5);
        assert_eq!(svc.generator().calls(), 3);
    }

    #[tokio::test]
    async fn test_cancelled_send_leaves_no_trace() {
        let store = Arc::new(MemoryStorage::new());
        let svc = Arc::new(service(
            Arc::clone(&store),
            FakeGenerator::slow("eventually", Duration::from_millis(150)),
            FakeDirectory::with_limit(Some(5)),
        ));

        let task = {
            let svc = Arc::clone(&svc);
            tokio::spawn(async move { svc.send_message("ada", "hello").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        task.abort();
        let _ = task.await;

        assert_eq!(store.quota_used("ada", today()).await.unwrap(), 0);
        // The lock was released with the dropped future.
        let next = tokio::time::timeout(Duration::from_secs(1), svc.send_message("ada", "again")).await;
        assert!(matches!(next, Ok(Ok(SendOutcome::Delivered { .. }))));
    }

    #[tokio::test]
    async fn test_cancel_during_commit_still_records_exchange() {
        let store = Arc::new(FlakyStorage {
            commit_delay: Duration::from_millis(100),
            ..Default::default()
        });
        let svc = Arc::new(service(
            Arc::clone(&store),
            FakeGenerator::replying("keep going"),
            FakeDirectory::with_limit(Some(5)),
        ));

        let task = {
            let svc = Arc::clone(&svc);
            tokio::spawn(async move { svc.send_message("ada", "hello").await })
        };
        // Generation is instant, so the caller is parked on the commit here.
        tokio::time::sleep(Duration::from_millis(30)).await;
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(store.quota_used("ada", today()).await.unwrap(), 1);
        let session = store.latest_session("ada", 50).await.unwrap().unwrap();
        let contents: Vec<_> = session.turns.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(contents, vec!["hello", "keep going"]);
    }

    #[tokio::test]
    async fn test_subscription_outage_uses_default_tier() {
        let store = Arc::new(MemoryStorage::new());
        preconsume(&*store, 5).await;
        let mut directory = FakeDirectory::with_limit(None);
        directory.subscription_up = false;
        let svc = service(Arc::clone(&store), FakeGenerator::replying("hi"), directory);

        // Default tier "free" allows 5 per day.
        let outcome = svc.send_message("ada", "hello").await.unwrap();
        assert!(matches!(outcome, SendOutcome::QuotaExceeded { .. }));
    }

    #[tokio::test]
    async fn test_quota_resets_on_new_day() {
        let store = Arc::new(MemoryStorage::new());
        preconsume(&*store, 5).await;
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 6, 2, 23, 59, 0).unwrap()));
        let svc = service(Arc::clone(&store), FakeGenerator::replying("hi"), FakeDirectory::with_limit(Some(5)))
            .with_calendar(QuotaCalendar::new(DayBoundary::Utc, clock.clone()));

        assert_eq!(svc.quota_status("ada").await.unwrap().remaining, Remaining::Limited(0));
        clock.advance(chrono::Duration::minutes(2));
        let status = svc.quota_status("ada").await.unwrap();
        assert_eq!(status.day, today().succ_opt().unwrap());
        assert_eq!(status.remaining, Remaining::Limited(5));
    }

    // -- get_recommendation --

    #[tokio::test]
    async fn test_recommendation_consumes_on_success() {
        let store = Arc::new(MemoryStorage::new());
        let svc = service(Arc::clone(&store), FakeGenerator::replying("Try recipe 4"), FakeDirectory::with_limit(Some(2)));

        let outcome = svc.get_recommendation("ada").await.unwrap();
        let RecommendationOutcome::Delivered { recommendation, quota } = outcome else {
            panic!("expected Delivered");
        };
        assert_eq!(recommendation, "Try recipe 4");
        assert_eq!(quota.remaining, Remaining::Limited(1));
        assert!(store.latest_session("ada", 10).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recommendation_failure_is_free() {
        let store = Arc::new(MemoryStorage::new());
        let svc = service(Arc::clone(&store), FakeGenerator::failing(), FakeDirectory::with_limit(Some(2)));

        let outcome = svc.get_recommendation("ada").await.unwrap();
        let RecommendationOutcome::GenerationFailed { message, .. } = outcome else {
            panic!("expected GenerationFailed");
        };
        assert_eq!(message, RECOMMENDATION_UNAVAILABLE);
        assert_eq!(store.quota_used("ada", today()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_recommendation_gated_by_quota() {
        let store = Arc::new(MemoryStorage::new());
        preconsume(&*store, 2).await;
        let svc = service(Arc::clone(&store), FakeGenerator::replying("x"), FakeDirectory::with_limit(Some(2)));
        let outcome = svc.get_recommendation("ada").await.unwrap();
        assert!(matches!(outcome, RecommendationOutcome::QuotaExceeded { .. }));
        assert_eq!(svc.generator().calls(), 0);
    }

    // -- load_session --

    #[tokio::test]
    async fn test_load_uses_remote_welcome() {
        let svc = service(Arc::new(MemoryStorage::new()), FakeGenerator::replying("Hey Ada!"), FakeDirectory::with_limit(Some(5)));
        let view = svc.load_session("ada").await;
        assert_eq!(view.welcome_message, "Hey Ada!");
        assert_eq!(view.welcome_source, WelcomeSource::Remote);
        assert!(view.session_id.is_none());
        assert!(view.history.is_empty());
        assert_eq!(view.quota.remaining, Remaining::Limited(5));
    }

    #[tokio::test]
    async fn test_load_falls_back_to_rules_for_new_learner() {
        let svc = service(Arc::new(MemoryStorage::new()), FakeGenerator::failing(), FakeDirectory::with_limit(Some(5)));
        let view = svc.load_session("ada").await;
        assert_eq!(view.welcome_message, FIRST_TIME_WELCOME);
        assert_eq!(view.welcome_source, WelcomeSource::Rules);
    }

    #[tokio::test]
    async fn test_load_without_progress_is_generic() {
        let mut directory = FakeDirectory::with_limit(Some(5));
        directory.progress = None;
        let svc = service(Arc::new(MemoryStorage::new()), FakeGenerator::replying("unused"), directory);
        let view = svc.load_session("ada").await;
        assert_eq!(view.welcome_message, GENERIC_WELCOME);
        assert_eq!(view.welcome_source, WelcomeSource::Generic);
        assert_eq!(svc.generator().calls(), 0);
    }

    #[tokio::test]
    async fn test_load_survives_storage_outage() {
        let store = Arc::new(FlakyStorage::default());
        store.fail_reads.store(true, Ordering::SeqCst);
        let svc = service(Arc::clone(&store), FakeGenerator::failing(), FakeDirectory::with_limit(Some(5)));
        let view = svc.load_session("ada").await;
        assert!(view.history.is_empty());
        assert_eq!(view.quota.used, 0);
        assert_eq!(view.welcome_source, WelcomeSource::Rules);
    }

    #[tokio::test]
    async fn test_load_returns_prior_history() {
        let store = Arc::new(MemoryStorage::new());
        let svc = service(Arc::clone(&store), FakeGenerator::replying("Keep going!"), FakeDirectory::with_limit(Some(5)));
        svc.send_message("ada", "hello").await.unwrap();

        let view = svc.load_session("ada").await;
        assert!(view.session_id.is_some());
        assert_eq!(view.history.len(), 2);
        assert_eq!(view.quota.used, 1);
    }

    #[tokio::test]
    async fn test_start_session_resets_visible_history() {
        let store = Arc::new(MemoryStorage::new());
        let svc = service(Arc::clone(&store), FakeGenerator::replying("ok"), FakeDirectory::with_limit(None));
        svc.send_message("ada", "hello").await.unwrap();
        let fresh = svc.start_session("ada").await.unwrap();

        let view = svc.load_session("ada").await;
        assert_eq!(view.session_id, Some(fresh.id));
        assert!(view.history.is_empty());
        assert_eq!(svc.list_sessions("ada", 10).await.unwrap().len(), 2);
    }

    #[test]
    fn test_outcome_serializes_with_status_tag() {
        let quota = QuotaStatus::from(&QuotaRecord::new("ada", today(), Some(5), 5));
        let json = serde_json::to_value(SendOutcome::QuotaExceeded { quota }).unwrap();
        assert_eq!(json["status"], "quota_exceeded");
        assert_eq!(json["quota"]["remaining"], 0);
        assert_eq!(json["quota"]["day"], "2025-06-02");
    }
}
