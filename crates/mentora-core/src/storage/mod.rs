mod backend;
mod memory;
mod sqlite;

pub use backend::StorageBackend;
pub use memory::MemoryStorage;
pub use sqlite::{SqliteStorage, SCHEMA_VERSION};

use chrono::NaiveDate;
use uuid::Uuid;

use crate::config::MentoraConfig;
use crate::error::{MentoraError, Result};
use crate::model::*;

/// Enum wrapper for storage backends. Dispatches to the concrete implementation.
/// Using an enum instead of `Box<dyn StorageBackend>` because the trait uses RPITIT.
pub enum Storage {
    Sqlite(SqliteStorage),
    Memory(MemoryStorage),
}

impl StorageBackend for Storage {
    async fn quota_used(&self, user_id: &str, day: NaiveDate) -> Result<u32> {
        match self {
            Storage::Sqlite(s) => s.quota_used(user_id, day).await,
            Storage::Memory(s) => s.quota_used(user_id, day).await,
        }
    }

    async fn try_consume(
        &self,
        user_id: &str,
        day: NaiveDate,
        limit: Option<u32>,
    ) -> Result<Option<u32>> {
        match self {
            Storage::Sqlite(s) => s.try_consume(user_id, day, limit).await,
            Storage::Memory(s) => s.try_consume(user_id, day, limit).await,
        }
    }

    async fn create_session(&self, session: &Session) -> Result<()> {
        match self {
            Storage::Sqlite(s) => s.create_session(session).await,
            Storage::Memory(s) => s.create_session(session).await,
        }
    }

    async fn latest_session(&self, user_id: &str, max_turns: usize) -> Result<Option<Session>> {
        match self {
            Storage::Sqlite(s) => s.latest_session(user_id, max_turns).await,
            Storage::Memory(s) => s.latest_session(user_id, max_turns).await,
        }
    }

    async fn list_sessions(&self, user_id: &str, limit: usize) -> Result<Vec<SessionSummary>> {
        match self {
            Storage::Sqlite(s) => s.list_sessions(user_id, limit).await,
            Storage::Memory(s) => s.list_sessions(user_id, limit).await,
        }
    }

    async fn append_turns(&self, user_id: &str, session_id: Uuid, turns: &[Turn]) -> Result<()> {
        match self {
            Storage::Sqlite(s) => s.append_turns(user_id, session_id, turns).await,
            Storage::Memory(s) => s.append_turns(user_id, session_id, turns).await,
        }
    }

    async fn commit_exchange(
        &self,
        user_id: &str,
        session_id: Uuid,
        turns: &[Turn],
        day: NaiveDate,
        limit: Option<u32>,
    ) -> Result<Option<u32>> {
        match self {
            Storage::Sqlite(s) => {
                s.commit_exchange(user_id, session_id, turns, day, limit)
                    .await
            }
            Storage::Memory(s) => {
                s.commit_exchange(user_id, session_id, turns, day, limit)
                    .await
            }
        }
    }

    async fn ping(&self) -> Result<()> {
        match self {
            Storage::Sqlite(s) => s.ping().await,
            Storage::Memory(s) => s.ping().await,
        }
    }
}

impl Storage {
    /// Return the schema version for SQLite, `None` for the in-memory store.
    pub fn schema_info(&self) -> Option<i32> {
        match self {
            Storage::Sqlite(s) => s.schema_info().ok(),
            Storage::Memory(_) => None,
        }
    }

    pub fn backend_name(&self) -> &'static str {
        match self {
            Storage::Sqlite(_) => "sqlite",
            Storage::Memory(_) => "memory",
        }
    }
}

/// Create a storage backend from the given configuration.
pub fn create_backend(config: &MentoraConfig) -> Result<Storage> {
    match config.storage.backend.as_str() {
        "sqlite" => {
            let path = match &config.storage.path {
                Some(p) => std::path::PathBuf::from(p),
                None => default_sqlite_path()?,
            };
            let storage = SqliteStorage::open(&path)?;
            tracing::info!(path = %path.display(), "opened sqlite store");
            Ok(Storage::Sqlite(storage))
        }
        "memory" => {
            tracing::warn!("using in-memory store; quota and history are lost on restart");
            Ok(Storage::Memory(MemoryStorage::new()))
        }
        other => Err(MentoraError::Config(format!(
            "unknown storage backend: {other}"
        ))),
    }
}

/// Default SQLite path: `~/.config/mentora/mentora.db`
fn default_sqlite_path() -> Result<std::path::PathBuf> {
    dirs::config_dir()
        .map(|p| p.join("mentora").join("mentora.db"))
        .ok_or_else(|| MentoraError::Config("cannot determine config directory".to_string()))
}
