use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::StorageBackend;
use crate::error::{MentoraError, Result};
use crate::model::*;

/// Current on-disk schema version, recorded in `schema_meta`.
pub const SCHEMA_VERSION: i32 = 1;

/// SQLite-backed storage for quota records and session history.
///
/// Uses a single `Connection` behind `Arc<Mutex<>>` so it can be shared
/// across async tasks. All blocking SQLite calls go through
/// [`with_conn`](Self::with_conn) which runs them on the Tokio blocking
/// thread-pool.
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl SqliteStorage {
    /// Open (or create) a file-backed SQLite database at `path`.
    ///
    /// Sets WAL journal mode and enables foreign keys, then creates all
    /// tables and indexes if they don't already exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    MentoraError::Storage(format!("failed to create database directory: {e}"))
                })?;
            }
        }
        let conn = Connection::open(&path)
            .map_err(|e| MentoraError::Storage(format!("failed to open SQLite database: {e}")))?;

        Self::configure_and_init(conn, path)
    }

    /// Open an in-memory SQLite database (useful for tests).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| {
            MentoraError::Storage(format!("failed to open in-memory SQLite database: {e}"))
        })?;

        Self::configure_and_init(conn, PathBuf::from(":memory:"))
    }

    /// Return the path this database was opened with (`:memory:` for in-memory).
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Schema version stored in the database.
    pub fn schema_info(&self) -> Result<i32> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT value FROM schema_meta WHERE key = 'schema_version'",
            [],
            |row| row.get::<_, String>(0),
        )
        .map_err(storage_err)?
        .parse()
        .map_err(|e| MentoraError::Storage(format!("corrupt schema_version: {e}")))
    }

    // ── helpers ────────────────────────────────────────────────────────

    fn configure_and_init(conn: Connection, path: PathBuf) -> Result<Self> {
        // WAL mode for better concurrent-read performance.
        conn.execute_batch("PRAGMA journal_mode = WAL;")
            .map_err(|e| MentoraError::Storage(format!("failed to set WAL mode: {e}")))?;

        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(|e| MentoraError::Storage(format!("failed to enable foreign keys: {e}")))?;

        // Other processes may hold the write lock briefly.
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(|e| MentoraError::Storage(format!("failed to set busy timeout: {e}")))?;

        let storage = Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        };

        storage.create_tables()?;
        Ok(storage)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| MentoraError::Storage(format!("failed to acquire database lock: {e}")))
    }

    /// Create all tables and indexes (idempotent).
    fn create_tables(&self) -> Result<()> {
        let conn = self.lock()?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS schema_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS quota_usage (
                user_id TEXT NOT NULL,
                day TEXT NOT NULL,
                used INTEGER NOT NULL DEFAULT 0 CHECK (used >= 0),
                updated_at TEXT NOT NULL,
                PRIMARY KEY (user_id, day)
            );

            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS turns (
                session_id TEXT NOT NULL REFERENCES sessions(id),
                seq INTEGER NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                source TEXT NOT NULL DEFAULT 'learner',
                created_at TEXT NOT NULL,
                PRIMARY KEY (session_id, seq)
            );

            CREATE INDEX IF NOT EXISTS idx_sessions_user_created ON sessions(user_id, created_at DESC);
            ",
        )
        .map_err(|e| MentoraError::Storage(format!("failed to create tables: {e}")))?;

        conn.execute(
            "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', ?1)",
            params![SCHEMA_VERSION.to_string()],
        )
        .map_err(|e| MentoraError::Storage(format!("failed to record schema version: {e}")))?;

        Ok(())
    }

    /// Run a blocking closure against the SQLite connection on the Tokio
    /// blocking thread-pool.
    pub(crate) async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|e| {
                MentoraError::Storage(format!("failed to acquire database lock: {e}"))
            })?;
            f(&conn)
        })
        .await
        .map_err(|e| MentoraError::Storage(format!("task join error: {e}")))?
    }
}

fn storage_err(e: rusqlite::Error) -> MentoraError {
    MentoraError::Storage(e.to_string())
}

fn ts(at: DateTime<Utc>) -> String {
    // Fixed-width so lexical order matches time order.
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| MentoraError::Storage(format!("bad timestamp '{raw}': {e}")))
}

fn ensure_quota_row(conn: &Connection, user_id: &str, day: NaiveDate) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO quota_usage (user_id, day, used, updated_at) VALUES (?1, ?2, 0, ?3)",
        params![user_id, day.to_string(), ts(Utc::now())],
    )
    .map_err(storage_err)?;
    Ok(())
}

fn read_used(conn: &Connection, user_id: &str, day: NaiveDate) -> Result<u32> {
    conn.query_row(
        "SELECT used FROM quota_usage WHERE user_id = ?1 AND day = ?2",
        params![user_id, day.to_string()],
        |row| row.get::<_, u32>(0),
    )
    .map_err(storage_err)
}

fn conditional_increment(
    conn: &Connection,
    user_id: &str,
    day: NaiveDate,
    limit: Option<u32>,
) -> Result<Option<u32>> {
    ensure_quota_row(conn, user_id, day)?;
    let now = ts(Utc::now());
    let changed = match limit {
        Some(limit) => conn.execute(
            "UPDATE quota_usage SET used = used + 1, updated_at = ?3
             WHERE user_id = ?1 AND day = ?2 AND used < ?4",
            params![user_id, day.to_string(), now, limit],
        ),
        None => conn.execute(
            "UPDATE quota_usage SET used = used + 1, updated_at = ?3
             WHERE user_id = ?1 AND day = ?2",
            params![user_id, day.to_string(), now],
        ),
    }
    .map_err(storage_err)?;

    if changed == 0 {
        return Ok(None);
    }
    read_used(conn, user_id, day).map(Some)
}

fn insert_turns(conn: &Connection, user_id: &str, session_id: Uuid, turns: &[Turn]) -> Result<()> {
    let owner: Option<String> = conn
        .query_row(
            "SELECT user_id FROM sessions WHERE id = ?1",
            params![session_id.to_string()],
            |row| row.get(0),
        )
        .optional()
        .map_err(storage_err)?;
    match owner {
        Some(owner) if owner == user_id => {}
        _ => {
            return Err(MentoraError::NotFound(format!(
                "session {session_id} for user {user_id}"
            )))
        }
    }

    let next_seq: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(seq), -1) + 1 FROM turns WHERE session_id = ?1",
            params![session_id.to_string()],
            |row| row.get(0),
        )
        .map_err(storage_err)?;

    let mut stmt = conn
        .prepare(
            "INSERT INTO turns (session_id, seq, role, content, source, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .map_err(storage_err)?;
    for (offset, turn) in turns.iter().enumerate() {
        stmt.execute(params![
            session_id.to_string(),
            next_seq + offset as i64,
            turn.role.to_string(),
            turn.content,
            turn.source.to_string(),
            ts(turn.timestamp),
        ])
        .map_err(storage_err)?;
    }
    Ok(())
}

fn load_turns(conn: &Connection, session_id: &str, max_turns: usize) -> Result<Vec<Turn>> {
    let mut stmt = conn
        .prepare(
            "SELECT role, content, source, created_at FROM (
                SELECT seq, role, content, source, created_at FROM turns
                WHERE session_id = ?1 ORDER BY seq DESC LIMIT ?2
             ) ORDER BY seq ASC",
        )
        .map_err(storage_err)?;
    let rows = stmt
        .query_map(params![session_id, max_turns as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })
        .map_err(storage_err)?;

    let mut turns = Vec::new();
    for row in rows {
        let (role, content, source, created_at) = row.map_err(storage_err)?;
        turns.push(Turn {
            role: role.parse()?,
            content,
            timestamp: parse_ts(&created_at)?,
            source: source.parse()?,
        });
    }
    Ok(turns)
}

impl StorageBackend for SqliteStorage {
    async fn quota_used(&self, user_id: &str, day: NaiveDate) -> Result<u32> {
        let user_id = user_id.to_string();
        self.with_conn(move |conn| {
            ensure_quota_row(conn, &user_id, day)?;
            read_used(conn, &user_id, day)
        })
        .await
    }

    async fn try_consume(
        &self,
        user_id: &str,
        day: NaiveDate,
        limit: Option<u32>,
    ) -> Result<Option<u32>> {
        let user_id = user_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction().map_err(storage_err)?;
            let used = conditional_increment(&tx, &user_id, day, limit)?;
            tx.commit().map_err(storage_err)?;
            Ok(used)
        })
        .await
    }

    async fn create_session(&self, session: &Session) -> Result<()> {
        let session = session.clone();
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction().map_err(storage_err)?;
            tx.execute(
                "INSERT INTO sessions (id, user_id, created_at) VALUES (?1, ?2, ?3)",
                params![
                    session.id.to_string(),
                    session.user_id,
                    ts(session.created_at)
                ],
            )
            .map_err(storage_err)?;
            if !session.turns.is_empty() {
                insert_turns(&tx, &session.user_id, session.id, &session.turns)?;
            }
            tx.commit().map_err(storage_err)
        })
        .await
    }

    async fn latest_session(&self, user_id: &str, max_turns: usize) -> Result<Option<Session>> {
        let user_id = user_id.to_string();
        self.with_conn(move |conn| {
            let row: Option<(String, String)> = conn
                .query_row(
                    "SELECT id, created_at FROM sessions WHERE user_id = ?1
                     ORDER BY created_at DESC, rowid DESC LIMIT 1",
                    params![user_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(storage_err)?;

            let Some((id, created_at)) = row else {
                return Ok(None);
            };
            let turns = load_turns(conn, &id, max_turns)?;
            Ok(Some(Session {
                id: id
                    .parse()
                    .map_err(|e| MentoraError::Storage(format!("bad session id '{id}': {e}")))?,
                user_id,
                created_at: parse_ts(&created_at)?,
                turns,
            }))
        })
        .await
    }

    async fn list_sessions(&self, user_id: &str, limit: usize) -> Result<Vec<SessionSummary>> {
        let user_id = user_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT s.id, s.created_at, COUNT(t.seq), MAX(t.created_at)
                     FROM sessions s LEFT JOIN turns t ON t.session_id = s.id
                     WHERE s.user_id = ?1
                     GROUP BY s.id
                     ORDER BY s.created_at DESC, s.rowid DESC
                     LIMIT ?2",
                )
                .map_err(storage_err)?;
            let rows = stmt
                .query_map(params![user_id, limit as i64], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, Option<String>>(3)?,
                    ))
                })
                .map_err(storage_err)?;

            let mut out = Vec::new();
            for row in rows {
                let (id, created_at, count, last) = row.map_err(storage_err)?;
                out.push(SessionSummary {
                    id: id.parse().map_err(|e| {
                        MentoraError::Storage(format!("bad session id '{id}': {e}"))
                    })?,
                    created_at: parse_ts(&created_at)?,
                    turn_count: count as usize,
                    last_turn_at: last.as_deref().map(parse_ts).transpose()?,
                });
            }
            Ok(out)
        })
        .await
    }

    async fn append_turns(&self, user_id: &str, session_id: Uuid, turns: &[Turn]) -> Result<()> {
        let user_id = user_id.to_string();
        let turns = turns.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction().map_err(storage_err)?;
            insert_turns(&tx, &user_id, session_id, &turns)?;
            tx.commit().map_err(storage_err)
        })
        .await
    }

    async fn commit_exchange(
        &self,
        user_id: &str,
        session_id: Uuid,
        turns: &[Turn],
        day: NaiveDate,
        limit: Option<u32>,
    ) -> Result<Option<u32>> {
        let user_id = user_id.to_string();
        let turns = turns.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction().map_err(storage_err)?;
            let Some(used) = conditional_increment(&tx, &user_id, day, limit)? else {
                // Dropping the transaction rolls back the row insert.
                return Ok(None);
            };
            insert_turns(&tx, &user_id, session_id, &turns)?;
            tx.commit().map_err(storage_err)?;
            Ok(Some(used))
        })
        .await
    }

    async fn ping(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .map_err(storage_err)?;
            Ok(())
        })
        .await
    }
}
