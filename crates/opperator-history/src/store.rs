//! Relational conversation/message store: WAL-mode sqlite, a
//! single writer connection guarded by a mutex, opened with a busy timeout
//! of at least 10 s. Writers retry on "database is busy" with exponential
//! backoff before surfacing failure.

use opperator_core::{ContentPart, Error, Message, Result, Role, SessionId};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

const BACKOFF_STEPS_MS: [u64; 3] = [100, 200, 400];

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(sqlite_err)?;
        conn.busy_timeout(Duration::from_secs(10)).map_err(sqlite_err)?;
        conn.pragma_update(None, "journal_mode", "WAL").map_err(sqlite_err)?;
        conn.execute_batch(SCHEMA).map_err(sqlite_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(sqlite_err)?;
        conn.execute_batch(SCHEMA).map_err(sqlite_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Runs `f` against the connection, retrying on a busy error with a
    /// fixed backoff schedule before surfacing `StoreBusy`.
    pub fn with_retry<T>(&self, f: impl Fn(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let conn = self.conn.lock().unwrap();
        let mut last_err = None;
        for delay_ms in BACKOFF_STEPS_MS {
            match f(&conn) {
                Ok(v) => return Ok(v),
                Err(e) if is_busy(&e) => {
                    last_err = Some(e);
                    std::thread::sleep(Duration::from_millis(delay_ms));
                }
                Err(e) => return Err(sqlite_err(e)),
            }
        }
        match f(&conn) {
            Ok(v) => Ok(v),
            Err(_) => {
                tracing::warn!(?last_err, "store busy after retries");
                Err(Error::StoreBusy)
            }
        }
    }

    pub fn ensure_conversation(&self, session: &SessionId) -> Result<()> {
        self.with_retry(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO conversations (id, title, created_at, active_agent, focused_agent_name) VALUES (?1, ?2, ?3, NULL, NULL)",
                params![session.as_str(), "", now()],
            )
        })?;
        Ok(())
    }

    pub fn message_count(&self, session: &SessionId) -> Result<i64> {
        self.with_retry(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE session_id = ?1",
                params![session.as_str()],
                |row| row.get(0),
            )
        })
        .map_err(Into::into)
    }

    pub fn set_title(&self, session: &SessionId, title: &str) -> Result<()> {
        self.with_retry(|conn| {
            conn.execute(
                "UPDATE conversations SET title = ?1 WHERE id = ?2",
                params![title, session.as_str()],
            )
        })?;
        Ok(())
    }

    pub fn insert_message(&self, session: &SessionId, role: Role, parts: &[ContentPart]) -> Result<i64> {
        let parts_json = serde_json::to_string(parts)?;
        let role_str = serde_json::to_value(role)?.as_str().unwrap().to_string();
        self.with_retry(|conn| {
            conn.execute(
                "INSERT INTO messages (session_id, role, parts, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![session.as_str(), role_str, parts_json, now()],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn load_messages(&self, session: &SessionId) -> Result<Vec<Message>> {
        self.with_retry(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, role, parts, created_at FROM messages WHERE session_id = ?1 ORDER BY id ASC",
            )?;
            let rows = stmt.query_map(params![session.as_str()], |row| {
                let id: i64 = row.get(0)?;
                let role_str: String = row.get(1)?;
                let parts_json: String = row.get(2)?;
                let created_at: i64 = row.get(3)?;
                Ok((id, role_str, parts_json, created_at))
            })?;

            let mut out = Vec::new();
            for row in rows {
                let (id, role_str, parts_json, created_at) = row?;
                let role: Role = serde_json::from_value(serde_json::Value::String(role_str))
                    .unwrap_or(Role::System);
                let parts: Vec<ContentPart> = serde_json::from_str(&parts_json).unwrap_or_default();
                out.push(Message {
                    id,
                    session_id: session.clone(),
                    role,
                    parts,
                    created_at,
                });
            }
            Ok(out)
        })
    }

    pub fn delete_session(&self, session: &SessionId) -> Result<()> {
        self.with_retry(|conn| {
            conn.execute("DELETE FROM messages WHERE session_id = ?1", params![session.as_str()])?;
            conn.execute("DELETE FROM conversations WHERE id = ?1", params![session.as_str()])
        })?;
        Ok(())
    }

    pub fn conversation_exists(&self, session: &SessionId) -> Result<bool> {
        let exists: Option<String> = self.with_retry(|conn| {
            conn.query_row(
                "SELECT id FROM conversations WHERE id = ?1",
                params![session.as_str()],
                |row| row.get(0),
            )
            .optional()
        })?;
        Ok(exists.is_some())
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(ffi_err, _)
            if ffi_err.code == rusqlite::ErrorCode::DatabaseBusy
    )
}

fn sqlite_err(e: rusqlite::Error) -> Error {
    Error::internal(format!("sqlite: {e}"))
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL DEFAULT '',
    created_at INTEGER NOT NULL,
    active_agent TEXT,
    focused_agent_name TEXT
);

CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    role TEXT NOT NULL,
    parts TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_session ON messages (session_id);
"#;
