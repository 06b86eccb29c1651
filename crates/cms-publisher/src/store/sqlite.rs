//! SQLite store.
//!
//! SQLite has a single writer, so skip-locked selection happens at database
//! granularity: a sweep opens its transaction with `BEGIN IMMEDIATE` on a
//! connection with no busy timeout. If another sweep already holds the write
//! lock, every candidate row is by definition locked elsewhere and the claim
//! returns an empty set instead of waiting.
//!
//! Timestamps are stored as fixed-width RFC 3339 text with microseconds and a
//! `Z` suffix, so lexicographic comparison in SQL matches time order.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use tracing::{debug, info};

use crate::clock::Clock;
use crate::store::{CatalogStore, PublicationStore, SweepTransaction};
use crate::types::{
    DueLesson, Lesson, LessonId, LessonStatus, LessonStatusChange, Program, ProgramId,
    ProgramStatus, Term,
};
use crate::StoreError;

/// How long editor writes wait for a sweep to release the write lock.
const EDITOR_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS programs (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'draft',
    language_primary TEXT NOT NULL,
    published_at TEXT,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);
CREATE INDEX IF NOT EXISTS idx_programs_status_language
    ON programs(status, language_primary, published_at);

CREATE TABLE IF NOT EXISTS terms (
    id TEXT PRIMARY KEY,
    program_id TEXT NOT NULL REFERENCES programs(id) ON DELETE CASCADE,
    term_number INTEGER NOT NULL,
    title TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    UNIQUE (program_id, term_number)
);

CREATE TABLE IF NOT EXISTS lessons (
    id TEXT PRIMARY KEY,
    term_id TEXT NOT NULL REFERENCES terms(id) ON DELETE CASCADE,
    lesson_number INTEGER NOT NULL,
    title TEXT NOT NULL,
    content_type TEXT NOT NULL DEFAULT 'video',
    status TEXT NOT NULL DEFAULT 'draft',
    publish_at TEXT,
    published_at TEXT,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    UNIQUE (term_id, lesson_number)
);
CREATE INDEX IF NOT EXISTS idx_lessons_status_publish_at ON lessons(status, publish_at);
";

/// SQLite-backed catalog.
pub struct SqliteStore {
    path: PathBuf,
    clock: Arc<dyn Clock>,
    /// Connection for editor-side reads and writes.
    editor: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create the database file.
    pub async fn open(path: impl AsRef<Path>, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let editor_path = path.clone();

        let conn = tokio::task::spawn_blocking(move || -> Result<Connection, StoreError> {
            let conn = open_connection(&editor_path, EDITOR_BUSY_TIMEOUT)?;
            // WAL keeps catalog reads flowing while a sweep holds the write lock.
            conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
            Ok(conn)
        })
        .await
        .map_err(join_error)??;

        info!(path = %path.display(), "sqlite store opened");

        Ok(Self {
            path,
            clock,
            editor: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create tables and indexes if missing.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        run(&self.editor, |conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;
        info!(path = %self.path.display(), "sqlite schema ready");
        Ok(())
    }
}

fn open_connection(path: &Path, busy_timeout: Duration) -> Result<Connection, StoreError> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(busy_timeout)?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    Ok(conn)
}

/// Run `f` against `conn` on the blocking pool.
async fn run<T, F>(conn: &Arc<Mutex<Connection>>, f: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
{
    let conn = Arc::clone(conn);
    tokio::task::spawn_blocking(move || {
        let mut guard = conn
            .lock()
            .map_err(|_| StoreError::Join("sqlite connection lock poisoned".to_string()))?;
        f(&mut guard)
    })
    .await
    .map_err(join_error)?
}

fn join_error(e: tokio::task::JoinError) -> StoreError {
    StoreError::Join(e.to_string())
}

fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked)
    )
}

pub(crate) fn encode_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn decode_ts(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StoreError::InvalidRow(format!("invalid timestamp '{}': {}", s, e)))
}

fn decode_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    s.as_deref().map(decode_ts).transpose()
}

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
enum TxnState {
    Open,
    /// Another connection held the write lock at `BEGIN IMMEDIATE`.
    Contended,
    Finished,
}

/// Sweep transaction on a dedicated connection.
///
/// Dropping it closes the connection, which rolls back anything uncommitted.
pub struct SqliteTransaction {
    conn: Arc<Mutex<Connection>>,
    now: DateTime<Utc>,
    state: TxnState,
}

impl SqliteTransaction {
    fn ensure_open(&self) -> Result<(), StoreError> {
        match self.state {
            TxnState::Open => Ok(()),
            TxnState::Contended => Err(StoreError::NotFound(
                "no rows are claimable while another sweep holds the write lock".to_string(),
            )),
            TxnState::Finished => Err(StoreError::Finished),
        }
    }
}

#[async_trait]
impl PublicationStore for SqliteStore {
    async fn begin(&self) -> Result<Box<dyn SweepTransaction>, StoreError> {
        let path = self.path.clone();
        let now = self.clock.now();

        let (conn, state) = tokio::task::spawn_blocking(move || -> Result<_, StoreError> {
            let conn = open_connection(&path, Duration::ZERO)?;
            match conn.execute_batch("BEGIN IMMEDIATE") {
                Ok(()) => Ok((conn, TxnState::Open)),
                Err(e) if is_busy(&e) => Ok((conn, TxnState::Contended)),
                Err(e) => Err(e.into()),
            }
        })
        .await
        .map_err(join_error)??;

        if state == TxnState::Contended {
            debug!("write lock held by another sweep");
        }

        Ok(Box::new(SqliteTransaction {
            conn: Arc::new(Mutex::new(conn)),
            now,
            state,
        }))
    }
}

#[async_trait]
impl SweepTransaction for SqliteTransaction {
    fn now(&self) -> DateTime<Utc> {
        self.now
    }

    async fn claim_due_lessons(
        &mut self,
        limit: Option<u32>,
    ) -> Result<Vec<DueLesson>, StoreError> {
        if self.state == TxnState::Contended {
            return Ok(Vec::new());
        }
        self.ensure_open()?;

        let now = encode_ts(self.now);
        // LIMIT -1 is unbounded in SQLite.
        let limit = limit.map(i64::from).unwrap_or(-1);

        run(&self.conn, move |conn| {
            let mut stmt = conn.prepare(
                "SELECT l.id, l.title, l.publish_at, t.program_id
                 FROM lessons l
                 JOIN terms t ON t.id = l.term_id
                 WHERE l.status = 'scheduled' AND l.publish_at <= ?1
                 ORDER BY l.publish_at, l.id
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![now, limit], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?;

            let mut due = Vec::new();
            for row in rows {
                let (id, title, publish_at, program_id) = row?;
                due.push(DueLesson {
                    lesson_id: id.parse()?,
                    title,
                    program_id: program_id.parse()?,
                    publish_at: decode_ts(&publish_at)?,
                });
            }
            Ok(due)
        })
        .await
    }

    async fn publish_lesson(&mut self, lesson_id: LessonId) -> Result<(), StoreError> {
        self.ensure_open()?;
        let now = encode_ts(self.now);

        let changed = run(&self.conn, move |conn| {
            Ok(conn.execute(
                "UPDATE lessons SET status = 'published', published_at = ?2
                 WHERE id = ?1 AND status = 'scheduled'",
                params![lesson_id.to_string(), now],
            )?)
        })
        .await?;

        if changed == 0 {
            return Err(StoreError::NotFound(format!(
                "scheduled lesson {}",
                lesson_id
            )));
        }
        Ok(())
    }

    async fn program_status(
        &mut self,
        program_id: ProgramId,
    ) -> Result<Option<ProgramStatus>, StoreError> {
        self.ensure_open()?;

        let status = run(&self.conn, move |conn| {
            Ok(conn
                .query_row(
                    "SELECT status FROM programs WHERE id = ?1",
                    params![program_id.to_string()],
                    |row| row.get::<_, String>(0),
                )
                .optional()?)
        })
        .await?;

        status.map(|s| s.parse()).transpose()
    }

    async fn publish_program(&mut self, program_id: ProgramId) -> Result<bool, StoreError> {
        self.ensure_open()?;
        let now = encode_ts(self.now);

        let changed = run(&self.conn, move |conn| {
            Ok(conn.execute(
                "UPDATE programs SET status = 'published', published_at = ?2
                 WHERE id = ?1 AND status <> 'published'",
                params![program_id.to_string(), now],
            )?)
        })
        .await?;

        Ok(changed > 0)
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        match self.state {
            TxnState::Finished => return Err(StoreError::Finished),
            TxnState::Contended => {}
            TxnState::Open => {
                run(&self.conn, |conn| {
                    conn.execute_batch("COMMIT")?;
                    Ok(())
                })
                .await?;
            }
        }
        self.state = TxnState::Finished;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        match self.state {
            TxnState::Finished => return Err(StoreError::Finished),
            TxnState::Contended => {}
            TxnState::Open => {
                run(&self.conn, |conn| {
                    conn.execute_batch("ROLLBACK")?;
                    Ok(())
                })
                .await?;
            }
        }
        self.state = TxnState::Finished;
        Ok(())
    }
}

/// A program row as stored.
struct ProgramRow {
    id: String,
    title: String,
    language_primary: String,
    status: String,
    published_at: Option<String>,
}

impl ProgramRow {
    fn into_program(self) -> Result<Program, StoreError> {
        Ok(Program {
            id: self.id.parse()?,
            title: self.title,
            language_primary: self.language_primary,
            status: self.status.parse()?,
            published_at: decode_opt_ts(self.published_at)?,
        })
    }
}

/// A lesson row as stored.
struct LessonRow {
    id: String,
    term_id: String,
    lesson_number: i32,
    title: String,
    content_type: String,
    status: String,
    publish_at: Option<String>,
    published_at: Option<String>,
}

impl LessonRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            term_id: row.get(1)?,
            lesson_number: row.get(2)?,
            title: row.get(3)?,
            content_type: row.get(4)?,
            status: row.get(5)?,
            publish_at: row.get(6)?,
            published_at: row.get(7)?,
        })
    }

    fn into_lesson(self) -> Result<Lesson, StoreError> {
        Ok(Lesson {
            id: self.id.parse()?,
            term_id: self.term_id.parse()?,
            lesson_number: self.lesson_number,
            title: self.title,
            content_type: self.content_type,
            status: self.status.parse()?,
            publish_at: decode_opt_ts(self.publish_at)?,
            published_at: decode_opt_ts(self.published_at)?,
        })
    }
}

const LESSON_COLUMNS: &str =
    "id, term_id, lesson_number, title, content_type, status, publish_at, published_at";

fn load_lesson(conn: &Connection, id: LessonId) -> Result<Option<Lesson>, StoreError> {
    conn.query_row(
        &format!("SELECT {} FROM lessons WHERE id = ?1", LESSON_COLUMNS),
        params![id.to_string()],
        LessonRow::from_row,
    )
    .optional()?
    .map(LessonRow::into_lesson)
    .transpose()
}

#[async_trait]
impl CatalogStore for SqliteStore {
    async fn insert_program(&self, program: &Program) -> Result<(), StoreError> {
        let program = program.clone();
        run(&self.editor, move |conn| {
            conn.execute(
                "INSERT INTO programs (id, title, status, language_primary, published_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    program.id.to_string(),
                    program.title,
                    program.status.as_str(),
                    program.language_primary,
                    program.published_at.map(encode_ts),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn insert_term(&self, term: &Term) -> Result<(), StoreError> {
        let term = term.clone();
        run(&self.editor, move |conn| {
            conn.execute(
                "INSERT INTO terms (id, program_id, term_number, title) VALUES (?1, ?2, ?3, ?4)",
                params![
                    term.id.to_string(),
                    term.program_id.to_string(),
                    term.term_number,
                    term.title,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn insert_lesson(&self, lesson: &Lesson) -> Result<(), StoreError> {
        let lesson = lesson.clone();
        run(&self.editor, move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO lessons ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    LESSON_COLUMNS
                ),
                params![
                    lesson.id.to_string(),
                    lesson.term_id.to_string(),
                    lesson.lesson_number,
                    lesson.title,
                    lesson.content_type,
                    lesson.status.as_str(),
                    lesson.publish_at.map(encode_ts),
                    lesson.published_at.map(encode_ts),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn program(&self, id: ProgramId) -> Result<Option<Program>, StoreError> {
        run(&self.editor, move |conn| {
            conn.query_row(
                "SELECT id, title, language_primary, status, published_at
                 FROM programs WHERE id = ?1",
                params![id.to_string()],
                |row| {
                    Ok(ProgramRow {
                        id: row.get(0)?,
                        title: row.get(1)?,
                        language_primary: row.get(2)?,
                        status: row.get(3)?,
                        published_at: row.get(4)?,
                    })
                },
            )
            .optional()?
            .map(ProgramRow::into_program)
            .transpose()
        })
        .await
    }

    async fn lesson(&self, id: LessonId) -> Result<Option<Lesson>, StoreError> {
        run(&self.editor, move |conn| load_lesson(conn, id)).await
    }

    async fn set_lesson_status(
        &self,
        id: LessonId,
        change: LessonStatusChange,
    ) -> Result<Lesson, StoreError> {
        let now = self.clock.now();

        run(&self.editor, move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let mut lesson =
                load_lesson(&tx, id)?.ok_or_else(|| StoreError::NotFound(format!("lesson {}", id)))?;
            lesson.apply(&change, now);

            tx.execute(
                "UPDATE lessons
                 SET status = ?2, publish_at = ?3, published_at = ?4, updated_at = ?5
                 WHERE id = ?1",
                params![
                    id.to_string(),
                    lesson.status.as_str(),
                    lesson.publish_at.map(encode_ts),
                    lesson.published_at.map(encode_ts),
                    encode_ts(now),
                ],
            )?;

            if lesson.status == LessonStatus::Published {
                tx.execute(
                    "UPDATE programs SET status = 'published', published_at = ?2
                     WHERE id = (SELECT program_id FROM terms WHERE id = ?1)
                       AND status <> 'published'",
                    params![lesson.term_id.to_string(), encode_ts(now)],
                )?;
            }

            tx.commit()?;
            Ok(lesson)
        })
        .await
    }
}
