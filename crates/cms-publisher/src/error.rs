//! Error types for the publisher.

use thiserror::Error;

use crate::types::{LessonId, ProgramId};

/// Errors raised by a store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite error.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Postgres error.
    #[cfg(feature = "postgres")]
    #[error("Postgres error: {0}")]
    Postgres(#[from] sqlx::Error),

    /// A blocking database task failed or its connection lock was poisoned.
    #[error("database task failed: {0}")]
    Join(String),

    /// Failure injected by the in-memory store.
    #[error("injected failure: {0}")]
    Injected(String),

    /// A persisted row could not be decoded.
    #[error("invalid row: {0}")]
    InvalidRow(String),

    /// Row not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Row is locked by an open sweep transaction.
    #[error("row locked by a running sweep: {0}")]
    Locked(String),

    /// The transaction was already committed or rolled back.
    #[error("transaction already finished")]
    Finished,

    /// Editor-side status change rejected.
    #[error("invalid status change: {0}")]
    InvalidStatusChange(String),

    /// Database URL with an unknown or disabled scheme.
    #[error("unsupported database URL: {0}")]
    UnsupportedUrl(String),
}

/// Errors that fail a whole publication sweep.
#[derive(Debug, Error)]
pub enum SweepError {
    /// Store error; the sweep transaction was rolled back.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A claimed lesson points at a program row that does not exist.
    #[error("lesson {lesson_id} references missing program {program_id}")]
    MissingProgram {
        lesson_id: LessonId,
        program_id: ProgramId,
    },

    /// The sweep task panicked or was cancelled.
    #[error("sweep task aborted: {0}")]
    Panicked(String),
}
