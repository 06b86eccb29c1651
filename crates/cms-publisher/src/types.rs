//! Catalog types touched by scheduled publication.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::StoreError;

macro_rules! row_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a fresh random id.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = StoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self).map_err(|e| {
                    StoreError::InvalidRow(format!("invalid {} '{}': {}", stringify!($name), s, e))
                })
            }
        }
    };
}

row_id!(
    /// Primary key of a program row.
    ProgramId
);
row_id!(
    /// Primary key of a term row.
    TermId
);
row_id!(
    /// Primary key of a lesson row.
    LessonId
);

/// Publication state of a lesson.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LessonStatus {
    /// Being edited; invisible to the sweep.
    #[default]
    Draft,
    /// Waiting for `publish_at`.
    Scheduled,
    /// Visible in the catalog.
    Published,
}

impl LessonStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Scheduled => "scheduled",
            Self::Published => "published",
        }
    }
}

impl fmt::Display for LessonStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LessonStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "scheduled" => Ok(Self::Scheduled),
            "published" => Ok(Self::Published),
            other => Err(StoreError::InvalidRow(format!(
                "unknown lesson status '{}'",
                other
            ))),
        }
    }
}

/// Publication state of a program.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgramStatus {
    #[default]
    Draft,
    Published,
    Archived,
}

impl ProgramStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Published => "published",
            Self::Archived => "archived",
        }
    }
}

impl fmt::Display for ProgramStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProgramStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "published" => Ok(Self::Published),
            "archived" => Ok(Self::Archived),
            other => Err(StoreError::InvalidRow(format!(
                "unknown program status '{}'",
                other
            ))),
        }
    }
}

/// A program: the top of the program → term → lesson hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    pub id: ProgramId,
    pub title: String,
    /// Primary content language (e.g. "en").
    pub language_primary: String,
    pub status: ProgramStatus,
    /// When the program was first published.
    pub published_at: Option<DateTime<Utc>>,
}

impl Program {
    /// Create a new draft program.
    pub fn new(title: impl Into<String>, language_primary: impl Into<String>) -> Self {
        Self {
            id: ProgramId::new(),
            title: title.into(),
            language_primary: language_primary.into(),
            status: ProgramStatus::Draft,
            published_at: None,
        }
    }

    /// Mark as published at `at`.
    pub fn published(mut self, at: DateTime<Utc>) -> Self {
        self.status = ProgramStatus::Published;
        self.published_at = Some(at);
        self
    }

    /// Mark as archived.
    pub fn archived(mut self) -> Self {
        self.status = ProgramStatus::Archived;
        self
    }
}

/// A term within a program. The sweep never reads or writes terms beyond
/// joining through them to find a lesson's program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Term {
    pub id: TermId,
    pub program_id: ProgramId,
    /// Ordinal, unique within the program.
    pub term_number: i32,
    pub title: String,
}

impl Term {
    pub fn new(program_id: ProgramId, term_number: i32, title: impl Into<String>) -> Self {
        Self {
            id: TermId::new(),
            program_id,
            term_number,
            title: title.into(),
        }
    }
}

/// A lesson within a term.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lesson {
    pub id: LessonId,
    pub term_id: TermId,
    /// Ordinal, unique within the term.
    pub lesson_number: i32,
    pub title: String,
    /// "video" or "article".
    pub content_type: String,
    pub status: LessonStatus,
    /// Scheduled publication time; only meaningful while `scheduled`.
    pub publish_at: Option<DateTime<Utc>>,
    /// Actual publication time.
    pub published_at: Option<DateTime<Utc>>,
}

impl Lesson {
    /// Create a new draft video lesson.
    pub fn new(term_id: TermId, lesson_number: i32, title: impl Into<String>) -> Self {
        Self {
            id: LessonId::new(),
            term_id,
            lesson_number,
            title: title.into(),
            content_type: "video".to_string(),
            status: LessonStatus::Draft,
            publish_at: None,
            published_at: None,
        }
    }

    /// Schedule for publication at `at`.
    pub fn scheduled(mut self, at: DateTime<Utc>) -> Self {
        self.apply(&LessonStatusChange::Schedule { at }, at);
        self
    }

    /// Mark as already published at `at`.
    pub fn published(mut self, at: DateTime<Utc>) -> Self {
        self.apply(&LessonStatusChange::PublishNow, at);
        self
    }

    /// Whether the sweep should publish this lesson at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == LessonStatus::Scheduled && self.publish_at.is_some_and(|at| at <= now)
    }

    /// Apply an editor status change, keeping the timestamp invariants:
    /// `publish_at` is set only while scheduled and `published_at` only while
    /// published.
    pub fn apply(&mut self, change: &LessonStatusChange, now: DateTime<Utc>) {
        match change {
            LessonStatusChange::Draft => {
                self.status = LessonStatus::Draft;
                self.publish_at = None;
                self.published_at = None;
            }
            LessonStatusChange::Schedule { at } => {
                self.status = LessonStatus::Scheduled;
                self.publish_at = Some(*at);
                self.published_at = None;
            }
            LessonStatusChange::PublishNow => {
                self.status = LessonStatus::Published;
                self.publish_at = None;
                self.published_at = Some(now);
            }
        }
    }
}

/// Status transition requested by an editor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LessonStatusChange {
    /// Back to draft.
    Draft,
    /// Publish automatically once `at` has passed.
    #[serde(rename = "scheduled")]
    Schedule {
        #[serde(rename = "publish_at")]
        at: DateTime<Utc>,
    },
    /// Publish immediately.
    #[serde(rename = "published")]
    PublishNow,
}

impl LessonStatusChange {
    /// Build a change from the raw `status` / `publish_at` pair an editor
    /// submits. Scheduling without a time is rejected.
    pub fn from_parts(status: &str, publish_at: Option<DateTime<Utc>>) -> Result<Self, StoreError> {
        match status.parse::<LessonStatus>() {
            Ok(LessonStatus::Draft) => Ok(Self::Draft),
            Ok(LessonStatus::Scheduled) => publish_at
                .map(|at| Self::Schedule { at })
                .ok_or_else(|| {
                    StoreError::InvalidStatusChange(
                        "publish_at is required for scheduling".to_string(),
                    )
                }),
            Ok(LessonStatus::Published) => Ok(Self::PublishNow),
            Err(_) => Err(StoreError::InvalidStatusChange(format!(
                "unknown status '{}'",
                status
            ))),
        }
    }
}

/// A lesson claimed by a sweep, joined to its owning program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DueLesson {
    pub lesson_id: LessonId,
    pub title: String,
    pub program_id: ProgramId,
    pub publish_at: DateTime<Utc>,
}

/// Outcome of one committed sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Transaction timestamp used for the due predicate and `published_at`.
    pub now: Option<DateTime<Utc>>,
    /// Lessons claimed by the skip-locked selection.
    pub claimed: usize,
    pub lessons_published: usize,
    pub programs_published: usize,
    pub elapsed_ms: u64,
}
