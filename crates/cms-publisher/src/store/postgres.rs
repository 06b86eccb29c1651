//! Postgres store.
//!
//! Claims use `FOR UPDATE OF l SKIP LOCKED`, so concurrent sweeps in different
//! processes each lock a disjoint subset of the due lessons without blocking
//! on one another. `now()` is the transaction start time, which makes it the
//! transaction timestamp for both the due predicate and the written values.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use tracing::info;
use uuid::Uuid;

use crate::store::{CatalogStore, PublicationStore, SweepTransaction};
use crate::types::{
    DueLesson, Lesson, LessonId, LessonStatus, LessonStatusChange, Program, ProgramId,
    ProgramStatus, Term, TermId,
};
use crate::StoreError;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS programs (
    id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
    title varchar(255) NOT NULL,
    status varchar(255) NOT NULL DEFAULT 'draft',
    language_primary varchar(255) NOT NULL,
    published_at timestamptz,
    created_at timestamptz NOT NULL DEFAULT now(),
    updated_at timestamptz NOT NULL DEFAULT now()
);
CREATE INDEX IF NOT EXISTS programs_status_language_primary_published_at_index
    ON programs(status, language_primary, published_at);

CREATE TABLE IF NOT EXISTS terms (
    id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
    program_id uuid REFERENCES programs(id) ON DELETE CASCADE,
    term_number integer NOT NULL,
    title varchar(255) NOT NULL,
    created_at timestamptz NOT NULL DEFAULT now(),
    updated_at timestamptz NOT NULL DEFAULT now(),
    UNIQUE (program_id, term_number)
);

CREATE TABLE IF NOT EXISTS lessons (
    id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
    term_id uuid REFERENCES terms(id) ON DELETE CASCADE,
    lesson_number integer NOT NULL,
    title varchar(255) NOT NULL,
    content_type varchar(255) NOT NULL DEFAULT 'video',
    status varchar(255) NOT NULL DEFAULT 'draft',
    publish_at timestamptz,
    published_at timestamptz,
    created_at timestamptz NOT NULL DEFAULT now(),
    updated_at timestamptz NOT NULL DEFAULT now(),
    UNIQUE (term_id, lesson_number)
);
CREATE INDEX IF NOT EXISTS lessons_status_publish_at_index ON lessons(status, publish_at);
";

/// Postgres-backed catalog.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        info!(max_connections, "postgres pool connected");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create tables and indexes if missing.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        info!("postgres schema ready");
        Ok(())
    }
}

#[async_trait]
impl PublicationStore for PgStore {
    async fn begin(&self) -> Result<Box<dyn SweepTransaction>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let now: DateTime<Utc> = sqlx::query_scalar("SELECT now()")
            .fetch_one(&mut *tx)
            .await?;
        Ok(Box::new(PgTransaction { tx: Some(tx), now }))
    }
}

/// Sweep transaction on a pooled connection. Dropping it rolls back.
pub struct PgTransaction {
    tx: Option<Transaction<'static, Postgres>>,
    now: DateTime<Utc>,
}

impl PgTransaction {
    fn tx(&mut self) -> Result<&mut Transaction<'static, Postgres>, StoreError> {
        self.tx.as_mut().ok_or(StoreError::Finished)
    }
}

#[async_trait]
impl SweepTransaction for PgTransaction {
    fn now(&self) -> DateTime<Utc> {
        self.now
    }

    async fn claim_due_lessons(
        &mut self,
        limit: Option<u32>,
    ) -> Result<Vec<DueLesson>, StoreError> {
        let tx = self.tx()?;
        // LIMIT NULL is unbounded.
        let rows = sqlx::query(
            "SELECT l.id, l.title, l.publish_at, t.program_id
             FROM lessons l
             JOIN terms t ON t.id = l.term_id
             WHERE l.status = 'scheduled' AND l.publish_at <= now()
             ORDER BY l.publish_at, l.id
             LIMIT $1
             FOR UPDATE OF l SKIP LOCKED",
        )
        .bind(limit.map(i64::from))
        .fetch_all(&mut **tx)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(DueLesson {
                    lesson_id: LessonId(row.try_get::<Uuid, _>("id")?),
                    title: row.try_get("title")?,
                    program_id: ProgramId(row.try_get::<Uuid, _>("program_id")?),
                    publish_at: row.try_get("publish_at")?,
                })
            })
            .collect()
    }

    async fn publish_lesson(&mut self, lesson_id: LessonId) -> Result<(), StoreError> {
        let tx = self.tx()?;
        let result = sqlx::query(
            "UPDATE lessons SET status = 'published', published_at = now()
             WHERE id = $1 AND status = 'scheduled'",
        )
        .bind(lesson_id.0)
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() == 0 {
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
        let tx = self.tx()?;
        let status: Option<String> = sqlx::query_scalar("SELECT status FROM programs WHERE id = $1")
            .bind(program_id.0)
            .fetch_optional(&mut **tx)
            .await?;
        status.map(|s| s.parse()).transpose()
    }

    async fn publish_program(&mut self, program_id: ProgramId) -> Result<bool, StoreError> {
        let tx = self.tx()?;
        // Re-evaluated against the latest committed row if a concurrent sweep
        // promoted the program first.
        let result = sqlx::query(
            "UPDATE programs SET status = 'published', published_at = now()
             WHERE id = $1 AND status <> 'published'",
        )
        .bind(program_id.0)
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let tx = self.tx.take().ok_or(StoreError::Finished)?;
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        let tx = self.tx.take().ok_or(StoreError::Finished)?;
        tx.rollback().await?;
        Ok(())
    }
}

fn program_from_row(row: &PgRow) -> Result<Program, StoreError> {
    Ok(Program {
        id: ProgramId(row.try_get("id")?),
        title: row.try_get("title")?,
        language_primary: row.try_get("language_primary")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        published_at: row.try_get("published_at")?,
    })
}

fn lesson_from_row(row: &PgRow) -> Result<Lesson, StoreError> {
    Ok(Lesson {
        id: LessonId(row.try_get("id")?),
        term_id: TermId(row.try_get("term_id")?),
        lesson_number: row.try_get("lesson_number")?,
        title: row.try_get("title")?,
        content_type: row.try_get("content_type")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        publish_at: row.try_get("publish_at")?,
        published_at: row.try_get("published_at")?,
    })
}

const LESSON_SELECT: &str = "SELECT id, term_id, lesson_number, title, content_type, status, \
     publish_at, published_at FROM lessons WHERE id = $1";

#[async_trait]
impl CatalogStore for PgStore {
    async fn insert_program(&self, program: &Program) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO programs (id, title, status, language_primary, published_at)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(program.id.0)
        .bind(&program.title)
        .bind(program.status.as_str())
        .bind(&program.language_primary)
        .bind(program.published_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_term(&self, term: &Term) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO terms (id, program_id, term_number, title) VALUES ($1, $2, $3, $4)",
        )
        .bind(term.id.0)
        .bind(term.program_id.0)
        .bind(term.term_number)
        .bind(&term.title)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_lesson(&self, lesson: &Lesson) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO lessons (id, term_id, lesson_number, title, content_type, status,
                                  publish_at, published_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(lesson.id.0)
        .bind(lesson.term_id.0)
        .bind(lesson.lesson_number)
        .bind(&lesson.title)
        .bind(&lesson.content_type)
        .bind(lesson.status.as_str())
        .bind(lesson.publish_at)
        .bind(lesson.published_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn program(&self, id: ProgramId) -> Result<Option<Program>, StoreError> {
        let row = sqlx::query(
            "SELECT id, title, language_primary, status, published_at FROM programs WHERE id = $1",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(program_from_row).transpose()
    }

    async fn lesson(&self, id: LessonId) -> Result<Option<Lesson>, StoreError> {
        let row = sqlx::query(LESSON_SELECT)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(lesson_from_row).transpose()
    }

    async fn set_lesson_status(
        &self,
        id: LessonId,
        change: LessonStatusChange,
    ) -> Result<Lesson, StoreError> {
        let mut tx = self.pool.begin().await?;
        let now: DateTime<Utc> = sqlx::query_scalar("SELECT now()")
            .fetch_one(&mut *tx)
            .await?;

        let row = sqlx::query(&format!("{} FOR UPDATE", LESSON_SELECT))
            .bind(id.0)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("lesson {}", id)))?;
        let mut lesson = lesson_from_row(&row)?;
        lesson.apply(&change, now);

        sqlx::query(
            "UPDATE lessons SET status = $2, publish_at = $3, published_at = $4, updated_at = now()
             WHERE id = $1",
        )
        .bind(id.0)
        .bind(lesson.status.as_str())
        .bind(lesson.publish_at)
        .bind(lesson.published_at)
        .execute(&mut *tx)
        .await?;

        if lesson.status == LessonStatus::Published {
            sqlx::query(
                "UPDATE programs SET status = 'published', published_at = now()
                 WHERE id = (SELECT program_id FROM terms WHERE id = $1)
                   AND status <> 'published'",
            )
            .bind(lesson.term_id.0)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(lesson)
    }
}
