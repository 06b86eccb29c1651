//! In-process store with per-row skip-locked semantics.
//!
//! Each claimed lesson row is locked by the claiming transaction until it
//! commits, rolls back or is dropped. Writes are staged in the transaction and
//! applied under one lock at commit, so a failed or abandoned transaction
//! leaves no trace. Used by tests and as the reference model for the
//! database-backed stores.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::clock::Clock;
use crate::store::{CatalogStore, PublicationStore, SweepTransaction};
use crate::types::{
    DueLesson, Lesson, LessonId, LessonStatus, LessonStatusChange, Program, ProgramId,
    ProgramStatus, Term, TermId,
};
use crate::StoreError;

#[derive(Default)]
struct MemoryState {
    programs: HashMap<ProgramId, Program>,
    terms: HashMap<TermId, Term>,
    lessons: HashMap<LessonId, Lesson>,
    /// Lesson row locks: lesson -> owning transaction.
    locks: HashMap<LessonId, u64>,
    next_txn: u64,
    /// Lessons whose publish statement fails.
    fail_on_publish: HashSet<LessonId>,
    /// Rows written by committed sweep transactions.
    sweep_writes: usize,
}

impl MemoryState {
    fn release(&mut self, txn: u64) {
        self.locks.retain(|_, owner| *owner != txn);
    }
}

/// In-memory catalog with row locks.
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            clock,
        }
    }

    /// Make every future attempt to publish `lesson_id` fail.
    pub fn fail_on_publish(&self, lesson_id: LessonId) {
        lock(&self.state).fail_on_publish.insert(lesson_id);
    }

    /// Number of lesson and program rows written by committed sweeps.
    pub fn sweep_writes(&self) -> usize {
        lock(&self.state).sweep_writes
    }

    /// Number of lesson rows currently locked by open transactions.
    pub fn locked_rows(&self) -> usize {
        lock(&self.state).locks.len()
    }

    pub fn lessons(&self) -> Vec<Lesson> {
        lock(&self.state).lessons.values().cloned().collect()
    }

    pub fn programs(&self) -> Vec<Program> {
        lock(&self.state).programs.values().cloned().collect()
    }
}

fn lock(state: &Mutex<MemoryState>) -> MutexGuard<'_, MemoryState> {
    // Staged writes are applied in a single critical section, so a poisoned
    // guard never exposes a half-applied commit.
    state.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl PublicationStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn SweepTransaction>, StoreError> {
        let id = {
            let mut state = lock(&self.state);
            state.next_txn += 1;
            state.next_txn
        };
        Ok(Box::new(MemoryTransaction {
            id,
            state: Arc::clone(&self.state),
            now: self.clock.now(),
            lessons: Vec::new(),
            programs: Vec::new(),
            finished: false,
        }))
    }
}

/// Transaction over a [`MemoryStore`].
pub struct MemoryTransaction {
    id: u64,
    state: Arc<Mutex<MemoryState>>,
    now: DateTime<Utc>,
    /// Staged lesson publications.
    lessons: Vec<LessonId>,
    /// Staged program promotions.
    programs: Vec<ProgramId>,
    finished: bool,
}

impl MemoryTransaction {
    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.finished {
            return Err(StoreError::Finished);
        }
        Ok(())
    }
}

#[async_trait]
impl SweepTransaction for MemoryTransaction {
    fn now(&self) -> DateTime<Utc> {
        self.now
    }

    async fn claim_due_lessons(
        &mut self,
        limit: Option<u32>,
    ) -> Result<Vec<DueLesson>, StoreError> {
        self.ensure_open()?;
        let mut state = lock(&self.state);

        let mut candidates: Vec<&Lesson> = state
            .lessons
            .values()
            .filter(|l| l.is_due(self.now))
            .filter(|l| match state.locks.get(&l.id) {
                Some(owner) => *owner == self.id,
                None => true,
            })
            .collect();
        candidates.sort_by_key(|l| (l.publish_at, l.id));
        if let Some(limit) = limit {
            candidates.truncate(limit as usize);
        }

        let mut due = Vec::with_capacity(candidates.len());
        for lesson in candidates {
            let term = state.terms.get(&lesson.term_id).ok_or_else(|| {
                StoreError::InvalidRow(format!(
                    "lesson {} references missing term {}",
                    lesson.id, lesson.term_id
                ))
            })?;
            due.push(DueLesson {
                lesson_id: lesson.id,
                title: lesson.title.clone(),
                program_id: term.program_id,
                publish_at: lesson.publish_at.unwrap_or(self.now),
            });
        }

        let skipped = state
            .lessons
            .values()
            .filter(|l| l.is_due(self.now))
            .count()
            .saturating_sub(due.len());
        for lesson in &due {
            state.locks.insert(lesson.lesson_id, self.id);
        }
        debug!(txn = self.id, claimed = due.len(), skipped, "claimed due lessons");

        Ok(due)
    }

    async fn publish_lesson(&mut self, lesson_id: LessonId) -> Result<(), StoreError> {
        self.ensure_open()?;
        let state = lock(&self.state);

        if state.fail_on_publish.contains(&lesson_id) {
            return Err(StoreError::Injected(format!(
                "publish of lesson {}",
                lesson_id
            )));
        }
        let locked_here = state.locks.get(&lesson_id) == Some(&self.id);
        let scheduled = state
            .lessons
            .get(&lesson_id)
            .is_some_and(|l| l.status == LessonStatus::Scheduled);
        if !locked_here || !scheduled {
            return Err(StoreError::NotFound(format!(
                "claimed scheduled lesson {}",
                lesson_id
            )));
        }
        drop(state);

        if !self.lessons.contains(&lesson_id) {
            self.lessons.push(lesson_id);
        }
        Ok(())
    }

    async fn program_status(
        &mut self,
        program_id: ProgramId,
    ) -> Result<Option<ProgramStatus>, StoreError> {
        self.ensure_open()?;
        if self.programs.contains(&program_id) {
            return Ok(Some(ProgramStatus::Published));
        }
        Ok(lock(&self.state).programs.get(&program_id).map(|p| p.status))
    }

    async fn publish_program(&mut self, program_id: ProgramId) -> Result<bool, StoreError> {
        match self.program_status(program_id).await? {
            None => Err(StoreError::NotFound(format!("program {}", program_id))),
            Some(ProgramStatus::Published) => Ok(false),
            Some(_) => {
                self.programs.push(program_id);
                Ok(true)
            }
        }
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        self.ensure_open()?;
        let mut state = lock(&self.state);
        let now = self.now;
        let mut writes = 0;

        // Conditional like `UPDATE ... WHERE status = 'scheduled'`.
        for id in self.lessons.drain(..) {
            if let Some(lesson) = state.lessons.get_mut(&id)
                && lesson.status == LessonStatus::Scheduled
            {
                lesson.status = LessonStatus::Published;
                lesson.published_at = Some(now);
                writes += 1;
            }
        }
        // Conditional like `UPDATE ... WHERE status <> 'published'`: a program
        // promoted by a concurrent commit is left alone.
        for id in self.programs.drain(..) {
            if let Some(program) = state.programs.get_mut(&id)
                && program.status != ProgramStatus::Published
            {
                program.status = ProgramStatus::Published;
                program.published_at = Some(now);
                writes += 1;
            }
        }

        state.sweep_writes += writes;
        state.release(self.id);
        self.finished = true;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.lessons.clear();
        self.programs.clear();
        lock(&self.state).release(self.id);
        self.finished = true;
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if !self.finished {
            lock(&self.state).release(self.id);
        }
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn insert_program(&self, program: &Program) -> Result<(), StoreError> {
        lock(&self.state)
            .programs
            .insert(program.id, program.clone());
        Ok(())
    }

    async fn insert_term(&self, term: &Term) -> Result<(), StoreError> {
        lock(&self.state).terms.insert(term.id, term.clone());
        Ok(())
    }

    async fn insert_lesson(&self, lesson: &Lesson) -> Result<(), StoreError> {
        lock(&self.state).lessons.insert(lesson.id, lesson.clone());
        Ok(())
    }

    async fn program(&self, id: ProgramId) -> Result<Option<Program>, StoreError> {
        Ok(lock(&self.state).programs.get(&id).cloned())
    }

    async fn lesson(&self, id: LessonId) -> Result<Option<Lesson>, StoreError> {
        Ok(lock(&self.state).lessons.get(&id).cloned())
    }

    async fn set_lesson_status(
        &self,
        id: LessonId,
        change: LessonStatusChange,
    ) -> Result<Lesson, StoreError> {
        let now = self.clock.now();
        let mut state = lock(&self.state);

        // Postgres and SQLite block here until the sweep finishes; this store
        // refuses instead.
        if let Some(owner) = state.locks.get(&id) {
            return Err(StoreError::Locked(format!("lesson {} (transaction {})", id, owner)));
        }

        let lesson = state
            .lessons
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("lesson {}", id)))?;
        lesson.apply(&change, now);
        let lesson = lesson.clone();

        if lesson.status == LessonStatus::Published {
            let program_id = state
                .terms
                .get(&lesson.term_id)
                .map(|t| t.program_id)
                .ok_or_else(|| StoreError::NotFound(format!("term {}", lesson.term_id)))?;
            if let Some(program) = state.programs.get_mut(&program_id)
                && program.status != ProgramStatus::Published
            {
                program.status = ProgramStatus::Published;
                program.published_at = Some(now);
            }
        }

        Ok(lesson)
    }
}
