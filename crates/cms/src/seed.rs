//! Demo catalog.

use std::sync::Arc;

use chrono::{Duration, Utc};
use miette::Result;
use tracing::info;

use cms_publisher::{CatalogStore, Lesson, Program, Term};

/// Insert two programs with their terms and lessons.
///
/// "Full Stack Web Development" is published with two published lessons and a
/// lesson scheduled 90 seconds out. "UX Design Fundamentals" is a draft whose
/// "Wireframing" lesson is scheduled two minutes out, so a running worker will
/// promote the program shortly after seeding.
pub async fn run(catalog: Arc<dyn CatalogStore>) -> Result<()> {
    let now = Utc::now();

    let web = Program::new("Full Stack Web Development", "en").published(now);
    let ux = Program::new("UX Design Fundamentals", "en");

    let frontend = Term::new(web.id, 1, "Frontend Basics");
    let backend = Term::new(web.id, 2, "Backend Mastery");
    let design = Term::new(ux.id, 1, "Design Thinking");

    let mut js = Lesson::new(frontend.id, 2, "JavaScript Basics").published(now);
    js.content_type = "article".to_string();
    let mut personas = Lesson::new(design.id, 1, "User Personas");
    personas.content_type = "article".to_string();

    let lessons = [
        Lesson::new(frontend.id, 1, "HTML & CSS Intro").published(now),
        js,
        Lesson::new(backend.id, 1, "Node.js Setup"),
        Lesson::new(backend.id, 2, "Express.js Routing (Scheduled)")
            .scheduled(now + Duration::seconds(90)),
        personas,
        Lesson::new(design.id, 2, "Wireframing").scheduled(now + Duration::minutes(2)),
    ];

    for program in [&web, &ux] {
        catalog
            .insert_program(program)
            .await
            .map_err(|e| miette::miette!("failed to insert program '{}': {}", program.title, e))?;
    }
    for term in [&frontend, &backend, &design] {
        catalog
            .insert_term(term)
            .await
            .map_err(|e| miette::miette!("failed to insert term '{}': {}", term.title, e))?;
    }
    for lesson in &lessons {
        catalog
            .insert_lesson(lesson)
            .await
            .map_err(|e| miette::miette!("failed to insert lesson '{}': {}", lesson.title, e))?;
    }

    info!(programs = 2, terms = 3, lessons = lessons.len(), "seed completed");
    Ok(())
}
