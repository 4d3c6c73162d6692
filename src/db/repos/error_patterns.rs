//! Error knowledge base: patterns, occurrences and solutions.
//!
//! Every function takes a `&Connection` so callers can pass either a pooled
//! connection or an open `Transaction` (which derefs to `Connection`). The
//! deduplication service uses the latter to keep the pattern upsert and the
//! occurrence insert atomic.

use rusqlite::{params, Connection, Row};

use crate::db::macros::parse_text_column;
use crate::db::models::{
    CreateErrorOccurrenceInput, CreateSolutionInput, ErrorOccurrence, ErrorPattern,
    ErrorSolution, UpsertErrorPatternInput,
};
use crate::error::AppError;

/// Number of leading characters of a message used for similarity search.
pub const SIMILARITY_PREFIX_CHARS: usize = 100;

// ── Row mappers ────────────────────────────────────────────────

fn row_to_pattern(row: &Row) -> rusqlite::Result<ErrorPattern> {
    Ok(ErrorPattern {
        id: row.get("id")?,
        project_name: row.get("project_name")?,
        error_hash: row.get("error_hash")?,
        error_message: row.get("error_message")?,
        category: parse_text_column(row, "category")?,
        first_seen: row.get("first_seen")?,
        last_seen: row.get("last_seen")?,
        occurrence_count: row.get("occurrence_count")?,
        confidence: row.get("confidence")?,
    })
}

fn row_to_occurrence(row: &Row) -> rusqlite::Result<ErrorOccurrence> {
    let context: Option<String> = row.get("context")?;
    Ok(ErrorOccurrence {
        id: row.get("id")?,
        pattern_id: row.get("pattern_id")?,
        environment: row.get("environment")?,
        stack_trace: row.get("stack_trace")?,
        context: context.and_then(|raw| serde_json::from_str(&raw).ok()),
        run_id: row.get("run_id")?,
        resolved: row.get::<_, i32>("resolved")? != 0,
        resolved_at: row.get("resolved_at")?,
        created_at: row.get("created_at")?,
    })
}

fn row_to_solution(row: &Row) -> rusqlite::Result<ErrorSolution> {
    let steps: String = row.get("steps")?;
    let files: String = row.get("modified_files")?;
    Ok(ErrorSolution {
        id: row.get("id")?,
        pattern_id: row.get("pattern_id")?,
        title: row.get("title")?,
        description: row.get("description")?,
        steps: serde_json::from_str(&steps).unwrap_or_default(),
        modified_files: serde_json::from_str(&files).unwrap_or_default(),
        success_rate: row.get("success_rate")?,
        times_applied: row.get("times_applied")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn not_found(what: &str, id: &str) -> impl FnOnce(rusqlite::Error) -> AppError {
    let label = format!("{what} {id}");
    move |e| match e {
        rusqlite::Error::QueryReturnedNoRows => AppError::NotFound(label),
        other => AppError::Database(other),
    }
}

// ── Patterns ───────────────────────────────────────────────────

/// Insert a new pattern, or bump `occurrence_count` and `last_seen` on the
/// existing (project_name, error_hash) row. Confidence only ever rises.
pub fn upsert_error_pattern(
    conn: &Connection,
    input: &UpsertErrorPatternInput,
) -> Result<ErrorPattern, AppError> {
    if input.project_name.trim().is_empty() {
        return Err(AppError::Validation("Project name cannot be empty".into()));
    }
    if input.error_hash.trim().is_empty() {
        return Err(AppError::Validation("Error hash cannot be empty".into()));
    }
    if input.error_message.trim().is_empty() {
        return Err(AppError::Validation("Error message cannot be empty".into()));
    }

    let id = uuid::Uuid::new_v4().to_string();
    let now = chrono::Utc::now().to_rfc3339();
    let confidence = input.confidence.clamp(0.0, 1.0);

    conn.execute(
        "INSERT INTO error_patterns
         (id, project_name, error_hash, error_message, category, first_seen, last_seen, occurrence_count, confidence)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, 1, ?7)
         ON CONFLICT(project_name, error_hash) DO UPDATE SET
            occurrence_count = occurrence_count + 1,
            last_seen = excluded.last_seen,
            confidence = MAX(confidence, excluded.confidence)",
        params![
            id,
            input.project_name,
            input.error_hash,
            input.error_message,
            input.category.as_str(),
            now,
            confidence,
        ],
    )?;

    conn.query_row(
        "SELECT * FROM error_patterns WHERE project_name = ?1 AND error_hash = ?2",
        params![input.project_name, input.error_hash],
        row_to_pattern,
    )
    .map_err(AppError::Database)
}

pub fn get_error_pattern_by_id(conn: &Connection, id: &str) -> Result<ErrorPattern, AppError> {
    conn.query_row(
        "SELECT * FROM error_patterns WHERE id = ?1",
        params![id],
        row_to_pattern,
    )
    .map_err(not_found("ErrorPattern", id))
}

pub fn list_patterns(
    conn: &Connection,
    project_name: Option<&str>,
    limit: i64,
) -> Result<Vec<ErrorPattern>, AppError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM error_patterns
         WHERE (?1 IS NULL OR project_name = ?1)
         ORDER BY occurrence_count DESC, last_seen DESC
         LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![project_name, limit], row_to_pattern)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(AppError::Database)
}

/// Best-effort similarity: patterns in the same project whose message contains
/// the first [`SIMILARITY_PREFIX_CHARS`] characters of `message`, most frequent
/// first. `exclude_id` keeps the pattern being recorded out of its own results.
pub fn search_error_patterns(
    conn: &Connection,
    project_name: &str,
    message: &str,
    exclude_id: Option<&str>,
    limit: i64,
) -> Result<Vec<ErrorPattern>, AppError> {
    let prefix: String = message.chars().take(SIMILARITY_PREFIX_CHARS).collect();
    let needle = escape_like(prefix.trim());
    if needle.is_empty() {
        return Ok(Vec::new());
    }

    let mut stmt = conn.prepare(
        "SELECT * FROM error_patterns
         WHERE project_name = ?1
           AND (?2 IS NULL OR id != ?2)
           AND error_message LIKE '%' || ?3 || '%' ESCAPE '\\'
         ORDER BY occurrence_count DESC, last_seen DESC
         LIMIT ?4",
    )?;
    let rows = stmt.query_map(params![project_name, exclude_id, needle, limit], row_to_pattern)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(AppError::Database)
}

fn escape_like(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

// ── Occurrences ────────────────────────────────────────────────

pub fn create_error_occurrence(
    conn: &Connection,
    input: &CreateErrorOccurrenceInput,
) -> Result<ErrorOccurrence, AppError> {
    let id = uuid::Uuid::new_v4().to_string();
    let now = chrono::Utc::now().to_rfc3339();
    let context = input
        .context
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    conn.execute(
        "INSERT INTO error_occurrences
         (id, pattern_id, environment, stack_trace, context, run_id, resolved, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)",
        params![
            id,
            input.pattern_id,
            input.environment,
            input.stack_trace,
            context,
            input.run_id,
            now,
        ],
    )?;

    conn.query_row(
        "SELECT * FROM error_occurrences WHERE id = ?1",
        params![id],
        row_to_occurrence,
    )
    .map_err(AppError::Database)
}

pub fn get_occurrences_by_pattern(
    conn: &Connection,
    pattern_id: &str,
    limit: i64,
) -> Result<Vec<ErrorOccurrence>, AppError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM error_occurrences WHERE pattern_id = ?1
         ORDER BY created_at DESC
         LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![pattern_id, limit], row_to_occurrence)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(AppError::Database)
}

/// Record a resolution. The only mutation an occurrence ever receives.
pub fn resolve_occurrence(conn: &Connection, id: &str) -> Result<ErrorOccurrence, AppError> {
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE error_occurrences SET resolved = 1, resolved_at = ?1
         WHERE id = ?2 AND resolved = 0",
        params![now, id],
    )?;
    conn.query_row(
        "SELECT * FROM error_occurrences WHERE id = ?1",
        params![id],
        row_to_occurrence,
    )
    .map_err(not_found("ErrorOccurrence", id))
}

// ── Solutions ──────────────────────────────────────────────────

pub fn create_solution(conn: &Connection, input: &CreateSolutionInput) -> Result<ErrorSolution, AppError> {
    if input.title.trim().is_empty() {
        return Err(AppError::Validation("Title cannot be empty".into()));
    }
    if input.description.trim().is_empty() {
        return Err(AppError::Validation("Description cannot be empty".into()));
    }
    // Surface a missing parent as NotFound rather than an FK error
    get_error_pattern_by_id(conn, &input.pattern_id)?;

    let id = uuid::Uuid::new_v4().to_string();
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO error_solutions
         (id, pattern_id, title, description, steps, modified_files, success_rate, times_applied, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, 0, ?7, ?7)",
        params![
            id,
            input.pattern_id,
            input.title,
            input.description,
            serde_json::to_string(&input.steps)?,
            serde_json::to_string(&input.modified_files)?,
            now,
        ],
    )?;

    get_solution_by_id(conn, &id)
}

pub fn get_solution_by_id(conn: &Connection, id: &str) -> Result<ErrorSolution, AppError> {
    conn.query_row(
        "SELECT * FROM error_solutions WHERE id = ?1",
        params![id],
        row_to_solution,
    )
    .map_err(not_found("ErrorSolution", id))
}

pub fn get_solutions_by_pattern_id(
    conn: &Connection,
    pattern_id: &str,
) -> Result<Vec<ErrorSolution>, AppError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM error_solutions WHERE pattern_id = ?1
         ORDER BY success_rate DESC, times_applied DESC",
    )?;
    let rows = stmt.query_map(params![pattern_id], row_to_solution)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(AppError::Database)
}

/// Count one application and fold its outcome into the running success rate.
pub fn record_solution_applied(
    conn: &Connection,
    id: &str,
    success: bool,
) -> Result<ErrorSolution, AppError> {
    let now = chrono::Utc::now().to_rfc3339();
    let updated = conn.execute(
        "UPDATE error_solutions SET
            success_rate = (success_rate * times_applied + ?1) / (times_applied + 1),
            times_applied = times_applied + 1,
            updated_at = ?2
         WHERE id = ?3",
        params![if success { 1.0 } else { 0.0 }, now, id],
    )?;
    if updated == 0 {
        return Err(AppError::NotFound(format!("ErrorSolution {id}")));
    }
    get_solution_by_id(conn, id)
}
