use rusqlite::Connection;

use crate::error::AppError;

/// Run the schema migration. Idempotent: every statement is `IF NOT EXISTS`.
pub fn run(conn: &Connection) -> Result<(), AppError> {
    tracing::debug!("Running database migrations");

    conn.execute_batch(SCHEMA)?;

    tracing::info!("Database migrations complete");
    Ok(())
}

const SCHEMA: &str = r#"

-- ============================================================================
-- Runs
-- ============================================================================

CREATE TABLE IF NOT EXISTS runs (
    id                  TEXT PRIMARY KEY,
    scenario_slug       TEXT NOT NULL,
    scenario_name       TEXT NOT NULL,
    status              TEXT NOT NULL DEFAULT 'PENDING'
                        CHECK(status IN ('PENDING', 'RUNNING', 'PASSED', 'FAILED')),
    environment         TEXT NOT NULL,
    trigger_source      TEXT NOT NULL DEFAULT 'manual'
                        CHECK(trigger_source IN ('schedule', 'manual', 'webhook')),
    total_steps         INTEGER NOT NULL DEFAULT 0,
    passed_steps        INTEGER NOT NULL DEFAULT 0,
    failed_steps        INTEGER NOT NULL DEFAULT 0,
    skipped_steps       INTEGER NOT NULL DEFAULT 0,
    auto_fix_enabled    INTEGER NOT NULL DEFAULT 1,
    auto_fixed_count    INTEGER NOT NULL DEFAULT 0,
    retry_count         INTEGER NOT NULL DEFAULT 0,
    duration_ms         INTEGER,
    created_at          TEXT NOT NULL,
    started_at          TEXT,
    finished_at         TEXT
);
CREATE INDEX IF NOT EXISTS idx_runs_scenario ON runs(scenario_slug);
CREATE INDEX IF NOT EXISTS idx_runs_status   ON runs(status);

-- ============================================================================
-- Step results (one row per attempt)
-- ============================================================================

CREATE TABLE IF NOT EXISTS step_results (
    id                  TEXT PRIMARY KEY,
    run_id              TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
    step_index          INTEGER NOT NULL,
    step_name           TEXT NOT NULL,
    status              TEXT NOT NULL CHECK(status IN ('PASSED', 'FAILED', 'SKIPPED')),
    started_at          TEXT NOT NULL,
    finished_at         TEXT NOT NULL,
    duration_ms         INTEGER NOT NULL DEFAULT 0,
    status_code         INTEGER,
    error_message       TEXT,
    response            TEXT,
    auto_fixed          INTEGER NOT NULL DEFAULT 0,
    fix_description     TEXT,
    retry_attempt       INTEGER NOT NULL DEFAULT 0,
    created_at          TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_step_results_run ON step_results(run_id, step_index, retry_attempt);

-- ============================================================================
-- Error knowledge base
-- ============================================================================

CREATE TABLE IF NOT EXISTS error_patterns (
    id                  TEXT PRIMARY KEY,
    project_name        TEXT NOT NULL,
    error_hash          TEXT NOT NULL,
    error_message       TEXT NOT NULL,
    category            TEXT NOT NULL DEFAULT 'UNKNOWN',
    first_seen          TEXT NOT NULL,
    last_seen           TEXT NOT NULL,
    occurrence_count    INTEGER NOT NULL DEFAULT 1,
    confidence          REAL NOT NULL DEFAULT 0.5,
    UNIQUE(project_name, error_hash)
);
CREATE INDEX IF NOT EXISTS idx_error_patterns_project ON error_patterns(project_name, occurrence_count DESC);

CREATE TABLE IF NOT EXISTS error_occurrences (
    id                  TEXT PRIMARY KEY,
    pattern_id          TEXT NOT NULL REFERENCES error_patterns(id) ON DELETE CASCADE,
    environment         TEXT NOT NULL,
    stack_trace         TEXT,
    context             TEXT,
    run_id              TEXT REFERENCES runs(id) ON DELETE SET NULL,
    resolved            INTEGER NOT NULL DEFAULT 0,
    resolved_at         TEXT,
    created_at          TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_error_occurrences_pattern ON error_occurrences(pattern_id, created_at DESC);

CREATE TABLE IF NOT EXISTS error_solutions (
    id                  TEXT PRIMARY KEY,
    pattern_id          TEXT NOT NULL REFERENCES error_patterns(id) ON DELETE CASCADE,
    title               TEXT NOT NULL,
    description         TEXT NOT NULL,
    steps               TEXT NOT NULL DEFAULT '[]',
    modified_files      TEXT NOT NULL DEFAULT '[]',
    success_rate        REAL NOT NULL DEFAULT 0,
    times_applied       INTEGER NOT NULL DEFAULT 0,
    created_at          TEXT NOT NULL,
    updated_at          TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_error_solutions_pattern ON error_solutions(pattern_id);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run(&conn).unwrap();
        run(&conn).unwrap();

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN
                 ('runs', 'step_results', 'error_patterns', 'error_occurrences', 'error_solutions')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 5);
    }
}
