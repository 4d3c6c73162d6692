use rusqlite::{params, Row};

use crate::db::macros::parse_text_column;
use crate::db::models::{CreateRunInput, Run, RunCompletion};
use crate::db::DbPool;
use crate::engine::types::{RunStatus, StepResult};
use crate::error::AppError;

// ── Row mappers ────────────────────────────────────────────────

fn row_to_run(row: &Row) -> rusqlite::Result<Run> {
    Ok(Run {
        id: row.get("id")?,
        scenario_slug: row.get("scenario_slug")?,
        scenario_name: row.get("scenario_name")?,
        status: parse_text_column(row, "status")?,
        environment: row.get("environment")?,
        trigger_source: parse_text_column(row, "trigger_source")?,
        total_steps: row.get("total_steps")?,
        passed_steps: row.get("passed_steps")?,
        failed_steps: row.get("failed_steps")?,
        skipped_steps: row.get("skipped_steps")?,
        auto_fix_enabled: row.get::<_, i32>("auto_fix_enabled")? != 0,
        auto_fixed_count: row.get("auto_fixed_count")?,
        retry_count: row.get("retry_count")?,
        duration_ms: row.get("duration_ms")?,
        created_at: row.get("created_at")?,
        started_at: row.get("started_at")?,
        finished_at: row.get("finished_at")?,
    })
}

fn row_to_step_result(row: &Row) -> rusqlite::Result<StepResult> {
    let response: Option<String> = row.get("response")?;
    Ok(StepResult {
        step_index: row.get::<_, i64>("step_index")? as usize,
        step_name: row.get("step_name")?,
        status: parse_text_column(row, "status")?,
        started_at: row.get("started_at")?,
        finished_at: row.get("finished_at")?,
        duration_ms: row.get::<_, i64>("duration_ms")?.max(0) as u64,
        status_code: row.get::<_, Option<i64>>("status_code")?.map(|c| c as u16),
        error_message: row.get("error_message")?,
        response: response.and_then(|raw| serde_json::from_str(&raw).ok()),
        auto_fixed: row.get::<_, i32>("auto_fixed")? != 0,
        fix_description: row.get("fix_description")?,
        retry_attempt: row.get::<_, i64>("retry_attempt")?.max(0) as u32,
    })
}

// ── Runs ───────────────────────────────────────────────────────

pub fn create_run(pool: &DbPool, input: CreateRunInput) -> Result<Run, AppError> {
    if input.scenario_slug.trim().is_empty() {
        return Err(AppError::Validation("Scenario slug cannot be empty".into()));
    }

    let id = uuid::Uuid::new_v4().to_string();
    let now = chrono::Utc::now().to_rfc3339();

    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO runs
         (id, scenario_slug, scenario_name, status, environment, trigger_source,
          total_steps, auto_fix_enabled, created_at)
         VALUES (?1, ?2, ?3, 'PENDING', ?4, ?5, ?6, ?7, ?8)",
        params![
            id,
            input.scenario_slug,
            input.scenario_name,
            input.environment,
            input.trigger_source.as_str(),
            input.total_steps,
            input.auto_fix_enabled as i32,
            now,
        ],
    )?;
    get_run_by_id(pool, &id)
}

pub fn get_run_by_id(pool: &DbPool, id: &str) -> Result<Run, AppError> {
    let conn = pool.get()?;
    conn.query_row("SELECT * FROM runs WHERE id = ?1", params![id], row_to_run)
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => AppError::NotFound(format!("Run {id}")),
            other => AppError::Database(other),
        })
}

pub fn list_runs(
    pool: &DbPool,
    scenario_slug: Option<&str>,
    limit: i64,
) -> Result<Vec<Run>, AppError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT * FROM runs
         WHERE (?1 IS NULL OR scenario_slug = ?1)
         ORDER BY created_at DESC
         LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![scenario_slug, limit], row_to_run)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(AppError::Database)
}

/// PENDING -> RUNNING. Fails if the run has already been started.
pub fn mark_running(pool: &DbPool, id: &str) -> Result<(), AppError> {
    let now = chrono::Utc::now().to_rfc3339();
    let conn = pool.get()?;
    let updated = conn.execute(
        "UPDATE runs SET status = 'RUNNING', started_at = ?1
         WHERE id = ?2 AND status = 'PENDING'",
        params![now, id],
    )?;
    if updated == 0 {
        let run = get_run_by_id(pool, id)?;
        return Err(AppError::Validation(format!(
            "Run {id} cannot start from {}",
            run.status
        )));
    }
    Ok(())
}

/// RUNNING -> PASSED | FAILED, exactly once.
pub fn finish_run(
    pool: &DbPool,
    id: &str,
    status: RunStatus,
    completion: &RunCompletion,
) -> Result<Run, AppError> {
    if !status.is_terminal() {
        return Err(AppError::Validation(format!(
            "{status} is not a terminal run status"
        )));
    }

    let now = chrono::Utc::now().to_rfc3339();
    let conn = pool.get()?;
    let updated = conn.execute(
        "UPDATE runs SET
            status = ?1,
            passed_steps = ?2,
            failed_steps = ?3,
            skipped_steps = ?4,
            auto_fixed_count = ?5,
            retry_count = ?6,
            duration_ms = ?7,
            finished_at = ?8
         WHERE id = ?9 AND status = 'RUNNING'",
        params![
            status.as_str(),
            completion.passed_steps,
            completion.failed_steps,
            completion.skipped_steps,
            completion.auto_fixed_count,
            completion.retry_count,
            completion.duration_ms,
            now,
            id,
        ],
    )?;
    drop(conn);

    if updated == 0 {
        let run = get_run_by_id(pool, id)?;
        return Err(AppError::Validation(format!(
            "Run {id} cannot finish from {}",
            run.status
        )));
    }
    get_run_by_id(pool, id)
}

// ── Step results ───────────────────────────────────────────────

/// Append one attempt. Attempts are never updated or replaced.
pub fn insert_step_result(pool: &DbPool, run_id: &str, result: &StepResult) -> Result<String, AppError> {
    let id = uuid::Uuid::new_v4().to_string();
    let now = chrono::Utc::now().to_rfc3339();
    let response = result
        .response
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO step_results
         (id, run_id, step_index, step_name, status, started_at, finished_at, duration_ms,
          status_code, error_message, response, auto_fixed, fix_description, retry_attempt, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        params![
            id,
            run_id,
            result.step_index as i64,
            result.step_name,
            result.status.as_str(),
            result.started_at,
            result.finished_at,
            result.duration_ms as i64,
            result.status_code.map(i64::from),
            result.error_message,
            response,
            result.auto_fixed as i32,
            result.fix_description,
            result.retry_attempt as i64,
            now,
        ],
    )?;
    Ok(id)
}

pub fn get_step_results(pool: &DbPool, run_id: &str) -> Result<Vec<StepResult>, AppError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT * FROM step_results WHERE run_id = ?1
         ORDER BY step_index, retry_attempt, created_at",
    )?;
    let rows = stmt.query_map(params![run_id], row_to_step_result)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(AppError::Database)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_test_db;
    use crate::engine::types::{StepStatus, TriggerSource};

    fn new_run(pool: &DbPool) -> Run {
        create_run(
            pool,
            CreateRunInput {
                scenario_slug: "checkout".into(),
                scenario_name: "Checkout".into(),
                environment: "staging".into(),
                trigger_source: TriggerSource::Webhook,
                total_steps: 2,
                auto_fix_enabled: true,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_run_lifecycle() {
        let pool = init_test_db().unwrap();
        let run = new_run(&pool);
        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.trigger_source, TriggerSource::Webhook);
        assert!(run.started_at.is_none());

        // Cannot finish before starting
        let early = finish_run(&pool, &run.id, RunStatus::Passed, &RunCompletion::default());
        assert!(matches!(early, Err(AppError::Validation(_))));

        mark_running(&pool, &run.id).unwrap();
        // Cannot start twice
        assert!(mark_running(&pool, &run.id).is_err());

        let done = finish_run(
            &pool,
            &run.id,
            RunStatus::Failed,
            &RunCompletion {
                passed_steps: 1,
                failed_steps: 1,
                retry_count: 1,
                duration_ms: 120,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(done.status, RunStatus::Failed);
        assert_eq!(done.retry_count, 1);
        assert_eq!(done.duration_ms, Some(120));
        assert!(done.finished_at.is_some());

        // Terminal exactly once
        assert!(finish_run(&pool, &run.id, RunStatus::Passed, &RunCompletion::default()).is_err());
        assert!(finish_run(&pool, &run.id, RunStatus::Running, &RunCompletion::default()).is_err());
    }

    #[test]
    fn test_step_results_keep_every_attempt() {
        let pool = init_test_db().unwrap();
        let run = new_run(&pool);

        let mut first = StepResult::failed("pay", chrono::Utc::now(), "Request timeout after 30000ms");
        first.fix_description = Some("modify_request".into());
        let mut retry = StepResult::passed("pay", chrono::Utc::now(), Some(200), Some(serde_json::json!({"ok": true})));
        retry.retry_attempt = 1;
        retry.auto_fixed = true;

        insert_step_result(&pool, &run.id, &first).unwrap();
        insert_step_result(&pool, &run.id, &retry).unwrap();

        let rows = get_step_results(&pool, &run.id).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].status, StepStatus::Failed);
        assert_eq!(rows[1].retry_attempt, 1);
        assert!(rows[1].auto_fixed);
        assert_eq!(rows[1].status_code, Some(200));
        assert_eq!(rows[1].response, Some(serde_json::json!({"ok": true})));
    }

    #[test]
    fn test_get_missing_run() {
        let pool = init_test_db().unwrap();
        assert!(matches!(get_run_by_id(&pool, "nope"), Err(AppError::NotFound(_))));
        assert!(list_runs(&pool, Some("checkout"), 10).unwrap().is_empty());
    }
}
