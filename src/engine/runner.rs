//! Run/step lifecycle.
//!
//! A run moves PENDING -> RUNNING -> {PASSED, FAILED}. Steps execute strictly
//! in order because later steps read variables captured by earlier ones. A
//! failed step gets at most one healing retry; there is no re-fixing of the
//! retry itself.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::db::models::{CreateRunInput, Run, RunCompletion};
use crate::db::repos::runs;
use crate::db::DbPool;
use crate::engine::adapter::StepAdapter;
use crate::engine::dedup::{categorize_error, ErrorDeduplicationService, RecordErrorInput};
use crate::engine::healing::{apply_fix, should_apply_fix, suggest_fix, FixSuggestion};
use crate::engine::scenario::{
    capture_variables, HttpStep, NestedScenarioStep, Scenario, ScenarioCatalog, Step, StepAction, Variables,
};
use crate::engine::types::{RunReport, RunStatus, StepResult, StepStatus, TriggerSource};
use crate::error::AppError;

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub project_name: String,
    pub environment: String,
    pub auto_fix: bool,
    pub fix_confidence_threshold: f64,
    pub default_step_timeout_ms: u64,
    pub max_retry_delay_ms: u64,
    pub record_errors: bool,
    pub include_similar: bool,
    pub similarity_async: bool,
}

impl From<&AppConfig> for RunnerConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            project_name: config.project_name.clone(),
            environment: config.environment.clone(),
            auto_fix: config.auto_fix,
            fix_confidence_threshold: config.fix_confidence_threshold,
            default_step_timeout_ms: config.default_step_timeout_ms,
            max_retry_delay_ms: config.max_retry_delay_ms,
            record_errors: config.record_errors,
            include_similar: config.include_similar,
            similarity_async: config.similarity_async,
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

/// Per-run overrides. Unset fields fall back to the scenario, then the config.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub environment: Option<String>,
    pub trigger: TriggerSource,
    pub auto_fix: Option<bool>,
    /// Checked between steps; a cancelled run skips what is left and fails.
    pub cancel: Option<CancellationToken>,
}

// =============================================================================
// Runner
// =============================================================================

pub struct ScenarioRunner {
    pool: DbPool,
    adapter: Arc<dyn StepAdapter>,
    dedup: Option<ErrorDeduplicationService>,
    catalog: Arc<ScenarioCatalog>,
    config: RunnerConfig,
}

/// One dispatch: the result plus any variables its `save` directive captured.
struct Dispatched {
    result: StepResult,
    captured: Variables,
}

/// Mutable bookkeeping for one run.
struct RunState {
    vars: Variables,
    results: Vec<StepResult>,
    passed: i64,
    failed: i64,
    skipped: i64,
    auto_fixed: i64,
    retries: i64,
    cancelled: bool,
    first_dispatch: Option<Instant>,
    last_completion: Option<Instant>,
}

impl RunState {
    fn new(vars: Variables) -> Self {
        Self {
            vars,
            results: Vec::new(),
            passed: 0,
            failed: 0,
            skipped: 0,
            auto_fixed: 0,
            retries: 0,
            cancelled: false,
            first_dispatch: None,
            last_completion: None,
        }
    }

    fn duration_ms(&self) -> i64 {
        match (self.first_dispatch, self.last_completion) {
            (Some(first), Some(last)) => last.saturating_duration_since(first).as_millis() as i64,
            _ => 0,
        }
    }

    fn completion(&self) -> RunCompletion {
        RunCompletion {
            passed_steps: self.passed,
            failed_steps: self.failed,
            skipped_steps: self.skipped,
            auto_fixed_count: self.auto_fixed,
            retry_count: self.retries,
            duration_ms: self.duration_ms(),
        }
    }
}

impl ScenarioRunner {
    pub fn new(pool: DbPool, adapter: Arc<dyn StepAdapter>, config: RunnerConfig) -> Self {
        Self {
            pool,
            adapter,
            dedup: None,
            catalog: Arc::new(ScenarioCatalog::new()),
            config,
        }
    }

    /// Record terminal step failures in the error knowledge base.
    pub fn with_dedup(mut self, dedup: ErrorDeduplicationService) -> Self {
        self.dedup = Some(dedup);
        self
    }

    /// Scenarios that nested steps may reference.
    pub fn with_catalog(mut self, catalog: ScenarioCatalog) -> Self {
        self.catalog = Arc::new(catalog);
        self
    }

    pub async fn run(&self, scenario: &Scenario, options: RunOptions) -> Result<RunReport, AppError> {
        scenario.validate()?;

        let auto_fix = options.auto_fix.unwrap_or(self.config.auto_fix);
        let environment = options
            .environment
            .clone()
            .or_else(|| scenario.environment.clone())
            .unwrap_or_else(|| self.config.environment.clone());

        let run = runs::create_run(
            &self.pool,
            CreateRunInput {
                scenario_slug: scenario.slug().to_string(),
                scenario_name: scenario.name.clone(),
                environment,
                trigger_source: options.trigger,
                total_steps: scenario.steps.len() as i64,
                auto_fix_enabled: auto_fix,
            },
        )?;
        tracing::info!(
            run_id = %run.id,
            scenario = scenario.slug(),
            steps = scenario.steps.len(),
            auto_fix,
            "Run started",
        );

        let mut state = RunState::new(scenario.variables.clone());
        if let Err(e) = self.drive_steps(&run, scenario, &options, auto_fix, &mut state).await {
            self.abort_run(&run, &state, &e);
            return Err(e);
        }

        let status = if state.failed == 0 && !state.cancelled {
            RunStatus::Passed
        } else {
            RunStatus::Failed
        };
        let run = runs::finish_run(&self.pool, &run.id, status, &state.completion())?;

        tracing::info!(
            run_id = %run.id,
            status = %run.status,
            passed = run.passed_steps,
            failed = run.failed_steps,
            skipped = run.skipped_steps,
            retries = run.retry_count,
            auto_fixed = run.auto_fixed_count,
            duration_ms = ?run.duration_ms,
            "Run finished",
        );

        Ok(RunReport {
            run,
            results: state.results,
        })
    }

    /// Execute every step in order, leaving the run RUNNING with its counters
    /// in `state`.
    async fn drive_steps(
        &self,
        run: &Run,
        scenario: &Scenario,
        options: &RunOptions,
        auto_fix: bool,
        state: &mut RunState,
    ) -> Result<(), AppError> {
        let stack = vec![scenario.slug().to_string()];
        let mut halted: Option<String> = None;

        for (idx, step) in scenario.steps.iter().enumerate() {
            if halted.is_none() && options.cancel.as_ref().is_some_and(|t| t.is_cancelled()) {
                tracing::info!(run_id = %run.id, step = %step.name, "Run cancelled");
                state.cancelled = true;
                halted = Some("Skipped: run cancelled".into());
            }

            if let Some(reason) = &halted {
                self.persist(&run.id, idx, StepResult::skipped(&step.name, reason.clone()), state)?;
                state.skipped += 1;
                continue;
            }

            if step.skip {
                self.persist(&run.id, idx, StepResult::skipped(&step.name, "Skipped by design"), state)?;
                state.skipped += 1;
                continue;
            }

            if state.first_dispatch.is_none() {
                runs::mark_running(&self.pool, &run.id)?;
                state.first_dispatch = Some(Instant::now());
            }

            let status = self
                .execute_step(run, scenario, idx, step, &stack, auto_fix, state)
                .await?;
            state.last_completion = Some(Instant::now());

            match status {
                StepStatus::Passed => state.passed += 1,
                StepStatus::Skipped => state.skipped += 1,
                StepStatus::Failed => {
                    state.failed += 1;
                    if step.blocking {
                        tracing::warn!(run_id = %run.id, step = %step.name, "Blocking step failed, halting run");
                        halted = Some(format!("Skipped: blocking step '{}' failed", step.name));
                    }
                }
            }
        }

        // Every step was skipped without a dispatch; the run still passes through RUNNING.
        if state.first_dispatch.is_none() {
            runs::mark_running(&self.pool, &run.id)?;
            state.first_dispatch = Some(Instant::now());
        }
        Ok(())
    }

    /// Close a run whose step loop failed so it never stays RUNNING. Best
    /// effort: the original error is what the caller sees.
    fn abort_run(&self, run: &Run, state: &RunState, cause: &AppError) {
        tracing::error!(run_id = %run.id, error = %cause, "Run aborted");
        if state.first_dispatch.is_none() {
            if let Err(e) = runs::mark_running(&self.pool, &run.id) {
                tracing::warn!(run_id = %run.id, error = %e, "Failed to start aborted run");
            }
        }
        if let Err(e) = runs::finish_run(&self.pool, &run.id, RunStatus::Failed, &state.completion()) {
            tracing::warn!(run_id = %run.id, error = %e, "Failed to close aborted run");
        }
    }

    // -------------------------------------------------------------------------
    // Failure cycle
    // -------------------------------------------------------------------------

    /// Dispatch a step, and on failure consult the fix engine for a single
    /// retry. Returns the final status; every attempt is persisted.
    #[allow(clippy::too_many_arguments)]
    async fn execute_step(
        &self,
        run: &Run,
        scenario: &Scenario,
        idx: usize,
        step: &Step,
        stack: &[String],
        auto_fix: bool,
        state: &mut RunState,
    ) -> Result<StepStatus, AppError> {
        let Dispatched { mut result, captured } = self.dispatch(scenario, step, &state.vars, stack).await;
        result.step_index = idx;

        if !result.is_failed() {
            state.vars.extend(captured);
            let status = result.status;
            self.persist(&run.id, idx, result, state)?;
            return Ok(status);
        }

        let suggestion = auto_fix.then(|| suggest_fix(step, &result));
        let retry_with = suggestion
            .as_ref()
            .filter(|s| should_apply_fix(s, self.config.fix_confidence_threshold) && s.kind.is_retryable());

        if let Some(s) = &suggestion {
            result.fix_description = Some(if retry_with.is_some() {
                format!("Retrying with {}", s.describe())
            } else {
                s.describe()
            });
        }
        let attempt = result.retry_attempt;
        let mut final_status = result.status;
        let mut final_result = result.clone();
        self.persist(&run.id, idx, result, state)?;

        if let Some(s) = retry_with {
            let fixed = apply_fix(step, s);
            if let Some(delay) = s.delay_ms.map(|d| d.min(self.config.max_retry_delay_ms)) {
                if delay > 0 {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
            }

            state.retries += 1;
            state.auto_fixed += 1;
            tracing::info!(
                run_id = %run.id,
                step = %step.name,
                rule = s.rule,
                kind = s.kind.as_str(),
                "Retrying failed step",
            );

            let Dispatched { result: mut retry, captured } = self.dispatch(scenario, &fixed, &state.vars, stack).await;
            retry.step_index = idx;
            retry.retry_attempt = attempt + 1;
            retry.fix_description = Some(s.describe());
            retry.auto_fixed = true;
            if !retry.is_failed() {
                state.vars.extend(captured);
            }
            final_status = retry.status;
            final_result = retry.clone();
            self.persist(&run.id, idx, retry, state)?;
        }

        if final_status == StepStatus::Failed {
            self.record_failure(run, scenario, step, &final_result, suggestion.as_ref())
                .await;
        }
        Ok(final_status)
    }

    fn persist(&self, run_id: &str, idx: usize, mut result: StepResult, state: &mut RunState) -> Result<(), AppError> {
        result.step_index = idx;
        runs::insert_step_result(&self.pool, run_id, &result)?;
        state.results.push(result);
        Ok(())
    }

    /// Knowledge-base bookkeeping never fails the run. The write transaction
    /// can wait on SQLite's busy timeout, so it runs off the async workers.
    async fn record_failure(
        &self,
        run: &Run,
        scenario: &Scenario,
        step: &Step,
        result: &StepResult,
        suggestion: Option<&FixSuggestion>,
    ) {
        let Some(dedup) = &self.dedup else {
            return;
        };
        if !self.config.record_errors {
            return;
        }

        let message = match result.error_message.as_deref() {
            Some(m) if !m.trim().is_empty() => m,
            _ => "Step failed without an error message",
        };
        let input = RecordErrorInput {
            category: categorize_error(message, result.status_code),
            confidence: suggestion.map(|s| s.confidence).unwrap_or(0.5),
            context: Some(json!({
                "scenario": scenario.slug(),
                "step": step.name,
                "step_index": result.step_index,
                "status_code": result.status_code,
                "retry_attempt": result.retry_attempt,
                "fix": suggestion.map(|s| s.rule),
            })),
            run_id: Some(run.id.clone()),
            include_similar: self.config.include_similar,
            async_mode: self.config.similarity_async,
            ..RecordErrorInput::new(&self.config.project_name, &run.environment, message)
        };

        let dedup = dedup.clone();
        let recorded = tokio::task::spawn_blocking(move || dedup.record_error_occurrence(input))
            .await
            .map_err(|e| AppError::Internal(format!("Error recorder task failed: {e}")))
            .and_then(|outcome| outcome);

        match recorded {
            Ok(outcome) => tracing::debug!(
                run_id = %run.id,
                pattern_id = %outcome.pattern.id,
                occurrences = outcome.pattern.occurrence_count,
                "Step failure recorded",
            ),
            Err(e) => tracing::warn!(run_id = %run.id, step = %step.name, error = %e, "Failed to record step failure"),
        }
    }

    // -------------------------------------------------------------------------
    // Dispatch
    // -------------------------------------------------------------------------

    /// Boxed so nested scenarios can recurse.
    fn dispatch<'a>(
        &'a self,
        scenario: &'a Scenario,
        step: &'a Step,
        vars: &'a Variables,
        stack: &'a [String],
    ) -> BoxFuture<'a, Dispatched> {
        async move {
            match &step.action {
                StepAction::Http(http) => self.dispatch_http(scenario, step, http, vars).await,
                StepAction::Scenario(nested) => self.dispatch_nested(step, nested, vars, stack).await,
            }
        }
        .boxed()
    }

    async fn dispatch_http(&self, scenario: &Scenario, step: &Step, http: &HttpStep, vars: &Variables) -> Dispatched {
        let deadline = step
            .timeout_ms()
            .or(scenario.timeout_ms)
            .unwrap_or(self.config.default_step_timeout_ms);
        let started = chrono::Utc::now();

        let outcome = tokio::time::timeout(Duration::from_millis(deadline), self.adapter.execute(step, vars)).await;
        let mut result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                tracing::warn!(step = %step.name, error = %e, "Step could not be executed");
                StepResult::failed(&step.name, started, format!("Step could not be executed: {e}"))
            }
            Err(_) => StepResult::failed(&step.name, started, format!("Request timeout after {deadline}ms")),
        };

        let mut captured = Variables::new();
        if result.status == StepStatus::Passed && !http.save.is_empty() {
            let body = result.response.clone().unwrap_or(Value::Null);
            match capture_variables(&http.save, &body) {
                Ok(vars) => captured = vars,
                Err(path) => {
                    result.status = StepStatus::Failed;
                    result.error_message = Some(format!("Expected response path '{path}' to be present got nothing"));
                }
            }
        }

        Dispatched { result, captured }
    }

    /// Run a referenced scenario inline. Child steps get no healing and are not
    /// persisted individually; the parent step passes when the fraction of
    /// passing child steps reaches the threshold.
    async fn dispatch_nested(
        &self,
        step: &Step,
        nested: &NestedScenarioStep,
        vars: &Variables,
        stack: &[String],
    ) -> Dispatched {
        let started = chrono::Utc::now();
        let failed = |message: String| Dispatched {
            result: StepResult::failed(&step.name, started, message),
            captured: Variables::new(),
        };

        if stack.iter().any(|slug| slug == &nested.scenario) {
            return failed(format!(
                "Scenario cycle detected: {} -> {}",
                stack.join(" -> "),
                nested.scenario
            ));
        }
        let Some(child) = self.catalog.get(&nested.scenario) else {
            return failed(format!("Unknown scenario '{}'", nested.scenario));
        };

        let mut child_stack = stack.to_vec();
        child_stack.push(nested.scenario.clone());

        // Parent values win over the child's defaults
        let mut child_vars = child.variables.clone();
        child_vars.extend(vars.iter().map(|(k, v)| (k.clone(), v.clone())));

        let mut passed = 0usize;
        let mut halted = false;
        let mut summary = Vec::with_capacity(child.steps.len());
        for child_step in &child.steps {
            if halted || child_step.skip {
                if !halted {
                    passed += 1;
                }
                summary.push(json!({"step": child_step.name, "status": StepStatus::Skipped.as_str()}));
                continue;
            }

            let Dispatched { result, captured } = self.dispatch(child, child_step, &child_vars, &child_stack).await;
            if result.is_failed() {
                halted = child_step.blocking;
            } else {
                passed += 1;
                child_vars.extend(captured);
            }
            summary.push(json!({
                "step": child_step.name,
                "status": result.status.as_str(),
                "error": result.error_message,
            }));
        }

        let total = child.steps.len();
        let ratio = passed as f64 / total.max(1) as f64;
        let response = json!({
            "scenario": nested.scenario,
            "passed": passed,
            "total": total,
            "steps": summary,
        });

        let result = if ratio >= nested.threshold() {
            StepResult::passed(&step.name, started, None, Some(response))
        } else {
            StepResult::failed(
                &step.name,
                started,
                format!(
                    "Nested scenario '{}' passed {}/{} steps, below threshold {:.2}",
                    nested.scenario,
                    passed,
                    total,
                    nested.threshold()
                ),
            )
            .with_response(response)
        };
        Dispatched {
            result,
            captured: Variables::new(),
        }
    }
}
