use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::db::models::Run;
use crate::engine::scenario::{NotifyTrigger, Scenario};

// ============================================================================
// Status enums (stored as TEXT)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Passed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Running,
    Passed,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerSource {
    Schedule,
    #[default]
    Manual,
    Webhook,
}

crate::text_enum!(StepStatus { Passed => "PASSED", Failed => "FAILED", Skipped => "SKIPPED" });
crate::text_enum!(RunStatus { Pending => "PENDING", Running => "RUNNING", Passed => "PASSED", Failed => "FAILED" });
crate::text_enum!(TriggerSource { Schedule => "schedule", Manual => "manual", Webhook => "webhook" });

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Passed | RunStatus::Failed)
    }

    /// PENDING -> RUNNING -> {PASSED, FAILED}. Terminal states never move.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (RunStatus::Pending, RunStatus::Running)
                | (RunStatus::Running, RunStatus::Passed)
                | (RunStatus::Running, RunStatus::Failed)
        )
    }
}

// ============================================================================
// StepResult
// ============================================================================

/// Outcome of one executed attempt of one step. A retried step produces one
/// result per attempt; earlier attempts are kept for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_index: usize,
    pub step_name: String,
    pub status: StepStatus,
    pub started_at: String,
    pub finished_at: String,
    pub duration_ms: u64,
    /// HTTP status of the response, when one was received.
    pub status_code: Option<u16>,
    pub error_message: Option<String>,
    /// Response body (JSON when parseable, otherwise a string).
    pub response: Option<Value>,
    pub auto_fixed: bool,
    pub fix_description: Option<String>,
    pub retry_attempt: u32,
}

impl StepResult {
    fn base(step_name: &str, status: StepStatus, started_at: chrono::DateTime<chrono::Utc>) -> Self {
        let finished = chrono::Utc::now();
        let duration_ms = (finished - started_at).num_milliseconds().max(0) as u64;
        Self {
            step_index: 0,
            step_name: step_name.to_string(),
            status,
            started_at: started_at.to_rfc3339(),
            finished_at: finished.to_rfc3339(),
            duration_ms,
            status_code: None,
            error_message: None,
            response: None,
            auto_fixed: false,
            fix_description: None,
            retry_attempt: 0,
        }
    }

    pub fn passed(
        step_name: &str,
        started_at: chrono::DateTime<chrono::Utc>,
        status_code: Option<u16>,
        response: Option<Value>,
    ) -> Self {
        Self {
            status_code,
            response,
            ..Self::base(step_name, StepStatus::Passed, started_at)
        }
    }

    pub fn failed(
        step_name: &str,
        started_at: chrono::DateTime<chrono::Utc>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            error_message: Some(error.into()),
            ..Self::base(step_name, StepStatus::Failed, started_at)
        }
    }

    pub fn skipped(step_name: &str, reason: impl Into<String>) -> Self {
        Self {
            error_message: Some(reason.into()),
            ..Self::base(step_name, StepStatus::Skipped, chrono::Utc::now())
        }
    }

    pub fn with_status_code(mut self, code: u16) -> Self {
        self.status_code = Some(code);
        self
    }

    pub fn with_response(mut self, response: Value) -> Self {
        self.response = Some(response);
        self
    }

    pub fn is_failed(&self) -> bool {
        self.status == StepStatus::Failed
    }

    pub fn error_text(&self) -> &str {
        self.error_message.as_deref().unwrap_or("")
    }
}

// ============================================================================
// RunReport
// ============================================================================

/// Everything observable about a finished run: the run row plus every
/// step-result attempt in execution order.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run: Run,
    pub results: Vec<StepResult>,
}

impl RunReport {
    /// The last attempt recorded for each step index.
    pub fn final_results(&self) -> Vec<&StepResult> {
        let mut finals: Vec<&StepResult> = Vec::new();
        for result in &self.results {
            match finals.iter_mut().find(|r| r.step_index == result.step_index) {
                Some(slot) => *slot = result,
                None => finals.push(result),
            }
        }
        finals
    }

    /// Attempts recorded for one step, original first.
    pub fn attempts(&self, step_index: usize) -> Vec<&StepResult> {
        self.results
            .iter()
            .filter(|r| r.step_index == step_index)
            .collect()
    }

    /// Which of the scenario's notification triggers fired for this run.
    pub fn due_notifications(&self, scenario: &Scenario) -> Vec<NotifyTrigger> {
        scenario
            .notify
            .iter()
            .copied()
            .filter(|trigger| match trigger {
                NotifyTrigger::OnFailure => self.run.status == RunStatus::Failed,
                NotifyTrigger::OnSuccess => self.run.status == RunStatus::Passed,
                NotifyTrigger::OnAutoFix => self.run.auto_fixed_count > 0,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_text_round_trip() {
        assert_eq!("PASSED".parse::<StepStatus>().unwrap(), StepStatus::Passed);
        assert_eq!(RunStatus::Running.as_str(), "RUNNING");
        assert_eq!("webhook".parse::<TriggerSource>().unwrap(), TriggerSource::Webhook);
        assert!("bogus".parse::<RunStatus>().is_err());
    }

    #[test]
    fn test_run_transitions() {
        assert!(RunStatus::Pending.can_transition_to(RunStatus::Running));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Failed));
        assert!(!RunStatus::Pending.can_transition_to(RunStatus::Passed));
        assert!(!RunStatus::Passed.can_transition_to(RunStatus::Failed));
        assert!(!RunStatus::Failed.can_transition_to(RunStatus::Running));
        assert!(RunStatus::Failed.is_terminal());
    }

    #[test]
    fn test_failed_result_defaults() {
        let r = StepResult::failed("login", chrono::Utc::now(), "Request timeout after 30000ms");
        assert!(r.is_failed());
        assert_eq!(r.retry_attempt, 0);
        assert!(!r.auto_fixed);
        assert_eq!(r.error_text(), "Request timeout after 30000ms");
    }
}
