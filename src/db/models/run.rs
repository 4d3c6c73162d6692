use serde::{Deserialize, Serialize};

use crate::engine::types::{RunStatus, TriggerSource};

// ============================================================================
// Runs
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub scenario_slug: String,
    pub scenario_name: String,
    pub status: RunStatus,
    pub environment: String,
    pub trigger_source: TriggerSource,
    pub total_steps: i64,
    pub passed_steps: i64,
    pub failed_steps: i64,
    pub skipped_steps: i64,
    pub auto_fix_enabled: bool,
    pub auto_fixed_count: i64,
    pub retry_count: i64,
    /// First dispatch to last completion.
    pub duration_ms: Option<i64>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CreateRunInput {
    pub scenario_slug: String,
    pub scenario_name: String,
    pub environment: String,
    pub trigger_source: TriggerSource,
    pub total_steps: i64,
    pub auto_fix_enabled: bool,
}

/// Final counters written when a run reaches a terminal state.
#[derive(Debug, Clone, Default)]
pub struct RunCompletion {
    pub passed_steps: i64,
    pub failed_steps: i64,
    pub skipped_steps: i64,
    pub auto_fixed_count: i64,
    pub retry_count: i64,
    pub duration_ms: i64,
}
