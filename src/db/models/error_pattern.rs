use serde::{Deserialize, Serialize};

// ============================================================================
// Error category
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    Timeout,
    Database,
    Auth,
    RateLimit,
    JwtKey,
    EnvVar,
    ServiceDown,
    Network,
    NotFound,
    Assertion,
    #[default]
    Unknown,
}

crate::text_enum!(ErrorCategory {
    Timeout => "TIMEOUT",
    Database => "DATABASE",
    Auth => "AUTH",
    RateLimit => "RATE_LIMIT",
    JwtKey => "JWT_KEY",
    EnvVar => "ENV_VAR",
    ServiceDown => "SERVICE_DOWN",
    Network => "NETWORK",
    NotFound => "NOT_FOUND",
    Assertion => "ASSERTION",
    Unknown => "UNKNOWN",
});

// ============================================================================
// Error patterns (deduplicated failure signatures)
// ============================================================================

/// Canonical record of a recurring failure, unique per (project_name, error_hash).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPattern {
    pub id: String,
    pub project_name: String,
    pub error_hash: String,
    pub error_message: String,
    pub category: ErrorCategory,
    pub first_seen: String,
    pub last_seen: String,
    /// Only ever incremented.
    pub occurrence_count: i64,
    pub confidence: f64,
}

#[derive(Debug, Clone)]
pub struct UpsertErrorPatternInput {
    pub project_name: String,
    pub error_hash: String,
    pub error_message: String,
    pub category: ErrorCategory,
    pub confidence: f64,
}

// ============================================================================
// Error occurrences
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorOccurrence {
    pub id: String,
    pub pattern_id: String,
    pub environment: String,
    pub stack_trace: Option<String>,
    pub context: Option<serde_json::Value>,
    pub run_id: Option<String>,
    pub resolved: bool,
    pub resolved_at: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct CreateErrorOccurrenceInput {
    pub pattern_id: String,
    pub environment: String,
    pub stack_trace: Option<String>,
    pub context: Option<serde_json::Value>,
    pub run_id: Option<String>,
}

// ============================================================================
// Error solutions
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorSolution {
    pub id: String,
    pub pattern_id: String,
    pub title: String,
    pub description: String,
    pub steps: Vec<String>,
    pub modified_files: Vec<String>,
    /// Fraction of applications that resolved the error, in [0, 1].
    pub success_rate: f64,
    pub times_applied: i64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateSolutionInput {
    pub pattern_id: String,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(default)]
    pub modified_files: Vec<String>,
}

/// A pattern with everything known about it, for review screens and the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct PatternDetails {
    pub pattern: ErrorPattern,
    pub solutions: Vec<ErrorSolution>,
    pub recent_occurrences: Vec<ErrorOccurrence>,
}
