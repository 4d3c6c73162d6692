//! Error deduplication: fold failures into canonical patterns keyed by a
//! content hash, log each occurrence, and look for similar patterns.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use rusqlite::TransactionBehavior;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::db::models::{
    CreateErrorOccurrenceInput, CreateSolutionInput, ErrorCategory, ErrorOccurrence,
    ErrorPattern, ErrorSolution, PatternDetails, UpsertErrorPatternInput,
};
use crate::db::repos::error_patterns as repo;
use crate::db::DbPool;
use crate::engine::queue::{BackgroundQueue, QueueTask, QueueTaskKind, TaskExecutor};
use crate::error::AppError;

/// Upper bound on similar patterns returned per search.
pub const SIMILAR_PATTERN_LIMIT: i64 = 10;
const RECENT_OCCURRENCE_LIMIT: i64 = 20;

// ============================================================================
// Hashing and categorisation
// ============================================================================

fn uuid_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}\b")
            .expect("valid uuid regex")
    })
}

fn digits_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d{4,}").expect("valid digits regex"))
}

/// Normalise volatile parts of a message so recurrences hash identically:
/// UUIDs and runs of 4+ digits are masked, whitespace is collapsed.
pub fn normalize_error_message(message: &str) -> String {
    let masked = uuid_re().replace_all(message, "<uuid>");
    let masked = digits_re().replace_all(&masked, "<n>");
    masked.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Stable SHA-256 (hex) of the normalised message.
pub fn compute_error_hash(message: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_error_message(message).as_bytes());
    hex::encode(hasher.finalize())
}

const CATEGORY_KEYWORDS: &[(ErrorCategory, &[&str])] = &[
    (ErrorCategory::RateLimit, &["rate limit", "too many requests"]),
    (ErrorCategory::JwtKey, &["jwt", "signing key", "jwks", "invalid signature"]),
    (ErrorCategory::Auth, &["unauthorized", "forbidden", "authentication", "access denied"]),
    (ErrorCategory::EnvVar, &["environment variable", "env var", "is not set", "missing env"]),
    (ErrorCategory::Database, &["database", "sqlite", "postgres", "prisma", "deadlock", "sql error"]),
    (ErrorCategory::Timeout, &["timeout", "timed out", "aborted"]),
    (ErrorCategory::ServiceDown, &["connection refused", "econnrefused", "service unavailable", "bad gateway"]),
    (ErrorCategory::Network, &["enotfound", "getaddrinfo", "dns error", "network", "connection reset"]),
];

/// Classify a failure for the knowledge base. Status codes take precedence
/// where they are unambiguous; otherwise the first keyword group that matches
/// the message wins.
pub fn categorize_error(message: &str, status_code: Option<u16>) -> ErrorCategory {
    match status_code {
        Some(429) => return ErrorCategory::RateLimit,
        Some(401) | Some(403) => return ErrorCategory::Auth,
        Some(502) | Some(503) => return ErrorCategory::ServiceDown,
        _ => {}
    }

    let lower = message.to_lowercase();
    if let Some((category, _)) = CATEGORY_KEYWORDS
        .iter()
        .find(|(_, needles)| needles.iter().any(|n| lower.contains(n)))
    {
        return *category;
    }

    if status_code == Some(404) {
        ErrorCategory::NotFound
    } else if lower.contains("expected") && lower.contains("got") {
        ErrorCategory::Assertion
    } else {
        ErrorCategory::Unknown
    }
}

// ============================================================================
// Deferred similarity results
// ============================================================================

/// Results of completed background similarity searches, by pattern id.
#[derive(Clone, Default)]
pub struct SimilarityIndex {
    inner: Arc<Mutex<HashMap<String, Vec<ErrorPattern>>>>,
}

impl SimilarityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, pattern_id: &str, similar: Vec<ErrorPattern>) {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.insert(pattern_id.to_string(), similar);
    }

    /// `None` until a search for this pattern has completed.
    pub fn get(&self, pattern_id: &str) -> Option<Vec<ErrorPattern>> {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.get(pattern_id).cloned()
    }
}

/// Queue executor that runs similarity searches and stores the results.
pub struct SimilaritySearchExecutor {
    pool: DbPool,
    index: SimilarityIndex,
}

impl SimilaritySearchExecutor {
    pub fn new(pool: DbPool, index: SimilarityIndex) -> Self {
        Self { pool, index }
    }
}

#[async_trait]
impl TaskExecutor for SimilaritySearchExecutor {
    async fn execute(&self, task: &QueueTask) -> Result<(), AppError> {
        match &task.kind {
            QueueTaskKind::SimilaritySearch {
                pattern_id,
                project_name,
                error_message,
            } => {
                let pool = self.pool.clone();
                let (id, project, message) = (pattern_id.clone(), project_name.clone(), error_message.clone());
                let similar = tokio::task::spawn_blocking(move || search_similar(&pool, &id, &project, &message))
                    .await
                    .map_err(|e| AppError::Internal(format!("Similarity search task failed: {e}")))??;
                tracing::debug!(pattern_id = %pattern_id, found = similar.len(), "Deferred similarity search done");
                self.index.record(pattern_id, similar);
                Ok(())
            }
        }
    }
}

fn search_similar(
    pool: &DbPool,
    pattern_id: &str,
    project_name: &str,
    error_message: &str,
) -> Result<Vec<ErrorPattern>, AppError> {
    let conn = pool.get()?;
    let mut similar = repo::search_error_patterns(
        &conn,
        project_name,
        error_message,
        Some(pattern_id),
        SIMILAR_PATTERN_LIMIT,
    )?;
    similar.retain(|p| p.id != pattern_id);
    Ok(similar)
}

// ============================================================================
// Service
// ============================================================================

#[derive(Debug, Clone)]
pub struct RecordErrorInput {
    pub project_name: String,
    /// Computed from `error_message` when absent.
    pub error_hash: Option<String>,
    pub error_message: String,
    pub category: ErrorCategory,
    pub confidence: f64,
    pub environment: String,
    pub stack_trace: Option<String>,
    pub context: Option<serde_json::Value>,
    pub run_id: Option<String>,
    pub include_similar: bool,
    pub async_mode: bool,
}

impl RecordErrorInput {
    pub fn new(
        project_name: impl Into<String>,
        environment: impl Into<String>,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            project_name: project_name.into(),
            error_hash: None,
            error_message: error_message.into(),
            category: ErrorCategory::Unknown,
            confidence: 0.5,
            environment: environment.into(),
            stack_trace: None,
            context: None,
            run_id: None,
            include_similar: false,
            async_mode: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordErrorOutcome {
    pub occurrence: ErrorOccurrence,
    pub pattern: ErrorPattern,
    /// Always empty in async mode; see [`ErrorDeduplicationService::similar_patterns`].
    pub similar_patterns: Vec<ErrorPattern>,
}

#[derive(Clone)]
pub struct ErrorDeduplicationService {
    pool: DbPool,
    queue: BackgroundQueue,
    index: SimilarityIndex,
}

impl ErrorDeduplicationService {
    pub fn new(pool: DbPool, queue: BackgroundQueue, index: SimilarityIndex) -> Self {
        Self { pool, queue, index }
    }

    /// Wire a service with its own queue and similarity executor.
    pub fn with_background_queue(pool: DbPool) -> Self {
        let index = SimilarityIndex::new();
        let executor = Arc::new(SimilaritySearchExecutor::new(pool.clone(), index.clone()));
        Self::new(pool, BackgroundQueue::new(executor), index)
    }

    pub fn queue(&self) -> &BackgroundQueue {
        &self.queue
    }

    /// Upsert the pattern and insert the occurrence atomically, then
    /// optionally search for similar patterns (inline or deferred).
    pub fn record_error_occurrence(&self, input: RecordErrorInput) -> Result<RecordErrorOutcome, AppError> {
        let error_hash = input
            .error_hash
            .clone()
            .unwrap_or_else(|| compute_error_hash(&input.error_message));

        let (pattern, occurrence) = {
            let mut conn = self.pool.get()?;
            // IMMEDIATE takes the write lock up front so two recorders of the
            // same error cannot both miss the existing row.
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let pattern = repo::upsert_error_pattern(
                &tx,
                &UpsertErrorPatternInput {
                    project_name: input.project_name.clone(),
                    error_hash,
                    error_message: input.error_message.clone(),
                    category: input.category,
                    confidence: input.confidence,
                },
            )?;
            let occurrence = repo::create_error_occurrence(
                &tx,
                &CreateErrorOccurrenceInput {
                    pattern_id: pattern.id.clone(),
                    environment: input.environment.clone(),
                    stack_trace: input.stack_trace.clone(),
                    context: input.context.clone(),
                    run_id: input.run_id.clone(),
                },
            )?;
            tx.commit()?;
            (pattern, occurrence)
        };

        tracing::info!(
            pattern_id = %pattern.id,
            category = pattern.category.as_str(),
            occurrences = pattern.occurrence_count,
            "Error occurrence recorded",
        );

        let similar_patterns = if !input.include_similar {
            Vec::new()
        } else if input.async_mode {
            self.queue.add_task(QueueTask::similarity_search(
                &pattern.id,
                &pattern.project_name,
                &pattern.error_message,
            ));
            Vec::new()
        } else {
            let similar = search_similar(&self.pool, &pattern.id, &pattern.project_name, &pattern.error_message)?;
            self.index.record(&pattern.id, similar.clone());
            similar
        };

        Ok(RecordErrorOutcome {
            occurrence,
            pattern,
            similar_patterns,
        })
    }

    /// Similar patterns from the most recent completed search, if any.
    pub fn similar_patterns(&self, pattern_id: &str) -> Option<Vec<ErrorPattern>> {
        self.index.get(pattern_id)
    }

    pub fn list_patterns(&self, project_name: Option<&str>, limit: i64) -> Result<Vec<ErrorPattern>, AppError> {
        let conn = self.pool.get()?;
        repo::list_patterns(&conn, project_name, limit)
    }

    pub fn pattern_details(&self, pattern_id: &str) -> Result<PatternDetails, AppError> {
        let conn = self.pool.get()?;
        Ok(PatternDetails {
            pattern: repo::get_error_pattern_by_id(&conn, pattern_id)?,
            solutions: repo::get_solutions_by_pattern_id(&conn, pattern_id)?,
            recent_occurrences: repo::get_occurrences_by_pattern(&conn, pattern_id, RECENT_OCCURRENCE_LIMIT)?,
        })
    }

    pub fn create_solution(&self, input: &CreateSolutionInput) -> Result<ErrorSolution, AppError> {
        let conn = self.pool.get()?;
        repo::create_solution(&conn, input)
    }

    pub fn record_solution_applied(&self, solution_id: &str, success: bool) -> Result<ErrorSolution, AppError> {
        let conn = self.pool.get()?;
        repo::record_solution_applied(&conn, solution_id, success)
    }

    pub fn resolve_occurrence(&self, occurrence_id: &str) -> Result<ErrorOccurrence, AppError> {
        let conn = self.pool.get()?;
        repo::resolve_occurrence(&conn, occurrence_id)
    }
}
