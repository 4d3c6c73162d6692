//! Fix engine: maps a failed step to a [`FixSuggestion`].
//!
//! Pure functions. No DB or async dependencies, for testability.
//! The decision is an ordered rule table ([`FIX_RULES`]); the first matching
//! rule wins. The engine never retries anything itself: the runner owns the
//! retry budget.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::scenario::{Step, StepAction};
use crate::engine::types::StepResult;

/// Base used when doubling the timeout of a step that has none.
pub const DEFAULT_BASE_TIMEOUT_MS: u64 = 30_000;
/// Delay suggested before retrying a rate-limited request.
pub const RATE_LIMIT_DELAY_MS: u64 = 1_000;
/// Minimum confidence a suggestion needs before callers act on it.
pub const DEFAULT_FIX_THRESHOLD: f64 = 0.6;

// ---------------------------------------------------------------------------
// Suggestion types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixKind {
    Retry,
    ModifyRequest,
    Skip,
    Alert,
}

impl FixKind {
    /// Kinds that lead to a re-dispatch of the step.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FixKind::Retry | FixKind::ModifyRequest)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FixKind::Retry => "retry",
            FixKind::ModifyRequest => "modify_request",
            FixKind::Skip => "skip",
            FixKind::Alert => "alert",
        }
    }
}

/// Field overrides applied by [`apply_fix`]. Headers are merged into the
/// step's headers; every other field replaces the original.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FixModifications {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FixSuggestion {
    pub kind: FixKind,
    pub reason: String,
    pub modifications: Option<FixModifications>,
    /// In [0, 1].
    pub confidence: f64,
    /// Delay the caller should wait before re-dispatching.
    pub delay_ms: Option<u64>,
    /// Name of the rule that produced this suggestion.
    pub rule: &'static str,
}

impl FixSuggestion {
    fn new(rule: &'static str, kind: FixKind, confidence: f64, reason: String) -> Self {
        Self {
            kind,
            reason,
            modifications: None,
            confidence,
            delay_ms: None,
            rule,
        }
    }

    /// Human-readable one-liner for `StepResult::fix_description`.
    pub fn describe(&self) -> String {
        format!(
            "{} (confidence {:.2}): {}",
            self.kind.as_str(),
            self.confidence,
            self.reason
        )
    }
}

// ---------------------------------------------------------------------------
// Rule table
// ---------------------------------------------------------------------------

/// What the rules look at: lower-cased error text and the HTTP status.
#[derive(Debug, Clone)]
pub struct FailureSignal {
    pub error: String,
    pub status_code: Option<u16>,
}

impl FailureSignal {
    pub fn from_result(result: &StepResult) -> Self {
        Self {
            error: result.error_text().to_lowercase(),
            status_code: result.status_code,
        }
    }

    fn error_contains_any(&self, needles: &[&str]) -> bool {
        needles.iter().any(|n| self.error.contains(n))
    }
}

pub struct FixRule {
    pub name: &'static str,
    pub matches: fn(&FailureSignal) -> bool,
    pub suggest: fn(&Step, &FailureSignal) -> FixSuggestion,
}

/// Evaluated top to bottom; first match wins.
pub static FIX_RULES: &[FixRule] = &[
    FixRule {
        name: "client_timeout",
        matches: |s| s.error_contains_any(&["timeout", "timed out", "aborted"]),
        suggest: suggest_timeout,
    },
    FixRule {
        name: "connection_refused",
        matches: |s| {
            s.error_contains_any(&[
                "econnrefused",
                "connection refused",
                "enotfound",
                "getaddrinfo",
                "dns error",
                "failed to lookup address",
            ])
        },
        suggest: |_, _| {
            FixSuggestion::new(
                "connection_refused",
                FixKind::Retry,
                0.7,
                "Target unreachable (connection refused or DNS failure), retrying".into(),
            )
        },
    },
    FixRule {
        name: "rate_limited",
        matches: |s| s.status_code == Some(429),
        suggest: |_, _| FixSuggestion {
            delay_ms: Some(RATE_LIMIT_DELAY_MS),
            ..FixSuggestion::new(
                "rate_limited",
                FixKind::Retry,
                0.9,
                format!("Rate limited (HTTP 429), retrying after {}ms", RATE_LIMIT_DELAY_MS),
            )
        },
    },
    FixRule {
        name: "auth_rejected",
        matches: |s| matches!(s.status_code, Some(401) | Some(403)),
        suggest: |_, s| {
            FixSuggestion::new(
                "auth_rejected",
                FixKind::Alert,
                0.9,
                format!(
                    "Authorization rejected (HTTP {}), credentials are likely stale",
                    s.status_code.unwrap_or_default()
                ),
            )
        },
    },
    FixRule {
        name: "server_error",
        matches: |s| s.status_code.is_some_and(|c| c >= 500),
        suggest: |_, s| {
            FixSuggestion::new(
                "server_error",
                FixKind::Retry,
                0.7,
                format!(
                    "Server error (HTTP {}), likely transient",
                    s.status_code.unwrap_or_default()
                ),
            )
        },
    },
    FixRule {
        name: "bad_request",
        matches: |s| s.status_code == Some(400),
        suggest: |_, _| {
            FixSuggestion::new(
                "bad_request",
                FixKind::Alert,
                0.8,
                "Bad request (HTTP 400), the step definition needs review".into(),
            )
        },
    },
    FixRule {
        name: "not_found",
        matches: |s| s.status_code == Some(404),
        suggest: |_, _| {
            FixSuggestion::new(
                "not_found",
                FixKind::Alert,
                0.9,
                "Endpoint not found (HTTP 404), check the URL or route".into(),
            )
        },
    },
    FixRule {
        name: "assertion_mismatch",
        matches: |s| assertion_re().is_match(&s.error),
        suggest: |_, s| {
            FixSuggestion::new(
                "assertion_mismatch",
                FixKind::Alert,
                0.8,
                format!("Assertion mismatch: {}", truncate(&s.error, 200)),
            )
        },
    },
    FixRule {
        name: "fallback",
        matches: |_| true,
        suggest: |_, s| {
            FixSuggestion::new(
                "fallback",
                FixKind::Retry,
                0.5,
                format!("Unclassified failure, low-confidence retry: {}", truncate(&s.error, 200)),
            )
        },
    },
];

fn assertion_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)\bexpected\b.+\bgot\b").expect("valid assertion regex"))
}

fn suggest_timeout(step: &Step, _: &FailureSignal) -> FixSuggestion {
    let current = step.timeout_ms().unwrap_or(DEFAULT_BASE_TIMEOUT_MS);
    let doubled = current.saturating_mul(2);
    FixSuggestion {
        modifications: Some(FixModifications {
            timeout_ms: Some(doubled),
            ..Default::default()
        }),
        ..FixSuggestion::new(
            "client_timeout",
            FixKind::ModifyRequest,
            0.8,
            format!("Request timed out after {}ms, retrying with {}ms", current, doubled),
        )
    }
}

// ---------------------------------------------------------------------------
// Public contract
// ---------------------------------------------------------------------------

/// Pick a remedy for a failed step.
pub fn suggest_fix(step: &Step, result: &StepResult) -> FixSuggestion {
    let signal = FailureSignal::from_result(result);
    // The fallback rule always matches, so this finds a rule.
    let rule = FIX_RULES
        .iter()
        .find(|r| (r.matches)(&signal))
        .unwrap_or(&FIX_RULES[FIX_RULES.len() - 1]);
    let suggestion = (rule.suggest)(step, &signal);

    tracing::debug!(
        step = %step.name,
        rule = rule.name,
        kind = suggestion.kind.as_str(),
        confidence = suggestion.confidence,
        "Fix suggested",
    );
    suggestion
}

/// Return a copy of `step` with the suggestion's modifications applied.
/// Only `modify_request` suggestions change anything.
pub fn apply_fix(step: &Step, suggestion: &FixSuggestion) -> Step {
    let mut fixed = step.clone();
    if suggestion.kind != FixKind::ModifyRequest {
        return fixed;
    }
    let Some(mods) = &suggestion.modifications else {
        return fixed;
    };

    match &mut fixed.action {
        StepAction::Http(http) => {
            if let Some(headers) = &mods.headers {
                http.headers
                    .extend(headers.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            if let Some(body) = &mods.body {
                http.body = Some(body.clone());
            }
            if let Some(url) = &mods.url {
                http.url = url.clone();
            }
            if let Some(timeout) = mods.timeout_ms {
                http.timeout_ms = Some(timeout);
            }
        }
        StepAction::Scenario(_) => {
            tracing::debug!(step = %step.name, "Request modifications do not apply to nested scenario steps");
        }
    }
    fixed
}

/// Callers must not act on a suggestion below `threshold`.
pub fn should_apply_fix(suggestion: &FixSuggestion, threshold: f64) -> bool {
    suggestion.confidence >= threshold
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        s
    } else {
        let mut end = max;
        while end > 0 && !s.is_char_boundary(end) {
            end -= 1;
        }
        &s[..end]
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
