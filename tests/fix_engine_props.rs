//! Property tests for the fix engine and error hashing.

use std::collections::BTreeMap;

use proptest::prelude::*;
use serde_json::json;

use selfheal_qa::engine::dedup::compute_error_hash;
use selfheal_qa::engine::healing::{
    apply_fix, should_apply_fix, suggest_fix, FixKind, FixModifications, FixSuggestion,
    DEFAULT_BASE_TIMEOUT_MS, DEFAULT_FIX_THRESHOLD,
};
use selfheal_qa::engine::scenario::{HttpMethod, HttpStep, Step};
use selfheal_qa::engine::types::StepResult;

// -- Strategy helpers --

fn arb_method() -> impl Strategy<Value = HttpMethod> {
    prop_oneof![
        Just(HttpMethod::Get),
        Just(HttpMethod::Post),
        Just(HttpMethod::Put),
        Just(HttpMethod::Patch),
        Just(HttpMethod::Delete),
    ]
}

fn arb_step() -> impl Strategy<Value = Step> {
    (
        arb_method(),
        "[a-z]{1,12}",
        prop::option::of(1u64..10_000_000),
        prop::collection::btree_map("[A-Z][a-z]{1,8}", "[a-z0-9]{0,8}", 0..4),
        any::<bool>(),
    )
        .prop_map(|(method, path, timeout_ms, headers, blocking)| {
            let mut step = Step::http(
                format!("step {path}"),
                HttpStep {
                    method,
                    url: format!("https://api.example.test/{path}"),
                    headers,
                    body: Some(json!({ "path": path })),
                    timeout_ms,
                    ..Default::default()
                },
            );
            step.blocking = blocking;
            step
        })
}

fn arb_non_modify_kind() -> impl Strategy<Value = FixKind> {
    prop_oneof![Just(FixKind::Retry), Just(FixKind::Skip), Just(FixKind::Alert)]
}

fn failed(step: &Step, error: &str, status: Option<u16>) -> StepResult {
    let result = StepResult::failed(&step.name, chrono::Utc::now(), error);
    match status {
        Some(code) => result.with_status_code(code),
        None => result,
    }
}

proptest! {
    /// Any error text mentioning a timeout doubles the step's deadline.
    #[test]
    fn timeout_always_doubles(
        step in arb_step(),
        prefix in "[a-z ]{0,16}",
        needle in prop_oneof![Just("timeout"), Just("Timeout"), Just("TIMEOUT")],
        suffix in "[a-z0-9 ]{0,16}",
        status in prop::option::of(100u16..600),
    ) {
        let error = format!("{prefix}{needle}{suffix}");
        let suggestion = suggest_fix(&step, &failed(&step, &error, status));

        let base = step.timeout_ms().unwrap_or(DEFAULT_BASE_TIMEOUT_MS);
        prop_assert_eq!(suggestion.kind, FixKind::ModifyRequest);
        let mods = suggestion.modifications.expect("timeout fix carries modifications");
        prop_assert_eq!(mods.timeout_ms, Some(base * 2));
    }

    /// HTTP 429 is always a retry the default threshold lets through.
    #[test]
    fn rate_limit_passes_default_threshold(
        step in arb_step(),
        error in "[0-9 ]{0,20}",
    ) {
        let suggestion = suggest_fix(&step, &failed(&step, &error, Some(429)));
        prop_assert_eq!(suggestion.kind, FixKind::Retry);
        prop_assert!(suggestion.confidence >= DEFAULT_FIX_THRESHOLD);
        prop_assert!(should_apply_fix(&suggestion, DEFAULT_FIX_THRESHOLD));
    }

    /// Only modify_request suggestions change the step.
    #[test]
    fn apply_fix_ignores_other_kinds(
        step in arb_step(),
        kind in arb_non_modify_kind(),
        timeout_ms in prop::option::of(1u64..1_000_000),
        url in prop::option::of("https://[a-z]{3,8}\\.test/[a-z]{1,6}"),
    ) {
        let mut headers = BTreeMap::new();
        headers.insert("X-Fix".to_string(), "1".to_string());
        let suggestion = FixSuggestion {
            kind,
            reason: "property".into(),
            modifications: Some(FixModifications {
                headers: Some(headers),
                body: Some(json!({"replaced": true})),
                url,
                timeout_ms,
            }),
            confidence: 1.0,
            delay_ms: None,
            rule: "property",
        };
        prop_assert_eq!(apply_fix(&step, &suggestion), step);
    }

    /// Every suggestion is confidence-scored within [0, 1].
    #[test]
    fn confidence_is_bounded(
        step in arb_step(),
        error in ".{0,64}",
        status in prop::option::of(100u16..600),
    ) {
        let suggestion = suggest_fix(&step, &failed(&step, &error, status));
        prop_assert!((0.0..=1.0).contains(&suggestion.confidence));
    }

    /// Whitespace layout never changes a pattern's identity.
    #[test]
    fn error_hash_ignores_whitespace(words in prop::collection::vec("[a-zA-Z:]{1,10}", 1..8)) {
        let tight = words.join(" ");
        let loose = format!("  {}\n", words.join("   \t"));
        prop_assert_eq!(compute_error_hash(&tight), compute_error_hash(&loose));
    }
}
