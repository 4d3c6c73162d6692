//! Step adapters: the boundary where a step turns into real I/O.
//!
//! Ordinary request failures (transport errors, unexpected status codes,
//! expectation mismatches) come back as FAILED [`StepResult`]s. `Err` is
//! reserved for malformed steps the adapter cannot even attempt.

use std::error::Error as StdError;

use async_trait::async_trait;
use serde_json::Value;

use crate::engine::scenario::{
    extract_path, resolve_template, resolve_value, Expectations, HttpStep, Step, StepAction, Variables,
};
use crate::engine::types::StepResult;
use crate::error::AppError;

/// Longest slice of a response body quoted in an error message.
const BODY_EXCERPT_CHARS: usize = 200;

// ── Trait ──────────────────────────────────────────────────────────

#[async_trait]
pub trait StepAdapter: Send + Sync {
    /// Execute one step with the run's current variables.
    async fn execute(&self, step: &Step, vars: &Variables) -> Result<StepResult, AppError>;
}

// ── HTTP adapter ───────────────────────────────────────────────────

/// Executes `http` steps with a shared reqwest client. Deadlines are applied
/// by the runner, not here.
pub struct HttpStepAdapter {
    http: reqwest::Client,
}

impl HttpStepAdapter {
    pub fn new() -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("selfheal-qa/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { http })
    }

    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }

    fn build_request(&self, http: &HttpStep, vars: &Variables) -> Result<reqwest::RequestBuilder, AppError> {
        let raw_url = resolve_template(&http.url, vars);
        let url = url::Url::parse(&raw_url)
            .map_err(|e| AppError::Validation(format!("Invalid URL '{}': {}", raw_url, e)))?;

        let mut req = self.http.request(http.method.as_reqwest(), url);
        for (name, value) in &http.headers {
            req = req.header(name.as_str(), resolve_template(value, vars));
        }
        if let Some(body) = &http.body {
            req = req.json(&resolve_value(body, vars));
        }
        Ok(req)
    }
}

#[async_trait]
impl StepAdapter for HttpStepAdapter {
    async fn execute(&self, step: &Step, vars: &Variables) -> Result<StepResult, AppError> {
        let http = match &step.action {
            StepAction::Http(http) => http,
            StepAction::Scenario(nested) => {
                return Err(AppError::Execution(format!(
                    "HTTP adapter cannot run nested scenario step '{}' ({})",
                    step.name, nested.scenario
                )));
            }
        };

        let req = self.build_request(http, vars)?;
        let started = chrono::Utc::now();

        let resp = match req.send().await {
            Ok(resp) => resp,
            Err(e) => {
                tracing::debug!(step = %step.name, error = %e, "HTTP request failed");
                return Ok(StepResult::failed(&step.name, started, transport_error_message(&e)));
            }
        };

        let status = resp.status();
        let text = match resp.text().await {
            Ok(text) => text,
            Err(e) => {
                return Ok(StepResult::failed(&step.name, started, transport_error_message(&e))
                    .with_status_code(status.as_u16()));
            }
        };
        let body = parse_body(&text);

        let outcome = check_expectations(&http.expect, status, &text, body.as_ref(), vars);
        let mut result = match outcome {
            Ok(()) => StepResult::passed(&step.name, started, Some(status.as_u16()), None),
            Err(message) => StepResult::failed(&step.name, started, message).with_status_code(status.as_u16()),
        };
        if let Some(body) = body {
            result = result.with_response(body);
        }
        Ok(result)
    }
}

// ── Helpers ────────────────────────────────────────────────────────

fn parse_body(text: &str) -> Option<Value> {
    if text.is_empty() {
        return None;
    }
    Some(serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string())))
}

/// Flatten reqwest's error chain so the root cause ("Connection refused",
/// "dns error", ...) is visible to the fix engine.
fn transport_error_message(err: &reqwest::Error) -> String {
    let mut message = if err.is_timeout() {
        format!("Request timeout: {err}")
    } else {
        err.to_string()
    };
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}

fn excerpt(text: &str) -> String {
    let mut out: String = text.chars().take(BODY_EXCERPT_CHARS).collect();
    if out.len() < text.len() {
        out.push_str("...");
    }
    out
}

/// First failing expectation as "Expected <what> <expected> got <actual>".
fn check_expectations(
    expect: &Expectations,
    status: reqwest::StatusCode,
    text: &str,
    body: Option<&Value>,
    vars: &Variables,
) -> Result<(), String> {
    match expect.status {
        Some(wanted) if wanted != status.as_u16() => {
            return Err(format!("Expected status {} got {}", wanted, status.as_u16()));
        }
        None if !status.is_success() => {
            return Err(format!(
                "HTTP {} {}: {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("error"),
                excerpt(text)
            ));
        }
        _ => {}
    }

    if let Some(needle) = &expect.body_contains {
        let needle = resolve_template(needle, vars);
        if !text.contains(&needle) {
            return Err(format!("Expected body to contain \"{}\" got \"{}\"", needle, excerpt(text)));
        }
    }

    for (path, wanted) in &expect.json {
        let wanted = resolve_value(wanted, vars);
        let actual = body.and_then(|b| extract_path(b, path));
        if actual != Some(&wanted) {
            let got = actual.map(Value::to_string).unwrap_or_else(|| "nothing".into());
            return Err(format!("Expected {} to equal {} got {}", path, wanted, got));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::scenario::HttpMethod;
    use crate::engine::types::StepStatus;
    use httpmock::prelude::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn get_step(url: String) -> Step {
        Step::http("call", HttpStep { url, ..Default::default() })
    }

    #[tokio::test]
    async fn test_passes_on_2xx_and_substitutes_variables() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/orders/42")
                    .header("Authorization", "Bearer t1")
                    .json_body(json!({"qty": 3, "note": "for qa"}));
                then.status(201).json_body(json!({"data": {"id": "o-1"}}));
            })
            .await;

        let mut headers = BTreeMap::new();
        headers.insert("Authorization".to_string(), "Bearer {{token}}".to_string());
        let step = Step::http(
            "create order",
            HttpStep {
                method: HttpMethod::Post,
                url: format!("{}/orders/{{{{id}}}}", server.base_url()),
                headers,
                body: Some(json!({"qty": "{{qty}}", "note": "for {{who}}"})),
                ..Default::default()
            },
        );

        let mut vars = Variables::new();
        vars.insert("token".into(), json!("t1"));
        vars.insert("id".into(), json!(42));
        vars.insert("qty".into(), json!(3));
        vars.insert("who".into(), json!("qa"));

        let adapter = HttpStepAdapter::new().unwrap();
        let result = adapter.execute(&step, &vars).await.unwrap();
        mock.assert_async().await;

        assert_eq!(result.status, StepStatus::Passed, "{:?}", result.error_message);
        assert_eq!(result.status_code, Some(201));
        assert_eq!(result.response, Some(json!({"data": {"id": "o-1"}})));
    }

    #[tokio::test]
    async fn test_non_2xx_fails_with_status() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/busy");
                then.status(429).body("slow down");
            })
            .await;

        let adapter = HttpStepAdapter::new().unwrap();
        let result = adapter
            .execute(&get_step(server.url("/busy")), &Variables::new())
            .await
            .unwrap();
        assert!(result.is_failed());
        assert_eq!(result.status_code, Some(429));
        assert!(result.error_text().contains("429"));
        assert_eq!(result.response, Some(json!("slow down")));
    }

    #[tokio::test]
    async fn test_expectation_mismatch_message() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/status");
                then.status(200).json_body(json!({"data": {"state": "pending"}}));
            })
            .await;

        let mut json_checks = BTreeMap::new();
        json_checks.insert("data.state".to_string(), json!("ok"));
        let step = Step::http(
            "status",
            HttpStep {
                url: server.url("/status"),
                expect: Expectations {
                    status: Some(200),
                    json: json_checks,
                    ..Default::default()
                },
                ..Default::default()
            },
        );

        let adapter = HttpStepAdapter::new().unwrap();
        let result = adapter.execute(&step, &Variables::new()).await.unwrap();
        assert!(result.is_failed());
        assert_eq!(result.error_text(), "Expected data.state to equal \"ok\" got \"pending\"");
    }

    #[tokio::test]
    async fn test_expected_status_and_body_contains() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/health");
                then.status(200).body("all good");
            })
            .await;

        let adapter = HttpStepAdapter::new().unwrap();
        let step = Step::http(
            "health",
            HttpStep {
                url: server.url("/health"),
                expect: Expectations {
                    status: Some(204),
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        let result = adapter.execute(&step, &Variables::new()).await.unwrap();
        assert_eq!(result.error_text(), "Expected status 204 got 200");

        let step = Step::http(
            "health",
            HttpStep {
                url: server.url("/health"),
                expect: Expectations {
                    body_contains: Some("good".into()),
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        let result = adapter.execute(&step, &Variables::new()).await.unwrap();
        assert_eq!(result.status, StepStatus::Passed);
    }

    #[tokio::test]
    async fn test_connection_refused_is_a_failed_result() {
        let adapter = HttpStepAdapter::new().unwrap();
        let result = adapter
            .execute(&get_step("http://127.0.0.1:1/unreachable".into()), &Variables::new())
            .await
            .unwrap();
        assert!(result.is_failed());
        assert!(result.status_code.is_none());
        assert!(
            result.error_text().to_lowercase().contains("connection refused"),
            "{}",
            result.error_text()
        );
    }

    #[tokio::test]
    async fn test_malformed_step_is_an_error() {
        let adapter = HttpStepAdapter::new().unwrap();
        let err = adapter
            .execute(&get_step("not a url".into()), &Variables::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let nested = Step::nested("child", "smoke", None);
        let err = adapter.execute(&nested, &Variables::new()).await.unwrap_err();
        assert!(matches!(err, AppError::Execution(_)));
    }
}
