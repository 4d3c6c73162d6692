//! Scenario and step model.
//!
//! A scenario is loaded once (YAML or JSON), validated, and then treated as
//! read-only by the runner. Steps are a tagged union so dispatch is an
//! exhaustive `match` instead of string comparisons on a `type` field.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AppError;

/// Runtime variables shared by the steps of one run.
pub type Variables = BTreeMap<String, Value>;

// ============================================================================
// Scenario
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScenarioType {
    Precision,
    Sso,
    #[default]
    Api,
    E2e,
    RenoAi,
}

/// When a finished run should be handed to the notification consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyTrigger {
    OnFailure,
    OnSuccess,
    OnAutoFix,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    slug: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "type", default)]
    pub scenario_type: ScenarioType,
    #[serde(default)]
    pub environment: Option<String>,
    /// Default deadline for steps that do not set their own.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub notify: Vec<NotifyTrigger>,
    #[serde(default)]
    pub variables: Variables,
    pub steps: Vec<Step>,
}

impl Scenario {
    pub fn new(
        name: impl Into<String>,
        slug: impl Into<String>,
        steps: Vec<Step>,
    ) -> Result<Self, AppError> {
        let scenario = Self {
            name: name.into(),
            slug: slug.into(),
            description: None,
            scenario_type: ScenarioType::default(),
            environment: None,
            timeout_ms: None,
            notify: Vec::new(),
            variables: Variables::new(),
            steps,
        };
        scenario.validate()?;
        Ok(scenario)
    }

    /// Unique identifier. Fixed at load time; there is no setter.
    pub fn slug(&self) -> &str {
        &self.slug
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, AppError> {
        let scenario: Scenario = serde_yaml::from_str(raw)?;
        scenario.validate()?;
        Ok(scenario)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, AppError> {
        let scenario: Scenario = serde_json::from_str(raw)?;
        scenario.validate()?;
        Ok(scenario)
    }

    /// Load a scenario file; `.json` is parsed as JSON, anything else as YAML.
    pub fn load_file(path: &Path) -> Result<Self, AppError> {
        let raw = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .map(|e| e.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        if is_json {
            Self::from_json_str(&raw)
        } else {
            Self::from_yaml_str(&raw)
        }
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.name.trim().is_empty() {
            return Err(AppError::Validation("Scenario name cannot be empty".into()));
        }
        if self.slug.trim().is_empty() {
            return Err(AppError::Validation(format!(
                "Scenario '{}' has an empty slug",
                self.name
            )));
        }
        if self.steps.is_empty() {
            return Err(AppError::Validation(format!(
                "Scenario '{}' has no steps",
                self.slug
            )));
        }
        if self.timeout_ms == Some(0) {
            return Err(AppError::Validation(format!(
                "Scenario '{}' timeout_ms must be > 0",
                self.slug
            )));
        }
        for (idx, step) in self.steps.iter().enumerate() {
            step.validate(&self.slug)
                .map_err(|msg| AppError::Validation(format!("{} step #{}: {}", self.slug, idx + 1, msg)))?;
        }
        Ok(())
    }
}

// ============================================================================
// Steps
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    /// A terminal failure of a blocking step stops the run.
    #[serde(default)]
    pub blocking: bool,
    /// Skipped by design: recorded as SKIPPED and counted as passing.
    #[serde(default)]
    pub skip: bool,
    #[serde(flatten)]
    pub action: StepAction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepAction {
    Http(HttpStep),
    Scenario(NestedScenarioStep),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
}

impl HttpMethod {
    pub fn as_reqwest(self) -> reqwest::Method {
        match self {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
            HttpMethod::Head => reqwest::Method::HEAD,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpStep {
    #[serde(default)]
    pub method: HttpMethod,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
    #[serde(default)]
    pub expect: Expectations,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// `variable name -> dotted path` into the JSON response body.
    #[serde(default)]
    pub save: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Expectations {
    /// Exact status code. When unset any 2xx passes.
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub body_contains: Option<String>,
    /// `dotted path -> expected value` checks on the JSON response body.
    #[serde(default)]
    pub json: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NestedScenarioStep {
    /// Slug of the referenced scenario.
    pub scenario: String,
    /// Fraction of child steps that must pass, in [0, 1]. Defaults to 1.0.
    #[serde(default)]
    pub pass_threshold: Option<f64>,
}

impl NestedScenarioStep {
    pub fn threshold(&self) -> f64 {
        self.pass_threshold.unwrap_or(1.0)
    }
}

impl Step {
    pub fn http(name: impl Into<String>, http: HttpStep) -> Self {
        Self {
            name: name.into(),
            blocking: false,
            skip: false,
            action: StepAction::Http(http),
        }
    }

    pub fn nested(name: impl Into<String>, slug: impl Into<String>, pass_threshold: Option<f64>) -> Self {
        Self {
            name: name.into(),
            blocking: false,
            skip: false,
            action: StepAction::Scenario(NestedScenarioStep {
                scenario: slug.into(),
                pass_threshold,
            }),
        }
    }

    /// Per-step deadline, if the step kind carries one.
    pub fn timeout_ms(&self) -> Option<u64> {
        match &self.action {
            StepAction::Http(http) => http.timeout_ms,
            StepAction::Scenario(_) => None,
        }
    }

    fn validate(&self, owner_slug: &str) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("step name cannot be empty".into());
        }
        match &self.action {
            StepAction::Http(http) => {
                if http.url.trim().is_empty() {
                    return Err(format!("'{}' has an empty url", self.name));
                }
                if http.timeout_ms == Some(0) {
                    return Err(format!("'{}' timeout_ms must be > 0", self.name));
                }
            }
            StepAction::Scenario(nested) => {
                if nested.scenario.trim().is_empty() {
                    return Err(format!("'{}' references an empty scenario slug", self.name));
                }
                if nested.scenario == owner_slug {
                    return Err(format!("'{}' references its own scenario", self.name));
                }
                if !(0.0..=1.0).contains(&nested.threshold()) {
                    return Err(format!("'{}' pass_threshold must be within [0, 1]", self.name));
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// Catalog
// ============================================================================

/// Scenarios addressable by slug, used to resolve nested references.
#[derive(Debug, Clone, Default)]
pub struct ScenarioCatalog {
    scenarios: HashMap<String, Scenario>,
}

impl ScenarioCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, scenario: Scenario) -> Result<(), AppError> {
        if self.scenarios.contains_key(scenario.slug()) {
            return Err(AppError::Validation(format!(
                "Duplicate scenario slug '{}'",
                scenario.slug()
            )));
        }
        self.scenarios.insert(scenario.slug().to_string(), scenario);
        Ok(())
    }

    pub fn get(&self, slug: &str) -> Option<&Scenario> {
        self.scenarios.get(slug)
    }

    pub fn len(&self) -> usize {
        self.scenarios.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scenarios.is_empty()
    }

    /// Load every `.yaml`, `.yml` and `.json` file in `dir`.
    pub fn load_dir(dir: &Path) -> Result<Self, AppError> {
        let mut catalog = Self::new();
        let mut paths: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .map(|e| matches!(e.to_ascii_lowercase().as_str(), "yaml" | "yml" | "json"))
                    .unwrap_or(false)
            })
            .collect();
        paths.sort();
        for path in paths {
            catalog.insert(Scenario::load_file(&path)?)?;
        }
        tracing::debug!(dir = %dir.display(), count = catalog.len(), "Scenario catalog loaded");
        Ok(catalog)
    }
}

// ============================================================================
// Variables
// ============================================================================

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").expect("valid placeholder regex"))
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Replace `{{name}}` placeholders with variable values. Unknown names are left
/// untouched so the failure is visible in the request.
pub fn resolve_template(template: &str, vars: &Variables) -> String {
    placeholder_re()
        .replace_all(template, |caps: &regex::Captures| match vars.get(&caps[1]) {
            Some(v) => value_to_text(v),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Resolve placeholders inside a JSON value. A string that is exactly one
/// placeholder is replaced by the variable's JSON value, preserving its type.
pub fn resolve_value(value: &Value, vars: &Variables) -> Value {
    match value {
        Value::String(s) => {
            if let Some(caps) = placeholder_re().captures(s) {
                if caps[0].len() == s.len() {
                    if let Some(v) = vars.get(&caps[1]) {
                        return v.clone();
                    }
                }
            }
            Value::String(resolve_template(s, vars))
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_value(v, vars)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_value(v, vars)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Look up a dotted path (`data.items.0.id`) in a JSON value.
pub fn extract_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|seg| !seg.is_empty())
        .try_fold(value, |current, seg| match current {
            Value::Object(map) => map.get(seg),
            Value::Array(items) => seg.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

/// Apply a step's `save` directive to a response body.
///
/// Returns the captured variables, or the first path that could not be found.
pub fn capture_variables(save: &BTreeMap<String, String>, body: &Value) -> Result<Variables, String> {
    let mut captured = Variables::new();
    for (var, path) in save {
        match extract_path(body, path) {
            Some(v) => {
                captured.insert(var.clone(), v.clone());
            }
            None => return Err(path.clone()),
        }
    }
    Ok(captured)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const LOGIN_FLOW: &str = r#"
name: Login flow
slug: login-flow
type: SSO
timeout_ms: 10000
notify: [on_failure]
variables:
  base: https://api.example.test
steps:
  - name: Fetch token
    type: http
    method: POST
    url: "{{base}}/auth"
    body: { user: "qa" }
    save:
      token: data.token
  - name: Profile
    type: http
    url: "{{base}}/me"
    headers:
      Authorization: "Bearer {{token}}"
    expect:
      status: 200
    timeout_ms: 5000
  - name: Smoke suite
    type: scenario
    scenario: smoke
    pass_threshold: 0.5
"#;

    #[test]
    fn test_parse_yaml_scenario() {
        let s = Scenario::from_yaml_str(LOGIN_FLOW).unwrap();
        assert_eq!(s.slug(), "login-flow");
        assert_eq!(s.scenario_type, ScenarioType::Sso);
        assert_eq!(s.notify, vec![NotifyTrigger::OnFailure]);
        assert_eq!(s.steps.len(), 3);

        match &s.steps[0].action {
            StepAction::Http(http) => {
                assert_eq!(http.method, HttpMethod::Post);
                assert_eq!(http.save.get("token").map(String::as_str), Some("data.token"));
            }
            other => panic!("unexpected step {other:?}"),
        }
        assert_eq!(s.steps[1].timeout_ms(), Some(5000));
        match &s.steps[2].action {
            StepAction::Scenario(nested) => {
                assert_eq!(nested.scenario, "smoke");
                assert_eq!(nested.threshold(), 0.5);
            }
            other => panic!("unexpected step {other:?}"),
        }
    }

    #[test]
    fn test_step_order_preserved() {
        let s = Scenario::from_yaml_str(LOGIN_FLOW).unwrap();
        let names: Vec<_> = s.steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["Fetch token", "Profile", "Smoke suite"]);
    }

    #[test]
    fn test_reno_ai_and_e2e_types() {
        let s: ScenarioType = serde_json::from_value(json!("RENO_AI")).unwrap();
        assert_eq!(s, ScenarioType::RenoAi);
        let s: ScenarioType = serde_json::from_value(json!("E2E")).unwrap();
        assert_eq!(s, ScenarioType::E2e);
    }

    #[test]
    fn test_rejects_empty_steps() {
        let err = Scenario::from_json_str(r#"{"name":"x","slug":"x","steps":[]}"#).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn test_rejects_missing_slug() {
        let err = Scenario::from_yaml_str("name: x\nsteps: []\n").unwrap_err();
        assert!(matches!(err, AppError::Yaml(_)));
    }

    #[test]
    fn test_rejects_empty_step_name() {
        let err = Scenario::new("x", "x", vec![Step::http(" ", HttpStep {
            url: "http://a".into(),
            ..Default::default()
        })])
        .unwrap_err();
        assert!(err.to_string().contains("step name cannot be empty"));
    }

    #[test]
    fn test_rejects_self_reference() {
        let err = Scenario::new("x", "x", vec![Step::nested("loop", "x", None)]).unwrap_err();
        assert!(err.to_string().contains("references its own scenario"));
    }

    #[test]
    fn test_catalog_rejects_duplicate_slug() {
        let mut catalog = ScenarioCatalog::new();
        let s = Scenario::from_yaml_str(LOGIN_FLOW).unwrap();
        catalog.insert(s.clone()).unwrap();
        assert!(catalog.insert(s).is_err());
        assert!(catalog.get("login-flow").is_some());
    }

    #[test]
    fn test_load_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("login.yaml"), LOGIN_FLOW).unwrap();
        std::fs::write(
            dir.path().join("smoke.json"),
            r#"{"name":"Smoke","slug":"smoke","steps":[{"name":"ping","type":"http","url":"http://x/ping"}]}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("README.md"), "ignored").unwrap();

        let catalog = ScenarioCatalog::load_dir(dir.path()).unwrap();
        assert_eq!(catalog.len(), 2);
        assert!(catalog.get("smoke").is_some());
    }

    #[test]
    fn test_resolve_template() {
        let mut vars = Variables::new();
        vars.insert("base".into(), json!("https://h"));
        vars.insert("id".into(), json!(42));
        assert_eq!(resolve_template("{{base}}/items/{{ id }}", &vars), "https://h/items/42");
        assert_eq!(resolve_template("{{missing}}", &vars), "{{missing}}");
    }

    #[test]
    fn test_resolve_value_preserves_types() {
        let mut vars = Variables::new();
        vars.insert("count".into(), json!(3));
        vars.insert("name".into(), json!("qa"));
        let body = json!({"n": "{{count}}", "greeting": "hi {{name}}", "list": ["{{name}}"]});
        assert_eq!(
            resolve_value(&body, &vars),
            json!({"n": 3, "greeting": "hi qa", "list": ["qa"]})
        );
    }

    #[test]
    fn test_extract_path() {
        let body = json!({"data": {"items": [{"id": "a"}, {"id": "b"}]}});
        assert_eq!(extract_path(&body, "data.items.1.id"), Some(&json!("b")));
        assert_eq!(extract_path(&body, "data.items.5.id"), None);
        assert_eq!(extract_path(&body, "data.missing"), None);
    }

    #[test]
    fn test_capture_variables_reports_missing_path() {
        let mut save = BTreeMap::new();
        save.insert("token".to_string(), "data.token".to_string());
        let ok = capture_variables(&save, &json!({"data": {"token": "t1"}})).unwrap();
        assert_eq!(ok.get("token"), Some(&json!("t1")));

        let err = capture_variables(&save, &json!({"data": {}})).unwrap_err();
        assert_eq!(err, "data.token");
    }
}
