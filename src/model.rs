//! Test case, step, template and result types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// A test case: an ordered list of steps sharing one variable context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Merged into the global scope before the first step runs.
    #[serde(default)]
    pub global_vars: HashMap<String, Value>,
    #[serde(default)]
    pub steps: Vec<TestStep>,
}

/// A single step in a test case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestStep {
    /// Human-readable step name.
    #[serde(default)]
    pub name: Option<String>,
    /// Execution position; steps run in ascending order.
    #[serde(default)]
    pub step_order: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Template to call. `None` makes the step a deliberate no-op.
    #[serde(default)]
    pub api_template_id: Option<String>,
    #[serde(default)]
    pub pre_processing: PreProcessing,
    #[serde(default)]
    pub post_processing: PostProcessing,
    #[serde(default)]
    pub assertions: BTreeMap<String, Assertion>,
    /// Written into the local scope during pre-processing, so later steps
    /// see them too.
    #[serde(default)]
    pub variables: HashMap<String, Value>,
}

impl TestStep {
    /// Name used in events and reports.
    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => format!("step {}", self.step_order),
        }
    }
}

fn default_enabled() -> bool {
    true
}

/// Work done before the main request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PreProcessing {
    /// Written into the local scope.
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    /// Optional auxiliary HTTP call.
    #[serde(default)]
    pub tool: Option<ToolCall>,
}

/// Auxiliary HTTP call made during pre-processing, e.g. to fetch a token.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default)]
    pub api_template_id: Option<String>,
    /// Inline template, used when no id is given.
    #[serde(default)]
    pub request: Option<ApiTemplate>,
    /// Variable name to dotted path in the tool's response body.
    #[serde(default)]
    pub extractors: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PostProcessing {
    /// Variable name to dotted path in the response body.
    #[serde(default)]
    pub extractors: BTreeMap<String, String>,
}

/// The three supported assertion kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Assertion {
    StatusCode { value: Value },
    ResponseContains { value: Value },
    JsonPath { path: String, value: Value },
}

/// A stored API request definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiTemplate {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub method: HttpMethod,
    /// Path relative to the environment base URL, or an absolute URL.
    pub url_path: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub params: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

fn default_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
        }
    }
}

/// Target environment supplied by the caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Environment {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Sent with every request unless the template sets the same header.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Merged into the global scope before the case's own globals.
    #[serde(default)]
    pub variables: HashMap<String, Value>,
}

impl TestCase {
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    /// Enabled steps in execution order. Ties keep authoring order.
    pub fn ordered_steps(&self) -> Vec<&TestStep> {
        let mut steps: Vec<&TestStep> =
            self.steps.iter().filter(|s| s.enabled).collect();
        steps.sort_by_key(|s| s.step_order);
        steps
    }
}

/// Step life-cycle. `Pending -> Running -> terminal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Failure,
    Error,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Success
                | StepStatus::Failure
                | StepStatus::Error
                | StepStatus::Skipped
        )
    }
}

/// Result of running a single step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_order: u32,
    pub name: String,
    pub status: StepStatus,
    pub request: Option<RequestInfo>,
    pub response: Option<ResponseInfo>,
    pub assertions: BTreeMap<String, bool>,
    /// Extracted values; `null` marks a path that was not found.
    pub extracted: BTreeMap<String, Value>,
    pub error: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: u64,
}

impl StepResult {
    pub fn pending(step: &TestStep) -> Self {
        Self {
            step_order: step.step_order,
            name: step.display_name(),
            status: StepStatus::Pending,
            request: None,
            response: None,
            assertions: BTreeMap::new(),
            extracted: BTreeMap::new(),
            error: None,
            start_time: None,
            end_time: None,
            duration_ms: 0,
        }
    }

    /// Move to `Running` and stamp the start time.
    pub fn start(&mut self) {
        self.status = StepStatus::Running;
        self.start_time = Some(Utc::now());
    }

    /// Move to a terminal status and compute the duration.
    ///
    /// A result that is already terminal is left untouched.
    pub fn finish(&mut self, status: StepStatus) {
        debug_assert!(status.is_terminal());
        if self.status.is_terminal() {
            return;
        }
        self.status = status;
        self.end_time = Some(Utc::now());
        self.duration_ms = self.duration();
    }

    /// `end - start` in milliseconds, or 0 when either is unset.
    pub fn duration(&self) -> u64 {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => {
                (end - start).num_milliseconds().max(0) as u64
            }
            _ => 0,
        }
    }
}

/// Request as it was sent, after substitution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestInfo {
    pub method: String,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub params: HashMap<String, String>,
    pub body: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseInfo {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Value,
    pub elapsed_secs: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    Success,
    Failure,
    Error,
    /// Cancelled before every step ran, with nothing failed so far.
    Partial,
}

impl CaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaseStatus::Success => "success",
            CaseStatus::Failure => "failure",
            CaseStatus::Error => "error",
            CaseStatus::Partial => "partial",
        }
    }
}

/// Aggregated result of one case run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseExecutionResult {
    pub case_id: Option<String>,
    pub case_name: String,
    pub overall_status: CaseStatus,
    pub success: bool,
    pub total_steps: usize,
    pub passed: usize,
    pub failed: usize,
    pub errored: usize,
    pub skipped: usize,
    pub cancelled: bool,
    pub duration_ms: u64,
    pub steps: Vec<StepResult>,
    /// Set only when the run itself aborted.
    pub error: Option<String>,
    /// Global and local variables at the end of the run.
    pub variables: BTreeMap<String, Value>,
}

impl CaseExecutionResult {
    /// Tally step results into a case result.
    pub fn from_steps(
        case: &TestCase,
        steps: Vec<StepResult>,
        cancelled: bool,
        duration_ms: u64,
    ) -> Self {
        let count = |status: StepStatus| {
            steps.iter().filter(|s| s.status == status).count()
        };
        let passed = count(StepStatus::Success);
        let failed = count(StepStatus::Failure);
        let errored = count(StepStatus::Error);
        let skipped = count(StepStatus::Skipped);

        let overall_status = if errored > 0 {
            CaseStatus::Error
        } else if failed > 0 {
            CaseStatus::Failure
        } else if cancelled {
            CaseStatus::Partial
        } else {
            CaseStatus::Success
        };

        Self {
            case_id: case.id.clone(),
            case_name: case.name.clone(),
            overall_status,
            success: overall_status == CaseStatus::Success,
            total_steps: steps.len(),
            passed,
            failed,
            errored,
            skipped,
            cancelled,
            duration_ms,
            steps,
            error: None,
            variables: BTreeMap::new(),
        }
    }

    /// Result for a run that died outside any step.
    pub fn aborted(case: &TestCase, error: impl Into<String>) -> Self {
        let mut result = Self::from_steps(case, Vec::new(), false, 0);
        result.overall_status = CaseStatus::Error;
        result.success = false;
        result.error = Some(error.into());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step(order: u32, enabled: bool) -> TestStep {
        TestStep {
            name: Some(format!("s{order}")),
            step_order: order,
            enabled,
            api_template_id: None,
            pre_processing: PreProcessing::default(),
            post_processing: PostProcessing::default(),
            assertions: BTreeMap::new(),
            variables: HashMap::new(),
        }
    }

    fn finished(order: u32, status: StepStatus) -> StepResult {
        let mut result = StepResult::pending(&step(order, true));
        result.start();
        result.finish(status);
        result
    }

    #[test]
    fn test_case_from_yaml_applies_defaults() {
        let yaml = r#"
name: login flow
global_vars:
  user: alice
steps:
  - name: login
    step_order: 1
    api_template_id: login
    post_processing:
      extractors:
        token: data.token
    assertions:
      ok:
        type: status_code
        value: 200
      has_id:
        type: json_path
        path: data.id
        value: 5
  - step_order: 2
"#;
        let case = TestCase::from_yaml(yaml).unwrap();
        assert_eq!(case.steps.len(), 2);
        assert!(case.steps[1].enabled);
        assert_eq!(case.steps[1].display_name(), "step 2");
        assert_eq!(
            case.steps[0].assertions["has_id"],
            Assertion::JsonPath {
                path: "data.id".into(),
                value: json!(5)
            }
        );
        assert_eq!(
            case.steps[0].post_processing.extractors["token"],
            "data.token"
        );
    }

    #[test]
    fn test_ordered_steps_filters_and_sorts() {
        let case = TestCase {
            id: None,
            name: "c".into(),
            description: None,
            global_vars: HashMap::new(),
            steps: vec![step(3, true), step(1, true), step(2, false)],
        };
        let orders: Vec<u32> =
            case.ordered_steps().iter().map(|s| s.step_order).collect();
        assert_eq!(orders, vec![1, 3]);
    }

    #[test]
    fn test_template_defaults() {
        let tpl: ApiTemplate =
            serde_yaml::from_str("id: a\nurl_path: /users\n").unwrap();
        assert_eq!(tpl.method, HttpMethod::Get);
        assert_eq!(tpl.timeout, 30);
    }

    #[test]
    fn test_finish_is_terminal_once() {
        let mut result = finished(1, StepStatus::Success);
        result.finish(StepStatus::Error);
        assert_eq!(result.status, StepStatus::Success);
        assert!(result.end_time.is_some());
    }

    #[test]
    fn test_duration_zero_without_timestamps() {
        let result = StepResult::pending(&step(1, true));
        assert_eq!(result.duration(), 0);
    }

    #[test]
    fn test_aggregation_priority() {
        let case = TestCase {
            id: Some("1".into()),
            name: "c".into(),
            description: None,
            global_vars: HashMap::new(),
            steps: vec![],
        };

        let result = CaseExecutionResult::from_steps(
            &case,
            vec![
                finished(1, StepStatus::Success),
                finished(2, StepStatus::Failure),
                finished(3, StepStatus::Error),
                finished(4, StepStatus::Skipped),
            ],
            false,
            10,
        );
        assert_eq!(result.overall_status, CaseStatus::Error);
        assert_eq!(result.total_steps, 4);
        assert_eq!(
            result.passed + result.failed + result.errored + result.skipped,
            result.total_steps
        );

        let result = CaseExecutionResult::from_steps(
            &case,
            vec![finished(1, StepStatus::Success)],
            true,
            10,
        );
        assert_eq!(result.overall_status, CaseStatus::Partial);
        assert!(!result.success);

        let result = CaseExecutionResult::from_steps(
            &case,
            vec![
                finished(1, StepStatus::Success),
                finished(2, StepStatus::Skipped),
            ],
            false,
            10,
        );
        assert_eq!(result.overall_status, CaseStatus::Success);
        assert_eq!(result.passed, 1);
        assert_eq!(result.skipped, 1);
    }
}
