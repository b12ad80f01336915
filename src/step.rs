//! Life-cycle of a single step: pre-processing, request, extraction,
//! assertions.

use crate::error::StepError;
use crate::events::{self, EventSink, LogLevel};
use crate::executor::{
    join_url, HttpResponse, RequestExecutor, ResolvedRequest,
};
use crate::model::{
    ApiTemplate, Assertion, Environment, StepResult, StepStatus, TestStep,
    ToolCall,
};
use crate::store::TemplateStore;
use crate::template::Substituter;
use crate::validator;
use crate::variables::VariableContext;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Runs steps against shared collaborators. Holds no per-run state.
pub struct StepProcessor<'a> {
    executor: &'a dyn RequestExecutor,
    templates: &'a dyn TemplateStore,
    environment: &'a Environment,
    sink: &'a dyn EventSink,
}

impl<'a> StepProcessor<'a> {
    pub fn new(
        executor: &'a dyn RequestExecutor,
        templates: &'a dyn TemplateStore,
        environment: &'a Environment,
        sink: &'a dyn EventSink,
    ) -> Self {
        Self {
            executor,
            templates,
            environment,
            sink,
        }
    }

    /// Run one step. Always returns a terminal result.
    pub async fn process(
        &self,
        step: &TestStep,
        vars: &mut VariableContext,
    ) -> StepResult {
        let mut result = StepResult::pending(step);
        result.start();

        let status = match self.run_stages(step, vars, &mut result).await {
            Ok(status) => status,
            Err(err) => {
                let message = err.to_string();
                self.log(
                    LogLevel::Error,
                    format!("Step '{}' errored: {}", result.name, message),
                )
                .await;
                result.error = Some(message);
                StepStatus::Error
            }
        };

        result.finish(status);
        result
    }

    async fn run_stages(
        &self,
        step: &TestStep,
        vars: &mut VariableContext,
        result: &mut StepResult,
    ) -> Result<StepStatus, StepError> {
        self.pre_process(step, vars).await;

        let Some(template_id) = step.api_template_id.as_deref() else {
            self.log(
                LogLevel::Info,
                format!("Step '{}' has no API template, skipping", result.name),
            )
            .await;
            return Ok(StepStatus::Skipped);
        };

        let template =
            self.load_template(template_id).await?.ok_or_else(|| {
                StepError::Configuration(format!(
                    "API template '{template_id}' not found"
                ))
            })?;

        let request = self.resolve_request(&template, vars, &step.variables)?;
        result.request = Some(request.info());
        debug!("Step '{}' resolved request: {:?}", result.name, request);

        let response = self.executor.execute(&request).await?;
        result.response = Some(response.info());
        self.log(
            LogLevel::Info,
            format!(
                "Step '{}' got status {} in {:.3}s",
                result.name, response.status, response.elapsed_secs
            ),
        )
        .await;

        result.extracted = self
            .extract_into(&step.post_processing.extractors, &response, vars)
            .await;

        let failures = self.check_assertions(step, &response, vars, result);
        if failures.is_empty() {
            Ok(StepStatus::Success)
        } else {
            let message = format!("assertions failed: {}", failures.join("; "));
            self.log(
                LogLevel::Warning,
                format!("Step '{}' {}", result.name, message),
            )
            .await;
            result.error = Some(message);
            Ok(StepStatus::Failure)
        }
    }

    /// `pre_processing.variables` go into local scope first, then the
    /// step's own `variables`, which win on a clash.
    async fn pre_process(&self, step: &TestStep, vars: &mut VariableContext) {
        let pre = &step.pre_processing;
        for overrides in [&pre.variables, &step.variables] {
            if overrides.is_empty() {
                continue;
            }
            let resolved: HashMap<String, Value> = {
                let sub = Substituter::new(vars).with_extra(&step.variables);
                overrides
                    .iter()
                    .map(|(k, v)| (k.clone(), sub.value(v)))
                    .collect()
            };
            vars.set_local(resolved);
        }

        if let Some(tool) = &pre.tool {
            self.run_tool(tool, step, vars).await;
        }
    }

    /// Auxiliary call. Every failure here is logged and swallowed.
    async fn run_tool(
        &self,
        tool: &ToolCall,
        step: &TestStep,
        vars: &mut VariableContext,
    ) {
        let template = match (&tool.request, tool.api_template_id.as_deref()) {
            (Some(inline), _) => Some(inline.clone()),
            (None, Some(id)) => match self.load_template(id).await {
                Ok(Some(template)) => Some(template),
                Ok(None) => {
                    self.log(
                        LogLevel::Warning,
                        format!("Tool template '{id}' not found"),
                    )
                    .await;
                    None
                }
                Err(err) => {
                    self.log(
                        LogLevel::Warning,
                        format!("Tool template lookup failed: {err}"),
                    )
                    .await;
                    None
                }
            },
            (None, None) => {
                self.log(
                    LogLevel::Warning,
                    "Tool configured without a template".to_string(),
                )
                .await;
                None
            }
        };
        let Some(template) = template else {
            return;
        };

        let request =
            match self.resolve_request(&template, vars, &step.variables) {
                Ok(request) => request,
                Err(err) => {
                    self.log(
                        LogLevel::Warning,
                        format!("Tool request invalid: {err}"),
                    )
                    .await;
                    return;
                }
            };

        match self.executor.execute(&request).await {
            Ok(response) => {
                self.log(
                    LogLevel::Info,
                    format!(
                        "Tool call {} returned {}",
                        request.url, response.status
                    ),
                )
                .await;
                self.extract_into(&tool.extractors, &response, vars).await;
            }
            Err(err) => {
                self.log(LogLevel::Warning, format!("Tool call failed: {err}"))
                    .await;
            }
        }
    }

    async fn load_template(
        &self,
        id: &str,
    ) -> Result<Option<ApiTemplate>, StepError> {
        self.templates
            .get_template(id)
            .await
            .map_err(|e| StepError::Store(format!("{e:#}")))
    }

    /// Substitute every part of `template` and join it onto the base URL.
    fn resolve_request(
        &self,
        template: &ApiTemplate,
        vars: &VariableContext,
        extra: &HashMap<String, Value>,
    ) -> Result<ResolvedRequest, StepError> {
        let sub = Substituter::new(vars).with_extra(extra);

        let path = sub.text(&template.url_path);
        let base_url =
            self.environment.base_url.as_deref().map(|b| sub.text(b));
        let url = join_url(base_url.as_deref(), &path);
        if url.trim().is_empty() {
            return Err(StepError::Configuration(format!(
                "API template '{}' resolves to an empty URL",
                template.id
            )));
        }

        let mut headers = sub.string_map(&template.headers);
        for (key, value) in &self.environment.headers {
            let present = headers.keys().any(|k| k.eq_ignore_ascii_case(key));
            if !present {
                headers.insert(sub.text(key), sub.text(value));
            }
        }

        Ok(ResolvedRequest {
            method: template.method,
            url,
            headers,
            params: sub.string_map(&template.params),
            body: template.body.as_ref().map(|b| sub.value(b)),
            timeout_secs: template.timeout,
        })
    }

    /// Run extractors against the response body, storing hits in local
    /// scope. Misses come back as `null` and leave the scope untouched.
    async fn extract_into(
        &self,
        extractors: &BTreeMap<String, String>,
        response: &HttpResponse,
        vars: &mut VariableContext,
    ) -> BTreeMap<String, Value> {
        let mut extracted = BTreeMap::new();
        for (var_name, path) in extractors {
            match validator::extract(&response.body, path) {
                Some(value) => {
                    debug!("Extracted '{}' = {:?}", var_name, value);
                    vars.set_local_var(var_name.clone(), value.clone());
                    extracted.insert(var_name.clone(), value.clone());
                }
                None => {
                    self.log(
                        LogLevel::Warning,
                        format!(
                            "Extraction of '{var_name}' failed: \
                             path '{path}' not found"
                        ),
                    )
                    .await;
                    extracted.insert(var_name.clone(), Value::Null);
                }
            }
        }
        extracted
    }

    /// Evaluate every assertion, recording each outcome. Returns the
    /// messages of the ones that failed.
    fn check_assertions(
        &self,
        step: &TestStep,
        response: &HttpResponse,
        vars: &VariableContext,
        result: &mut StepResult,
    ) -> Vec<String> {
        let sub = Substituter::new(vars).with_extra(&step.variables);
        let mut failures = Vec::new();

        for (name, assertion) in &step.assertions {
            let resolved = substitute_assertion(&sub, assertion);
            let outcome = validator::evaluate(&resolved, response);
            result.assertions.insert(name.clone(), outcome.passed);
            if let Some(message) = outcome.message {
                failures.push(format!("{name}: {message}"));
            }
        }
        failures
    }

    async fn log(&self, level: LogLevel, message: String) {
        events::log(self.sink, level, message).await;
    }
}

fn substitute_assertion(
    sub: &Substituter<'_>,
    assertion: &Assertion,
) -> Assertion {
    match assertion {
        Assertion::StatusCode { value } => Assertion::StatusCode {
            value: sub.value(value),
        },
        Assertion::ResponseContains { value } => Assertion::ResponseContains {
            value: sub.value(value),
        },
        Assertion::JsonPath { path, value } => Assertion::JsonPath {
            path: sub.text(path),
            value: sub.value(value),
        },
    }
}
