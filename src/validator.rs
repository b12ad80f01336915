//! Dotted-path extraction and assertion evaluation.

use crate::executor::HttpResponse;
use crate::model::Assertion;
use crate::template::stringify;
use serde_json::Value;

/// Walk `json` along a dotted path of object keys.
///
/// Only object keys are supported; array indices and wildcards are not.
/// Any missing segment yields `None`.
pub fn extract<'a>(json: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return None;
    }
    let mut current = json;
    for part in path.split('.') {
        match current {
            Value::Object(map) => current = map.get(part)?,
            _ => return None,
        }
    }
    Some(current)
}

/// Outcome of one assertion.
#[derive(Debug, Clone, PartialEq)]
pub struct AssertionOutcome {
    pub passed: bool,
    /// Human readable mismatch description, set when `passed` is false.
    pub message: Option<String>,
}

impl AssertionOutcome {
    fn pass() -> Self {
        Self {
            passed: true,
            message: None,
        }
    }

    fn fail(message: String) -> Self {
        Self {
            passed: false,
            message: Some(message),
        }
    }
}

/// Evaluate one assertion against a response. `assertion` values are
/// expected to be substituted already.
pub fn evaluate(
    assertion: &Assertion,
    response: &HttpResponse,
) -> AssertionOutcome {
    match assertion {
        Assertion::StatusCode { value } => match status_of(value) {
            Some(expected) if expected == response.status => {
                AssertionOutcome::pass()
            }
            Some(expected) => AssertionOutcome::fail(format!(
                "status code mismatch: expected {expected}, actual {}",
                response.status
            )),
            None => AssertionOutcome::fail(format!(
                "status code assertion has a non-numeric value: {value}"
            )),
        },
        Assertion::ResponseContains { value } => {
            let needle = stringify(value);
            if response_text(response).contains(&needle) {
                AssertionOutcome::pass()
            } else {
                AssertionOutcome::fail(format!(
                    "response body does not contain '{needle}'"
                ))
            }
        }
        Assertion::JsonPath { path, value } => {
            match extract(&response.body, path) {
                Some(actual) if values_match(actual, value) => {
                    AssertionOutcome::pass()
                }
                Some(actual) => AssertionOutcome::fail(format!(
                    "json path '{path}' mismatch: expected {value}, \
                     actual {actual}"
                )),
                None => AssertionOutcome::fail(format!(
                    "json path '{path}' not found in response"
                )),
            }
        }
    }
}

fn status_of(value: &Value) -> Option<u16> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn response_text(response: &HttpResponse) -> String {
    if response.raw_body.is_empty() {
        stringify(&response.body)
    } else {
        response.raw_body.clone()
    }
}

/// Exact JSON equality, or textual equality when the expected value is a
/// string (substituted expectations always come out as strings).
fn values_match(actual: &Value, expected: &Value) -> bool {
    if actual == expected {
        return true;
    }
    match expected {
        Value::String(s) => !actual.is_string() && stringify(actual) == *s,
        _ => false,
    }
}
