//! `${name}` substitution over strings and JSON structures.
//!
//! Each pass scans the text once. Token bodies are substituted before
//! the name is resolved, so `${user_${id}}` works in a single pass.
//! Passes repeat until nothing changes, at most
//! [`MAX_SUBSTITUTION_PASSES`] times, which keeps self-referencing
//! definitions finite. Unresolved tokens are left in place.

use crate::variables::VariableContext;
use serde_json::{Map, Value};
use std::collections::HashMap;

pub const MAX_SUBSTITUTION_PASSES: usize = 10;

const OPEN: &str = "${";

/// Substitutes against a variable context plus call-site extras.
///
/// Lookup priority: extras, local, global, system.
pub struct Substituter<'a> {
    vars: &'a VariableContext,
    extra: Option<&'a HashMap<String, Value>>,
}

impl<'a> Substituter<'a> {
    pub fn new(vars: &'a VariableContext) -> Self {
        Self { vars, extra: None }
    }

    pub fn with_extra(mut self, extra: &'a HashMap<String, Value>) -> Self {
        self.extra = Some(extra);
        self
    }

    pub fn resolve(&self, name: &str) -> Option<Value> {
        if let Some(value) = self.extra.and_then(|extra| extra.get(name)) {
            return Some(value.clone());
        }
        self.vars.get(name)
    }

    /// Substitute every token in `text`.
    pub fn text(&self, text: &str) -> String {
        let mut current = text.to_string();
        for _ in 0..MAX_SUBSTITUTION_PASSES {
            if !current.contains(OPEN) {
                break;
            }
            let next = self.single_pass(&current);
            if next == current {
                break;
            }
            current = next;
        }
        current
    }

    /// Substitute inside every string leaf and map key.
    pub fn value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => Value::String(self.text(s)),
            Value::Array(items) => Value::Array(self.list(items)),
            Value::Object(map) => Value::Object(self.map(map)),
            other => other.clone(),
        }
    }

    pub fn map(&self, map: &Map<String, Value>) -> Map<String, Value> {
        map.iter()
            .map(|(k, v)| (self.text(k), self.value(v)))
            .collect()
    }

    pub fn list(&self, items: &[Value]) -> Vec<Value> {
        items.iter().map(|v| self.value(v)).collect()
    }

    /// Substitute keys and values of a string map (headers, params).
    pub fn string_map(
        &self,
        map: &HashMap<String, String>,
    ) -> HashMap<String, String> {
        map.iter()
            .map(|(k, v)| (self.text(k), self.text(v)))
            .collect()
    }

    fn single_pass(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;

        while let Some(start) = rest.find(OPEN) {
            out.push_str(&rest[..start]);
            let after = &rest[start + OPEN.len()..];

            let Some(end) = find_closing(after) else {
                // Unterminated token: keep the remainder verbatim.
                out.push_str(&rest[start..]);
                return out;
            };

            let body = &after[..end];
            let name = if body.contains(OPEN) {
                self.single_pass(body)
            } else {
                body.to_string()
            };

            match self.resolve(name.trim()) {
                Some(value) => out.push_str(&stringify(&value)),
                None => {
                    out.push_str(OPEN);
                    out.push_str(&name);
                    out.push('}');
                }
            }
            rest = &after[end + 1..];
        }

        out.push_str(rest);
        out
    }
}

/// Byte offset of the `}` closing a token whose `${` was just consumed.
fn find_closing(s: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut depth = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'$' if bytes.get(i + 1) == Some(&b'{') => {
                depth += 1;
                i += 2;
                continue;
            }
            b'}' if depth == 0 => return Some(i),
            b'}' => depth -= 1,
            _ => {}
        }
        i += 1;
    }
    None
}

/// Text form of a value: strings raw, null empty, the rest as JSON.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

impl VariableContext {
    pub fn substitute(
        &self,
        text: &str,
        extra: &HashMap<String, Value>,
    ) -> String {
        Substituter::new(self).with_extra(extra).text(text)
    }

    pub fn substitute_in_map(
        &self,
        map: &Map<String, Value>,
        extra: &HashMap<String, Value>,
    ) -> Map<String, Value> {
        Substituter::new(self).with_extra(extra).map(map)
    }

    pub fn substitute_in_list(
        &self,
        items: &[Value],
        extra: &HashMap<String, Value>,
    ) -> Vec<Value> {
        Substituter::new(self).with_extra(extra).list(items)
    }

    pub fn substitute_value(
        &self,
        value: &Value,
        extra: &HashMap<String, Value>,
    ) -> Value {
        Substituter::new(self).with_extra(extra).value(value)
    }
}
