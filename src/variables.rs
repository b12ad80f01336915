//! Scoped variable storage.
//!
//! Three scopes are searched in priority order: local, global, system.
//! System entries may be computed, in which case they are evaluated on
//! every lookup.

use chrono::{DateTime, Local, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, LazyLock};
use tracing::trace;

/// Maximum number of retained history entries.
pub const HISTORY_LIMIT: usize = 100;

/// Producer for a computed system value.
pub type ComputeFn = Arc<dyn Fn() -> Value + Send + Sync>;

/// A system scope entry.
#[derive(Clone)]
pub enum SystemValue {
    Static(Value),
    Computed(ComputeFn),
}

impl SystemValue {
    pub fn computed<F>(f: F) -> Self
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        SystemValue::Computed(Arc::new(f))
    }

    pub fn evaluate(&self) -> Value {
        match self {
            SystemValue::Static(v) => v.clone(),
            SystemValue::Computed(f) => f(),
        }
    }
}

impl std::fmt::Debug for SystemValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SystemValue::Static(v) => write!(f, "Static({v:?})"),
            SystemValue::Computed(_) => write!(f, "Computed(<fn>)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    System,
    Global,
    Local,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryAction {
    Set,
    Clear,
    Register,
}

/// One recorded mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub at: DateTime<Utc>,
    pub scope: Scope,
    pub action: HistoryAction,
    pub names: Vec<String>,
}

/// Plain copy of the user-visible scopes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VariableSnapshot {
    pub global: BTreeMap<String, Value>,
    pub local: BTreeMap<String, Value>,
}

impl VariableSnapshot {
    /// Global and local merged, local winning.
    pub fn merged(&self) -> BTreeMap<String, Value> {
        let mut out = self.global.clone();
        out.extend(self.local.clone());
        out
    }
}

/// Variable context owned by a single case run.
#[derive(Debug, Clone, Default)]
pub struct VariableContext {
    system: HashMap<String, SystemValue>,
    global: HashMap<String, Value>,
    local: HashMap<String, Value>,
    history: VecDeque<HistoryEntry>,
}

impl VariableContext {
    /// Context with the builtin system variables registered.
    pub fn new() -> Self {
        let mut ctx = Self::empty();
        for (name, value) in builtin_system_variables() {
            ctx.register_system(name, value);
        }
        ctx
    }

    /// Context with no variables at all.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn register_system(
        &mut self,
        name: impl Into<String>,
        value: SystemValue,
    ) {
        let name = strip_wrapping(&name.into()).to_string();
        self.record(Scope::System, HistoryAction::Register, vec![name.clone()]);
        self.system.insert(name, value);
    }

    /// Merge `vars` into the global scope.
    pub fn set_global(&mut self, vars: HashMap<String, Value>) {
        self.record(Scope::Global, HistoryAction::Set, sorted_keys(&vars));
        self.global.extend(vars);
    }

    /// Merge `vars` into the local scope.
    pub fn set_local(&mut self, vars: HashMap<String, Value>) {
        self.record(Scope::Local, HistoryAction::Set, sorted_keys(&vars));
        self.local.extend(vars);
    }

    pub fn set_global_var(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        self.record(Scope::Global, HistoryAction::Set, vec![name.clone()]);
        self.global.insert(name, value);
    }

    pub fn set_local_var(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        self.record(Scope::Local, HistoryAction::Set, vec![name.clone()]);
        self.local.insert(name, value);
    }

    /// Look a variable up by name, with or without `${}` around it.
    pub fn get(&self, name: &str) -> Option<Value> {
        let name = strip_wrapping(name);
        if let Some(value) = self.local.get(name) {
            return Some(value.clone());
        }
        if let Some(value) = self.global.get(name) {
            return Some(value.clone());
        }
        self.system.get(name).map(SystemValue::evaluate)
    }

    /// Which scope currently answers for `name`.
    pub fn scope_of(&self, name: &str) -> Option<Scope> {
        let name = strip_wrapping(name);
        if self.local.contains_key(name) {
            Some(Scope::Local)
        } else if self.global.contains_key(name) {
            Some(Scope::Global)
        } else if self.system.contains_key(name) {
            Some(Scope::System)
        } else {
            None
        }
    }

    pub fn clear_local(&mut self) {
        self.record(Scope::Local, HistoryAction::Clear, Vec::new());
        self.local.clear();
    }

    pub fn clear_global(&mut self) {
        self.record(Scope::Global, HistoryAction::Clear, Vec::new());
        self.global.clear();
    }

    /// Every variable in one map.
    ///
    /// System entries are evaluated and keyed as `${__name}`; global and
    /// local entries use their bare names, local overriding global.
    pub fn all_variables(&self) -> Map<String, Value> {
        let mut out = Map::new();
        for (name, value) in &self.system {
            out.insert(format!("${{{name}}}"), value.evaluate());
        }
        for (name, value) in &self.global {
            out.insert(name.clone(), value.clone());
        }
        for (name, value) in &self.local {
            out.insert(name.clone(), value.clone());
        }
        out
    }

    pub fn snapshot(&self) -> VariableSnapshot {
        VariableSnapshot {
            global: self
                .global
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            local: self
                .local
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    /// Mutation log, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.history.iter()
    }

    fn record(
        &mut self,
        scope: Scope,
        action: HistoryAction,
        names: Vec<String>,
    ) {
        trace!(?scope, ?action, ?names, "variable mutation");
        if self.history.len() == HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(HistoryEntry {
            at: Utc::now(),
            scope,
            action,
            names,
        });
    }
}

/// Strip a surrounding `${...}` and whitespace from a variable name.
pub fn strip_wrapping(name: &str) -> &str {
    static WRAPPED_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"^\$\{\s*(.*?)\s*\}$")
            .expect("failed to compile wrapped name regex")
    });

    let trimmed = name.trim();
    match WRAPPED_RE.captures(trimmed).and_then(|c| c.get(1)) {
        Some(inner) => inner.as_str(),
        None => trimmed,
    }
}

fn sorted_keys(vars: &HashMap<String, Value>) -> Vec<String> {
    let mut keys: Vec<String> = vars.keys().cloned().collect();
    keys.sort();
    keys
}

fn builtin_system_variables() -> Vec<(&'static str, SystemValue)> {
    vec![
        (
            "__timestamp",
            SystemValue::computed(|| Value::from(Utc::now().timestamp())),
        ),
        (
            "__timestamp_ms",
            SystemValue::computed(|| {
                Value::from(Utc::now().timestamp_millis())
            }),
        ),
        (
            "__datetime",
            SystemValue::computed(|| {
                Value::from(
                    Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
                )
            }),
        ),
        (
            "__date",
            SystemValue::computed(|| {
                Value::from(Local::now().format("%Y-%m-%d").to_string())
            }),
        ),
        (
            "__uuid",
            SystemValue::computed(|| {
                Value::from(uuid::Uuid::new_v4().to_string())
            }),
        ),
        (
            "__random_int",
            SystemValue::computed(|| Value::from(fastrand::u32(0..=999_999))),
        ),
        (
            "__random_string",
            SystemValue::computed(|| {
                let s: String =
                    std::iter::repeat_with(fastrand::alphanumeric)
                        .take(8)
                        .collect();
                Value::from(s)
            }),
        ),
    ]
}
