//! Interfaces to the parts of the engine that live outside the job subsystem, with
//! in-memory implementations used by the node and by tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::RwLock;

use serde_json::{Map, Value};

/// Variable storage, addressed by scope key. Documents are opaque bytes to the job layer.
pub trait VariableStore: Send + Sync {
    /// Full variable document of a scope.
    fn document(&self, scope_key: i64) -> Vec<u8>;

    /// Document restricted to `names`; unknown names are skipped.
    fn document_with(&self, scope_key: i64, names: &[String]) -> Vec<u8>;

    /// Merge `document` into the scope (used when a job completes with variables).
    fn merge_document(&self, scope_key: i64, document: &[u8]);
}

/// A catch point found for a thrown error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatchEvent {
    /// Element instance whose scope holds the catch event.
    pub scope_key: i64,
    pub catch_event_id: String,
}

/// The slice of the process model needed to resolve thrown errors.
pub trait ProcessModel: Send + Sync {
    fn is_element_active(&self, element_instance_key: i64) -> bool;

    /// Walk the scope hierarchy upward from `element_instance_key` looking for a catch
    /// event matching `error_code`.
    fn find_catch_event(&self, element_instance_key: i64, error_code: &str) -> Option<CatchEvent>;
}

/// JSON-object documents per scope.
#[derive(Debug, Default)]
pub struct InMemoryVariables {
    scopes: RwLock<HashMap<i64, BTreeMap<String, Value>>>,
}

impl InMemoryVariables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, scope_key: i64, name: impl Into<String>, value: Value) {
        if let Ok(mut scopes) = self.scopes.write() {
            scopes.entry(scope_key).or_default().insert(name.into(), value);
        }
    }

    pub fn get(&self, scope_key: i64, name: &str) -> Option<Value> {
        self.scopes
            .read()
            .ok()
            .and_then(|scopes| scopes.get(&scope_key).and_then(|vars| vars.get(name).cloned()))
    }

    fn encode<'a>(vars: impl Iterator<Item = (&'a String, &'a Value)>) -> Vec<u8> {
        let object: Map<String, Value> = vars.map(|(k, v)| (k.clone(), v.clone())).collect();
        serde_json::to_vec(&Value::Object(object)).unwrap_or_default()
    }
}

impl VariableStore for InMemoryVariables {
    fn document(&self, scope_key: i64) -> Vec<u8> {
        let Ok(scopes) = self.scopes.read() else {
            return Vec::new();
        };
        match scopes.get(&scope_key) {
            Some(vars) => Self::encode(vars.iter()),
            None => Self::encode(std::iter::empty()),
        }
    }

    fn document_with(&self, scope_key: i64, names: &[String]) -> Vec<u8> {
        let Ok(scopes) = self.scopes.read() else {
            return Vec::new();
        };
        match scopes.get(&scope_key) {
            Some(vars) => Self::encode(vars.iter().filter(|(name, _)| names.contains(name))),
            None => Self::encode(std::iter::empty()),
        }
    }

    fn merge_document(&self, scope_key: i64, document: &[u8]) {
        let Ok(Value::Object(object)) = serde_json::from_slice::<Value>(document) else {
            tracing::warn!(scope_key, "Ignoring variable document that is not a JSON object");
            return;
        };
        if let Ok(mut scopes) = self.scopes.write() {
            scopes.entry(scope_key).or_default().extend(object);
        }
    }
}

#[derive(Debug, Default)]
struct ModelState {
    parents: HashMap<i64, i64>,
    terminated: HashSet<i64>,
    /// (scope, error code) -> catch event id; an empty code catches every error.
    catch_events: HashMap<(i64, String), String>,
}

/// Element instance tree with error catch events attached to scopes.
///
/// Element instances the model has never been told about are treated as active roots,
/// which lets standalone jobs (created without a process) use the full command surface.
#[derive(Debug, Default)]
pub struct InMemoryProcessModel {
    state: RwLock<ModelState>,
}

impl InMemoryProcessModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_element(&self, element_instance_key: i64, parent: Option<i64>) {
        if let Ok(mut state) = self.state.write() {
            if let Some(parent) = parent {
                state.parents.insert(element_instance_key, parent);
            }
            state.terminated.remove(&element_instance_key);
        }
    }

    pub fn terminate_element(&self, element_instance_key: i64) {
        if let Ok(mut state) = self.state.write() {
            state.terminated.insert(element_instance_key);
        }
    }

    pub fn add_catch_event(&self, scope_key: i64, error_code: &str, catch_event_id: &str) {
        if let Ok(mut state) = self.state.write() {
            state
                .catch_events
                .insert((scope_key, error_code.to_string()), catch_event_id.to_string());
        }
    }
}

impl ProcessModel for InMemoryProcessModel {
    fn is_element_active(&self, element_instance_key: i64) -> bool {
        self.state
            .read()
            .map(|state| !state.terminated.contains(&element_instance_key))
            .unwrap_or(false)
    }

    fn find_catch_event(&self, element_instance_key: i64, error_code: &str) -> Option<CatchEvent> {
        let state = self.state.read().ok()?;
        let mut scope = Some(element_instance_key);
        let mut visited = HashSet::new();

        while let Some(scope_key) = scope {
            if !visited.insert(scope_key) {
                break;
            }
            let matched = state
                .catch_events
                .get(&(scope_key, error_code.to_string()))
                .or_else(|| state.catch_events.get(&(scope_key, String::new())));
            if let Some(catch_event_id) = matched {
                return Some(CatchEvent {
                    scope_key,
                    catch_event_id: catch_event_id.clone(),
                });
            }
            scope = state.parents.get(&scope_key).copied();
        }
        None
    }
}
