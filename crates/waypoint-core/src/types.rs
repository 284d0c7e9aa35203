//! World state model.
//!
//! A [`WorldState`] is an immutable snapshot of named condition values. Goals
//! are expressed with the same type: a goal is satisfied when every one of its
//! conditions holds in the state.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

// =============================================================================
// Condition values
// =============================================================================

/// The value of a single world condition.
///
/// Serialized untagged so that TOML and JSON literals map directly onto
/// variants (`true`, `3`, `"ready"`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl Value {
    /// Type-tagged rendering used by [`WorldState::canonical_key`].
    ///
    /// `Text("true")` and `Bool(true)` must not collide.
    fn canonical(&self) -> String {
        match self {
            Value::Bool(b) => format!("b:{}", b),
            Value::Number(n) => format!("n:{}", n),
            Value::Text(s) => format!("s:{}", escape_key_part(s)),
        }
    }
}

/// Backslash-escape the separators of [`WorldState::canonical_key`].
fn escape_key_part(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '\\' | '=' | ';') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", n),
            Value::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(f64::from(n))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

// =============================================================================
// WorldState
// =============================================================================

/// Immutable mapping of condition name to value.
///
/// Every transition produces a new state; nothing mutates a state in place,
/// so search can hold many states at once and backtrack freely.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorldState {
    conditions: BTreeMap<String, Value>,
}

impl WorldState {
    /// Create an empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a copy of this state with `key` set to `value`.
    pub fn with(&self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut conditions = self.conditions.clone();
        conditions.insert(key.into(), value.into());
        Self { conditions }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.conditions.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.conditions.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.conditions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Iterate conditions in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.conditions.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.conditions.keys()
    }

    /// True iff every condition of `goal` holds with an equal value here.
    ///
    /// Keys present in the state but absent from the goal are ignored.
    pub fn satisfies(&self, goal: &WorldState) -> bool {
        goal.iter()
            .all(|(key, value)| self.conditions.get(key) == Some(value))
    }

    /// Number of goal conditions not yet satisfied by this state.
    pub fn unmet(&self, goal: &WorldState) -> usize {
        goal.iter()
            .filter(|(key, value)| self.conditions.get(*key) != Some(*value))
            .count()
    }

    /// Overlay `other` on top of this state. Values from `other` win.
    pub fn merge(&self, other: &WorldState) -> WorldState {
        let mut conditions = self.conditions.clone();
        for (key, value) in other.iter() {
            conditions.insert(key.clone(), value.clone());
        }
        Self { conditions }
    }

    /// Deterministic serialization used to deduplicate states during search.
    pub fn canonical_key(&self) -> String {
        self.conditions
            .iter()
            .map(|(k, v)| format!("{}={}", escape_key_part(k), v.canonical()))
            .collect::<Vec<_>>()
            .join(";")
    }
}

impl fmt::Display for WorldState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (key, value)) in self.conditions.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", key, value)?;
        }
        write!(f, "}}")
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for WorldState {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            conditions: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl<K: Into<String>, V: Into<Value>, const N: usize> From<[(K, V); N]> for WorldState {
    fn from(pairs: [(K, V); N]) -> Self {
        pairs.into_iter().collect()
    }
}
