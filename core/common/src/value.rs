//! Typed field values and field patches.
//!
//! Field values are a closed tagged union so that every merge is fully
//! specified: scalars replace, lists replace whole, sets are edited with
//! explicit add/remove operations.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::{Error, Result};

/// A typed field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    /// Ordered sequence; always replaced as a whole.
    List(Vec<Value>),
    /// Unordered set of strings; edited element-wise.
    Set(BTreeSet<String>),
}

impl Value {
    /// Build a set value from anything yielding strings.
    pub fn set<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Value::Set(items.into_iter().map(Into::into).collect())
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_set(&self) -> Option<&BTreeSet<String>> {
        match self {
            Value::Set(v) => Some(v),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

impl TryFrom<serde_json::Value> for Value {
    type Error = Error;

    fn try_from(json: serde_json::Value) -> Result<Self> {
        match json {
            serde_json::Value::Null => Ok(Value::Null),
            serde_json::Value::Bool(b) => Ok(Value::Bool(b)),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Ok(Value::Int(i)),
                None => n.as_f64().map(Value::Float).ok_or_else(|| {
                    Error::InvalidInput(format!("Unsupported number: {}", n))
                }),
            },
            serde_json::Value::String(s) => Ok(Value::Text(s)),
            serde_json::Value::Array(items) => items
                .into_iter()
                .map(Value::try_from)
                .collect::<Result<Vec<_>>>()
                .map(Value::List),
            serde_json::Value::Object(_) => Err(Error::InvalidInput(
                "Nested objects are not supported as field values".to_string(),
            )),
        }
    }
}

/// One operation on one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FieldOp {
    /// Replace the field value.
    Set { value: Value },
    /// Remove the field.
    Remove,
    /// Add and remove elements of a set field.
    SetEdit {
        #[serde(default)]
        add: BTreeSet<String>,
        #[serde(default)]
        remove: BTreeSet<String>,
    },
}

impl FieldOp {
    /// Whether this op edits a set element-wise instead of replacing it.
    pub fn is_set_edit(&self) -> bool {
        matches!(self, FieldOp::SetEdit { .. })
    }

    /// Apply this op to the current value of a field.
    ///
    /// Returns the new value, or `None` if the field should be removed.
    /// A set edit on a missing or non-set field starts from the empty set.
    pub fn apply(&self, current: Option<&Value>) -> Option<Value> {
        match self {
            FieldOp::Set { value } => Some(value.clone()),
            FieldOp::Remove => None,
            FieldOp::SetEdit { add, remove } => {
                let mut set = current
                    .and_then(Value::as_set)
                    .cloned()
                    .unwrap_or_default();
                set.extend(add.iter().cloned());
                set.retain(|item| !remove.contains(item));
                Some(Value::Set(set))
            }
        }
    }

    /// Compose `self` followed by `later` into a single op.
    pub fn then(&self, later: &FieldOp) -> FieldOp {
        match (self, later) {
            (
                FieldOp::SetEdit { add: a1, remove: r1 },
                FieldOp::SetEdit { add: a2, remove: r2 },
            ) => {
                let add = a1
                    .difference(r2)
                    .cloned()
                    .chain(a2.iter().cloned())
                    .collect();
                let remove = r1
                    .difference(a2)
                    .cloned()
                    .chain(r2.iter().cloned())
                    .collect();
                FieldOp::SetEdit { add, remove }
            }
            (earlier, edit @ FieldOp::SetEdit { .. }) => {
                let base = earlier.apply(None);
                match edit.apply(base.as_ref()) {
                    Some(value) => FieldOp::Set { value },
                    None => FieldOp::Remove,
                }
            }
            (_, replace) => replace.clone(),
        }
    }
}

/// A set of field operations keyed by field name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldPatch(BTreeMap<String, FieldOp>);

impl FieldPatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a field to a value.
    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(
            field.into(),
            FieldOp::Set {
                value: value.into(),
            },
        );
        self
    }

    /// Remove a field.
    pub fn remove(mut self, field: impl Into<String>) -> Self {
        self.0.insert(field.into(), FieldOp::Remove);
        self
    }

    /// Add elements to a set field.
    pub fn add_to_set<I, S>(self, field: impl Into<String>, items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.with_op(
            field,
            FieldOp::SetEdit {
                add: items.into_iter().map(Into::into).collect(),
                remove: BTreeSet::new(),
            },
        )
    }

    /// Remove elements from a set field.
    pub fn remove_from_set<I, S>(self, field: impl Into<String>, items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.with_op(
            field,
            FieldOp::SetEdit {
                add: BTreeSet::new(),
                remove: items.into_iter().map(Into::into).collect(),
            },
        )
    }

    /// Add an op, composing with any op already present for the field.
    pub fn with_op(mut self, field: impl Into<String>, op: FieldOp) -> Self {
        self.push(field.into(), op);
        self
    }

    fn push(&mut self, field: String, op: FieldOp) {
        let composed = match self.0.get(&field) {
            Some(existing) => existing.then(&op),
            None => op,
        };
        self.0.insert(field, composed);
    }

    /// Compose this patch followed by `later`.
    pub fn then(&self, later: &FieldPatch) -> FieldPatch {
        let mut out = self.clone();
        for (field, op) in later.iter() {
            out.push(field.clone(), op.clone());
        }
        out
    }

    pub fn get(&self, field: &str) -> Option<&FieldOp> {
        self.0.get(field)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldOp)> {
        self.0.iter()
    }

    pub fn fields(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, FieldOp)> for FieldPatch {
    fn from_iter<T: IntoIterator<Item = (String, FieldOp)>>(iter: T) -> Self {
        let mut patch = FieldPatch::new();
        for (field, op) in iter {
            patch.push(field, op);
        }
        patch
    }
}
