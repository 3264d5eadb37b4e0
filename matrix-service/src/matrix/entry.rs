// Matrix Entries
// One fully-resolved combination of matrix field values

use crate::error::{ServiceError, ServiceResult};
use crate::value::Value;

use serde::ser::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// An immutable binding of every matrix field to one concrete value.
///
/// Entries are only produced by the expander; clones share storage.
#[derive(Debug, Clone, PartialEq)]
pub struct MatrixEntry {
    fields: Arc<BTreeMap<String, Value>>,
}

impl MatrixEntry {
    pub(crate) fn from_bindings(fields: BTreeMap<String, Value>) -> Self {
        Self {
            fields: Arc::new(fields),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Like `get`, but a missing field is a configuration error
    pub fn require(&self, name: &str) -> ServiceResult<&Value> {
        self.fields
            .get(name)
            .ok_or_else(|| ServiceError::MissingField(name.to_string()))
    }

    pub fn str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    /// Boolean field; absent or non-boolean reads as false
    pub fn flag(&self, name: &str) -> bool {
        self.get(name).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Sub-mapping restricted to `names`; fails if any name is missing
    pub fn project<S: AsRef<str>>(&self, names: &[S]) -> ServiceResult<BTreeMap<String, Value>> {
        names
            .iter()
            .map(|name| {
                let name = name.as_ref();
                self.require(name).map(|v| (name.to_string(), v.clone()))
            })
            .collect()
    }
}

impl fmt::Display for MatrixEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .fields
            .iter()
            .map(|(k, v)| format!("{}={}", k, v.canonical()))
            .collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}

impl Serialize for MatrixEntry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.fields.iter())
    }
}
