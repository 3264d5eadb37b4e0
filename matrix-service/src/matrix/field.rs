// Matrix Field Specifications
// Constant, enumerated, and derived fields of a matrix

use crate::value::Value;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Output of a derived field for one combination of its inputs
#[derive(Debug, Clone, PartialEq)]
pub enum Derived {
    /// A single value; does not branch
    One(Value),
    /// Candidate values; branches like an enumeration (empty drops the branch)
    Many(Vec<Value>),
}

impl Derived {
    pub fn into_candidates(self) -> Vec<Value> {
        match self {
            Derived::One(value) => vec![value],
            Derived::Many(values) => values,
        }
    }
}

impl From<Value> for Derived {
    fn from(value: Value) -> Self {
        Derived::One(value)
    }
}

/// Function computing a derived field from its declared reads
pub type DeriveFn = Arc<dyn Fn(&FieldArgs<'_>) -> Result<Derived, String> + Send + Sync>;

/// A named matrix field's specification
#[derive(Clone)]
pub enum FieldSpec {
    Constant(Value),
    Enumeration(Vec<Value>),
    Derived { reads: Vec<String>, derive: DeriveFn },
}

impl FieldSpec {
    pub fn constant(value: impl Into<Value>) -> Self {
        FieldSpec::Constant(value.into())
    }

    pub fn enumeration<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        FieldSpec::Enumeration(values.into_iter().map(Into::into).collect())
    }

    pub fn derived<F>(reads: &[&str], derive: F) -> Self
    where
        F: Fn(&FieldArgs<'_>) -> Result<Derived, String> + Send + Sync + 'static,
    {
        FieldSpec::Derived {
            reads: reads.iter().map(|r| r.to_string()).collect(),
            derive: Arc::new(derive),
        }
    }

    /// Names this field must see resolved before it can be evaluated
    pub fn reads(&self) -> &[String] {
        match self {
            FieldSpec::Derived { reads, .. } => reads,
            FieldSpec::Constant(_) | FieldSpec::Enumeration(_) => &[],
        }
    }
}

impl fmt::Debug for FieldSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldSpec::Constant(value) => f.debug_tuple("Constant").field(value).finish(),
            FieldSpec::Enumeration(values) => f.debug_tuple("Enumeration").field(values).finish(),
            FieldSpec::Derived { reads, .. } => f
                .debug_struct("Derived")
                .field("reads", reads)
                .finish_non_exhaustive(),
        }
    }
}

/// The full set of fields making up a matrix, keyed by field name
pub type FieldMap = BTreeMap<String, FieldSpec>;

/// View of the already-resolved fields a derived function declared it reads.
///
/// Reading a name outside the declaration is an error, so a derived field
/// cannot depend on something the evaluation order does not know about.
pub struct FieldArgs<'a> {
    field: &'a str,
    reads: &'a [String],
    bound: &'a BTreeMap<String, Value>,
}

impl<'a> FieldArgs<'a> {
    pub(crate) fn new(
        field: &'a str,
        reads: &'a [String],
        bound: &'a BTreeMap<String, Value>,
    ) -> Self {
        Self {
            field,
            reads,
            bound,
        }
    }

    /// Name of the field being derived
    pub fn field(&self) -> &str {
        self.field
    }

    pub fn get(&self, name: &str) -> Result<&'a Value, String> {
        if !self.reads.iter().any(|r| r == name) {
            return Err(format!("reads undeclared field '{}'", name));
        }
        self.bound
            .get(name)
            .ok_or_else(|| format!("field '{}' is not resolved", name))
    }

    pub fn str(&self, name: &str) -> Result<&'a str, String> {
        self.get(name)?
            .as_str()
            .ok_or_else(|| format!("field '{}' is not a string", name))
    }

    pub fn bool(&self, name: &str) -> Result<bool, String> {
        self.get(name)?
            .as_bool()
            .ok_or_else(|| format!("field '{}' is not a boolean", name))
    }

    pub fn number(&self, name: &str) -> Result<f64, String> {
        self.get(name)?
            .as_number()
            .ok_or_else(|| format!("field '{}' is not a number", name))
    }
}

/// Builder for assembling a field map programmatically
#[derive(Default)]
pub struct MatrixBuilder {
    fields: FieldMap,
}

impl MatrixBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn constant(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), FieldSpec::constant(value));
        self
    }

    pub fn enumerate<I, V>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.fields
            .insert(name.into(), FieldSpec::enumeration(values));
        self
    }

    pub fn derive<F>(mut self, name: impl Into<String>, reads: &[&str], derive: F) -> Self
    where
        F: Fn(&FieldArgs<'_>) -> Result<Derived, String> + Send + Sync + 'static,
    {
        self.fields
            .insert(name.into(), FieldSpec::derived(reads, derive));
        self
    }

    pub fn field(mut self, name: impl Into<String>, spec: FieldSpec) -> Self {
        self.fields.insert(name.into(), spec);
        self
    }

    pub fn build(self) -> FieldMap {
        self.fields
    }
}
