// Matrix Module
// Field specifications, resolved entries, and dependency-ordered expansion

pub mod entry;
pub mod expander;
pub mod field;

// Re-export key types
pub use entry::MatrixEntry;
pub use expander::MatrixExpander;
pub use field::{DeriveFn, Derived, FieldArgs, FieldMap, FieldSpec, MatrixBuilder};
