// Service Errors
// Typed failures raised by the matrix core and its collaborators

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result alias used throughout the service
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Errors that can occur while planning or running a matrix
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("cyclic field dependency: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("field '{field}' reads unknown field '{reference}'")]
    UnresolvedReference { field: String, reference: String },

    #[error("derived field '{field}' failed: {message}")]
    DerivationFailed { field: String, message: String },

    #[error("matrix entry has no field '{0}'")]
    MissingField(String),

    #[error("'{reference}' not found in {repo}")]
    NotFound { repo: String, reference: String },

    #[error("malformed manifest at {}: {message}", .path.display())]
    MalformedManifest { path: PathBuf, message: String },

    #[error("result name '{name}' used twice in group '{group}'")]
    NamingCollision { group: String, name: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("tool not available: {0}")]
    ToolMissing(String),

    #[error("command failed: {command}: {message}")]
    Command { command: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Broad classes of failure, which decide how far an error propagates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Aborts the whole run before any expensive work
    Configuration,
    /// Aborts one snapshot group; other groups proceed
    Resolution,
    /// Recorded against every entry sharing a memo key
    Computation,
    /// A caller bug in discriminator construction
    Naming,
    /// Environment failure (filesystem, serialization)
    Io,
}

impl ServiceError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ServiceError::CyclicDependency { .. }
            | ServiceError::UnresolvedReference { .. }
            | ServiceError::DerivationFailed { .. }
            | ServiceError::MissingField(_)
            | ServiceError::MalformedManifest { .. }
            | ServiceError::Config(_)
            | ServiceError::ToolMissing(_)
            | ServiceError::Yaml(_) => ErrorClass::Configuration,
            ServiceError::NotFound { .. } => ErrorClass::Resolution,
            ServiceError::Command { .. } => ErrorClass::Computation,
            ServiceError::NamingCollision { .. } => ErrorClass::Naming,
            ServiceError::Io(_) | ServiceError::Json(_) => ErrorClass::Io,
        }
    }

    /// Whether this error must abort the entire run
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::Configuration | ErrorClass::Naming | ErrorClass::Io
        )
    }

    pub fn command(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Command {
            command: command.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message() {
        let err = ServiceError::CyclicDependency {
            cycle: vec!["p".to_string(), "q".to_string(), "p".to_string()],
        };
        assert_eq!(err.to_string(), "cyclic field dependency: p -> q -> p");
        assert_eq!(err.class(), ErrorClass::Configuration);
        assert!(err.is_fatal());
    }

    #[test]
    fn test_not_found_is_not_fatal() {
        let err = ServiceError::NotFound {
            repo: "/src/repo".to_string(),
            reference: "1234".to_string(),
        };
        assert_eq!(err.class(), ErrorClass::Resolution);
        assert!(!err.is_fatal());
    }
}
