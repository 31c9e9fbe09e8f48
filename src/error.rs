//! Error types for bag building, splitting, and job tracking

use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BagError {
    /// Invalid settings detected while constructing a component
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Filesystem failure, wrapped with the operation and path it hit
    #[error("I/O error while trying to {operation} {}: {source}", path.display())]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Unexpected on-disk condition or lock-layer failure
    #[error("State error: {0}")]
    State(String),

    /// One or more itemized validation problems
    #[error("Validation failed ({} problem(s)): {}", .0.len(), .0.join("; "))]
    Validation(Vec<String>),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid bag name: {0}")]
    InvalidName(String),

    /// Downstream failure that may succeed if retried
    #[error("Transient service failure: {0}")]
    TransientService(String),

    /// Downstream failure that retrying will not fix
    #[error("Permanent service failure: {0}")]
    PermanentService(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    TomlConfig(#[from] toml::de::Error),
}

impl BagError {
    pub fn io(operation: &'static str, path: impl AsRef<Path>, source: std::io::Error) -> Self {
        BagError::Io {
            operation,
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Single-item validation failure
    pub fn invalid(problem: impl Into<String>) -> Self {
        BagError::Validation(vec![problem.into()])
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, BagError::TransientService(_))
    }

    /// True for filesystem or lock-layer failures
    pub fn is_state_error(&self) -> bool {
        matches!(self, BagError::Io { .. } | BagError::State(_))
    }

    /// The itemized problems of a validation failure (empty for other kinds)
    pub fn problems(&self) -> &[String] {
        match self {
            BagError::Validation(problems) => problems,
            _ => &[],
        }
    }
}

pub type Result<T> = std::result::Result<T, BagError>;

/// Attach operation/path context to raw I/O results
pub(crate) trait IoContext<T> {
    fn ctx(self, operation: &'static str, path: impl AsRef<Path>) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn ctx(self, operation: &'static str, path: impl AsRef<Path>) -> Result<T> {
        self.map_err(|e| BagError::io(operation, path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_display_lists_every_problem() {
        let err = BagError::Validation(vec!["a is missing".into(), "b mismatched".into()]);
        let text = err.to_string();
        assert!(text.contains("2 problem(s)"));
        assert!(text.contains("a is missing"));
        assert!(text.contains("b mismatched"));
        assert_eq!(err.problems().len(), 2);
    }

    #[test]
    fn test_io_context_carries_path() {
        let res: std::io::Result<()> = Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "gone",
        ));
        let err = res.ctx("read record", "/tmp/x/nerdm.json").unwrap_err();
        assert!(err.is_state_error());
        assert!(err.to_string().contains("/tmp/x/nerdm.json"));
        assert!(err.to_string().contains("read record"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(BagError::TransientService("busy".into()).is_transient());
        assert!(!BagError::PermanentService("rejected".into()).is_transient());
    }
}
