//! Error taxonomy for pipeline planning.

use std::path::PathBuf;

use thiserror::Error;

/// Errors produced while constructing, resolving or assembling a plan.
#[derive(Debug, Error)]
pub enum PlanError {
    /// The build graph contains a dependency cycle. Planning aborts.
    #[error("dependency cycle detected between build units: {}", units.join(" -> "))]
    DependencyCycle { units: Vec<String> },

    /// Two renders produced the same build unit key.
    #[error("duplicate build unit {key}: rendered by both {first} and {second}")]
    DuplicateKey {
        key: String,
        first: String,
        second: String,
    },

    /// An upload target is malformed or cannot produce tasks.
    #[error("upload target '{target}' is invalid: {reason}")]
    UploadConfig { target: String, reason: String },

    /// The recipe renderer failed for one (recipe, matrix row) pair.
    #[error("failed to render recipe {recipe} against matrix row {row}: {reason}")]
    Render {
        recipe: String,
        row: String,
        reason: String,
    },

    /// A traversal bound below `-1`; only `-1` means unbounded.
    #[error("invalid {field} bound {value}: expected -1 or a non-negative count")]
    InvalidBound { field: &'static str, value: i64 },

    /// A rendered task reads a directory that no earlier step of its job
    /// provides.
    #[error("job {job}: task {task} needs input '{input}' but no earlier step provides it")]
    MissingInput {
        job: String,
        task: String,
        input: String,
    },

    /// A configuration file parsed but holds unusable values.
    #[error("invalid configuration in {path}: {reason}")]
    InvalidConfig { path: PathBuf, reason: String },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Toml {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("git error: {0}")]
    Git(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PlanError {
    /// Create an upload configuration error for `target`.
    pub fn upload_config(target: impl Into<String>, reason: impl ToString) -> Self {
        Self::UploadConfig {
            target: target.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a render error for a (recipe, row) pair.
    pub fn render(recipe: impl Into<String>, row: impl Into<String>, reason: impl ToString) -> Self {
        Self::Render {
            recipe: recipe.into(),
            row: row.into(),
            reason: reason.to_string(),
        }
    }

    /// Create an I/O error with path context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a TOML parse error with path context.
    pub fn toml(path: impl Into<PathBuf>, source: toml::de::Error) -> Self {
        Self::Toml {
            path: path.into(),
            source,
        }
    }

    pub fn invalid_config(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::InvalidConfig {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// `true` for errors that make the whole build graph unusable.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            PlanError::DependencyCycle { .. } | PlanError::DuplicateKey { .. }
        )
    }
}

/// Result type for planning operations.
pub type PlanResult<T> = std::result::Result<T, PlanError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_error_names_every_unit() {
        let err = PlanError::DependencyCycle {
            units: vec![
                "a-1.0-h0_0-linux-64".to_string(),
                "b-1.0-h0_0-linux-64".to_string(),
                "a-1.0-h0_0-linux-64".to_string(),
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("cycle"));
        assert!(msg.contains("a-1.0-h0_0-linux-64 -> b-1.0-h0_0-linux-64"));
        assert!(err.is_structural());
    }

    #[test]
    fn test_duplicate_key_error_names_both_recipes() {
        let err = PlanError::DuplicateKey {
            key: "zlib-1.3-h1_0-linux-64".to_string(),
            first: "zlib@linux-a".to_string(),
            second: "zlib@linux-b".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("zlib@linux-a"));
        assert!(msg.contains("zlib@linux-b"));
        assert!(err.is_structural());
    }

    #[test]
    fn test_invalid_bound_names_field_and_value() {
        let err = PlanError::InvalidBound {
            field: "steps",
            value: -2,
        };
        assert_eq!(
            err.to_string(),
            "invalid steps bound -2: expected -1 or a non-negative count"
        );
        assert!(!err.is_structural());
    }

    #[test]
    fn test_upload_config_error_is_not_structural() {
        let err = PlanError::upload_config("uploads.d/odd.toml", "no recognised key");
        assert!(err.to_string().contains("uploads.d/odd.toml"));
        assert!(!err.is_structural());
    }
}
