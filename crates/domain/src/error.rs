/// Shared error type used across all weft crates.
///
/// Variants carry the stable kind tags surfaced in API error envelopes and
/// `*.failed` events.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("validation: {field}: {constraint}")]
    Validation { field: String, constraint: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("loop limit exceeded on transition {transition_id} (max {max_iterations})")]
    LoopLimitExceeded {
        transition_id: String,
        max_iterations: u32,
    },

    #[error("synchronization timeout in group {group}")]
    SynchronizationTimeout { group: String },

    #[error("tool failure: {0}")]
    ToolFailure(String),

    #[error("memory extraction: {0}")]
    MemoryExtraction(String),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("expression: {0}")]
    Expression(String),

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Construct a validation error for a named field.
    pub fn validation(field: impl Into<String>, constraint: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            constraint: constraint.into(),
        }
    }

    /// Stable kind tag for API envelopes and failure events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::LoopLimitExceeded { .. } => "loop_limit_exceeded",
            Self::SynchronizationTimeout { .. } => "synchronization_timeout",
            Self::ToolFailure(_) => "tool_failure",
            Self::MemoryExtraction(_) => "memory_extraction_failure",
            Self::StorageUnavailable(_) => "storage_unavailable",
            Self::Expression(_) => "expression",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
            Self::Other(_) => "internal",
        }
    }
}

impl From<weft_expr::ParseError> for Error {
    fn from(e: weft_expr::ParseError) -> Self {
        Self::Expression(e.to_string())
    }
}

impl From<weft_expr::EvalError> for Error {
    fn from(e: weft_expr::EvalError) -> Self {
        Self::Expression(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_tags_are_stable() {
        assert_eq!(Error::validation("f", "c").kind(), "validation");
        assert_eq!(Error::NotFound("x".into()).kind(), "not_found");
        assert_eq!(
            Error::LoopLimitExceeded {
                transition_id: "t1".into(),
                max_iterations: 3
            }
            .kind(),
            "loop_limit_exceeded"
        );
        assert_eq!(
            Error::SynchronizationTimeout { group: "G".into() }.kind(),
            "synchronization_timeout"
        );
    }

    #[test]
    fn display_includes_field() {
        let e = Error::validation("nodes[0].ref", "must be unique");
        assert!(e.to_string().contains("nodes[0].ref"));
    }
}
