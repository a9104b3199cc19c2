//! Error types: load-time configuration errors and protocol errors.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A pipeline document that cannot be turned into a runnable graph.
///
/// Raised by the loader before anything touches the target application,
/// and by the scheduler when a transition has nowhere to go. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConfigError {
    #[error("invalid pipeline document: {message}")]
    Document { message: String },

    #[error("node '{node}': missing required field '{field}'")]
    MissingField { node: String, field: String },

    #[error("node '{node}': invalid value for '{field}': {message}")]
    InvalidField {
        node: String,
        field: String,
        message: String,
    },

    #[error("node '{node}': successor '{successor}' does not exist")]
    DanglingSuccessor { node: String, successor: String },

    #[error("node '{node}': template image {path:?} not found")]
    MissingTemplate { node: String, path: String },

    #[error("node '{node}': template image {path:?} could not be decoded: {message}")]
    UnreadableTemplate {
        node: String,
        path: String,
        message: String,
    },

    #[error("entry node '{node}' does not exist")]
    UnknownEntry { node: String },

    #[error("node '{node}': no enabled successor to transition to")]
    NoViableSuccessor { node: String },
}

impl ConfigError {
    /// The node the error is about, if it concerns a single node.
    #[must_use]
    pub fn node(&self) -> Option<&str> {
        match self {
            ConfigError::Document { .. } => None,
            ConfigError::MissingField { node, .. }
            | ConfigError::InvalidField { node, .. }
            | ConfigError::DanglingSuccessor { node, .. }
            | ConfigError::MissingTemplate { node, .. }
            | ConfigError::UnreadableTemplate { node, .. }
            | ConfigError::UnknownEntry { node }
            | ConfigError::NoViableSuccessor { node } => Some(node),
        }
    }

    pub(crate) fn document(message: impl Into<String>) -> Self {
        ConfigError::Document {
            message: message.into(),
        }
    }

    pub(crate) fn missing(node: &str, field: &str) -> Self {
        ConfigError::MissingField {
            node: node.to_string(),
            field: field.to_string(),
        }
    }

    pub(crate) fn invalid(node: &str, field: &str, message: impl Into<String>) -> Self {
        ConfigError::InvalidField {
            node: node.to_string(),
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// Error codes for protocol responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    PipelineNotFound,
    RunNotFound,
    InvalidPipeline,
    InvalidInput,
    InternalError,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::PipelineNotFound => write!(f, "PIPELINE_NOT_FOUND"),
            ErrorCode::RunNotFound => write!(f, "RUN_NOT_FOUND"),
            ErrorCode::InvalidPipeline => write!(f, "INVALID_PIPELINE"),
            ErrorCode::InvalidInput => write!(f, "INVALID_INPUT"),
            ErrorCode::InternalError => write!(f, "INTERNAL_ERROR"),
        }
    }
}

/// An error response with a hint for the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    pub suggestion: Option<String>,
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(suggestion) = &self.suggestion {
            write!(f, " (hint: {})", suggestion)?;
        }
        Ok(())
    }
}

impl std::error::Error for ApiError {}

impl ApiError {
    pub fn pipeline_not_found(pipeline_id: &str) -> Self {
        Self {
            code: ErrorCode::PipelineNotFound,
            message: format!("Pipeline '{}' not found", pipeline_id),
            suggestion: Some("Send 'list_pipelines' to see submitted pipelines".into()),
        }
    }

    pub fn run_not_found(run_id: &str) -> Self {
        Self {
            code: ErrorCode::RunNotFound,
            message: format!("Run '{}' not found", run_id),
            suggestion: Some("Send 'list_runs' to see known runs".into()),
        }
    }

    /// Wrap a load-time configuration error, pointing at the offending node.
    pub fn invalid_pipeline(err: &ConfigError) -> Self {
        let suggestion = match err.node() {
            Some(node) => format!("Fix node '{}' in the pipeline document and resubmit", node),
            None => "Check that the document is a JSON object of node name to node".to_string(),
        };
        Self {
            code: ErrorCode::InvalidPipeline,
            message: err.to_string(),
            suggestion: Some(suggestion),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::InvalidInput,
            message: message.into(),
            suggestion: Some("Check the request syntax and try again".into()),
        }
    }

    /// Create an invalid input error with a custom suggestion.
    pub fn invalid_input_with_suggestion(
        message: impl Into<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self {
            code: ErrorCode::InvalidInput,
            message: message.into(),
            suggestion: Some(suggestion.into()),
        }
    }

    /// Create an error when the concurrent run limit is reached.
    pub fn run_limit_reached(max: usize) -> Self {
        Self {
            code: ErrorCode::InvalidInput,
            message: format!("Maximum concurrent run limit ({}) reached", max),
            suggestion: Some(
                "Abort an active run with 'abort_run' or wait for one to finish".into(),
            ),
        }
    }

    /// Create an error when too many pipelines are registered.
    pub fn pipeline_limit_reached(max: usize) -> Self {
        Self {
            code: ErrorCode::InvalidInput,
            message: format!("Maximum pipeline limit ({}) reached", max),
            suggestion: Some("Restart the server to clear submitted pipelines".into()),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::InternalError,
            message: message.into(),
            suggestion: Some("This is an internal error. Please report it if it persists.".into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// All error constructors must provide a suggestion.
    fn assert_has_suggestion(err: &ApiError, context: &str) {
        assert!(
            err.suggestion.is_some(),
            "{} should have a suggestion, but got None",
            context
        );
    }

    #[test]
    fn test_pipeline_not_found_has_suggestion() {
        let err = ApiError::pipeline_not_found("abc-123");
        assert_has_suggestion(&err, "pipeline_not_found");
        assert!(err.message.contains("abc-123"));
        assert!(err.suggestion.as_ref().unwrap().contains("list_pipelines"));
    }

    #[test]
    fn test_run_not_found_has_suggestion() {
        let err = ApiError::run_not_found("run-9");
        assert_has_suggestion(&err, "run_not_found");
        assert!(err.message.contains("run-9"));
    }

    #[test]
    fn test_invalid_pipeline_names_node() {
        let cfg = ConfigError::missing("pick_tool", "template");
        let err = ApiError::invalid_pipeline(&cfg);
        assert_eq!(err.code, ErrorCode::InvalidPipeline);
        assert!(err.message.contains("pick_tool"));
        assert!(err.message.contains("template"));
        assert!(err.suggestion.as_ref().unwrap().contains("pick_tool"));
    }

    #[test]
    fn test_invalid_pipeline_document_level() {
        let cfg = ConfigError::document("expected an object");
        let err = ApiError::invalid_pipeline(&cfg);
        assert_has_suggestion(&err, "invalid_pipeline (document)");
        assert!(err.suggestion.as_ref().unwrap().contains("JSON object"));
    }

    #[test]
    fn test_invalid_input_with_custom_suggestion() {
        let err = ApiError::invalid_input_with_suggestion("bad entry", "Name an existing node");
        assert_has_suggestion(&err, "invalid_input_with_suggestion");
        assert!(err.suggestion.as_ref().unwrap().contains("existing node"));
    }

    #[test]
    fn test_limits_have_suggestions() {
        assert_has_suggestion(&ApiError::run_limit_reached(8), "run_limit_reached");
        assert_has_suggestion(&ApiError::pipeline_limit_reached(8), "pipeline_limit_reached");
        assert_has_suggestion(&ApiError::internal("boom"), "internal");
        assert_has_suggestion(&ApiError::invalid_input("x"), "invalid_input");
    }

    #[test]
    fn test_display_format_with_suggestion() {
        let err = ApiError::run_not_found("abc");
        let display = format!("{}", err);
        assert!(display.contains("[RUN_NOT_FOUND]"));
        assert!(display.contains("abc"));
        assert!(display.contains("(hint:"));
    }

    #[test]
    fn test_config_error_node_accessor() {
        let err = ConfigError::DanglingSuccessor {
            node: "start".into(),
            successor: "nowhere".into(),
        };
        assert_eq!(err.node(), Some("start"));
        assert!(err.to_string().contains("nowhere"));
        assert_eq!(ConfigError::document("x").node(), None);
    }

    #[test]
    fn test_config_error_json_roundtrip_tag() {
        let err = ConfigError::NoViableSuccessor {
            node: "menu".into(),
        };
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"kind\":\"no_viable_successor\""));
        let back: ConfigError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, err);
    }

    #[test]
    fn test_json_deserialization() {
        let json =
            r#"{"code":"PIPELINE_NOT_FOUND","message":"Pipeline 'x' not found","suggestion":"hint"}"#;
        let err: ApiError = serde_json::from_str(json).unwrap();
        assert!(matches!(err.code, ErrorCode::PipelineNotFound));
        assert_eq!(err.suggestion, Some("hint".to_string()));
    }
}
