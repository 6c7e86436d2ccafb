//! The engine error type.
//!
//! Every error surfaces as a `{context, message, code}` tuple: the context
//! names the subsystem that failed, the message is human-readable and the
//! code is a stable machine-readable constant the API layer forwards
//! verbatim.

use thiserror::Error;

/// Engine-wide error type.
#[derive(Debug, Error)]
#[error("[{context}] {message}")]
pub struct EngineError {
    pub context: String,
    pub message: String,
    pub code: ErrorCode,
}

/// Stable machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidParameter,
    MissingParameter,
    UnknownWorkflow,
    UnknownNotification,
    UnknownQueue,
    UnknownType,
    WorkflowAlreadyExists,
    InvalidWorkflowParameters,
    XmlError,
    XpathError,
    DbError,
    IoError,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidParameter => "INVALID_PARAMETER",
            Self::MissingParameter => "MISSING_PARAMETER",
            Self::UnknownWorkflow => "UNKNOWN_WORKFLOW",
            Self::UnknownNotification => "UNKNOWN_NOTIFICATION",
            Self::UnknownQueue => "UNKNOWN_QUEUE",
            Self::UnknownType => "UNKNOWN_TYPE",
            Self::WorkflowAlreadyExists => "WORKFLOW_ALREADY_EXISTS",
            Self::InvalidWorkflowParameters => "INVALID_WORKFLOW_PARAMETERS",
            Self::XmlError => "XML_ERROR",
            Self::XpathError => "XPATH_ERROR",
            Self::DbError => "DB_ERROR",
            Self::IoError => "IO_ERROR",
            Self::Internal => "INTERNAL_ERROR",
        }
    }
}

impl EngineError {
    pub fn new(
        context: impl Into<String>,
        message: impl Into<String>,
        code: ErrorCode,
    ) -> Self {
        Self {
            context: context.into(),
            message: message.into(),
            code,
        }
    }

    pub fn invalid_parameter(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(context, message, ErrorCode::InvalidParameter)
    }

    pub fn missing_parameter(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(context, message, ErrorCode::MissingParameter)
    }

    pub fn unknown_workflow(name: impl std::fmt::Display) -> Self {
        Self::new(
            "Workflow",
            format!("unknown workflow: {name}"),
            ErrorCode::UnknownWorkflow,
        )
    }

    pub fn unknown_queue(name: impl std::fmt::Display) -> Self {
        Self::new(
            "QueuePool",
            format!("unknown queue: {name}"),
            ErrorCode::UnknownQueue,
        )
    }

    pub fn xml(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(context, message, ErrorCode::XmlError)
    }

    pub fn xpath(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(context, message, ErrorCode::XpathError)
    }

    pub fn code(&self) -> &'static str {
        self.code.as_str()
    }
}

/// Engine-wide result alias.
pub type Result<T> = std::result::Result<T, EngineError>;

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        Self::new("IO", err.to_string(), ErrorCode::IoError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_context_and_message() {
        let err = EngineError::unknown_queue("batch");
        assert_eq!(err.to_string(), "[QueuePool] unknown queue: batch");
        assert_eq!(err.code(), "UNKNOWN_QUEUE");
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(
            ErrorCode::InvalidWorkflowParameters.as_str(),
            "INVALID_WORKFLOW_PARAMETERS"
        );
        assert_eq!(ErrorCode::WorkflowAlreadyExists.as_str(), "WORKFLOW_ALREADY_EXISTS");
    }
}
