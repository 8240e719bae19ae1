use serde::Serialize;
use thiserror::Error;

use crate::session::CallerId;

/// Argument shape failures. Raised before anything reaches the backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("the 'algorithm' argument should have a 'name' string property")]
    MissingAlgorithmName,

    #[error("the 'key' argument should be a token key carrying a 'cs_pkcs11id'")]
    InvalidKeyReference,

    #[error("the 'data' argument should be an array of byte values or a string")]
    MissingPayload,

    #[error("the '{argument}' argument should be {expected}")]
    InvalidArgumentType {
        argument: &'static str,
        expected: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error("gateway session has not been activated")]
    NotActive,

    #[error("gateway session has been terminated")]
    Terminated,

    #[error("a gateway session is already active for caller {0}")]
    AlreadyActive(CallerId),
}

/// Opaque failure reported by a backend. The gateway relays it untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct BackendError {
    message: String,
}

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn abandoned() -> Self {
        Self::new("operation abandoned by backend")
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Failure payload carried by a result handle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OperationError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl OperationError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(ValidationError::MissingAlgorithmName) => "MissingAlgorithmName",
            Self::Validation(ValidationError::InvalidKeyReference) => "InvalidKeyReference",
            Self::Validation(ValidationError::MissingPayload) => "MissingPayload",
            Self::Validation(ValidationError::InvalidArgumentType { .. }) => "InvalidArgumentType",
            Self::Lifecycle(_) => "LifecycleError",
            Self::Backend(_) => "BackendError",
        }
    }

    /// Caller-facing view of the failure: a kind tag and a message, nothing else.
    pub fn view(&self) -> ErrorView {
        ErrorView {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorView {
    pub kind: &'static str,
    pub message: String,
}

/// Synchronous failures of the dynamic member dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvokeError {
    #[error("member '{0}' is not exposed")]
    UnknownMember(String),

    #[error(transparent)]
    Rejected(#[from] OperationError),
}

impl InvokeError {
    pub fn view(&self) -> ErrorView {
        match self {
            Self::UnknownMember(_) => ErrorView {
                kind: "UnknownMember",
                message: self.to_string(),
            },
            Self::Rejected(err) => err.view(),
        }
    }
}
