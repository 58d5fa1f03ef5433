use thiserror::Error;

use crate::approvals::ApprovalError;
use crate::domain::rule::RuleValidationError;
use crate::flows::FlowTransitionError;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error(transparent)]
    FlowTransition(#[from] FlowTransitionError),
    #[error("domain invariant violation: {0}")]
    InvariantViolation(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Approval(#[from] ApprovalError),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("integration failure: {0}")]
    Integration(String),
    #[error("configuration failure: {0}")]
    Configuration(String),
}

impl From<RuleValidationError> for ApplicationError {
    fn from(value: RuleValidationError) -> Self {
        Self::Approval(value.into())
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { code: &'static str, message: String, correlation_id: String },
    #[error("forbidden: {message}")]
    Forbidden { code: &'static str, message: String, correlation_id: String },
    #[error("not found: {message}")]
    NotFound { code: &'static str, message: String, correlation_id: String },
    #[error("conflict: {message}")]
    Conflict { code: &'static str, message: String, correlation_id: String },
    #[error("unprocessable: {message}")]
    Unprocessable { code: &'static str, message: String, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { code: &'static str, message: String, correlation_id: String },
    #[error("internal error: {message}")]
    Internal { code: &'static str, message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => {
                "The request could not be processed. Check inputs and try again."
            }
            Self::Forbidden { .. } => "You are not allowed to perform this action.",
            Self::NotFound { .. } => "The requested resource does not exist.",
            Self::Conflict { .. } => "The resource changed state and cannot accept this action.",
            Self::Unprocessable { .. } => "The submitted configuration is not valid.",
            Self::ServiceUnavailable { .. } => {
                "The service is temporarily unavailable. Please retry shortly."
            }
            Self::Internal { .. } => "An unexpected internal error occurred.",
        }
    }

    pub fn code(&self) -> &'static str {
        let (code, _, _) = self.parts();
        code
    }

    /// Caller-facing detail. Internal failures only expose the generic text.
    pub fn message(&self) -> &str {
        match self {
            Self::ServiceUnavailable { .. } | Self::Internal { .. } => self.user_message(),
            _ => self.parts().1,
        }
    }

    pub fn correlation_id(&self) -> &str {
        self.parts().2
    }

    fn parts(&self) -> (&'static str, &str, &str) {
        match self {
            Self::BadRequest { code, message, correlation_id }
            | Self::Forbidden { code, message, correlation_id }
            | Self::NotFound { code, message, correlation_id }
            | Self::Conflict { code, message, correlation_id }
            | Self::Unprocessable { code, message, correlation_id }
            | Self::ServiceUnavailable { code, message, correlation_id }
            | Self::Internal { code, message, correlation_id } => {
                (*code, message.as_str(), correlation_id.as_str())
            }
        }
    }
}

impl ApplicationError {
    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let mut mapped = InterfaceError::from(self);
        match &mut mapped {
            InterfaceError::BadRequest { correlation_id: id, .. }
            | InterfaceError::Forbidden { correlation_id: id, .. }
            | InterfaceError::NotFound { correlation_id: id, .. }
            | InterfaceError::Conflict { correlation_id: id, .. }
            | InterfaceError::Unprocessable { correlation_id: id, .. }
            | InterfaceError::ServiceUnavailable { correlation_id: id, .. }
            | InterfaceError::Internal { correlation_id: id, .. } => *id = correlation_id,
        }
        mapped
    }
}

const UNASSIGNED: &str = "unassigned";

impl From<ApplicationError> for InterfaceError {
    fn from(value: ApplicationError) -> Self {
        let correlation_id = UNASSIGNED.to_owned();
        match value {
            ApplicationError::Domain(DomainError::FlowTransition(error)) => {
                Self::Conflict { code: "invalid_transition", message: error.to_string(), correlation_id }
            }
            ApplicationError::Domain(DomainError::InvariantViolation(message)) => {
                Self::BadRequest { code: "validation_failed", message, correlation_id }
            }
            ApplicationError::Approval(error) => {
                let code = error.kind();
                let message = error.to_string();
                match error {
                    ApprovalError::NotFound { .. } => Self::NotFound { code, message, correlation_id },
                    ApprovalError::NotPendingApproval { .. } | ApprovalError::InvalidTransition(_) => {
                        Self::Conflict { code, message, correlation_id }
                    }
                    ApprovalError::Unauthorized(_) => Self::Forbidden { code, message, correlation_id },
                    ApprovalError::MissingReason => Self::BadRequest { code, message, correlation_id },
                    ApprovalError::RuleMisconfigured(_) => {
                        Self::Unprocessable { code, message, correlation_id }
                    }
                    ApprovalError::Persistence(_) => {
                        Self::ServiceUnavailable { code, message, correlation_id }
                    }
                }
            }
            ApplicationError::Persistence(message) => {
                Self::ServiceUnavailable { code: "persistence", message, correlation_id }
            }
            ApplicationError::Integration(message) => {
                Self::ServiceUnavailable { code: "integration", message, correlation_id }
            }
            ApplicationError::Configuration(message) => {
                Self::Internal { code: "configuration", message, correlation_id }
            }
        }
    }
}
