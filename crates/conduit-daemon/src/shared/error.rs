use conduit_core::{CoreError, InstanceStatus};
use std::collections::HashMap;
use thiserror::Error;

/// Daemon specific errors
#[derive(Debug, Clone, Error)]
pub enum DaemonError {
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Instance not found: {0}")]
    InstanceNotFound(String),
    #[error("Operation not found: {0}")]
    OperationNotFound(String),
    #[error("Invalid state: cannot {action} instance {instance_id} while it is {status}")]
    InvalidState {
        instance_id: String,
        action: String,
        status: InstanceStatus,
    },
    #[error("Policy denied: {}", .reasons.join("; "))]
    PolicyDenied { reasons: Vec<String> },
    #[error("Provisioning error: {0}")]
    Provisioning(String),
    #[error("Operation cancelled: {0}")]
    Cancelled(String),
    #[error("Timeout: {0}")]
    Timeout(String),
    #[error("Storage error: {0}")]
    StorageError(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DaemonError {
    pub fn error_code(&self) -> &'static str {
        match self {
            DaemonError::ValidationError(_) => "VALIDATION_ERROR",
            DaemonError::InstanceNotFound(_) => "INSTANCE_NOT_FOUND",
            DaemonError::OperationNotFound(_) => "OPERATION_NOT_FOUND",
            DaemonError::InvalidState { .. } => "INVALID_STATE",
            DaemonError::PolicyDenied { .. } => "POLICY_DENIED",
            DaemonError::Provisioning(_) => "PROVISIONING_ERROR",
            DaemonError::Cancelled(_) => "CANCELLED",
            DaemonError::Timeout(_) => "TIMEOUT",
            DaemonError::StorageError(_) => "STORAGE_ERROR",
            DaemonError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// HTTP-like status used by the API boundary.
    pub fn status_code(&self) -> u16 {
        status_code_for(self.error_code())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            DaemonError::InstanceNotFound(_) | DaemonError::OperationNotFound(_)
        )
    }
}

impl From<CoreError> for DaemonError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::InvalidPermission(msg) => DaemonError::ValidationError(msg),
            CoreError::SerializationError(msg) => DaemonError::StorageError(msg),
            transition @ CoreError::InvalidTransition { .. } => {
                DaemonError::ValidationError(transition.to_string())
            }
        }
    }
}

impl From<serde_json::Error> for DaemonError {
    fn from(err: serde_json::Error) -> Self {
        DaemonError::StorageError(err.to_string())
    }
}

impl From<std::io::Error> for DaemonError {
    fn from(err: std::io::Error) -> Self {
        DaemonError::StorageError(err.to_string())
    }
}

impl From<DaemonError> for conduit_core::ErrorResponse {
    fn from(err: DaemonError) -> Self {
        let code = err.error_code();
        let (message, details) = match &err {
            DaemonError::ValidationError(msg)
            | DaemonError::InstanceNotFound(msg)
            | DaemonError::OperationNotFound(msg)
            | DaemonError::Provisioning(msg)
            | DaemonError::Cancelled(msg)
            | DaemonError::Timeout(msg)
            | DaemonError::StorageError(msg)
            | DaemonError::Internal(msg) => (msg.clone(), None),
            DaemonError::InvalidState {
                instance_id,
                status,
                ..
            } => {
                let mut details = HashMap::new();
                details.insert("instance_id".to_string(), instance_id.clone());
                details.insert("status".to_string(), status.to_string());
                (err.to_string(), Some(details))
            }
            DaemonError::PolicyDenied { reasons } => {
                let details = reasons
                    .iter()
                    .enumerate()
                    .map(|(i, reason)| (format!("reason_{i}"), reason.clone()))
                    .collect();
                (err.to_string(), Some(details))
            }
        };

        let response = conduit_core::ErrorResponse::new(code, message);
        match details {
            Some(details) => response.with_details(details),
            None => response,
        }
    }
}

/// Status for an `ErrorResponse` error code. Unknown codes map to 500.
pub fn status_code_for(error_code: &str) -> u16 {
    match error_code {
        "VALIDATION_ERROR" => 400,
        "POLICY_DENIED" => 403,
        "INSTANCE_NOT_FOUND" | "OPERATION_NOT_FOUND" => 404,
        "INVALID_STATE" => 409,
        "CANCELLED" => 499,
        "PROVISIONING_ERROR" => 502,
        "TIMEOUT" => 504,
        _ => 500,
    }
}

pub type DaemonResult<T> = std::result::Result<T, DaemonError>;
