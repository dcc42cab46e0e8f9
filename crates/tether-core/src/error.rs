// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for tether-core.
//!
//! Every failure surfaced by the orchestrators maps onto one [`TetherError`]
//! variant with a stable machine-readable code.

/// Result type using TetherError
pub type Result<T> = std::result::Result<T, TetherError>;

/// Errors produced by correlation, caching and send/receive orchestration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum TetherError {
    /// Configuration or contract validation failed before any I/O.
    #[error("Validation error for '{field}': {message}")]
    Validation {
        /// The setting or argument that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// The operation is not valid in the current correlation state.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// A transport operation failed.
    #[error("Communication error during '{operation}': {details}")]
    Communication {
        /// The transport operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// A transport operation timed out.
    #[error("Operation '{operation}' timed out")]
    Timeout {
        /// The transport operation that timed out.
        operation: String,
    },

    /// No workflow instance is waiting for the operation.
    #[error("Operation '{operation}' on contract '{contract}' is not available")]
    OperationNotAvailable {
        /// The contract name.
        contract: String,
        /// The operation name.
        operation: String,
    },

    /// Instance key data could not be computed from a message.
    #[error("Invalid instance key: {0}")]
    InvalidInstanceKey(String),

    /// The transaction flowed with a message differs from the instance's transaction.
    #[error(
        "Transaction flowed to instance '{instance_id}' differs from the transaction the instance is running under"
    )]
    TransactionMismatch {
        /// The target instance key.
        instance_id: String,
    },

    /// The remote party replied with a fault.
    #[error("Fault '{code}': {reason}")]
    Fault {
        /// Fault code.
        code: String,
        /// Fault reason.
        reason: String,
    },

    /// The operation was cancelled before it completed.
    #[error("Operation was cancelled")]
    Cancelled,
}

impl TetherError {
    /// Shorthand for a [`TetherError::Validation`].
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a [`TetherError::Communication`].
    pub fn communication(operation: impl Into<String>, details: impl Into<String>) -> Self {
        Self::Communication {
            operation: operation.into(),
            details: details.into(),
        }
    }

    /// Shorthand for a [`TetherError::InvalidOperation`].
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation(message.into())
    }

    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::InvalidOperation(_) => "INVALID_OPERATION",
            Self::Communication { .. } => "COMMUNICATION_ERROR",
            Self::Timeout { .. } => "TIMEOUT",
            Self::OperationNotAvailable { .. } => "OPERATION_NOT_AVAILABLE",
            Self::InvalidInstanceKey(_) => "INVALID_INSTANCE_KEY",
            Self::TransactionMismatch { .. } => "TRANSACTION_MISMATCH",
            Self::Fault { .. } => "FAULT",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Whether this error came from the transport.
    ///
    /// Channels implicated in a transport fault are aborted rather than closed.
    pub fn is_transport_fault(&self) -> bool {
        matches!(self, Self::Communication { .. } | Self::Timeout { .. })
    }
}

impl From<serde_json::Error> for TetherError {
    fn from(err: serde_json::Error) -> Self {
        TetherError::InvalidInstanceKey(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let test_cases = vec![
            (
                TetherError::validation("endpoint", "address not set"),
                "VALIDATION_ERROR",
            ),
            (
                TetherError::invalid_operation("handle already claimed"),
                "INVALID_OPERATION",
            ),
            (
                TetherError::communication("request", "connection reset"),
                "COMMUNICATION_ERROR",
            ),
            (
                TetherError::Timeout {
                    operation: "open".to_string(),
                },
                "TIMEOUT",
            ),
            (
                TetherError::OperationNotAvailable {
                    contract: "IBank".to_string(),
                    operation: "Deposit".to_string(),
                },
                "OPERATION_NOT_AVAILABLE",
            ),
            (
                TetherError::InvalidInstanceKey("empty key data".to_string()),
                "INVALID_INSTANCE_KEY",
            ),
            (
                TetherError::TransactionMismatch {
                    instance_id: "abc".to_string(),
                },
                "TRANSACTION_MISMATCH",
            ),
            (
                TetherError::Fault {
                    code: "Sender".to_string(),
                    reason: "bad input".to_string(),
                },
                "FAULT",
            ),
            (TetherError::Cancelled, "CANCELLED"),
        ];

        for (error, expected_code) in test_cases {
            assert_eq!(error.error_code(), expected_code, "wrong code for {error}");
        }
    }

    #[test]
    fn test_transport_fault_classification() {
        assert!(TetherError::communication("send", "reset").is_transport_fault());
        assert!(
            TetherError::Timeout {
                operation: "close".to_string()
            }
            .is_transport_fault()
        );
        assert!(!TetherError::Cancelled.is_transport_fault());
        assert!(!TetherError::invalid_operation("x").is_transport_fault());
    }

    #[test]
    fn test_error_display() {
        let err = TetherError::OperationNotAvailable {
            contract: "IBank".to_string(),
            operation: "Deposit".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Operation 'Deposit' on contract 'IBank' is not available"
        );

        let err = TetherError::validation("correlation", "missing handle");
        assert_eq!(
            err.to_string(),
            "Validation error for 'correlation': missing handle"
        );
    }
}
