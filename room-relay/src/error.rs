//! Error types shared by the relay and its collaborators.

use thiserror::Error;

use crate::protocol::ServerToClient;

/// Token verification failures.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token required")]
    Missing,
    #[error("invalid or expired token: {0}")]
    Invalid(String),
}

/// Failures raised by a message store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode message record: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("corrupt message record on line {line}: {reason}")]
    Corrupt { line: usize, reason: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Why the relay refused an inbound event.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("authentication required")]
    AuthRequired,
    #[error(transparent)]
    AuthInvalid(#[from] AuthError),
    #[error("failed to {operation}: {source}")]
    Store {
        operation: &'static str,
        #[source]
        source: StoreError,
    },
}

impl RelayError {
    pub fn store(operation: &'static str, source: StoreError) -> Self {
        RelayError::Store { operation, source }
    }

    /// Event sent back to the originating connection. Store details stay in the logs.
    pub fn to_reply(&self) -> ServerToClient {
        match self {
            RelayError::AuthRequired => ServerToClient::AuthError {
                message: "Authentication required".to_string(),
            },
            RelayError::AuthInvalid(AuthError::Missing) => ServerToClient::AuthError {
                message: "Token required".to_string(),
            },
            RelayError::AuthInvalid(AuthError::Invalid(_)) => ServerToClient::AuthError {
                message: "Invalid or expired token".to_string(),
            },
            RelayError::Store { operation, .. } => ServerToClient::Error {
                message: format!("failed to {operation}"),
            },
        }
    }
}
