// SPDX-License-Identifier: Apache-2.0

//! Normalized error types for the Tessera engine core
//!
//! Every collaborator failure is mapped onto this taxonomy so that the
//! client always receives a stable code and a user-facing message.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reason a logon attempt was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogonFailureKind {
    /// The per-user session quota is exhausted.
    QuotaExceeded,
    /// The account does not exist or was removed.
    UnknownAccount,
    /// The account exists but is frozen.
    AccountFrozen,
    /// The credentials did not authenticate.
    BadCredentials,
    /// The requested VDB is not deployed.
    UnknownVdb,
}

/// Unified error type for all engine operations
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum EngineError {
    #[error("Invalid session: {message}")]
    InvalidSession { message: String },

    #[error("Logon failed: {message}")]
    LogonFailure {
        kind: LogonFailureKind,
        message: String,
    },

    #[error("Component unavailable ({component}): {message}")]
    ComponentUnavailable { component: String, message: String },

    #[error("Authorization denied: {message}")]
    AuthorizationDenied { message: String },

    #[error("Group {group} is not visible in this VDB version")]
    VisibilityDenied { group: String },

    #[error("Transport setup failed: {message}")]
    TransportSetupFailure { message: String },

    #[error("Malformed envelope: {message}")]
    MalformedEnvelope { message: String },

    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Connector {binding} failed: {message}")]
    ConnectorFailure { binding: String, message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl EngineError {
    pub fn invalid_session(msg: impl Into<String>) -> Self {
        Self::InvalidSession { message: msg.into() }
    }

    pub fn logon_failure(kind: LogonFailureKind, msg: impl Into<String>) -> Self {
        Self::LogonFailure {
            kind,
            message: msg.into(),
        }
    }

    pub fn unavailable(component: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ComponentUnavailable {
            component: component.into(),
            message: msg.into(),
        }
    }

    pub fn authorization_denied(msg: impl Into<String>) -> Self {
        Self::AuthorizationDenied { message: msg.into() }
    }

    pub fn visibility_denied(group: impl Into<String>) -> Self {
        Self::VisibilityDenied {
            group: group.into(),
        }
    }

    pub fn transport_setup(msg: impl Into<String>) -> Self {
        Self::TransportSetupFailure { message: msg.into() }
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedEnvelope { message: msg.into() }
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument { message: msg.into() }
    }

    pub fn connector(binding: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ConnectorFailure {
            binding: binding.into(),
            message: msg.into(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal { message: msg.into() }
    }

    /// Stable machine-readable code sent to clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidSession { .. } => "ERR_INVALID_SESSION",
            Self::LogonFailure { .. } => "ERR_LOGON_FAILED",
            Self::ComponentUnavailable { .. } => "ERR_COMPONENT_UNAVAILABLE",
            Self::AuthorizationDenied { .. } => "ERR_AUTHORIZATION_DENIED",
            Self::VisibilityDenied { .. } => "ERR_VISIBILITY_DENIED",
            Self::TransportSetupFailure { .. } => "ERR_TRANSPORT_SETUP",
            Self::MalformedEnvelope { .. } => "ERR_MALFORMED_ENVELOPE",
            Self::InvalidArgument { .. } => "ERR_INVALID_ARGUMENT",
            Self::Timeout { .. } => "ERR_TIMEOUT",
            Self::Cancelled => "ERR_CANCELLED",
            Self::ConnectorFailure { .. } => "ERR_CONNECTOR",
            Self::Internal { .. } => "ERR_INTERNAL",
        }
    }

    /// `InvalidSession` is the only failure a client clears by logging on again.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::InvalidSession { .. })
    }
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_invalid_session_is_recoverable() {
        assert!(EngineError::invalid_session("expired").is_recoverable());
        assert!(!EngineError::logon_failure(LogonFailureKind::QuotaExceeded, "quota").is_recoverable());
        assert!(!EngineError::unavailable("entitlements", "down").is_recoverable());
    }

    #[test]
    fn visibility_message_names_group() {
        let err = EngineError::visibility_denied("modelB.t2");
        assert_eq!(err.to_string(), "Group modelB.t2 is not visible in this VDB version");
        assert_eq!(err.code(), "ERR_VISIBILITY_DENIED");
    }
}
