//! Service Errors
//!
//! Every request handler returns [`ServiceError`]. Each variant maps to one
//! stable [`ErrorKind`] and a client-safe message; storage detail stays in
//! the logs.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::auth::token::TokenError;
use crate::store::StoreError;

/// Stable error kinds sent to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A required field is absent or empty.
    FieldMissing,
    /// A field is present but malformed.
    FieldInvalid,
    /// Credential, session or binding check failed.
    AuthenticationFailed,
    /// Code does not match, or there is nothing to verify.
    CodeInvalid,
    /// Code is past its expiry.
    CodeExpired,
    /// Too many wrong codes for this challenge.
    CodeAttemptsExceeded,
    /// Requested record does not exist.
    NotFound,
    /// The user is already paired in this contest.
    AlreadyMatched,
    /// A store call failed or timed out.
    StoreUnavailable,
    /// Unexpected internal failure.
    Internal,
}

/// Why an authentication check failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthFailure {
    /// Credential itself is invalid.
    #[error("{0}")]
    Credential(#[from] TokenError),

    /// No session with that token.
    #[error("session not found")]
    SessionNotFound,

    /// Session is past its expiry.
    #[error("session expired")]
    SessionExpired,

    /// Session is pending verification or revoked.
    #[error("session not active")]
    SessionInactive,

    /// Connection has no session bound to it.
    #[error("connection not authenticated")]
    NotBound,

    /// Credential mobile differs from the session's.
    #[error("mobile does not match session")]
    MobileMismatch,

    /// Credential device differs from the session's.
    #[error("device does not match session")]
    DeviceMismatch,

    /// Credential is not the one attached to the session.
    #[error("credential does not match session")]
    CredentialMismatch,

    /// Request names a different user than the authenticated one.
    #[error("user does not match credential")]
    UserMismatch,
}

/// Errors returned by request handlers.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Required field absent.
    #[error("missing field: {0}")]
    FieldMissing(&'static str),

    /// Field malformed.
    #[error("invalid {field}: {reason}")]
    FieldInvalid {
        /// Offending field.
        field: &'static str,
        /// Human-readable reason.
        reason: String,
    },

    /// Authentication failed.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(#[from] AuthFailure),

    /// Wrong code, or nothing to verify.
    #[error("invalid code")]
    CodeInvalid,

    /// Code expired.
    #[error("code expired")]
    CodeExpired,

    /// Attempt limit reached.
    #[error("too many attempts")]
    CodeAttemptsExceeded,

    /// Record not found.
    #[error("{0} not found")]
    NotFound(&'static str),

    /// Already paired.
    #[error("already matched")]
    AlreadyMatched,

    /// Store failure.
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    /// Internal failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<TokenError> for ServiceError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::NotConfigured | TokenError::SealFailed => Self::Internal(err.to_string()),
            other => Self::AuthenticationFailed(AuthFailure::Credential(other)),
        }
    }
}

impl ServiceError {
    /// Shorthand for [`ServiceError::FieldInvalid`].
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::FieldInvalid { field, reason: reason.into() }
    }

    /// Stable kind for clients.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::FieldMissing(_) => ErrorKind::FieldMissing,
            Self::FieldInvalid { .. } => ErrorKind::FieldInvalid,
            Self::AuthenticationFailed(_) => ErrorKind::AuthenticationFailed,
            Self::CodeInvalid => ErrorKind::CodeInvalid,
            Self::CodeExpired => ErrorKind::CodeExpired,
            Self::CodeAttemptsExceeded => ErrorKind::CodeAttemptsExceeded,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::AlreadyMatched => ErrorKind::AlreadyMatched,
            Self::StoreUnavailable(_) => ErrorKind::StoreUnavailable,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Field the error is about, if any.
    pub fn field(&self) -> Option<&'static str> {
        match self {
            Self::FieldMissing(field) | Self::FieldInvalid { field, .. } => Some(*field),
            Self::CodeInvalid | Self::CodeExpired | Self::CodeAttemptsExceeded => Some("otp"),
            Self::AuthenticationFailed(AuthFailure::Credential(_))
            | Self::AuthenticationFailed(AuthFailure::CredentialMismatch) => Some("credential"),
            Self::AuthenticationFailed(AuthFailure::MobileMismatch) => Some("mobile"),
            Self::AuthenticationFailed(AuthFailure::DeviceMismatch) => Some("device_id"),
            Self::AuthenticationFailed(AuthFailure::UserMismatch) => Some("user_id"),
            Self::AuthenticationFailed(
                AuthFailure::SessionNotFound | AuthFailure::SessionExpired | AuthFailure::SessionInactive,
            ) => Some("session_token"),
            _ => None,
        }
    }

    /// Message safe to send to a client.
    pub fn client_message(&self) -> String {
        match self {
            Self::StoreUnavailable(_) => "service temporarily unavailable, retry later".to_string(),
            Self::Internal(_) => "internal error".to_string(),
            Self::CodeAttemptsExceeded => "maximum verification attempts exceeded".to_string(),
            other => other.to_string(),
        }
    }
}
