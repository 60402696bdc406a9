//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket.
//! Every frame is a JSON object tagged by `type`. Every reply carries a
//! `status` of `success`, `pending` or `error`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::auth::UserStatus;
use crate::contest::{GameSeed, JoinOutcome, MatchNotice, OpponentStatus};
use crate::core::{ContestId, MatchId, UserId};
use crate::error::{ErrorKind, ServiceError};

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Start a login and request a one-time code.
    Login(LoginRequest),

    /// Verify the one-time code.
    VerifyOtp(VerifyOtpRequest),

    /// Enter a contest's waiting pool.
    ContestJoin(ContestJoinRequest),

    /// Ask whether an opponent has been found.
    CheckOpponent(OpponentRequest),

    /// Leave a contest's waiting pool.
    CancelFind(OpponentRequest),

    /// Rebind this connection to an existing session.
    RestoreSession(RestoreSessionRequest),

    /// End the session.
    Logout(LogoutRequest),

    /// Ping for latency measurement.
    Ping {
        /// Client timestamp, echoed back.
        #[serde(default)]
        timestamp: u64,
    },
}

impl ClientMessage {
    /// Wire name of the message, used to tag replies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Login(_) => "login",
            Self::VerifyOtp(_) => "verify_otp",
            Self::ContestJoin(_) => "contest_join",
            Self::CheckOpponent(_) => "check_opponent",
            Self::CancelFind(_) => "cancel_find",
            Self::RestoreSession(_) => "restore_session",
            Self::Logout(_) => "logout",
            Self::Ping { .. } => "ping",
        }
    }

    /// Parse from JSON.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// Missing fields decode as empty strings so the services can report which
// field is missing.

/// Login request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoginRequest {
    /// Ten-digit mobile number.
    pub mobile: String,
    /// Device identifier.
    pub device_id: String,
    /// Push notification token.
    pub push_token: String,
}

/// Code verification request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifyOtpRequest {
    /// Mobile the code was sent to.
    pub mobile: String,
    /// Token returned by login.
    pub session_token: String,
    /// Six-digit code.
    pub otp: String,
}

/// Contest join request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContestJoinRequest {
    /// Credential from verification.
    pub credential: String,
    /// Contest to join.
    pub contest_id: String,
    /// Optional team name.
    pub team: Option<String>,
}

/// Opponent check or cancellation request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OpponentRequest {
    /// Credential from verification.
    pub credential: String,
    /// Must equal the authenticated user.
    pub user_id: String,
    /// Contest.
    pub contest_id: String,
}

/// Session restore request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreSessionRequest {
    /// Session to restore.
    pub session_token: String,
    /// Credential attached to that session.
    pub credential: String,
}

/// Logout request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LogoutRequest {
    /// Credential of the session to end.
    pub credential: String,
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Reply to `login`.
    LoginResult(LoginResult),

    /// Reply to `verify_otp`.
    VerifyOtpResult(VerifyOtpResult),

    /// Reply to `contest_join`.
    ContestJoinResult(ContestJoinResult),

    /// Reply to `check_opponent`.
    CheckOpponentResult(CheckOpponentResult),

    /// Reply to `cancel_find`.
    CancelFindResult(CancelFindResult),

    /// Reply to `restore_session`.
    RestoreSessionResult(RestoreSessionResult),

    /// Reply to `logout`.
    LogoutResult(LogoutResult),

    /// Server-initiated: an opponent was found.
    MatchFound(MatchFoundInfo),

    /// Pong response.
    Pong {
        /// Echoed client timestamp.
        timestamp: u64,
        /// Server time in milliseconds since the epoch.
        server_time: u64,
    },

    /// Error reply.
    Error(ServerError),

    /// Server is shutting down.
    Shutdown {
        /// Reason.
        reason: String,
    },
}

impl ServerMessage {
    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse from JSON.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// Reply status, if this is a reply.
    pub fn status(&self) -> Option<ReplyStatus> {
        match self {
            Self::LoginResult(r) => Some(r.status),
            Self::VerifyOtpResult(r) => Some(r.status),
            Self::ContestJoinResult(r) => Some(r.status),
            Self::CheckOpponentResult(r) => Some(r.status),
            Self::CancelFindResult(r) => Some(r.status),
            Self::RestoreSessionResult(r) => Some(r.status),
            Self::LogoutResult(r) => Some(r.status),
            Self::Error(e) => Some(e.status),
            Self::MatchFound(_) | Self::Pong { .. } | Self::Shutdown { .. } => None,
        }
    }
}

/// Reply status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStatus {
    /// Request completed.
    Success,
    /// Accepted, result not ready yet.
    Pending,
    /// Request failed.
    Error,
}

/// Login reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResult {
    /// Always success.
    pub status: ReplyStatus,
    /// Token to present at verification.
    pub session_token: String,
    /// The code, only on the inline development channel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub otp: Option<String>,
    /// True until the first successful verification.
    pub is_new_user: bool,
}

/// Verification reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyOtpResult {
    /// Always success.
    pub status: ReplyStatus,
    /// Credential for every later request.
    pub credential: String,
    /// Verified user.
    pub user_id: UserId,
    /// User status.
    pub user_status: UserStatus,
}

/// Join reply. Never names an opponent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContestJoinResult {
    /// Always success.
    pub status: ReplyStatus,
    /// Contest joined.
    pub contest_id: ContestId,
    /// Team id when a team name was given.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
    /// Recorded join time.
    pub join_time: DateTime<Utc>,
    /// What the join did.
    pub join_status: JoinOutcome,
}

/// Opponent check reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckOpponentResult {
    /// `success` when matched, `pending` while waiting.
    pub status: ReplyStatus,
    /// Opponent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opponent_user_id: Option<UserId>,
    /// Contest the opponent joined.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opponent_contest_id: Option<ContestId>,
    /// Match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_id: Option<MatchId>,
    /// Caller's turn marker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn: Option<u8>,
    /// Caller's seeded game state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<GameSeed>,
}

impl From<OpponentStatus> for CheckOpponentResult {
    fn from(status: OpponentStatus) -> Self {
        match status {
            OpponentStatus::Pending => Self {
                status: ReplyStatus::Pending,
                opponent_user_id: None,
                opponent_contest_id: None,
                match_id: None,
                turn: None,
                seed: None,
            },
            OpponentStatus::Matched(info) => Self {
                status: ReplyStatus::Success,
                opponent_user_id: Some(info.opponent_user_id),
                opponent_contest_id: Some(info.opponent_contest_id),
                match_id: Some(info.match_id),
                turn: Some(info.turn),
                seed: info.seed,
            },
        }
    }
}

/// Cancellation reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelFindResult {
    /// Always success.
    pub status: ReplyStatus,
    /// Contest left.
    pub contest_id: ContestId,
}

/// Session restore reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreSessionResult {
    /// Always success.
    pub status: ReplyStatus,
    /// Restored user.
    pub user_id: UserId,
}

/// Logout reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogoutResult {
    /// Always success.
    pub status: ReplyStatus,
}

/// Match found notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchFoundInfo {
    /// Opponent.
    pub opponent_user_id: UserId,
    /// Contest the opponent joined.
    pub opponent_contest_id: ContestId,
    /// Match.
    pub match_id: MatchId,
    /// Recipient's turn marker.
    pub turn: u8,
}

impl From<MatchNotice> for MatchFoundInfo {
    fn from(notice: MatchNotice) -> Self {
        Self {
            opponent_user_id: notice.opponent_user_id,
            opponent_contest_id: notice.opponent_contest_id,
            match_id: notice.match_id,
            turn: notice.turn,
        }
    }
}

/// Error reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerError {
    /// Always error.
    pub status: ReplyStatus,
    /// Request this replies to, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    /// Stable error kind.
    pub error_kind: ErrorKind,
    /// Offending field, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// Human-readable message.
    pub message: String,
}

impl ServerError {
    /// Error reply for a failed request.
    pub fn from_service(reply_to: &str, err: &ServiceError) -> Self {
        Self {
            status: ReplyStatus::Error,
            reply_to: Some(reply_to.to_string()),
            error_kind: err.kind(),
            field: err.field().map(str::to_string),
            message: err.client_message(),
        }
    }

    /// Error reply for a frame that could not be parsed.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self {
            status: ReplyStatus::Error,
            reply_to: None,
            error_kind: ErrorKind::FieldInvalid,
            field: None,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AuthFailure;

    #[test]
    fn test_login_roundtrip() {
        let json = r#"{"type":"login","mobile":"9876543210","device_id":"d","push_token":"p"}"#;
        let msg = ClientMessage::from_json(json).unwrap();
        assert_eq!(msg.kind(), "login");
        if let ClientMessage::Login(req) = msg {
            assert_eq!(req.mobile, "9876543210");
            assert_eq!(req.push_token, "p");
        } else {
            panic!("Wrong message type");
        }
    }

    #[test]
    fn test_missing_fields_decode_empty() {
        let msg = ClientMessage::from_json(r#"{"type":"verify_otp","mobile":"9876543210"}"#).unwrap();
        match msg {
            ClientMessage::VerifyOtp(req) => {
                assert!(req.session_token.is_empty());
                assert!(req.otp.is_empty());
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert!(ClientMessage::from_json(r#"{"type":"teleport"}"#).is_err());
        assert!(ClientMessage::from_json("not json").is_err());
    }

    #[test]
    fn test_all_client_messages_serialize() {
        let messages = vec![
            ClientMessage::Login(LoginRequest::default()),
            ClientMessage::VerifyOtp(VerifyOtpRequest::default()),
            ClientMessage::ContestJoin(ContestJoinRequest::default()),
            ClientMessage::CheckOpponent(OpponentRequest::default()),
            ClientMessage::CancelFind(OpponentRequest::default()),
            ClientMessage::RestoreSession(RestoreSessionRequest::default()),
            ClientMessage::Logout(LogoutRequest::default()),
            ClientMessage::Ping { timestamp: 7 },
        ];
        for msg in messages {
            let json = msg.to_json().unwrap();
            let parsed = ClientMessage::from_json(&json).unwrap();
            assert_eq!(parsed.kind(), msg.kind());
        }
    }

    #[test]
    fn test_pending_opponent_shape() {
        let msg = ServerMessage::CheckOpponentResult(OpponentStatus::Pending.into());
        let json = msg.to_json().unwrap();
        assert!(json.contains(r#""type":"check_opponent_result""#));
        assert!(json.contains(r#""status":"pending""#));
        assert!(!json.contains("opponent_user_id"));
        assert_eq!(msg.status(), Some(ReplyStatus::Pending));
    }

    #[test]
    fn test_error_shape() {
        let err = ServiceError::AuthenticationFailed(AuthFailure::DeviceMismatch);
        let msg = ServerMessage::Error(ServerError::from_service("contest_join", &err));
        let json = msg.to_json().unwrap();
        assert!(json.contains(r#""status":"error""#));
        assert!(json.contains(r#""error_kind":"authentication_failed""#));
        assert!(json.contains(r#""field":"device_id""#));
        assert!(json.contains(r#""reply_to":"contest_join""#));

        let parsed = ServerMessage::from_json(&json).unwrap();
        assert_eq!(parsed.status(), Some(ReplyStatus::Error));
    }
}
