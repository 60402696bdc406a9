//! Login and Code Verification
//!
//! The per-player authentication state machine:
//!
//! 1. `login` validates the request, finds or creates the user, revokes every
//!    other session on the device, stores a pending session and a fresh
//!    one-time code challenge keyed by mobile.
//! 2. `verify_code` checks the code against the challenge. Each wrong code is
//!    durably counted before the rejection is returned; once the limit is
//!    reached even the right code is refused.
//! 3. On success the connection is bound and a credential minted, then the
//!    challenge is consumed, the user activated and the credential attached
//!    to the session.

use std::sync::Arc;
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::core::{Clock, ConnectionId, SessionToken, UserId};
use crate::error::{AuthFailure, ServiceError};
use crate::store::{decide, SharedTable, Write};
use super::delivery::{mask_mobile, CodeDelivery, Delivery};
use super::session::{Session, SessionCoordinator, SessionStatus};
use super::token::{CredentialFields, TokenService};
use super::AuthConfig;

const MOBILE_LEN: usize = 10;
const CODE_LEN: usize = 6;
const MAX_FIELD_LEN: usize = 512;

/// User lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    /// Created at login, never verified.
    PendingOtp,
    /// Verified at least once.
    Active,
}

/// A player account keyed by mobile number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    /// Stable user id.
    pub id: UserId,
    /// Mobile number (unique).
    pub mobile: String,
    /// Lifecycle state.
    pub status: UserStatus,
    /// Preferred language.
    pub language: Option<String>,
    /// Region.
    pub region: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation.
    pub updated_at: DateTime<Utc>,
}

impl UserIdentity {
    fn new(mobile: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: UserId::generate(),
            mobile: mobile.to_string(),
            status: UserStatus::PendingOtp,
            language: None,
            region: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Outstanding one-time code for a mobile number. Superseded by the next login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtpChallenge {
    /// Mobile the code was issued for.
    pub mobile: String,
    /// Session the code verifies.
    pub session_token: SessionToken,
    /// The six-digit code.
    pub code: String,
    /// Expiry.
    pub expires_at: DateTime<Utc>,
    /// Wrong codes seen so far.
    pub attempts: u32,
    /// Consumed.
    pub verified: bool,
    /// Issue time.
    pub created_at: DateTime<Utc>,
}

impl OtpChallenge {
    /// Whether `now` is at or past the expiry.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    fn belongs_to(&self, token: &SessionToken) -> bool {
        !self.verified && &self.session_token == token
    }
}

/// Result of a login.
#[derive(Debug, Clone)]
pub struct LoginOutcome {
    /// New session token.
    pub session_token: SessionToken,
    /// User the session belongs to.
    pub user_id: UserId,
    /// True until the user verifies a code for the first time.
    pub is_new_user: bool,
    /// The code, only when the inline channel is configured.
    pub code: Option<String>,
}

/// Result of a successful verification.
#[derive(Debug, Clone)]
pub struct VerifiedSession {
    /// Issued credential.
    pub credential: String,
    /// Verified user.
    pub user_id: UserId,
    /// Now-active session.
    pub session_token: SessionToken,
    /// User status after verification.
    pub user_status: UserStatus,
}

/// Login and verification.
pub struct AuthService {
    config: AuthConfig,
    users: SharedTable<String, UserIdentity>,
    challenges: SharedTable<String, OtpChallenge>,
    sessions: Arc<SessionCoordinator>,
    tokens: Arc<TokenService>,
    delivery: Arc<dyn CodeDelivery>,
    clock: Arc<dyn Clock>,
}

impl AuthService {
    /// Create the service.
    pub fn new(
        config: AuthConfig,
        users: SharedTable<String, UserIdentity>,
        challenges: SharedTable<String, OtpChallenge>,
        sessions: Arc<SessionCoordinator>,
        tokens: Arc<TokenService>,
        delivery: Arc<dyn CodeDelivery>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { config, users, challenges, sessions, tokens, delivery, clock }
    }

    /// Session coordinator used by this service.
    pub fn sessions(&self) -> &Arc<SessionCoordinator> {
        &self.sessions
    }

    /// Start a login: Anonymous → CodePending.
    #[instrument(skip_all, fields(mobile = %mask_mobile(mobile)))]
    pub async fn login(&self, mobile: &str, device_id: &str, push_token: &str) -> Result<LoginOutcome, ServiceError> {
        validate_mobile(mobile)?;
        validate_opaque("device_id", device_id)?;
        validate_opaque("push_token", push_token)?;

        let now = self.clock.now();
        let fresh = UserIdentity::new(mobile, now);
        let user = self
            .users
            .update(&mobile.to_string(), decide(move |cur: Option<&UserIdentity>| match cur {
                Some(_) => Write::Keep,
                None => Write::Put(fresh),
            }))
            .await?
            .current
            .ok_or_else(|| ServiceError::Internal("user row vanished".into()))?;
        let is_new_user = user.status == UserStatus::PendingOtp;

        let token = generate_session_token();
        let code = generate_code();
        let fields = CredentialFields {
            mobile: mobile.to_string(),
            device_id: device_id.to_string(),
            push_token: push_token.to_string(),
        };
        let session = Session::pending(token.clone(), user.id.clone(), &fields, now, self.config.session_ttl);
        self.sessions.open_pending(&session).await?;

        let otp_ttl = chrono::Duration::from_std(self.config.otp_ttl)
            .unwrap_or_else(|_| chrono::Duration::minutes(5));
        let challenge = OtpChallenge {
            mobile: mobile.to_string(),
            session_token: token.clone(),
            code: code.clone(),
            expires_at: now + otp_ttl,
            attempts: 0,
            verified: false,
            created_at: now,
        };
        self.challenges.put(mobile.to_string(), challenge).await?;

        let delivered = self.delivery.deliver(mobile, &code).await?;
        info!("Login started for user {} (new: {})", user.id, is_new_user);

        Ok(LoginOutcome {
            session_token: token,
            user_id: user.id,
            is_new_user,
            code: match delivered {
                Delivery::Inline(code) if self.config.inline_code_delivery => Some(code),
                _ => None,
            },
        })
    }

    /// Verify a code: CodePending → Authenticated. Binds `conn` on success.
    #[instrument(skip_all, fields(mobile = %mask_mobile(mobile)))]
    pub async fn verify_code(
        &self,
        conn: ConnectionId,
        mobile: &str,
        session_token: &str,
        code: &str,
    ) -> Result<VerifiedSession, ServiceError> {
        validate_mobile(mobile)?;
        if session_token.is_empty() {
            return Err(ServiceError::FieldMissing("session_token"));
        }
        validate_code(code)?;

        let token = SessionToken::new(session_token);
        let now = self.clock.now();
        let session = self
            .sessions
            .repo()
            .load(&token)
            .await?
            .ok_or(AuthFailure::SessionNotFound)?;
        if session.mobile != mobile {
            return Err(AuthFailure::MobileMismatch.into());
        }
        if session.status == SessionStatus::Revoked {
            return Err(AuthFailure::SessionInactive.into());
        }
        if session.is_expired(now) {
            return Err(AuthFailure::SessionExpired.into());
        }

        let max_attempts = self.config.otp_max_attempts;
        let challenge = match self.challenges.get(&mobile.to_string()).await? {
            Some(c) if c.belongs_to(&token) => c,
            _ => return Err(ServiceError::CodeInvalid),
        };
        if challenge.attempts >= max_attempts {
            return Err(ServiceError::CodeAttemptsExceeded);
        }
        if challenge.is_expired(now) {
            return Err(ServiceError::CodeExpired);
        }

        if challenge.code != code {
            let counted_token = token.clone();
            let counted = self
                .challenges
                .update(&mobile.to_string(), decide(move |cur: Option<&OtpChallenge>| match cur {
                    Some(c) if c.belongs_to(&counted_token) => Write::Put(OtpChallenge {
                        attempts: c.attempts + 1,
                        ..c.clone()
                    }),
                    _ => Write::Keep,
                }))
                .await?;
            let attempts = counted.current.map(|c| c.attempts).unwrap_or(0);
            warn!("Wrong code for session {} ({}/{})", token.short(), attempts, max_attempts);
            return Err(ServiceError::CodeInvalid);
        }

        // Everything that can fail transiently goes before the challenge is
        // consumed, so a retry with the same code still works.
        let credential = self.tokens.issue(&session.fields())?;
        self.sessions.bind(conn, &session).await?;

        let consume_token = token.clone();
        let submitted = code.to_string();
        let consumed = self
            .challenges
            .update(&mobile.to_string(), decide(move |cur: Option<&OtpChallenge>| match cur {
                Some(c) if c.belongs_to(&consume_token) && c.attempts < max_attempts && c.code == submitted => {
                    Write::Put(OtpChallenge { verified: true, ..c.clone() })
                }
                _ => Write::Keep,
            }))
            .await?;
        if !consumed.applied {
            // Lost a race with another attempt on the same challenge.
            return Err(match consumed.current {
                Some(c) if c.attempts >= max_attempts => ServiceError::CodeAttemptsExceeded,
                _ => ServiceError::CodeInvalid,
            });
        }

        let user = self
            .users
            .update(&mobile.to_string(), decide(move |cur: Option<&UserIdentity>| match cur {
                Some(u) if u.status != UserStatus::Active => Write::Put(UserIdentity {
                    status: UserStatus::Active,
                    updated_at: now,
                    ..u.clone()
                }),
                _ => Write::Keep,
            }))
            .await?
            .current
            .ok_or(ServiceError::NotFound("user"))?;

        let session = self.sessions.activate(&token, credential.clone()).await?;

        info!("User {} verified on {}", user.id, conn);
        debug!("Session {} active until {}", token.short(), session.expires_at);

        Ok(VerifiedSession {
            credential,
            user_id: user.id,
            session_token: token,
            user_status: user.status,
        })
    }
}

// =============================================================================
// VALIDATION
// =============================================================================

fn validate_mobile(mobile: &str) -> Result<(), ServiceError> {
    if mobile.is_empty() {
        return Err(ServiceError::FieldMissing("mobile"));
    }
    if mobile.len() != MOBILE_LEN || !mobile.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ServiceError::invalid("mobile", "must be exactly 10 digits"));
    }
    Ok(())
}

fn validate_opaque(field: &'static str, value: &str) -> Result<(), ServiceError> {
    if value.trim().is_empty() {
        return Err(ServiceError::FieldMissing(field));
    }
    if value.len() > MAX_FIELD_LEN {
        return Err(ServiceError::invalid(field, "too long"));
    }
    Ok(())
}

fn validate_code(code: &str) -> Result<(), ServiceError> {
    if code.is_empty() {
        return Err(ServiceError::FieldMissing("otp"));
    }
    if code.len() != CODE_LEN || !code.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ServiceError::invalid("otp", "must be exactly 6 digits"));
    }
    Ok(())
}

fn generate_code() -> String {
    OsRng.gen_range(100_000..=999_999u32).to_string()
}

fn generate_session_token() -> SessionToken {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    SessionToken::new(hex::encode(bytes))
}

// =============================================================================
// TESTS
// =============================================================================
