//! Authentication
//!
//! Login, one-time code verification, credentials and sessions.
//!
//! ```text
//!   login ──► CodePending ──verify_code──► Authenticated
//!                 │                              │
//!                 └──── next login on device ────┴──► Revoked
//! ```

pub mod delivery;
pub mod service;
pub mod session;
pub mod sweep;
pub mod token;

use std::time::Duration;

pub use delivery::{CodeDelivery, Delivery, DeliveryError, InlineDelivery, LogDelivery};
pub use service::{AuthService, LoginOutcome, OtpChallenge, UserIdentity, UserStatus, VerifiedSession};
pub use session::{AuthContext, ConnectionBinding, Session, SessionCoordinator, SessionRepository, SessionStatus};
pub use sweep::{SessionSweeper, SweepReport};
pub use token::{CredentialFields, TokenError, TokenService};

/// Authentication configuration.
#[derive(Clone, Debug)]
pub struct AuthConfig {
    /// HS256 secret used to sign credentials.
    pub signing_secret: Option<String>,
    /// Secret the credential encryption key is derived from.
    pub encryption_secret: Option<String>,
    /// Credential lifetime.
    pub credential_ttl: Duration,
    /// Session lifetime.
    pub session_ttl: Duration,
    /// One-time code lifetime.
    pub otp_ttl: Duration,
    /// Wrong codes allowed per challenge.
    pub otp_max_attempts: u32,
    /// Echo the code in the login response (development only).
    pub inline_code_delivery: bool,
    /// How often expired sessions and codes are swept.
    pub sweep_interval: Duration,
    /// Rows examined per sweep page.
    pub sweep_batch: usize,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            signing_secret: None,
            encryption_secret: None,
            credential_ttl: Duration::from_secs(24 * 3600),
            session_ttl: Duration::from_secs(24 * 3600),
            otp_ttl: Duration::from_secs(5 * 60),
            otp_max_attempts: 5,
            inline_code_delivery: true,
            sweep_interval: Duration::from_secs(5 * 60),
            sweep_batch: 500,
        }
    }
}

impl AuthConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let secs = |name: &str, fallback: Duration| {
            std::env::var(name)
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|v| *v > 0)
                .map(Duration::from_secs)
                .unwrap_or(fallback)
        };
        Self {
            signing_secret: std::env::var("CREDENTIAL_SIGNING_SECRET").ok(),
            encryption_secret: std::env::var("CREDENTIAL_ENCRYPTION_KEY").ok(),
            credential_ttl: secs("CREDENTIAL_TTL_SECS", defaults.credential_ttl),
            session_ttl: secs("SESSION_TTL_SECS", defaults.session_ttl),
            otp_ttl: secs("OTP_TTL_SECS", defaults.otp_ttl),
            otp_max_attempts: defaults.otp_max_attempts,
            inline_code_delivery: std::env::var("OTP_INLINE_DELIVERY")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(defaults.inline_code_delivery),
            sweep_interval: secs("SWEEP_INTERVAL_SECS", defaults.sweep_interval),
            sweep_batch: defaults.sweep_batch,
        }
    }

    /// Check if credential secrets are configured.
    pub fn is_configured(&self) -> bool {
        self.signing_secret.as_deref().map_or(false, |s| !s.is_empty())
            && self.encryption_secret.as_deref().map_or(false, |s| !s.is_empty())
    }
}
