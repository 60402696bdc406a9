//! Session Credentials
//!
//! Issues and validates the self-contained credential handed to a player
//! after code verification.
//!
//! ```text
//! credential = HS256-JWT { iat, exp, data }
//! data       = base64url( nonce(12) || AES-256-GCM( json{mobile, device_id, push_token} ) )
//! ```
//!
//! The credential carries no session id. The server never trusts plain-text
//! copies of the three fields sent alongside it: every decision reads the
//! decrypted values returned by [`TokenService::validate`].

use std::collections::HashSet;
use std::sync::Arc;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::Aes256Gcm;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::core::Clock;
use super::AuthConfig;

const NONCE_LEN: usize = 12;

/// The three fields sealed inside a credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialFields {
    /// Mobile number.
    pub mobile: String,
    /// Device identifier.
    pub device_id: String,
    /// Push notification token.
    pub push_token: String,
}

impl CredentialFields {
    fn first_missing(&self) -> Option<&'static str> {
        if self.mobile.is_empty() {
            Some("mobile")
        } else if self.device_id.is_empty() {
            Some("device_id")
        } else if self.push_token.is_empty() {
            Some("push_token")
        } else {
            None
        }
    }
}

/// Registered claims plus the sealed payload. Nothing else is accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CredentialClaims {
    /// Expiry (Unix seconds).
    exp: i64,
    /// Issued at (Unix seconds).
    iat: i64,
    /// Sealed fields.
    data: String,
}

/// Credential errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    /// Signing or encryption secret is absent.
    #[error("credential secrets not configured")]
    NotConfigured,

    /// Signature does not verify.
    #[error("invalid signature")]
    InvalidSignature,

    /// Credential is past its expiry.
    #[error("credential expired")]
    Expired,

    /// Structure could not be parsed.
    #[error("malformed credential: {0}")]
    Malformed(String),

    /// Payload does not decrypt under the server key.
    #[error("credential payload could not be decrypted")]
    DecryptFailed,

    /// A sealed field is absent or empty.
    #[error("credential missing field: {0}")]
    MissingField(&'static str),

    /// Sealing failed while issuing.
    #[error("credential could not be sealed")]
    SealFailed,
}

/// Issues and validates credentials.
pub struct TokenService {
    cipher: Aes256Gcm,
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: chrono::Duration,
    clock: Arc<dyn Clock>,
}

impl TokenService {
    /// Build from config. Both secrets must be present.
    pub fn new(config: &AuthConfig, clock: Arc<dyn Clock>) -> Result<Self, TokenError> {
        let signing = config.signing_secret.as_deref().filter(|s| !s.is_empty());
        let sealing = config.encryption_secret.as_deref().filter(|s| !s.is_empty());
        let (signing, sealing) = match (signing, sealing) {
            (Some(a), Some(b)) => (a, b),
            _ => return Err(TokenError::NotConfigured),
        };

        // AES-256 wants exactly 32 bytes; derive them from the configured secret.
        let key = Sha256::digest(sealing.as_bytes());
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| TokenError::NotConfigured)?;

        Ok(Self {
            cipher,
            encoding: EncodingKey::from_secret(signing.as_bytes()),
            decoding: DecodingKey::from_secret(signing.as_bytes()),
            ttl: chrono::Duration::from_std(config.credential_ttl)
                .unwrap_or_else(|_| chrono::Duration::hours(24)),
            clock,
        })
    }

    /// Issue a credential for the given fields.
    pub fn issue(&self, fields: &CredentialFields) -> Result<String, TokenError> {
        if let Some(field) = fields.first_missing() {
            return Err(TokenError::MissingField(field));
        }
        let now = self.clock.now();
        let claims = CredentialClaims {
            iat: now.timestamp(),
            exp: (now + self.ttl).timestamp(),
            data: self.seal(fields)?,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|_| TokenError::SealFailed)
    }

    /// Validate a credential and return its decrypted fields.
    ///
    /// Order: signature, expiry against the service clock, decryption,
    /// field presence.
    pub fn validate(&self, credential: &str) -> Result<CredentialFields, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.required_spec_claims = HashSet::new();
        validation.validate_exp = false;
        validation.validate_aud = false;

        let claims = decode::<CredentialClaims>(credential, &self.decoding, &validation)
            .map_err(map_jwt_error)?
            .claims;

        if self.clock.now().timestamp() >= claims.exp {
            return Err(TokenError::Expired);
        }

        let fields = self.open(&claims.data)?;
        if let Some(field) = fields.first_missing() {
            return Err(TokenError::MissingField(field));
        }
        Ok(fields)
    }

    fn seal(&self, fields: &CredentialFields) -> Result<String, TokenError> {
        let plaintext = serde_json::to_vec(fields).map_err(|_| TokenError::SealFailed)?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_ref())
            .map_err(|_| TokenError::SealFailed)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(URL_SAFE_NO_PAD.encode(sealed))
    }

    fn open(&self, data: &str) -> Result<CredentialFields, TokenError> {
        let sealed = URL_SAFE_NO_PAD
            .decode(data)
            .map_err(|e| TokenError::Malformed(format!("payload encoding: {}", e)))?;
        if sealed.len() <= NONCE_LEN {
            return Err(TokenError::Malformed("payload too short".into()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(GenericArray::from_slice(nonce), ciphertext)
            .map_err(|_| TokenError::DecryptFailed)?;
        serde_json::from_slice(&plaintext)
            .map_err(|e| TokenError::Malformed(format!("payload body: {}", e)))
    }
}

/// Map JWT library errors to our error type.
fn map_jwt_error(err: jsonwebtoken::errors::Error) -> TokenError {
    use jsonwebtoken::errors::ErrorKind;
    match err.kind() {
        ErrorKind::InvalidSignature => TokenError::InvalidSignature,
        ErrorKind::ExpiredSignature => TokenError::Expired,
        ErrorKind::InvalidAlgorithm => TokenError::InvalidSignature,
        _ => TokenError::Malformed(err.to_string()),
    }
}

// =============================================================================
// TESTS
// =============================================================================
