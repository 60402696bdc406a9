//! Session Storage and Coordination
//!
//! [`SessionRepository`] keeps sessions in two tiers:
//!
//! - durable table (source of truth), plus a `(device, token)` index used to
//!   find every session bound to a device
//! - cache entry `session:{token}` with TTL equal to the remaining lifetime
//!
//! Writes go durable first, then cache. If the cache write fails the key is
//! deleted instead; if that delete also fails the write is reported as a
//! store failure, so a stale cache entry can never outlive a revocation
//! silently. Reads go cache first and fall back to the durable tier.
//!
//! Connection bindings (`conn:{id}` → session) live only in the cache tier.
//!
//! [`SessionCoordinator`] enforces the rules on top: one active session per
//! device, inline expiry checks, and credential-to-session matching.

use std::sync::Arc;
use std::time::Duration;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::core::{Clock, ConnectionId, SessionToken, UserId};
use crate::error::{AuthFailure, ServiceError};
use crate::store::{decode, decide, encode, CacheStore, KeyRange, SharedTable, StoreError, Write};
use super::token::{CredentialFields, TokenService};

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Login done, code not yet verified.
    CodePending,
    /// Code verified, credential attached.
    Active,
    /// Superseded or logged out.
    Revoked,
}

/// A login session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Opaque token handed to the client at login.
    pub token: SessionToken,
    /// Owning user.
    pub user_id: UserId,
    /// Mobile number used at login.
    pub mobile: String,
    /// Device the session is bound to.
    pub device_id: String,
    /// Push token supplied at login.
    pub push_token: String,
    /// Credential attached on verification.
    pub credential: Option<String>,
    /// Lifecycle state.
    pub status: SessionStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Hard expiry.
    pub expires_at: DateTime<Utc>,
    /// Last mutation.
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// A fresh session awaiting code verification.
    pub fn pending(
        token: SessionToken,
        user_id: UserId,
        fields: &CredentialFields,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(24));
        Self {
            token,
            user_id,
            mobile: fields.mobile.clone(),
            device_id: fields.device_id.clone(),
            push_token: fields.push_token.clone(),
            credential: None,
            status: SessionStatus::CodePending,
            created_at: now,
            expires_at: now + ttl,
            updated_at: now,
        }
    }

    /// Whether `now` is at or past the expiry.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Active and unexpired.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.status == SessionStatus::Active && !self.is_expired(now)
    }

    /// Lifetime left, if any.
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        (self.expires_at - now).to_std().ok().filter(|d| !d.is_zero())
    }

    /// The credential fields this session was opened with.
    pub fn fields(&self) -> CredentialFields {
        CredentialFields {
            mobile: self.mobile.clone(),
            device_id: self.device_id.clone(),
            push_token: self.push_token.clone(),
        }
    }
}

/// What a connection is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionBinding {
    /// Bound session.
    pub session_token: SessionToken,
    /// Owner of that session.
    pub user_id: UserId,
}

/// Identity established for one request. Built from decrypted credential
/// fields, never from plain-text request fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    /// Authenticated user.
    pub user_id: UserId,
    /// Mobile number from the credential.
    pub mobile: String,
    /// Device from the credential.
    pub device_id: String,
    /// Push token from the credential.
    pub push_token: String,
    /// Session the request runs under.
    pub session_token: SessionToken,
}

fn session_key(token: &SessionToken) -> String {
    format!("session:{}", token)
}

fn binding_key(conn: ConnectionId) -> String {
    format!("conn:{}", conn.get())
}

// =============================================================================
// REPOSITORY
// =============================================================================

/// Two-tier session storage.
pub struct SessionRepository {
    sessions: SharedTable<SessionToken, Session>,
    by_device: SharedTable<(String, SessionToken), ()>,
    cache: Arc<dyn CacheStore>,
    clock: Arc<dyn Clock>,
}

impl SessionRepository {
    /// Create a repository over the given stores.
    pub fn new(
        sessions: SharedTable<SessionToken, Session>,
        by_device: SharedTable<(String, SessionToken), ()>,
        cache: Arc<dyn CacheStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { sessions, by_device, cache, clock }
    }

    /// Persist a session in both tiers.
    pub async fn save(&self, session: &Session) -> Result<(), StoreError> {
        self.sessions.put(session.token.clone(), session.clone()).await?;
        self.by_device
            .put((session.device_id.clone(), session.token.clone()), ())
            .await?;
        self.refresh_cache(session).await
    }

    /// Load a session, cache first.
    ///
    /// Cache entries that are expired or revoked are evicted and the durable
    /// tier is consulted instead. Callers still check status and expiry.
    pub async fn load(&self, token: &SessionToken) -> Result<Option<Session>, StoreError> {
        let key = session_key(token);
        let now = self.clock.now();

        match self.cache.get(&key).await {
            Ok(Some(bytes)) => match decode::<Session>(&bytes) {
                Ok(session) if !session.is_expired(now) && session.status != SessionStatus::Revoked => {
                    return Ok(Some(session));
                }
                Ok(_) | Err(_) => {
                    if let Err(e) = self.cache.delete(&key).await {
                        warn!("Failed to evict stale session {}: {}", token.short(), e);
                    }
                }
            },
            Ok(None) => {}
            Err(e) => warn!("Session cache read failed for {}: {}", token.short(), e),
        }

        let session = self.sessions.get(token).await?;
        if let Some(ref s) = session {
            if s.status != SessionStatus::Revoked && !s.is_expired(now) {
                if let Err(e) = self.refresh_cache(s).await {
                    warn!("Failed to repopulate session cache for {}: {}", token.short(), e);
                }
            }
        }
        Ok(session)
    }

    /// Conditionally rewrite a session. `change` returns `None` to leave it.
    pub async fn modify<F>(&self, token: &SessionToken, change: F) -> Result<Option<Session>, StoreError>
    where
        F: FnOnce(&Session) -> Option<Session> + Send + 'static,
    {
        let updated = self
            .sessions
            .update(token, decide(move |cur: Option<&Session>| match cur.and_then(change) {
                Some(next) => Write::Put(next),
                None => Write::Keep,
            }))
            .await?;
        if let (true, Some(current)) = (updated.applied, updated.current.as_ref()) {
            self.refresh_cache(current).await?;
        }
        Ok(if updated.applied { updated.current } else { None })
    }

    /// Mark a session revoked. Returns the revoked session if it changed.
    pub async fn revoke(&self, token: &SessionToken) -> Result<Option<Session>, StoreError> {
        let now = self.clock.now();
        self.modify(token, move |s| {
            (s.status != SessionStatus::Revoked).then(|| Session {
                status: SessionStatus::Revoked,
                updated_at: now,
                ..s.clone()
            })
        })
        .await
    }

    /// Tokens of every session recorded against `device_id`.
    pub async fn device_tokens(&self, device_id: &str) -> Result<Vec<SessionToken>, StoreError> {
        let start = (device_id.to_string(), SessionToken::new(""));
        let end = (format!("{}\0", device_id), SessionToken::new(""));
        let rows = self.by_device.scan(KeyRange::half_open(start, end), usize::MAX).await?;
        Ok(rows.into_iter().map(|((_, token), ())| token).collect())
    }

    /// Page through durable sessions in token order.
    pub async fn scan(&self, after: Option<SessionToken>, limit: usize) -> Result<Vec<Session>, StoreError> {
        let range = match after {
            Some(token) => KeyRange::after(token),
            None => KeyRange::all(),
        };
        let rows = self.sessions.scan(range, limit).await?;
        Ok(rows.into_iter().map(|(_, s)| s).collect())
    }

    /// Reclaim expired cache entries that were never read again.
    pub async fn purge_cache(&self) -> Result<usize, StoreError> {
        self.cache.purge_expired().await
    }

    /// Remove a session from every tier.
    pub async fn remove(&self, session: &Session) -> Result<(), StoreError> {
        self.sessions.delete(&session.token).await?;
        self.by_device
            .delete(&(session.device_id.clone(), session.token.clone()))
            .await?;
        self.cache.delete(&session_key(&session.token)).await
    }

    /// Bind a connection to a session for the session's remaining lifetime.
    pub async fn bind(&self, conn: ConnectionId, session: &Session) -> Result<(), StoreError> {
        let ttl = match session.remaining(self.clock.now()) {
            Some(ttl) => ttl,
            None => return Ok(()),
        };
        let binding = ConnectionBinding {
            session_token: session.token.clone(),
            user_id: session.user_id.clone(),
        };
        self.cache.set(&binding_key(conn), encode(&binding)?, ttl).await
    }

    /// Session bound to a connection.
    pub async fn binding(&self, conn: ConnectionId) -> Result<Option<ConnectionBinding>, StoreError> {
        match self.cache.get(&binding_key(conn)).await? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Drop a connection binding.
    pub async fn unbind(&self, conn: ConnectionId) -> Result<(), StoreError> {
        self.cache.delete(&binding_key(conn)).await
    }

    async fn refresh_cache(&self, session: &Session) -> Result<(), StoreError> {
        let key = session_key(&session.token);
        if session.status != SessionStatus::Revoked {
            if let Some(ttl) = session.remaining(self.clock.now()) {
                match self.cache.set(&key, encode(session)?, ttl).await {
                    Ok(()) => return Ok(()),
                    Err(e) => warn!("Session cache write failed for {}: {}", session.token.short(), e),
                }
            }
        }
        // Never leave an entry that disagrees with the durable tier.
        self.cache.delete(&key).await
    }
}

// =============================================================================
// COORDINATOR
// =============================================================================

/// Session rules: device exclusivity, binding and per-request authorization.
pub struct SessionCoordinator {
    repo: Arc<SessionRepository>,
    tokens: Arc<TokenService>,
    clock: Arc<dyn Clock>,
}

impl SessionCoordinator {
    /// Create a coordinator.
    pub fn new(repo: Arc<SessionRepository>, tokens: Arc<TokenService>, clock: Arc<dyn Clock>) -> Self {
        Self { repo, tokens, clock }
    }

    /// Underlying repository.
    pub fn repo(&self) -> &Arc<SessionRepository> {
        &self.repo
    }

    /// Store a new pending session, revoking every other session on its device.
    #[instrument(skip(self, session), fields(device = %session.device_id))]
    pub async fn open_pending(&self, session: &Session) -> Result<(), ServiceError> {
        let revoked = self.revoke_device(&session.device_id, None).await?;
        if revoked > 0 {
            info!("Revoked {} earlier session(s) on device", revoked);
        }
        self.repo.save(session).await?;
        Ok(())
    }

    /// Attach a credential and activate. Any other session on the same device
    /// that became active meanwhile is revoked afterwards.
    pub async fn activate(&self, token: &SessionToken, credential: String) -> Result<Session, ServiceError> {
        let now = self.clock.now();
        let activated = self
            .repo
            .modify(token, move |s| {
                (s.status == SessionStatus::CodePending && !s.is_expired(now)).then(|| Session {
                    status: SessionStatus::Active,
                    credential: Some(credential),
                    updated_at: now,
                    ..s.clone()
                })
            })
            .await?;

        let session = match activated {
            Some(session) => session,
            None => {
                return Err(match self.repo.load(token).await? {
                    None => AuthFailure::SessionNotFound,
                    Some(s) if s.is_expired(now) => AuthFailure::SessionExpired,
                    Some(_) => AuthFailure::SessionInactive,
                }
                .into())
            }
        };

        self.revoke_device(&session.device_id, Some(token)).await?;
        Ok(session)
    }

    /// Revoke every non-revoked session on `device_id` except `keep`.
    pub async fn revoke_device(&self, device_id: &str, keep: Option<&SessionToken>) -> Result<usize, ServiceError> {
        let mut revoked = 0;
        for token in self.repo.device_tokens(device_id).await? {
            if Some(&token) == keep {
                continue;
            }
            if self.repo.revoke(&token).await?.is_some() {
                debug!("Revoked session {}", token.short());
                revoked += 1;
            }
        }
        Ok(revoked)
    }

    /// Bind a connection to a session.
    pub async fn bind(&self, conn: ConnectionId, session: &Session) -> Result<(), ServiceError> {
        self.repo.bind(conn, session).await?;
        debug!("Bound {} to session {}", conn, session.token.short());
        Ok(())
    }

    /// Authorize a request on `conn` presenting `credential`.
    pub async fn authorize(&self, conn: ConnectionId, credential: &str) -> Result<AuthContext, ServiceError> {
        if credential.is_empty() {
            return Err(ServiceError::FieldMissing("credential"));
        }
        let fields = self.tokens.validate(credential)?;
        let binding = self.repo.binding(conn).await?.ok_or(AuthFailure::NotBound)?;
        let session = self.live_session(&binding.session_token).await?;
        Self::check_session(&session, &fields, credential)?;
        Ok(Self::context(&session, fields))
    }

    /// Rebind a new connection to an existing session without a new login.
    #[instrument(skip(self, credential), fields(session = %token.short()))]
    pub async fn restore(
        &self,
        conn: ConnectionId,
        token: &SessionToken,
        credential: &str,
    ) -> Result<AuthContext, ServiceError> {
        if token.is_empty() {
            return Err(ServiceError::FieldMissing("session_token"));
        }
        if credential.is_empty() {
            return Err(ServiceError::FieldMissing("credential"));
        }
        let fields = self.tokens.validate(credential)?;
        let session = self.live_session(token).await?;
        Self::check_session(&session, &fields, credential)?;
        self.bind(conn, &session).await?;
        info!("Restored session on {}", conn);
        Ok(Self::context(&session, fields))
    }

    /// Drop only the connection binding. The session stays valid.
    pub async fn disconnect(&self, conn: ConnectionId) -> Result<(), ServiceError> {
        self.repo.unbind(conn).await?;
        Ok(())
    }

    /// Revoke the session behind `conn` and drop the binding.
    pub async fn logout(&self, conn: ConnectionId, credential: &str) -> Result<AuthContext, ServiceError> {
        let ctx = self.authorize(conn, credential).await?;
        self.repo.revoke(&ctx.session_token).await?;
        self.repo.unbind(conn).await?;
        info!("Session {} logged out", ctx.session_token.short());
        Ok(ctx)
    }

    async fn live_session(&self, token: &SessionToken) -> Result<Session, ServiceError> {
        let session = self.repo.load(token).await?.ok_or(AuthFailure::SessionNotFound)?;
        let now = self.clock.now();
        if session.is_expired(now) {
            return Err(AuthFailure::SessionExpired.into());
        }
        if session.status != SessionStatus::Active {
            return Err(AuthFailure::SessionInactive.into());
        }
        Ok(session)
    }

    fn check_session(session: &Session, fields: &CredentialFields, credential: &str) -> Result<(), AuthFailure> {
        if fields.mobile != session.mobile {
            return Err(AuthFailure::MobileMismatch);
        }
        if fields.device_id != session.device_id {
            return Err(AuthFailure::DeviceMismatch);
        }
        if session.credential.as_deref() != Some(credential) {
            return Err(AuthFailure::CredentialMismatch);
        }
        Ok(())
    }

    fn context(session: &Session, fields: CredentialFields) -> AuthContext {
        AuthContext {
            user_id: session.user_id.clone(),
            mobile: fields.mobile,
            device_id: fields.device_id,
            push_token: fields.push_token,
            session_token: session.token.clone(),
        }
    }
}
