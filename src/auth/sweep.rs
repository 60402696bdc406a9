//! Expired session and code cleanup.
//!
//! Expiry is always checked inline, so the sweep only reclaims space. A
//! failed or skipped sweep never makes an expired session usable.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::core::{Clock, SessionToken, TaskHandle};
use crate::store::{KeyRange, SharedTable, StoreError};
use super::service::OtpChallenge;
use super::session::{SessionRepository, SessionStatus};

/// What one sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Sessions deleted.
    pub sessions_removed: usize,
    /// Challenges deleted.
    pub challenges_removed: usize,
    /// Expired cache entries evicted.
    pub cache_purged: usize,
}

/// Periodic cleanup of dead sessions and challenges.
pub struct SessionSweeper {
    sessions: Arc<SessionRepository>,
    challenges: SharedTable<String, OtpChallenge>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    batch: usize,
}

impl SessionSweeper {
    /// Create a sweeper.
    pub fn new(
        sessions: Arc<SessionRepository>,
        challenges: SharedTable<String, OtpChallenge>,
        clock: Arc<dyn Clock>,
        interval: Duration,
        batch: usize,
    ) -> Self {
        Self { sessions, challenges, clock, interval, batch: batch.max(1) }
    }

    /// Run one full pass.
    pub async fn sweep_once(&self) -> Result<SweepReport, StoreError> {
        let now = self.clock.now();
        let mut report = SweepReport::default();

        let mut cursor: Option<SessionToken> = None;
        loop {
            let page = self.sessions.scan(cursor.take(), self.batch).await?;
            let full = page.len() == self.batch;
            for session in &page {
                if session.is_expired(now) || session.status == SessionStatus::Revoked {
                    self.sessions.remove(session).await?;
                    report.sessions_removed += 1;
                }
            }
            match page.last() {
                Some(last) if full => cursor = Some(last.token.clone()),
                _ => break,
            }
        }

        let mut range = KeyRange::all();
        loop {
            let page = self.challenges.scan(range, self.batch).await?;
            let full = page.len() == self.batch;
            for (mobile, challenge) in &page {
                if challenge.is_expired(now) || challenge.verified {
                    self.challenges.delete(mobile).await?;
                    report.challenges_removed += 1;
                }
            }
            match page.last() {
                Some((last, _)) if full => range = KeyRange::after(last.clone()),
                _ => break,
            }
        }

        match self.sessions.purge_cache().await {
            Ok(n) => report.cache_purged = n,
            Err(e) => warn!("Cache purge skipped: {}", e),
        }

        if report != SweepReport::default() {
            info!(
                "Swept {} session(s), {} code(s), {} cache entr(ies)",
                report.sessions_removed, report.challenges_removed, report.cache_purged
            );
        }
        Ok(report)
    }

    /// Run [`Self::sweep_once`] every interval until stopped.
    pub fn start(self: Arc<Self>) -> TaskHandle {
        TaskHandle::spawn("session-sweeper", move |mut shutdown| async move {
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = self.sweep_once().await {
                            warn!("Session sweep failed: {}", e);
                        }
                    }
                    _ = shutdown.recv() => {
                        debug!("Session sweeper shutting down");
                        break;
                    }
                }
            }
        })
    }
}
