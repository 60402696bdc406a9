//! Opponent lookup and pool cancellation.

use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::auth::AuthContext;
use crate::core::{Clock, ContestId, MatchId, UserId};
use crate::error::{AuthFailure, ServiceError};
use crate::store::{decide, Write};
use super::join::{validate_contest_id, JoinRepository};
use super::model::{GameSeed, JoinRecord, JoinStatus};
use super::seed::GameSeeder;

/// A resolved opponent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpponentInfo {
    /// Match both users were paired into.
    pub match_id: MatchId,
    /// Opponent.
    pub opponent_user_id: UserId,
    /// Contest the opponent joined.
    pub opponent_contest_id: ContestId,
    /// Caller's turn marker.
    pub turn: u8,
    /// Caller's seeded game state.
    pub seed: Option<GameSeed>,
}

/// Result of [`OpponentService::check_opponent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpponentStatus {
    /// Still waiting.
    Pending,
    /// Paired.
    Matched(OpponentInfo),
}

/// Result of [`OpponentService::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Left the pool now.
    Cancelled,
    /// Was already out of the pool.
    AlreadyCancelled,
}

/// Read-only opponent resolution plus cancellation.
pub struct OpponentService {
    joins: Arc<JoinRepository>,
    seeder: Arc<GameSeeder>,
    clock: Arc<dyn Clock>,
}

impl OpponentService {
    /// Create the service.
    pub fn new(joins: Arc<JoinRepository>, seeder: Arc<GameSeeder>, clock: Arc<dyn Clock>) -> Self {
        Self { joins, seeder, clock }
    }

    /// Where the caller stands in `contest_id`. Never pairs anyone.
    #[instrument(skip(self, ctx), fields(user = %ctx.user_id))]
    pub async fn check_opponent(
        &self,
        ctx: &AuthContext,
        user_id: &str,
        contest_id: &str,
    ) -> Result<OpponentStatus, ServiceError> {
        let (user, contest) = Self::authorize_target(ctx, user_id, contest_id)?;
        let record = self.joins.get(&user, &contest).await?;
        match record {
            Some(JoinRecord { status: JoinStatus::Waiting, .. }) => Ok(OpponentStatus::Pending),
            Some(record @ JoinRecord { status: JoinStatus::Matched, .. }) => {
                let (match_id, opponent_user_id, opponent_contest_id) =
                    match (record.match_id, record.opponent_user_id, record.opponent_contest_id) {
                        (Some(m), Some(u), Some(c)) => (m, u, c),
                        _ => return Err(ServiceError::Internal("matched record without opponent".into())),
                    };
                let seed = self.seeder.get(match_id, &user).await?;
                Ok(OpponentStatus::Matched(OpponentInfo {
                    match_id,
                    opponent_user_id,
                    opponent_contest_id,
                    turn: record.turn.unwrap_or(0),
                    seed,
                }))
            }
            Some(JoinRecord { status: JoinStatus::Cancelled, .. }) | None => Err(ServiceError::NotFound("join record")),
        }
    }

    /// Leave the waiting pool of `contest_id`.
    #[instrument(skip(self, ctx), fields(user = %ctx.user_id))]
    pub async fn cancel(&self, ctx: &AuthContext, user_id: &str, contest_id: &str) -> Result<CancelOutcome, ServiceError> {
        let (user, contest) = Self::authorize_target(ctx, user_id, contest_id)?;
        let now = self.clock.now();
        let updated = self
            .joins
            .update(&(user.clone(), contest.clone()), decide(move |cur: Option<&JoinRecord>| match cur {
                Some(r) if r.status == JoinStatus::Waiting => Write::Put(JoinRecord {
                    status: JoinStatus::Cancelled,
                    updated_at: now,
                    ..r.clone()
                }),
                _ => Write::Keep,
            }))
            .await?;

        match (updated.applied, updated.previous, updated.current) {
            (true, Some(previous), Some(current)) => {
                if let Err(e) = self.joins.move_index(&previous.index_key(), current.index_key()).await {
                    warn!("Index move for cancelled join deferred to reconcile: {}", e);
                }
                info!("User {} left the pool of {}", user, contest);
                Ok(CancelOutcome::Cancelled)
            }
            (_, _, Some(current)) => match current.status {
                JoinStatus::Matched => Err(ServiceError::AlreadyMatched),
                _ => Ok(CancelOutcome::AlreadyCancelled),
            },
            (_, _, None) => Err(ServiceError::NotFound("join record")),
        }
    }

    /// The request's `user_id` must be the authenticated user.
    fn authorize_target(ctx: &AuthContext, user_id: &str, contest_id: &str) -> Result<(UserId, ContestId), ServiceError> {
        if user_id.is_empty() {
            return Err(ServiceError::FieldMissing("user_id"));
        }
        let contest = validate_contest_id(contest_id)?;
        if ctx.user_id.as_str() != user_id {
            return Err(AuthFailure::UserMismatch.into());
        }
        Ok((ctx.user_id.clone(), contest))
    }
}
