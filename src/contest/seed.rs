//! Initial game state for new matches.

use std::sync::Arc;
use tracing::debug;

use crate::core::{Clock, MatchId, UserId};
use crate::store::{decide, SharedTable, StoreError, Write};
use super::model::GameSeed;

/// Writes each player's starting state exactly once per match.
pub struct GameSeeder {
    seeds: SharedTable<(MatchId, UserId), GameSeed>,
    clock: Arc<dyn Clock>,
}

impl GameSeeder {
    /// Create a seeder.
    pub fn new(seeds: SharedTable<(MatchId, UserId), GameSeed>, clock: Arc<dyn Clock>) -> Self {
        Self { seeds, clock }
    }

    /// Seed `user` into `slot` of `match_id`. A second call returns the
    /// existing state unchanged.
    pub async fn seed(&self, match_id: MatchId, user: &UserId, slot: u8) -> Result<GameSeed, StoreError> {
        let fresh = GameSeed::initial(match_id, user.clone(), slot, self.clock.now());
        let updated = self
            .seeds
            .update(&(match_id, user.clone()), decide(move |cur: Option<&GameSeed>| match cur {
                Some(_) => Write::Keep,
                None => Write::Put(fresh),
            }))
            .await?;
        if updated.applied {
            debug!("Seeded {} as player {} in match {}", user, slot, match_id);
        }
        updated
            .current
            .ok_or_else(|| StoreError::Backend("seed missing after insert".into()))
    }

    /// Seeded state for one player.
    pub async fn get(&self, match_id: MatchId, user: &UserId) -> Result<Option<GameSeed>, StoreError> {
        self.seeds.get(&(match_id, user.clone())).await
    }

    /// Drop a player's state for a match that was unwound.
    pub async fn discard(&self, match_id: MatchId, user: &UserId) -> Result<(), StoreError> {
        self.seeds.delete(&(match_id, user.clone())).await
    }
}
