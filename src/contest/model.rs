//! Contest Records
//!
//! Rows owned by the contest layer: join records and their FIFO index,
//! match pairs, the pairing outbox and per-player seeded game state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::{ContestId, MatchId, UserId};

/// Number of pieces each player starts with.
pub const PIECES_PER_PLAYER: usize = 4;

// =============================================================================
// JOIN RECORDS
// =============================================================================

/// Join lifecycle. The derive order is the index partition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinStatus {
    /// In the pool, waiting for an opponent.
    Waiting,
    /// Paired.
    Matched,
    /// Left the pool before being paired.
    Cancelled,
}

/// One user's participation in one contest. Keyed by `(user, contest)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRecord {
    /// Joining user.
    pub user_id: UserId,
    /// Contest joined.
    pub contest_id: ContestId,
    /// Lifecycle state.
    pub status: JoinStatus,
    /// FIFO position. Microsecond precision.
    pub joined_at: DateTime<Utc>,
    /// Generated when a team name was supplied.
    pub team_id: Option<String>,
    /// Team name as supplied.
    pub team_name: Option<String>,
    /// Paired opponent.
    pub opponent_user_id: Option<UserId>,
    /// Contest the opponent joined.
    pub opponent_contest_id: Option<ContestId>,
    /// Match this record was paired into.
    pub match_id: Option<MatchId>,
    /// 1 for the earlier joiner, 2 for the later.
    pub turn: Option<u8>,
    /// Last mutation.
    pub updated_at: DateTime<Utc>,
}

impl JoinRecord {
    /// A fresh waiting record.
    pub fn waiting(
        user_id: UserId,
        contest_id: ContestId,
        team_name: Option<String>,
        team_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id,
            contest_id,
            status: JoinStatus::Waiting,
            joined_at: now,
            team_id,
            team_name,
            opponent_user_id: None,
            opponent_contest_id: None,
            match_id: None,
            turn: None,
            updated_at: now,
        }
    }

    /// Point-projection key.
    pub fn key(&self) -> (UserId, ContestId) {
        (self.user_id.clone(), self.contest_id.clone())
    }

    /// FIFO index key for the record's current status.
    pub fn index_key(&self) -> IndexKey {
        IndexKey::new(self.status, &self.contest_id, self.joined_at, &self.user_id)
    }
}

/// FIFO index key. Field order gives scan order: status partition, then
/// contest, then join time, then user as a tiebreak.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IndexKey {
    /// Partition.
    pub status: JoinStatus,
    /// Contest.
    pub contest: ContestId,
    /// Join time in microseconds since the epoch.
    pub joined_at_micros: i64,
    /// User.
    pub user: UserId,
}

impl IndexKey {
    /// Build a key.
    pub fn new(status: JoinStatus, contest: &ContestId, joined_at: DateTime<Utc>, user: &UserId) -> Self {
        Self {
            status,
            contest: contest.clone(),
            joined_at_micros: joined_at.timestamp_micros(),
            user: user.clone(),
        }
    }

    /// Smallest key in the `(status, contest)` partition.
    pub fn partition_start(status: JoinStatus, contest: &ContestId) -> Self {
        Self {
            status,
            contest: contest.clone(),
            joined_at_micros: i64::MIN,
            user: UserId::new(""),
        }
    }

    /// Whether `record` is what this index entry claims it is.
    pub fn describes(&self, record: &JoinRecord) -> bool {
        record.status == self.status
            && record.contest_id == self.contest
            && record.user_id == self.user
            && record.joined_at.timestamp_micros() == self.joined_at_micros
    }
}

// =============================================================================
// MATCHES
// =============================================================================

/// Match lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    /// Created and playable.
    Active,
}

/// What a match stores about each side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchSide {
    /// Player.
    pub user_id: UserId,
    /// Contest joined.
    pub contest_id: ContestId,
    /// Team id, if any.
    pub team_id: Option<String>,
    /// Team name, if any.
    pub team_name: Option<String>,
    /// Original join time.
    pub joined_at: DateTime<Utc>,
}

impl From<&JoinRecord> for MatchSide {
    fn from(record: &JoinRecord) -> Self {
        Self {
            user_id: record.user_id.clone(),
            contest_id: record.contest_id.clone(),
            team_id: record.team_id.clone(),
            team_name: record.team_name.clone(),
            joined_at: record.joined_at,
        }
    }
}

/// A pairing of two users in one contest. Written exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchPair {
    /// Match id.
    pub id: MatchId,
    /// Contest.
    pub contest_id: ContestId,
    /// Earlier joiner.
    pub user1: MatchSide,
    /// Later joiner.
    pub user2: MatchSide,
    /// Lifecycle.
    pub status: MatchStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation.
    pub updated_at: DateTime<Utc>,
}

/// One side of a committed pairing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entrant {
    /// Player.
    pub user_id: UserId,
    /// Join time the pairing was decided on.
    pub joined_at: DateTime<Utc>,
}

/// Outbox row. Presence means the pairing is committed and must be finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairIntent {
    /// Match being created.
    pub match_id: MatchId,
    /// Contest.
    pub contest_id: ContestId,
    /// Earlier joiner (turn 1).
    pub first: Entrant,
    /// Later joiner (turn 2).
    pub second: Entrant,
    /// Commit time.
    pub created_at: DateTime<Utc>,
}

impl PairIntent {
    /// Whether `user` is one of the two entrants.
    pub fn involves(&self, user: &UserId) -> bool {
        &self.first.user_id == user || &self.second.user_id == user
    }
}

// =============================================================================
// GAME SEED
// =============================================================================

/// A starting piece.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Piece {
    /// `piece_1` .. `piece_4`.
    pub piece_id: String,
    /// `player1` or `player2`.
    pub player: String,
    /// Board position.
    pub position: String,
}

/// Initial game state for one player in one match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameSeed {
    /// Match.
    pub match_id: MatchId,
    /// Player.
    pub user_id: UserId,
    /// 1 or 2.
    pub player_slot: u8,
    /// Starting pieces.
    pub pieces: Vec<Piece>,
    /// Dice allocation.
    pub dice_id: Uuid,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl GameSeed {
    /// Fresh state for `slot`.
    pub fn initial(match_id: MatchId, user_id: UserId, slot: u8, now: DateTime<Utc>) -> Self {
        let player = format!("player{}", slot);
        let pieces = (1..=PIECES_PER_PLAYER)
            .map(|n| Piece {
                piece_id: format!("piece_{}", n),
                player: player.clone(),
                position: "initial".to_string(),
            })
            .collect();
        Self {
            match_id,
            user_id,
            player_slot: slot,
            pieces,
            dice_id: Uuid::new_v4(),
            created_at: now,
        }
    }
}
