//! Contests
//!
//! Joining a contest's waiting pool, pairing waiting users, and resolving
//! or cancelling a pairing.
//!
//! ```text
//!  contest_join ──► JoinRecord(waiting) ──tick──► MatchPair + GameSeed
//!        │                 │                            │
//!   cancel_find ──► cancelled                check_opponent (read only)
//! ```

pub mod join;
pub mod model;
pub mod opponent;
pub mod reconcile;
pub mod scheduler;
pub mod seed;

pub use join::{ContestJoinHandler, JoinAck, JoinOutcome, JoinRepository};
pub use model::{GameSeed, IndexKey, JoinRecord, JoinStatus, MatchPair, PairIntent, Piece};
pub use opponent::{CancelOutcome, OpponentInfo, OpponentService, OpponentStatus};
pub use reconcile::{ReconcileReport, ReconcileSweep};
pub use scheduler::{MatchNotice, MatchNotifier, MatchmakingConfig, MatchmakingScheduler, TickReport};
pub use seed::GameSeeder;
