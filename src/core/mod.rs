//! Core primitives shared by every layer.
//!
//! Identifier newtypes, the clock abstraction and owned background tasks.

pub mod clock;
pub mod ids;
pub mod task;

pub use clock::{Clock, ManualClock, SystemClock};
pub use ids::{ConnectionId, ContestId, MatchId, SessionToken, UserId};
pub use task::TaskHandle;
