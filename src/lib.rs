//! # Dice Duel Server
//!
//! Contest backend for Dice Duel: one-time-code login, encrypted session
//! credentials, contest joins and a FIFO matchmaking loop.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     DICE DUEL SERVER                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Shared primitives                         │
//! │  ├── ids.rs      - User, contest, session and match ids      │
//! │  ├── clock.rs    - Injectable time source                    │
//! │  └── task.rs     - Owned background loops                    │
//! │                                                              │
//! │  store/          - Key-value storage contract                │
//! │  ├── memory.rs   - Ordered in-memory tables and cache        │
//! │  └── redis.rs    - Redis cache tier (feature gated)          │
//! │                                                              │
//! │  auth/           - Login and sessions                        │
//! │  ├── token.rs    - Signed, encrypted credentials             │
//! │  ├── session.rs  - Session storage and authorization         │
//! │  ├── service.rs  - Login and code verification               │
//! │  ├── delivery.rs - One-time code delivery                    │
//! │  └── sweep.rs    - Expired session cleanup                   │
//! │                                                              │
//! │  contest/        - Joining and pairing                       │
//! │  ├── join.rs     - Waiting pool admission                    │
//! │  ├── scheduler.rs- FIFO matchmaking loop                     │
//! │  ├── opponent.rs - Opponent lookup and cancellation          │
//! │  ├── seed.rs     - Initial game state per player             │
//! │  └── reconcile.rs- Waiting index repair                      │
//! │                                                              │
//! │  network/        - WebSocket transport                       │
//! │  ├── server.rs   - Accept loop and request routing           │
//! │  ├── protocol.rs - Message types                             │
//! │  └── registry.rs - Live connections                          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Pairing Guarantee
//!
//! A user is paired at most once per contest. Pairing is committed by a
//! single intent record before any join record changes, so a crash between
//! the two halves is finished on the next tick instead of leaving one side
//! matched and the other waiting.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod app;
pub mod auth;
pub mod contest;
pub mod core;
pub mod error;
pub mod network;
pub mod store;

// Re-export commonly used types
pub use crate::app::{AppConfig, Services};
pub use crate::core::{ContestId, MatchId, SessionToken, UserId};
pub use crate::error::{ErrorKind, ServiceError};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
