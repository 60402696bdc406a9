//! Network Layer
//!
//! WebSocket server for player connections.
//! This layer only translates frames; every rule lives in `auth/` and `contest/`.

pub mod protocol;
pub mod registry;
pub mod server;

pub use protocol::{ClientMessage, ReplyStatus, ServerError, ServerMessage};
pub use registry::ConnectionRegistry;
pub use server::{DuelServer, GameServerError, ServerConfig};
