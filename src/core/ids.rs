//! Identifier newtypes.
//!
//! Every identifier that crosses a store or the wire gets its own type so a
//! contest id can never be handed to something expecting a user id.

use std::fmt;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap a raw identifier.
            pub fn new(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            /// Borrow the raw identifier.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Whether the identifier is empty.
            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }

            /// Immediate successor in string order: every identifier greater
            /// than `self` sorts at or after it. Used as a scan bound.
            pub fn successor(&self) -> Self {
                let mut next = self.0.clone();
                next.push('\0');
                Self(next)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(raw: &str) -> Self {
                Self(raw.to_string())
            }
        }

        impl From<String> for $name {
            fn from(raw: String) -> Self {
                Self(raw)
            }
        }
    };
}

string_id!(
    /// Stable user identifier, assigned on first login.
    UserId
);

string_id!(
    /// Contest (league) identifier supplied by clients.
    ContestId
);

string_id!(
    /// Opaque session token handed out at login.
    SessionToken
);

impl UserId {
    /// Allocate a fresh random user id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl SessionToken {
    /// First eight characters, safe to log.
    pub fn short(&self) -> &str {
        let end = self.0.char_indices().nth(8).map(|(i, _)| i).unwrap_or(self.0.len());
        &self.0[..end]
    }
}

/// Match identifier. Created once per pairing event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MatchId(Uuid);

impl MatchId {
    /// Allocate a fresh match id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for MatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier for one live transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Wrap a raw connection number.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw connection number.
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}
