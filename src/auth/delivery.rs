//! One-time code delivery channels.

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::error::ServiceError;

/// How a code reached the player.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Returned in the login response. Development only.
    Inline(String),
    /// Handed to an out-of-band channel.
    Dispatched,
}

/// Delivery errors.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The channel could not accept the code.
    #[error("delivery channel unavailable: {0}")]
    Unavailable(String),
}

impl From<DeliveryError> for ServiceError {
    fn from(err: DeliveryError) -> Self {
        ServiceError::Internal(err.to_string())
    }
}

/// A channel that gets one-time codes to players.
#[async_trait]
pub trait CodeDelivery: Send + Sync {
    /// Deliver `code` for `mobile`.
    async fn deliver(&self, mobile: &str, code: &str) -> Result<Delivery, DeliveryError>;
}

/// Echoes the code back to the caller.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineDelivery;

#[async_trait]
impl CodeDelivery for InlineDelivery {
    async fn deliver(&self, _mobile: &str, code: &str) -> Result<Delivery, DeliveryError> {
        Ok(Delivery::Inline(code.to_string()))
    }
}

/// Records that a code was issued without revealing it. Stands in for an
/// SMS gateway.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDelivery;

#[async_trait]
impl CodeDelivery for LogDelivery {
    async fn deliver(&self, mobile: &str, _code: &str) -> Result<Delivery, DeliveryError> {
        info!("One-time code issued for {}", mask_mobile(mobile));
        Ok(Delivery::Dispatched)
    }
}

/// Keep only the last four digits.
pub fn mask_mobile(mobile: &str) -> String {
    let visible = mobile.len().saturating_sub(4);
    mobile
        .char_indices()
        .map(|(i, c)| if i < visible { '*' } else { c })
        .collect()
}
