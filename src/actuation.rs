//! Actuation Gateway: the physical on/off side of a reservation.
//!
//! Implementations must treat "already on" / "already off" as success; the
//! engine calls `turn_off` on every completion and `turn_on` again during
//! recovery without knowing the relay's actual state.

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tracing::info;

use crate::model::ResourceId;

#[derive(Debug, Error)]
pub enum ActuationError {
    #[error("no actuation channel for resource {0}")]
    UnknownChannel(ResourceId),
    #[error("driver error on channel {channel}: {reason}")]
    Driver { channel: ResourceId, reason: String },
}

#[async_trait]
pub trait Actuator: Send + Sync {
    async fn turn_on(&self, resource_id: ResourceId) -> Result<(), ActuationError>;
    async fn turn_off(&self, resource_id: ResourceId) -> Result<(), ActuationError>;
}

/// Logs switch requests and tracks the last requested state per channel.
/// Used when no relay hardware is attached.
#[derive(Debug, Default)]
pub struct DryRunActuator {
    channels: DashMap<ResourceId, bool>,
}

impl DryRunActuator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last requested state, `None` if the channel was never switched.
    pub fn is_on(&self, resource_id: ResourceId) -> Option<bool> {
        self.channels.get(&resource_id).map(|e| *e.value())
    }

    fn switch(&self, resource_id: ResourceId, on: bool) -> Result<(), ActuationError> {
        if !(crate::limits::MIN_RESOURCE_ID..=crate::limits::MAX_RESOURCE_ID).contains(&resource_id) {
            return Err(ActuationError::UnknownChannel(resource_id));
        }
        let previous = self.channels.insert(resource_id, on);
        if previous == Some(on) {
            tracing::debug!(resource_id, on, "channel already in requested state");
        } else {
            info!(resource_id, on, "dry-run relay switch");
        }
        Ok(())
    }
}

#[async_trait]
impl Actuator for DryRunActuator {
    async fn turn_on(&self, resource_id: ResourceId) -> Result<(), ActuationError> {
        self.switch(resource_id, true)
    }

    async fn turn_off(&self, resource_id: ResourceId) -> Result<(), ActuationError> {
        self.switch(resource_id, false)
    }
}
