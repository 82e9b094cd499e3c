//! Operation layer boundary.
//!
//! State-mutating event kinds (posting a message, editing, moderation) are
//! executed by an external collaborator behind this interface. The router
//! hands it the validated payload and origin identity; it applies its
//! effects (storage, side services) and returns the outbound events to fan
//! out. The router never touches storage directly and does not roll back
//! effects the collaborator already committed.

use crate::event::OutboundEvent;
use crate::registry::Identity;
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Failure reported by the operation layer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Operation failed ({kind}): {detail}")]
pub struct OperationError {
    /// Machine-readable failure kind, e.g. `storage` or `unsupported`.
    pub kind: String,
    /// Human-readable detail.
    pub detail: String,
}

impl OperationError {
    /// Create a new operation error.
    #[must_use]
    pub fn new(kind: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            detail: detail.into(),
        }
    }
}

/// Result of a successful operation.
#[derive(Debug, Default)]
pub struct OperationOutcome {
    /// Data echoed back to the origin in the acknowledgment.
    pub data: Option<Value>,
    /// Events to dispatch, in the order they should reach each target.
    pub events: Vec<OutboundEvent>,
}

impl OperationOutcome {
    /// An outcome with no ack data and no events.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Attach ack data for the origin connection.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Append an event to dispatch.
    #[must_use]
    pub fn with_event(mut self, event: OutboundEvent) -> Self {
        self.events.push(event);
        self
    }
}

/// Business-logic collaborator invoked by the event pipeline.
#[async_trait]
pub trait OperationLayer: Send + Sync {
    /// Execute a state-mutating event.
    ///
    /// # Errors
    ///
    /// Returns an [`OperationError`] when the operation cannot be applied.
    /// Partial effects already committed are the collaborator's own
    /// responsibility; the pipeline only reports the failure to the origin.
    async fn execute(
        &self,
        kind: &str,
        payload: &Value,
        origin: &Identity,
    ) -> Result<OperationOutcome, OperationError>;
}

/// Operation layer that rejects every state-mutating kind.
///
/// Useful for relay-only deployments and tests: join/leave/relay kinds
/// still work, anything needing business logic fails cleanly.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullOperationLayer;

#[async_trait]
impl OperationLayer for NullOperationLayer {
    async fn execute(
        &self,
        kind: &str,
        _payload: &Value,
        _origin: &Identity,
    ) -> Result<OperationOutcome, OperationError> {
        Err(OperationError::new(
            "unsupported",
            format!("No operation layer configured for '{kind}'"),
        ))
    }
}
