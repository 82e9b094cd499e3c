//! In-memory chat operation layer.
//!
//! A stand-in for the real business-logic backend: stamps each chat message
//! with an id, sender, and timestamp, and broadcasts it to its room. Lets
//! the server run end-to-end without a storage service; a production
//! deployment swaps in its own [`OperationLayer`].

use async_trait::async_trait;
use palaver_core::{kinds, Identity, OperationError, OperationLayer, OperationOutcome, OutboundEvent};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Operation layer that echoes chat messages back to their room.
#[derive(Debug, Default)]
pub struct InMemoryChatOps {
    next_id: AtomicU64,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[async_trait]
impl OperationLayer for InMemoryChatOps {
    async fn execute(
        &self,
        kind: &str,
        payload: &Value,
        origin: &Identity,
    ) -> Result<OperationOutcome, OperationError> {
        if kind != kinds::CHAT_MESSAGE {
            return Err(OperationError::new(
                "unsupported",
                format!("No handler for '{kind}'"),
            ));
        }

        let room = payload
            .get("room")
            .and_then(Value::as_str)
            .ok_or_else(|| OperationError::new("invalid", "missing room"))?;
        let text = payload
            .get("text")
            .and_then(Value::as_str)
            .ok_or_else(|| OperationError::new("invalid", "missing text"))?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let message = json!({
            "id": id,
            "room": room,
            "text": text,
            "from": origin.as_str(),
            "sent_at": now_ms(),
        });

        Ok(OperationOutcome::empty()
            .with_data(message.clone())
            .with_event(OutboundEvent::to_room(kinds::CHAT_MESSAGE, message, room)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palaver_core::Target;

    #[tokio::test]
    async fn test_message_is_stamped_and_broadcast() {
        let ops = InMemoryChatOps::default();
        let outcome = ops
            .execute(
                kinds::CHAT_MESSAGE,
                &json!({"room": "lobby", "text": "hi"}),
                &Identity::new("user:alice"),
            )
            .await
            .unwrap();

        assert_eq!(outcome.events.len(), 1);
        let event = &outcome.events[0];
        assert_eq!(event.target, Target::Room("lobby".to_string()));
        assert_eq!(event.payload["from"], "user:alice");
        assert_eq!(event.payload["text"], "hi");
        assert!(outcome.data.is_some());
    }

    #[tokio::test]
    async fn test_ids_are_sequential() {
        let ops = InMemoryChatOps::default();
        let payload = json!({"room": "lobby", "text": "hi"});
        let alice = Identity::new("user:alice");

        let first = ops.execute(kinds::CHAT_MESSAGE, &payload, &alice).await.unwrap();
        let second = ops.execute(kinds::CHAT_MESSAGE, &payload, &alice).await.unwrap();
        assert_eq!(first.events[0].payload["id"], 0);
        assert_eq!(second.events[0].payload["id"], 1);
    }

    #[tokio::test]
    async fn test_unknown_kind_rejected() {
        let ops = InMemoryChatOps::default();
        let err = ops
            .execute("moderation.kick", &json!({}), &Identity::new("user:alice"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, "unsupported");
    }
}
