//! Inbound event pipeline.
//!
//! Every inbound event moves through validate -> authorize -> execute (or
//! relay), then its outbound events are handed to the dispatcher in the
//! order produced. Rejections at any stage have no side effects and are
//! reported to the origin connection only, as a `system` event carrying a
//! `{success, data | error}` envelope.
//!
//! Event kinds are resolved through a table built once at startup; there is
//! no per-event reflection. Built-in routes cover room membership; `Operation`
//! routes call the operation layer; `Relay` routes convert straight to a
//! room broadcast (typing indicators and the like).

use crate::dispatch::Dispatcher;
use crate::event::{kinds, InboundEvent, OutboundEvent};
use crate::ops::{OperationError, OperationLayer};
use crate::registry::{ConnectionId, ConnectionRegistry, Identity};
use crate::rooms::{DirectoryError, RoomDirectory};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Why an inbound event was rejected. Reported to the origin only.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Rejection {
    /// Event kind is not registered in the table.
    #[error("Unknown event kind: {0}")]
    UnknownKind(String),

    /// Payload failed structural validation.
    #[error("Invalid payload: {0}")]
    Validation(String),

    /// Origin identity lacks permission for the operation or room.
    #[error("Permission denied")]
    PermissionDenied,

    /// Origin connection is not registered.
    #[error("Connection not found")]
    ConnectionNotFound,

    /// A configured limit was exceeded.
    #[error("Limit exceeded: {0}")]
    Limit(&'static str),

    /// The operation layer reported a failure.
    #[error(transparent)]
    Operation(#[from] OperationError),
}

impl Rejection {
    /// Stable label for logs and metrics.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            Rejection::UnknownKind(_) => "unknown_kind",
            Rejection::Validation(_) => "validation",
            Rejection::PermissionDenied => "permission",
            Rejection::ConnectionNotFound => "not_found",
            Rejection::Limit(_) => "limit",
            Rejection::Operation(_) => "operation",
        }
    }
}

/// Payload validator for one event kind.
pub type Validator = Box<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

/// What the pipeline does with an event once validated and authorized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteAction {
    /// Add the origin connection to the payload's room.
    JoinRoom,
    /// Remove the origin connection from the payload's room.
    LeaveRoom,
    /// Invoke the operation layer.
    Operation,
    /// Broadcast to the payload's room, stamped with the sender. Bypasses
    /// the operation layer entirely.
    Relay,
}

/// Routing entry for one event kind.
pub struct Route {
    action: RouteAction,
    validator: Validator,
    /// Authorization: origin must already be a member of the payload's room.
    needs_membership: bool,
}

fn require_room(payload: &Value) -> Result<(), String> {
    match payload.get("room").and_then(Value::as_str) {
        Some(_) => Ok(()),
        None => Err("'room' must be a string".to_string()),
    }
}

impl Route {
    /// Route that joins the payload's room.
    #[must_use]
    pub fn join() -> Self {
        Self {
            action: RouteAction::JoinRoom,
            validator: Box::new(require_room),
            needs_membership: false,
        }
    }

    /// Route that leaves the payload's room.
    #[must_use]
    pub fn leave() -> Self {
        Self {
            action: RouteAction::LeaveRoom,
            validator: Box::new(require_room),
            needs_membership: false,
        }
    }

    /// Route executed by the operation layer.
    #[must_use]
    pub fn operation(validator: Validator, needs_membership: bool) -> Self {
        Self {
            action: RouteAction::Operation,
            validator,
            needs_membership,
        }
    }

    /// Pure-relay route: room-scoped, membership required.
    #[must_use]
    pub fn relay(validator: Validator) -> Self {
        Self {
            action: RouteAction::Relay,
            validator,
            needs_membership: true,
        }
    }
}

/// Kind -> route table, resolved once at startup.
#[derive(Default)]
pub struct EventTable {
    routes: HashMap<String, Route>,
}

impl EventTable {
    /// Start building a table.
    #[must_use]
    pub fn builder() -> EventTableBuilder {
        EventTableBuilder {
            table: Self::default(),
        }
    }

    /// The default chat table: `room.join`, `room.leave`, `chat.message`
    /// (operation) and `typing` (relay).
    #[must_use]
    pub fn chat_defaults() -> Self {
        Self::builder()
            .route(kinds::ROOM_JOIN, Route::join())
            .route(kinds::ROOM_LEAVE, Route::leave())
            .route(
                kinds::CHAT_MESSAGE,
                Route::operation(
                    Box::new(|payload| {
                        require_room(payload)?;
                        match payload.get("text").and_then(Value::as_str) {
                            Some(text) if !text.is_empty() => Ok(()),
                            Some(_) => Err("'text' must not be empty".to_string()),
                            None => Err("'text' must be a string".to_string()),
                        }
                    }),
                    true,
                ),
            )
            .route(kinds::TYPING, Route::relay(Box::new(require_room)))
            .build()
    }

    fn get(&self, kind: &str) -> Option<&Route> {
        self.routes.get(kind)
    }

    /// Registered kinds, for diagnostics.
    #[must_use]
    pub fn kinds(&self) -> Vec<&str> {
        self.routes.keys().map(String::as_str).collect()
    }
}

/// Builder for [`EventTable`].
pub struct EventTableBuilder {
    table: EventTable,
}

impl EventTableBuilder {
    /// Register a route for an event kind, replacing any previous one.
    #[must_use]
    pub fn route(mut self, kind: impl Into<String>, route: Route) -> Self {
        self.table.routes.insert(kind.into(), route);
        self
    }

    /// Finish the table.
    #[must_use]
    pub fn build(self) -> EventTable {
        self.table
    }
}

/// Identity-level authorization hook, consulted after the membership check.
pub trait AccessPolicy: Send + Sync {
    /// Whether `origin` may perform `kind` (scoped to `room`, if any).
    fn allow(&self, origin: &Identity, kind: &str, room: Option<&str>) -> bool;
}

/// Policy that permits everything; membership checks still apply.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn allow(&self, _origin: &Identity, _kind: &str, _room: Option<&str>) -> bool {
        true
    }
}

/// The inbound event pipeline.
pub struct EventPipeline {
    registry: Arc<ConnectionRegistry>,
    rooms: Arc<RoomDirectory>,
    dispatcher: Arc<Dispatcher>,
    table: EventTable,
    policy: Arc<dyn AccessPolicy>,
    ops: Arc<dyn OperationLayer>,
}

impl EventPipeline {
    /// Assemble a pipeline.
    #[must_use]
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        rooms: Arc<RoomDirectory>,
        dispatcher: Arc<Dispatcher>,
        table: EventTable,
        policy: Arc<dyn AccessPolicy>,
        ops: Arc<dyn OperationLayer>,
    ) -> Self {
        Self {
            registry,
            rooms,
            dispatcher,
            table,
            policy,
            ops,
        }
    }

    /// Process one inbound event from `origin`.
    ///
    /// The caller (the connection's read task) awaits each call, so events
    /// from one connection are processed in arrival order; different
    /// connections run concurrently.
    ///
    /// # Errors
    ///
    /// Returns the rejection, which has also been reported to the origin's
    /// outbound queue as a `system` error event. Rejections never affect
    /// other connections.
    pub async fn handle(
        &self,
        origin: &ConnectionId,
        event: InboundEvent,
    ) -> Result<(), Rejection> {
        match self.process(origin, &event).await {
            Ok(()) => Ok(()),
            Err(rejection) => {
                warn!(
                    connection = %origin,
                    kind = %event.kind,
                    reason = rejection.reason(),
                    error = %rejection,
                    "Event rejected"
                );
                self.report_rejection(origin, &event, &rejection);
                Err(rejection)
            }
        }
    }

    async fn process(&self, origin: &ConnectionId, event: &InboundEvent) -> Result<(), Rejection> {
        // Received: resolve the origin first; an unregistered connection
        // cannot be answered anyway.
        let connection = self
            .registry
            .lookup(origin)
            .ok_or(Rejection::ConnectionNotFound)?;
        let identity = connection.identity().clone();

        let route = self
            .table
            .get(&event.kind)
            .ok_or_else(|| Rejection::UnknownKind(event.kind.clone()))?;

        // Validating.
        (route.validator)(&event.payload).map_err(Rejection::Validation)?;
        let room = event
            .payload
            .get("room")
            .and_then(Value::as_str)
            .map(str::to_string);

        // Authorizing.
        if route.needs_membership {
            let scoped = room.as_deref().ok_or_else(|| {
                Rejection::Validation("'room' must be a string".to_string())
            })?;
            if !self.rooms.is_member(scoped, origin) {
                return Err(Rejection::PermissionDenied);
            }
        }
        if !self.policy.allow(&identity, &event.kind, room.as_deref()) {
            return Err(Rejection::PermissionDenied);
        }

        // Executing.
        match route.action {
            RouteAction::JoinRoom => {
                let scoped = room.as_deref().unwrap_or_default();
                self.rooms
                    .join(scoped, origin)
                    .map_err(map_directory_error)?;
                self.ack(origin, Some(json!({ "room_joined": scoped })));
            }
            RouteAction::LeaveRoom => {
                let scoped = room.as_deref().unwrap_or_default();
                self.rooms.leave(scoped, origin);
                self.ack(origin, Some(json!({ "room_left": scoped })));
            }
            RouteAction::Operation => {
                let outcome = self.ops.execute(&event.kind, &event.payload, &identity).await?;
                self.ack(origin, outcome.data);
                for outbound in outcome.events {
                    self.dispatcher.dispatch(outbound);
                }
            }
            RouteAction::Relay => {
                let scoped = room.clone().unwrap_or_default();
                let mut payload = event.payload.clone();
                if let Some(fields) = payload.as_object_mut() {
                    fields.insert("from".to_string(), Value::String(identity.to_string()));
                }
                self.dispatcher
                    .dispatch(OutboundEvent::to_room(event.kind.clone(), payload, scoped));
            }
        }

        debug!(connection = %origin, kind = %event.kind, "Event completed");
        Ok(())
    }

    fn ack(&self, origin: &ConnectionId, data: Option<Value>) {
        let payload = json!({ "success": true, "data": data });
        self.dispatcher.dispatch(OutboundEvent::to_connection(
            kinds::SYSTEM,
            payload,
            origin.clone(),
        ));
    }

    fn report_rejection(&self, origin: &ConnectionId, event: &InboundEvent, rejection: &Rejection) {
        let payload = json!({
            "success": false,
            "kind": event.kind,
            "error": {
                "reason": rejection.reason(),
                "detail": rejection.to_string(),
            },
        });
        self.dispatcher.dispatch(OutboundEvent::to_connection(
            kinds::SYSTEM,
            payload,
            origin.clone(),
        ));
    }
}

fn map_directory_error(err: DirectoryError) -> Rejection {
    match err {
        DirectoryError::InvalidRoom(detail) => Rejection::Validation(detail.to_string()),
        DirectoryError::ConnectionNotFound(_) => Rejection::ConnectionNotFound,
        DirectoryError::RoomLimitReached => Rejection::Limit("rooms"),
        DirectoryError::MembershipLimitReached => Rejection::Limit("memberships"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::OperationOutcome;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Operation layer that broadcasts every chat message to its room and
    /// counts invocations.
    #[derive(Default)]
    struct EchoOps {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl OperationLayer for EchoOps {
        async fn execute(
            &self,
            kind: &str,
            payload: &Value,
            origin: &Identity,
        ) -> Result<OperationOutcome, OperationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let room = payload
                .get("room")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let mut broadcast = payload.clone();
            if let Some(fields) = broadcast.as_object_mut() {
                fields.insert("from".to_string(), Value::String(origin.to_string()));
            }
            Ok(OperationOutcome::empty()
                .with_data(json!({ "delivered_to": room }))
                .with_event(OutboundEvent::to_room(kind, broadcast, room)))
        }
    }

    struct FailingOps;

    #[async_trait]
    impl OperationLayer for FailingOps {
        async fn execute(
            &self,
            _kind: &str,
            _payload: &Value,
            _origin: &Identity,
        ) -> Result<OperationOutcome, OperationError> {
            Err(OperationError::new("storage", "insert failed"))
        }
    }

    struct Fixture {
        registry: Arc<ConnectionRegistry>,
        rooms: Arc<RoomDirectory>,
        pipeline: EventPipeline,
    }

    fn fixture(ops: Arc<dyn OperationLayer>) -> Fixture {
        let registry = Arc::new(ConnectionRegistry::default());
        let rooms = Arc::new(RoomDirectory::new(
            Arc::clone(&registry),
            crate::rooms::DirectoryConfig::default(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&registry), Arc::clone(&rooms)));
        let pipeline = EventPipeline::new(
            Arc::clone(&registry),
            Arc::clone(&rooms),
            dispatcher,
            EventTable::chat_defaults(),
            Arc::new(AllowAll),
            ops,
        );
        Fixture {
            registry,
            rooms,
            pipeline,
        }
    }

    async fn drain(fx: &Fixture, conn: &ConnectionId) -> Vec<Arc<OutboundEvent>> {
        let queue = Arc::clone(fx.registry.lookup(conn).unwrap().queue());
        let mut events = Vec::new();
        while !queue.is_empty() {
            if let Some(event) = queue.pop().await {
                events.push(event);
            }
        }
        events
    }

    fn join(room: &str) -> InboundEvent {
        InboundEvent::new(kinds::ROOM_JOIN, json!({ "room": room }))
    }

    fn message(room: &str, text: &str) -> InboundEvent {
        InboundEvent::new(kinds::CHAT_MESSAGE, json!({ "room": room, "text": text }))
    }

    #[tokio::test]
    async fn test_lobby_broadcast_scenario() {
        let ops = Arc::new(EchoOps::default());
        let fx = fixture(Arc::clone(&ops) as Arc<dyn OperationLayer>);
        let a = fx.registry.register(Identity::new("user:a")).unwrap();
        let b = fx.registry.register(Identity::new("user:b")).unwrap();

        fx.pipeline.handle(&a, join("lobby")).await.unwrap();
        fx.pipeline.handle(&b, join("lobby")).await.unwrap();

        // Two back-to-back messages from A.
        fx.pipeline.handle(&a, message("lobby", "hi")).await.unwrap();
        fx.pipeline.handle(&a, message("lobby", "again")).await.unwrap();

        // B receives both broadcasts, in send order, stamped with A.
        let to_b: Vec<_> = drain(&fx, &b)
            .await
            .into_iter()
            .filter(|e| e.kind == kinds::CHAT_MESSAGE)
            .collect();
        assert_eq!(to_b.len(), 2);
        assert_eq!(to_b[0].payload["text"], "hi");
        assert_eq!(to_b[0].payload["from"], "user:a");
        assert_eq!(to_b[1].payload["text"], "again");

        // A receives them too (sender is a room member).
        let to_a: Vec<_> = drain(&fx, &a)
            .await
            .into_iter()
            .filter(|e| e.kind == kinds::CHAT_MESSAGE)
            .collect();
        assert_eq!(to_a.len(), 2);
        assert_eq!(to_a[0].payload["text"], "hi");
        assert_eq!(to_a[1].payload["text"], "again");
    }

    #[tokio::test]
    async fn test_ack_envelope() {
        let fx = fixture(Arc::new(EchoOps::default()));
        let a = fx.registry.register(Identity::new("user:a")).unwrap();

        fx.pipeline.handle(&a, join("lobby")).await.unwrap();

        let events = drain(&fx, &a).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, kinds::SYSTEM);
        assert_eq!(events[0].payload["success"], true);
        assert_eq!(events[0].payload["data"]["room_joined"], "lobby");
    }

    #[tokio::test]
    async fn test_permission_denied_is_origin_only() {
        let fx = fixture(Arc::new(EchoOps::default()));
        let a = fx.registry.register(Identity::new("user:a")).unwrap();
        let c = fx.registry.register(Identity::new("user:c")).unwrap();
        fx.pipeline.handle(&a, join("lobby")).await.unwrap();
        drain(&fx, &a).await;

        // C never joined the lobby.
        let result = fx.pipeline.handle(&c, message("lobby", "sneak")).await;
        assert_eq!(result, Err(Rejection::PermissionDenied));

        // Error envelope to C only; no broadcast, no directory mutation.
        let to_c = drain(&fx, &c).await;
        assert_eq!(to_c.len(), 1);
        assert_eq!(to_c[0].kind, kinds::SYSTEM);
        assert_eq!(to_c[0].payload["success"], false);
        assert_eq!(to_c[0].payload["error"]["reason"], "permission");
        assert!(drain(&fx, &a).await.is_empty());
        assert_eq!(fx.rooms.members_of("lobby").len(), 1);
    }

    #[tokio::test]
    async fn test_validation_failure_has_no_side_effects() {
        let ops = Arc::new(EchoOps::default());
        let fx = fixture(Arc::clone(&ops) as Arc<dyn OperationLayer>);
        let a = fx.registry.register(Identity::new("user:a")).unwrap();
        fx.pipeline.handle(&a, join("lobby")).await.unwrap();
        drain(&fx, &a).await;

        let bad = InboundEvent::new(kinds::CHAT_MESSAGE, json!({ "room": "lobby" }));
        let result = fx.pipeline.handle(&a, bad).await;
        assert!(matches!(result, Err(Rejection::Validation(_))));

        // The operation layer was never consulted.
        assert_eq!(ops.calls.load(Ordering::SeqCst), 0);
        let to_a = drain(&fx, &a).await;
        assert_eq!(to_a.len(), 1);
        assert_eq!(to_a[0].payload["error"]["reason"], "validation");
    }

    #[tokio::test]
    async fn test_unknown_kind_rejected() {
        let fx = fixture(Arc::new(EchoOps::default()));
        let a = fx.registry.register(Identity::new("user:a")).unwrap();

        let result = fx
            .pipeline
            .handle(&a, InboundEvent::new("no.such.kind", json!({})))
            .await;
        assert_eq!(result, Err(Rejection::UnknownKind("no.such.kind".to_string())));
    }

    #[tokio::test]
    async fn test_relay_bypasses_operation_layer() {
        let ops = Arc::new(EchoOps::default());
        let fx = fixture(Arc::clone(&ops) as Arc<dyn OperationLayer>);
        let a = fx.registry.register(Identity::new("user:a")).unwrap();
        let b = fx.registry.register(Identity::new("user:b")).unwrap();
        fx.pipeline.handle(&a, join("lobby")).await.unwrap();
        fx.pipeline.handle(&b, join("lobby")).await.unwrap();
        drain(&fx, &a).await;
        drain(&fx, &b).await;

        fx.pipeline
            .handle(&a, InboundEvent::new(kinds::TYPING, json!({ "room": "lobby" })))
            .await
            .unwrap();

        assert_eq!(ops.calls.load(Ordering::SeqCst), 0);
        let to_b = drain(&fx, &b).await;
        assert_eq!(to_b.len(), 1);
        assert_eq!(to_b[0].kind, kinds::TYPING);
        assert_eq!(to_b[0].payload["from"], "user:a");
    }

    #[tokio::test]
    async fn test_operation_failure_reported_to_origin() {
        let fx = fixture(Arc::new(FailingOps));
        let a = fx.registry.register(Identity::new("user:a")).unwrap();
        let b = fx.registry.register(Identity::new("user:b")).unwrap();
        fx.pipeline.handle(&a, join("lobby")).await.unwrap();
        fx.pipeline.handle(&b, join("lobby")).await.unwrap();
        drain(&fx, &a).await;
        drain(&fx, &b).await;

        let result = fx.pipeline.handle(&a, message("lobby", "hi")).await;
        assert!(matches!(result, Err(Rejection::Operation(_))));

        let to_a = drain(&fx, &a).await;
        assert_eq!(to_a.len(), 1);
        assert_eq!(to_a[0].payload["error"]["reason"], "operation");
        assert!(drain(&fx, &b).await.is_empty());
    }

    #[tokio::test]
    async fn test_unregistered_origin_rejected() {
        let fx = fixture(Arc::new(EchoOps::default()));
        let ghost = ConnectionId::from("conn_ghost");

        let result = fx.pipeline.handle(&ghost, join("lobby")).await;
        assert_eq!(result, Err(Rejection::ConnectionNotFound));
    }
}
