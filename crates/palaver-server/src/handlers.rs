//! Connection handlers for the Palaver server.
//!
//! This module handles the WebSocket connection lifecycle: handshake and
//! authentication, the per-connection read/drain loop, and teardown. All
//! routing decisions live in the hub; this layer only moves frames.

use crate::auth::{Authenticator, TrustedTokenAuthenticator};
use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use crate::ops::InMemoryChatOps;
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use bytes::BytesMut;
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use palaver_core::{ConnectionId, Hub, InboundEvent, Rejection};
use palaver_protocol::{codec, codes, Frame, Version, PROTOCOL_VERSION};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// The routing core.
    pub hub: Hub,
    /// Server configuration.
    pub config: Config,
    /// Handshake token verifier.
    pub authenticator: Arc<dyn Authenticator>,
}

impl AppState {
    /// Create new app state with the default authenticator and operation
    /// layer.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let hub = Hub::with_defaults(config.hub_config(), Arc::new(InMemoryChatOps::default()));

        Self {
            hub,
            config,
            authenticator: Arc::new(TrustedTokenAuthenticator),
        }
    }
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone()));

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    // Build router
    let app = Router::new()
        .route(&config.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    // Bind and serve
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Palaver server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}{}", addr, config.websocket_path);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.hub.stats();
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": stats.connections,
        "rooms": stats.rooms,
        "memberships": stats.memberships,
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut read_buffer = BytesMut::with_capacity(4096);

    // Handshake: the first frame must be Connect, within the timeout.
    let handshake_timeout = Duration::from_millis(state.config.heartbeat.timeout_ms);
    let connect = tokio::time::timeout(
        handshake_timeout,
        read_frame(&mut receiver, &mut read_buffer),
    )
    .await;

    let (version, token) = match connect {
        Ok(Some(Frame::Connect { version, token })) => (version, token),
        Ok(Some(frame)) => {
            debug!(frame_type = ?frame.frame_type(), "Expected Connect frame");
            let _ = send_frame(
                &mut sender,
                &Frame::error(0, codes::PROTOCOL, "Expected connect frame"),
            )
            .await;
            return;
        }
        Ok(None) | Err(_) => {
            debug!("Connection closed before handshake");
            return;
        }
    };

    if !Version::supports_major(version) {
        let _ = send_frame(
            &mut sender,
            &Frame::error(
                0,
                codes::UNSUPPORTED_VERSION,
                format!("Unsupported protocol version {version}"),
            ),
        )
        .await;
        return;
    }

    let identity = match state.authenticator.authenticate(token.as_deref()).await {
        Ok(identity) => identity,
        Err(e) => {
            warn!(error = %e, "Authentication failed");
            metrics::record_error("auth");
            let _ = send_frame(
                &mut sender,
                &Frame::error(0, codes::UNAUTHENTICATED, e.to_string()),
            )
            .await;
            return;
        }
    };

    let connection_id = match state.hub.connect(identity.clone()) {
        Ok(id) => id,
        Err(e) => {
            warn!(identity = %identity, error = %e, "Registration failed");
            metrics::record_error("registry");
            let _ = send_frame(&mut sender, &Frame::error(0, codes::LIMIT, e.to_string())).await;
            return;
        }
    };

    let _metrics_guard = ConnectionMetricsGuard::new();
    debug!(connection = %connection_id, identity = %identity, "WebSocket connected");

    let connected_frame = Frame::connected(
        connection_id.as_str(),
        PROTOCOL_VERSION.major,
        state.config.heartbeat.interval_ms as u32,
    );
    if send_frame(&mut sender, &connected_frame).await.is_err() {
        error!(connection = %connection_id, "Failed to send Connected frame");
        state.hub.disconnect(&connection_id);
        return;
    }

    // Delivery queue for this connection; closed by the hub on disconnect.
    let Some(queue) = state.hub.outbound(&connection_id) else {
        state.hub.disconnect(&connection_id);
        return;
    };

    // Event loop: drain the delivery queue and process inbound frames.
    loop {
        tokio::select! {
            biased;

            delivery = queue.pop() => {
                let Some(event) = delivery else {
                    // Queue closed, the connection was torn down elsewhere.
                    break;
                };
                let frame = Frame::Event {
                    id: None,
                    kind: event.kind.clone(),
                    room: event.room().map(str::to_string),
                    payload: event.payload.clone(),
                };
                if send_frame(&mut sender, &frame).await.is_err() {
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let start = Instant::now();
                        read_buffer.extend_from_slice(&data);

                        loop {
                            match codec::decode_from(&mut read_buffer) {
                                Ok(Some(frame)) => {
                                    metrics::record_event(data.len(), "inbound");
                                    if handle_frame(&frame, &connection_id, &state, &mut sender)
                                        .await
                                        .is_err()
                                    {
                                        break;
                                    }
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    warn!(connection = %connection_id, error = %e, "Decode error");
                                    metrics::record_error("decode");
                                    let _ = send_frame(
                                        &mut sender,
                                        &Frame::error(0, codes::PROTOCOL, e.to_string()),
                                    )
                                    .await;
                                    read_buffer.clear();
                                    break;
                                }
                            }
                        }

                        metrics::record_latency(start.elapsed().as_secs_f64());
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        // Ignore pongs
                    }
                    Some(Ok(Message::Text(_))) => {
                        warn!(connection = %connection_id, "Text frames are not supported");
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    state.hub.disconnect(&connection_id);
    metrics::set_active_rooms(state.hub.stats().rooms);

    debug!(connection = %connection_id, "WebSocket disconnected");
}

/// Handle a decoded frame from an established connection.
async fn handle_frame(
    frame: &Frame,
    connection_id: &ConnectionId,
    state: &Arc<AppState>,
    sender: &mut SplitSink<WebSocket, Message>,
) -> Result<()> {
    match frame {
        Frame::Event {
            id,
            kind,
            room,
            payload,
        } => {
            debug!(connection = %connection_id, kind = %kind, "Inbound event");

            // A frame-level room scope folds into the payload so routes see
            // a single shape.
            let mut payload = payload.clone();
            if let (Some(room), Some(obj)) = (room, payload.as_object_mut()) {
                obj.entry("room".to_string())
                    .or_insert_with(|| serde_json::Value::String(room.clone()));
            }

            let event = InboundEvent::new(kind.clone(), payload);
            match state.hub.handle_inbound(connection_id, event).await {
                Ok(()) => {
                    metrics::set_active_rooms(state.hub.stats().rooms);
                    if let Some(req_id) = id {
                        send_frame(sender, &Frame::ack(*req_id)).await?;
                    }
                }
                Err(rejection) => {
                    metrics::record_rejection(rejection.reason());
                    send_frame(
                        sender,
                        &Frame::error(
                            id.unwrap_or(0),
                            rejection_code(&rejection),
                            rejection.to_string(),
                        ),
                    )
                    .await?;
                }
            }
        }

        Frame::Ping { timestamp } => {
            send_frame(sender, &Frame::pong(*timestamp)).await?;
        }

        Frame::Pong { .. } => {
            // Liveness only
        }

        Frame::Connect { version, .. } => {
            debug!(
                connection = %connection_id,
                version = version,
                "Connect frame (already connected)"
            );
        }

        _ => {
            warn!(connection = %connection_id, frame_type = ?frame.frame_type(), "Unexpected frame type");
            send_frame(
                sender,
                &Frame::error(0, codes::PROTOCOL, "Unexpected frame type"),
            )
            .await?;
        }
    }

    Ok(())
}

/// The wire error code for a pipeline rejection.
fn rejection_code(rejection: &Rejection) -> u16 {
    match rejection {
        Rejection::UnknownKind(_) => codes::UNKNOWN_KIND,
        Rejection::Validation(_) => codes::VALIDATION,
        Rejection::PermissionDenied => codes::PERMISSION_DENIED,
        Rejection::ConnectionNotFound => codes::NOT_FOUND,
        Rejection::Limit(_) => codes::LIMIT,
        Rejection::Operation(_) => codes::OPERATION_FAILED,
    }
}

/// Read the next complete frame from the WebSocket.
///
/// Returns `None` when the stream closes before a full frame arrives.
async fn read_frame(
    receiver: &mut SplitStream<WebSocket>,
    read_buffer: &mut BytesMut,
) -> Option<Frame> {
    loop {
        match codec::decode_from(read_buffer) {
            Ok(Some(frame)) => return Some(frame),
            Ok(None) => {}
            Err(_) => return None,
        }

        match receiver.next().await? {
            Ok(Message::Binary(data)) => read_buffer.extend_from_slice(&data),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
}

/// Send a frame to the WebSocket.
async fn send_frame(sender: &mut SplitSink<WebSocket, Message>, frame: &Frame) -> Result<()> {
    let data = codec::encode(frame)?;
    metrics::record_event(data.len(), "outbound");
    sender.send(Message::Binary(data.to_vec())).await?;
    Ok(())
}
