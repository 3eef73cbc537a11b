//! Connection handlers for the Parley server.
//!
//! This module handles the socket lifecycle: handshake authentication,
//! frame decoding, dispatch into the chat service and outbound encoding.

use crate::backends;
use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{header::AUTHORIZATION, HeaderMap},
    response::IntoResponse,
    routing::get,
    Router,
};
use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use parley_core::{ChatError, ConnectionManager, Session};
use parley_protocol::{codec, ClientEvent, Encoded, ServerEvent, UserId, WireFormat};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Close code sent when the handshake credential is rejected.
pub const AUTH_CLOSE_CODE: u16 = 4401;

/// Shared server state.
pub struct AppState {
    /// The chat service.
    pub chat: ConnectionManager,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    #[must_use]
    pub fn new(chat: ConnectionManager, config: Config) -> Self {
        Self { chat, config }
    }
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the backends or the listener fail to start.
pub async fn run_server(config: Config) -> Result<()> {
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let backends = backends::build(&config).await?;
    let chat = ConnectionManager::new(backends, config.chat_config());
    let _bus_listener = chat.start().await?;
    let state = Arc::new(AppState::new(chat, config.clone()));

    let app = build_app(state);
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Parley server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(listener, app).await?;

    Ok(())
}

/// Build the HTTP router.
pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.chat.stats();
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": stats.sessions,
        "users": stats.users,
        "channels": stats.channels,
    }))
}

/// WebSocket upgrade handler. The credential is checked before the socket
/// does anything else.
async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let ws = ws.max_message_size(state.config.limits.max_message_size);
    let header = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());

    match state.chat.authenticate(header) {
        Ok(user) => ws.on_upgrade(move |socket| handle_websocket(socket, state, user)),
        Err(e) => {
            warn!(error = %e, "Handshake rejected");
            metrics::record_auth_failure();
            ws.on_upgrade(reject)
        }
    }
}

/// Close an unauthenticated socket at once.
async fn reject(mut socket: WebSocket) {
    let frame = CloseFrame {
        code: AUTH_CLOSE_CODE,
        reason: "authentication error".into(),
    };
    let _ = socket.send(Message::Close(Some(frame))).await;
}

/// Handle an authenticated WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>, user: UserId) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let (session, mut outbound) = match state.chat.open_session(user.clone()).await {
        Ok(opened) => opened,
        Err(e) => {
            error!(user = %user, error = %e, "Session setup failed");
            return;
        }
    };
    metrics::set_active_channels(state.chat.stats().channels);
    let connection = session.socket_id().to_string();
    debug!(connection = %connection, user = %user, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();

    // Replies follow the format of the client's latest frame.
    let mut format = WireFormat::Json;
    let mut read_buffer = BytesMut::with_capacity(4096);

    let period = state.config.heartbeat_interval();
    let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            Some(event) = outbound.recv() => {
                if let ServerEvent::Exception(exception) = event.as_ref() {
                    metrics::record_error(&exception.error);
                }
                let frame = match codec::encode(&event, format) {
                    Ok(Encoded::Text(text)) => Message::Text(text),
                    Ok(Encoded::Binary(data)) => Message::Binary(data.to_vec()),
                    Err(e) => {
                        error!(connection = %connection, event = event.name(), error = %e, "Encoding failed");
                        metrics::record_error("encode");
                        continue;
                    }
                };
                metrics::record_event(event.name(), "outbound");
                metrics::record_bytes(frame_len(&frame), "outbound");
                if sender.send(frame).await.is_err() {
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        metrics::record_bytes(text.len(), "inbound");
                        format = WireFormat::Json;
                        match codec::decode_text(&text) {
                            Ok(event) => spawn_dispatch(&state, &session, event),
                            Err(e) => reject_frame(&state, &session, e.into()),
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        metrics::record_bytes(data.len(), "inbound");
                        format = WireFormat::MessagePack;
                        read_buffer.extend_from_slice(&data);

                        loop {
                            match codec::decode_from(&mut read_buffer) {
                                Ok(Some(event)) => spawn_dispatch(&state, &session, event),
                                Ok(None) => break,
                                Err(e) => {
                                    read_buffer.clear();
                                    reject_frame(&state, &session, e.into());
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection, "WebSocket stream ended");
                        break;
                    }
                }
            }

            _ = heartbeat.tick() => {
                state.chat.heartbeat(&session).await;
            }
        }
    }

    state.chat.close_session(&session).await;
    metrics::set_active_channels(state.chat.stats().channels);

    debug!(connection = %connection, "WebSocket disconnected");
}

/// Run one operation on its own task so a slow store call does not hold up
/// the socket.
fn spawn_dispatch(state: &Arc<AppState>, session: &Arc<Session>, event: ClientEvent) {
    let op = event.name();
    metrics::record_event(op, "inbound");

    let state = Arc::clone(state);
    let session = Arc::clone(session);
    tokio::spawn(async move {
        let start = Instant::now();
        state.chat.dispatch(&session, event).await;
        metrics::record_operation(op, start.elapsed().as_secs_f64());
    });
}

/// Report an undecodable frame to the sender. Queued from a task since the
/// socket loop is the consumer of that queue.
fn reject_frame(state: &Arc<AppState>, session: &Arc<Session>, err: ChatError) {
    let state = Arc::clone(state);
    let session = Arc::clone(session);
    tokio::spawn(async move {
        state.chat.report(&session, "decode", None, &err).await;
    });
}

fn frame_len(frame: &Message) -> usize {
    match frame {
        Message::Text(text) => text.len(),
        Message::Binary(data) => data.len(),
        _ => 0,
    }
}
