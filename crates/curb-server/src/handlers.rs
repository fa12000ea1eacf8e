//! Connection handlers for the Curb server.
//!
//! This module handles the WebSocket connection lifecycle and frame
//! processing. One task runs per connection; tasks share only the
//! dispatcher's registry and store.

use crate::config::Config;
use crate::http;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use bytes::BytesMut;
use curb_core::{
    ConnectionSession, Dispatcher, MemoryTripStore, RegistryConfig, Role, SubscriptionRegistry,
    TopicId, TopicReceiver, TripChange, TripEvent, User,
};
use curb_protocol::{code, codec, Frame, PROTOCOL_VERSION};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Shared server state.
pub struct AppState {
    /// Orchestrates trip operations over the store and the registry.
    pub dispatcher: Dispatcher,
    /// Provisioned users, keyed by token.
    pub users: HashMap<String, User>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let registry_config = RegistryConfig {
            max_subscriptions_per_connection: config.limits.max_subscriptions_per_connection,
            topic_capacity: config.limits.topic_capacity,
        };
        let registry = Arc::new(SubscriptionRegistry::with_config(registry_config));
        let store = Arc::new(MemoryTripStore::new());
        let users = config
            .users
            .iter()
            .map(|entry| (entry.token.clone(), entry.to_user()))
            .collect();

        Self {
            dispatcher: Dispatcher::new(store, registry),
            users,
            config,
        }
    }

    /// Resolve a token to its provisioned user.
    #[must_use]
    pub fn user_for_token(&self, token: Option<&str>) -> Option<User> {
        token.and_then(|t| self.users.get(t)).cloned()
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
        .route(&config.transport.rider_path, get(rider_ws_handler))
        .route(&config.transport.driver_path, get(driver_ws_handler))
        .route("/health", get(health_handler))
        .merge(http::api_router())
        .with_state(state);

    // Bind and serve
    let addr = config.bind_addr();
    let listener = TcpListener::bind(addr).await?;

    info!("Curb server listening on {}", addr);
    info!(
        "Rider endpoint: ws://{}{}  Driver endpoint: ws://{}{}",
        addr, config.transport.rider_path, addr, config.transport.driver_path
    );

    axum::serve(listener, app).await?;

    Ok(())
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Token passed in the WebSocket query string.
#[derive(Debug, Deserialize)]
struct ConnectParams {
    token: Option<String>,
}

/// Rider WebSocket upgrade handler.
async fn rider_ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state, Role::Rider, params.token))
}

/// Driver WebSocket upgrade handler.
async fn driver_ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state, Role::Driver, params.token))
}

/// Handle a WebSocket connection for the given role endpoint.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>, role: Role, token: Option<String>) {
    // Record connection metrics
    let _metrics_guard = ConnectionMetricsGuard::new();

    // Resolve the session up front. An unknown token still gets a transport,
    // it just never receives any subscriptions.
    let mut auth_error = None;
    let mut session = match state.user_for_token(token.as_deref()) {
        Some(user) => {
            let mut session = ConnectionSession::connecting(user, role);
            match session.authenticate() {
                Ok(()) => Some(session),
                Err(e) => {
                    warn!(role = %role, error = %e, "Authentication failed");
                    auth_error = Some(e);
                    None
                }
            }
        }
        None => None,
    };

    let connection_id = session
        .as_ref()
        .map(|s| s.id().to_string())
        .unwrap_or_else(|| format!("conn-anon-{}", Uuid::new_v4().simple()));

    debug!(connection = %connection_id, role = %role, "WebSocket connected");

    // Split the WebSocket
    let (mut sender, mut receiver) = socket.split();

    // Send Connected frame
    let connected = Frame::connected(
        &connection_id,
        PROTOCOL_VERSION,
        state.config.heartbeat.interval_ms as u32,
    );
    if send_frame(&mut sender, &connected).await.is_err() {
        error!(connection = %connection_id, "Failed to send Connected frame");
        return;
    }
    if let Some(e) = auth_error {
        let _ = send_frame(&mut sender, &Frame::error(0, code::UNAUTHORIZED, e.to_string())).await;
    }

    // Bounded per-connection outbound queue. A slow consumer backs up its
    // own forwarders until their broadcast receivers lag and shed the
    // oldest events; other subscribers of the same topics are unaffected.
    let (out_tx, mut out_rx) =
        mpsc::channel::<(TopicId, Arc<TripEvent>)>(state.config.limits.outbound_queue);

    // Track forwarder task handles for cleanup
    let mut forwarders: HashMap<TopicId, tokio::task::JoinHandle<()>> = HashMap::new();

    // Bulk subscription from the user's active trips.
    if let Some(session) = session.as_mut() {
        match state.dispatcher.open_session(session).await {
            Ok(receivers) => {
                for (topic, rx) in receivers {
                    metrics::record_subscription();
                    spawn_forwarder(&mut forwarders, topic, rx, out_tx.clone());
                }
            }
            Err(e) => {
                warn!(connection = %connection_id, error = %e, "Failed to open session");
                let _ =
                    send_frame(&mut sender, &Frame::error(0, e.wire_code(), e.to_string())).await;
            }
        }
    }

    // Read buffer for partial frames
    let mut read_buffer = BytesMut::with_capacity(4096);

    // Frame processing loop
    loop {
        tokio::select! {
            biased;

            // Deliver broadcasts from subscribed topics
            Some((topic, event)) = out_rx.recv() => {
                let frame = Frame::trip(topic, event.trip.clone());
                match codec::encode(&frame) {
                    Ok(data) => {
                        metrics::record_message(data.len(), "outbound");
                        if sender.send(Message::Binary(data.to_vec())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!(connection = %connection_id, error = %e, "Failed to encode broadcast");
                    }
                }
            }

            // Receive from WebSocket
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let start = Instant::now();
                        metrics::record_message(data.len(), "inbound");
                        read_buffer.extend_from_slice(&data);

                        // Try to decode frames
                        while let Ok(Some(frame)) = codec::decode_from(&mut read_buffer) {
                            if let Err(e) = handle_frame(
                                &frame,
                                &state,
                                session.as_mut(),
                                &mut sender,
                                &mut forwarders,
                                &out_tx,
                            ).await {
                                error!(connection = %connection_id, error = %e, "Frame handling error");
                                break;
                            }
                        }

                        metrics::record_latency(start.elapsed().as_secs_f64());
                    }
                    Some(Ok(Message::Text(text))) => {
                        // Treat text as binary
                        read_buffer.extend_from_slice(text.as_bytes());
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        // Ignore pongs
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

    // Cleanup: abort all forwarder tasks
    for (_, handle) in forwarders {
        handle.abort();
    }

    // Cleanup: release every subscription
    if let Some(session) = session.as_mut() {
        state.dispatcher.close_session(session);
    }
    metrics::set_active_topics(state.dispatcher.registry().stats().topic_count);

    debug!(connection = %connection_id, "WebSocket disconnected");
}

/// Handle a decoded frame.
async fn handle_frame(
    frame: &Frame,
    state: &Arc<AppState>,
    session: Option<&mut ConnectionSession>,
    sender: &mut SplitSink<WebSocket, Message>,
    forwarders: &mut HashMap<TopicId, tokio::task::JoinHandle<()>>,
    out_tx: &mpsc::Sender<(TopicId, Arc<TripEvent>)>,
) -> Result<()> {
    match frame {
        Frame::RequestTrip {
            id,
            pick_up_address,
            drop_off_address,
        } => {
            let Some(session) = session else {
                return send_frame(
                    sender,
                    &Frame::error(*id, code::UNAUTHENTICATED, "Not authenticated"),
                )
                .await;
            };
            debug!(connection = %session.id(), "Trip request");

            let response = match state
                .dispatcher
                .handle_rider_request(session, pick_up_address, drop_off_address)
                .await
            {
                Ok((snapshot, receiver)) => {
                    if let Some(rx) = receiver {
                        metrics::record_subscription();
                        spawn_forwarder(forwarders, snapshot.nk.clone(), rx, out_tx.clone());
                    }
                    metrics::set_active_topics(state.dispatcher.registry().stats().topic_count);
                    Frame::ack(*id)
                }
                Err(e) => {
                    warn!(connection = %session.id(), error = %e, "Trip request failed");
                    metrics::record_error("dispatch");
                    Frame::error(*id, e.wire_code(), e.to_string())
                }
            };

            send_frame(sender, &response).await
        }

        Frame::UpdateTrip {
            id,
            nk,
            status,
            pick_up_address,
            drop_off_address,
        } => {
            let Some(session) = session else {
                return send_frame(
                    sender,
                    &Frame::error(*id, code::UNAUTHENTICATED, "Not authenticated"),
                )
                .await;
            };
            debug!(connection = %session.id(), nk = %nk, "Trip update");

            let change = TripChange {
                status: *status,
                pick_up_address: pick_up_address.clone(),
                drop_off_address: drop_off_address.clone(),
            };

            let response = match state
                .dispatcher
                .handle_driver_update(session, nk, change)
                .await
            {
                Ok((_, receiver)) => {
                    if let Some(rx) = receiver {
                        metrics::record_subscription();
                        spawn_forwarder(forwarders, nk.clone(), rx, out_tx.clone());
                    }
                    metrics::set_active_topics(state.dispatcher.registry().stats().topic_count);
                    Frame::ack(*id)
                }
                Err(e) => {
                    warn!(connection = %session.id(), nk = %nk, error = %e, "Trip update failed");
                    metrics::record_error("dispatch");
                    Frame::error(*id, e.wire_code(), e.to_string())
                }
            };

            send_frame(sender, &response).await
        }

        Frame::Ping { timestamp } => send_frame(sender, &Frame::pong(*timestamp)).await,

        Frame::Pong { .. } => Ok(()),

        Frame::Connect { version, token } => {
            debug!(
                version = version,
                has_token = token.is_some(),
                "Connect frame (already connected)"
            );
            // Connection already established, ignore
            Ok(())
        }

        _ => {
            warn!(frame = frame.kind(), "Unexpected frame type");
            Ok(())
        }
    }
}

/// Spawn a task draining one topic subscription into the outbound queue.
fn spawn_forwarder(
    forwarders: &mut HashMap<TopicId, tokio::task::JoinHandle<()>>,
    topic: TopicId,
    mut rx: TopicReceiver,
    tx: mpsc::Sender<(TopicId, Arc<TripEvent>)>,
) {
    let name = topic.clone();
    let handle = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if tx.send((name.clone(), event)).await.is_err() {
                        break; // Connection gone
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(topic = %name, skipped, "Subscriber lagged, oldest events dropped");
                    metrics::record_error("lagged");
                    continue;
                }
            }
        }
    });
    forwarders.insert(topic, handle);
}

/// Send a frame to the WebSocket.
async fn send_frame(sender: &mut SplitSink<WebSocket, Message>, frame: &Frame) -> Result<()> {
    let data = codec::encode(frame)?;
    metrics::record_message(data.len(), "outbound");
    sender.send(Message::Binary(data.to_vec())).await?;
    Ok(())
}
