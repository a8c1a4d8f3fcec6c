//! HTTP API handlers
//!
//! `/ws/{service}` upgrades to a WebSocket that is registered as an observer
//! on the service's topic. Inbound text frames go through the
//! [`ServiceRouter`]; replies meant only for the sender are queued on the
//! same observer so they stay ordered with broadcasts.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, warn};

use crate::bus::{BroadcastHub, ChannelObserver};
use crate::router::{HubStatus, ServiceName, ServiceRouter};

/// Default outbound queue depth per connection
pub const DEFAULT_OBSERVER_BUFFER: usize = 64;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub router: Arc<ServiceRouter>,
    pub hub: Arc<BroadcastHub>,
    pub observer_buffer: usize,
}

impl AppState {
    pub fn new(router: Arc<ServiceRouter>) -> Self {
        let hub = router.hub().clone();
        Self {
            router,
            hub,
            observer_buffer: DEFAULT_OBSERVER_BUFFER,
        }
    }

    pub fn with_observer_buffer(mut self, buffer: usize) -> Self {
        self.observer_buffer = buffer;
        self
    }
}

/// Error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub services: BTreeMap<&'static str, bool>,
}

/// General status response
#[derive(Serialize)]
pub struct StatusResponse {
    pub service: &'static str,
    pub version: &'static str,
    pub git_sha: &'static str,
    #[serde(flatten)]
    pub hub: HubStatus,
}

/// Build the HTTP surface
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/ws/{service}", get(ws_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /health - Liveness plus which services are wired up
pub async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        services: state.router.available_services(),
    })
}

/// GET /status - Arbitration, presence and observer counts
pub async fn status_handler(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        service: "audio-hub",
        version: env!("AUDIO_HUB_VERSION"),
        git_sha: env!("AUDIO_HUB_GIT_SHA"),
        hub: state.router.status(),
    })
}

// =============================================================================
// WebSocket observers
// =============================================================================

/// GET /ws/{service} - Subscribe to a service topic
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(service): Path<String>,
    State(state): State<AppState>,
) -> Response {
    let service = match service.parse::<ServiceName>() {
        Ok(service) => service,
        Err(e) => {
            warn!("Rejecting websocket: {}", e);
            return (
                StatusCode::NOT_FOUND,
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            )
                .into_response();
        }
    };

    ws.on_upgrade(move |socket| handle_socket(socket, service, state))
}

async fn handle_socket(socket: WebSocket, service: ServiceName, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (transport, mut outbound) = ChannelObserver::new(state.observer_buffer);

    let observer = match state.hub.subscribe(service.topic(), Arc::new(transport)).await {
        Ok(observer) => observer,
        Err(e) => {
            warn!("Could not register {} observer: {}", service, e);
            return;
        }
    };
    info!("Observer {} connected to {}", observer.id, service);

    let cancel = CancellationToken::new();
    let writer_cancel = cancel.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = writer_cancel.cancelled() => break,
                next = outbound.recv() => {
                    let Some(envelope) = next else { break };
                    let text = match serde_json::to_string(&envelope) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("Failed to encode {}: {}", envelope.kind, e);
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        debug!("Websocket write failed: {}", e);
                        break;
                    }
                }
            }
        }
        if let Err(e) = sink.close().await {
            debug!("Websocket close failed: {}", e);
        }
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                if let Some(reply) = state.router.handle_text(service.as_str(), text.as_str()).await
                {
                    state.hub.send_to(&observer, reply);
                }
            }
            Ok(Message::Close(_)) => break,
            // Pings are answered by axum; pongs and binary frames carry nothing for us
            Ok(_) => {}
            Err(e) => {
                debug!("Websocket read failed on {}: {}", service, e);
                break;
            }
        }
    }

    state.hub.unsubscribe(&observer);
    cancel.cancel();
    if let Err(e) = writer.await {
        warn!("Websocket writer for {} ended abnormally: {}", service, e);
    }
    info!("Observer {} disconnected from {}", observer.id, service);
}
