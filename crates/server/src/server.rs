//! HTTP server exposing the stream service.

use std::{io, time::Duration};

use axum::{
    Json, Router,
    body::Body,
    extract::{
        Query, Request, State, WebSocketUpgrade,
        rejection::{JsonRejection, QueryRejection},
        ws::{Message, WebSocket},
    },
    http::{HeaderMap, HeaderValue, Method},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
};
use futures::{SinkExt, StreamExt, TryStreamExt};
use tidestream_core::{IngestReport, StreamInfo, StreamService, StreamStatus};
use tokio_util::io::StreamReader;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{debug, info, warn};

use crate::{
    client,
    error::ApiError,
    types::{
        AddEventsRequest, CreateStreamRequest, CreateStreamResponse, EndStreamRequest,
        InfoResponse, IngestReply, KeyQuery, KeyRequest, ListQuery, ServerOptions, StatusResponse,
    },
};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: StreamService,
    pub options: ServerOptions,
}

/// Create the router with the control and subscription endpoints.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(allow_origin(state.options.allowed_origins.as_deref()))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
        .expose_headers(Any);

    let control = Router::new()
        .route("/api/info", get(handle_info))
        .route("/api/stream", get(handle_list).post(handle_create))
        .route("/api/stream/token", post(handle_token))
        .route("/api/stream/info", get(handle_stream_info))
        .route("/api/stream/add", post(handle_add))
        .route("/api/stream/add/json-stream", post(handle_add_json_stream))
        .route("/api/stream/add/ws", get(handle_add_ws))
        .route("/api/stream/end", post(handle_end))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    Router::new()
        .route("/api/health", get(|| async { "OK" }))
        .route("/api/client/sse", get(client::handle_sse))
        .route("/api/client/ws", get(client::handle_ws))
        .merge(control)
        .layer(cors)
        .with_state(state)
}

fn allow_origin(origins: Option<&[String]>) -> AllowOrigin {
    let Some(origins) = origins else {
        return AllowOrigin::any();
    };
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin.trim()) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    AllowOrigin::list(origins)
}

/// Rejects control requests without the configured `X-API-KEY`.
async fn require_api_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if let Some(expected) = &state.options.api_key {
        let provided = headers.get("x-api-key").and_then(|v| v.to_str().ok());
        if provided != Some(expected.as_str()) {
            debug!(path = %request.uri().path(), "Rejected request without valid API key");
            return Err(ApiError::unauthorized("missing or invalid API key"));
        }
    }
    Ok(next.run(request).await)
}

/// GET /api/info
async fn handle_info(State(state): State<AppState>) -> Json<InfoResponse> {
    Json(InfoResponse {
        url: state.service.config().public_url.to_string(),
        version: env!("CARGO_PKG_VERSION"),
        streams: state.service.registry().stream_count(),
        pool: state.service.pool_stats(),
    })
}

/// GET /api/stream - list active streams, optionally filtered by a glob pattern
async fn handle_list(
    State(state): State<AppState>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> Result<Json<Vec<StreamInfo>>, ApiError> {
    let Query(query) = query?;
    let streams = state
        .service
        .registry()
        .list(query.pattern.as_deref())
        .await?;
    Ok(Json(streams))
}

/// POST /api/stream - create a stream and hand out its access grant
async fn handle_create(
    State(state): State<AppState>,
    body: Result<Json<CreateStreamRequest>, JsonRejection>,
) -> Result<Json<CreateStreamResponse>, ApiError> {
    let Json(request) = body?;
    let ttl = request.ttl.map(Duration::from_secs);

    let info = state.service.registry().create(&request.key, ttl).await?;
    let grant = state.service.access().mint(&info.key, info.instance)?;
    debug!(key = %info.key, expires_at = %grant.expires_at, "Granted access to new stream");

    Ok(Json(CreateStreamResponse {
        status: info.status,
        grant,
    }))
}

/// POST /api/stream/token - issue a fresh access grant for an active stream
async fn handle_token(
    State(state): State<AppState>,
    body: Result<Json<KeyRequest>, JsonRejection>,
) -> Result<Json<CreateStreamResponse>, ApiError> {
    let Json(request) = body?;
    let grant = state.service.access().issue(&request.key).await?;
    Ok(Json(CreateStreamResponse {
        status: StreamStatus::Active,
        grant,
    }))
}

/// GET /api/stream/info?key=
async fn handle_stream_info(
    State(state): State<AppState>,
    query: Result<Query<KeyQuery>, QueryRejection>,
) -> Result<Json<StreamInfo>, ApiError> {
    let Query(query) = query?;
    Ok(Json(state.service.registry().get(&query.key).await?))
}

/// POST /api/stream/add - append a batch of events
async fn handle_add(
    State(state): State<AppState>,
    body: Result<Json<AddEventsRequest>, JsonRejection>,
) -> Result<Json<IngestReport>, ApiError> {
    let Json(request) = body?;
    let report = state
        .service
        .ingest()
        .add_batch(&request.key, request.events)
        .await?;
    Ok(Json(report))
}

/// POST /api/stream/add/json-stream?key= - newline-delimited JSON upload
async fn handle_add_json_stream(
    State(state): State<AppState>,
    query: Result<Query<KeyQuery>, QueryRejection>,
    body: Body,
) -> Result<Json<IngestReport>, ApiError> {
    let Query(query) = query?;
    let reader = StreamReader::new(body.into_data_stream().map_err(io::Error::other));

    let report = state.service.ingest().add_lines(&query.key, reader).await?;
    info!(
        key = %query.key,
        added = report.added,
        rejected = report.rejected,
        interrupted = report.interrupted,
        "Finished upload"
    );
    Ok(Json(report))
}

/// GET /api/stream/add/ws?key= - one event per WebSocket text frame
async fn handle_add_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    query: Result<Query<KeyQuery>, QueryRejection>,
) -> Result<Response, ApiError> {
    let Query(query) = query?;
    state.service.registry().ensure_active(&query.key).await?;
    info!(key = %query.key, "New WebSocket producer");

    Ok(ws.on_upgrade(move |socket| ingest_ws(socket, state.service, query.key)))
}

async fn ingest_ws(socket: WebSocket, service: StreamService, key: String) {
    let (mut sender, mut receiver) = socket.split();

    while let Some(message) = receiver.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text.as_str().to_owned(),
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => text,
                Err(_) => {
                    let reply = IngestReply::Error {
                        message: "frame is not valid UTF-8".to_string(),
                    };
                    if send_reply(&mut sender, &reply).await.is_err() {
                        break;
                    }
                    continue;
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                warn!(key = %key, error = %e, "WebSocket producer error");
                break;
            }
        };

        let reply = match service.ingest().add_json(&key, &text).await {
            Ok(event) => IngestReply::Success { id: event.id },
            Err(e) => IngestReply::Error {
                message: e.to_string(),
            },
        };
        if send_reply(&mut sender, &reply).await.is_err() {
            break;
        }
    }

    debug!(key = %key, "WebSocket producer disconnected");
}

async fn send_reply<S>(sender: &mut S, reply: &IngestReply) -> Result<(), ()>
where
    S: futures::Sink<Message> + Unpin,
{
    let text = serde_json::to_string(reply).map_err(|_| ())?;
    sender.send(Message::Text(text.into())).await.map_err(|_| ())
}

/// POST /api/stream/end - end or cancel a stream
async fn handle_end(
    State(state): State<AppState>,
    body: Result<Json<EndStreamRequest>, JsonRejection>,
) -> Result<Json<StatusResponse>, ApiError> {
    let Json(request) = body?;
    let status = state
        .service
        .registry()
        .end(&request.key, request.cancel)
        .await?;
    info!(key = %request.key, status = %status.as_str(), "Ended stream");
    Ok(Json(StatusResponse { status }))
}

/// Start the server.
pub async fn start_server(service: StreamService, options: ServerOptions) -> io::Result<()> {
    let state = AppState {
        service,
        options: options.clone(),
    };

    let router = create_router(state);

    let addr = format!("{}:{}", options.host, options.port);
    info!("Starting tidestream server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}
