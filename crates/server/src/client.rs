//! Subscriber transports: Server-Sent Events and WebSocket.

use std::convert::Infallible;

use axum::{
    extract::{
        Query, State, WebSocketUpgrade,
        rejection::QueryRejection,
        ws::{Message, WebSocket},
    },
    http::HeaderMap,
    response::{
        IntoResponse, Response, Sse,
        sse::{Event, KeepAlive},
    },
};
use futures::{SinkExt, Stream, StreamExt};
use tidestream_core::{
    AuthError, CloseReason, Delivery, EventId, StreamError, StreamEvent, Subscription,
};
use tracing::{debug, info, warn};

use crate::{
    error::ApiError,
    server::AppState,
    types::{ClientFrame, ClientQuery},
};

/// Token from `Authorization: Bearer …`, falling back to the `token` query parameter.
pub fn extract_token(headers: &HeaderMap, query_token: Option<&str>) -> Option<String> {
    if let Some(auth) = headers.get("authorization")
        && let Ok(auth_str) = auth.to_str()
        && let Some(token) = auth_str.strip_prefix("Bearer ")
    {
        return Some(token.to_string());
    }
    query_token.map(|t| t.to_string())
}

async fn open_subscription(
    state: &AppState,
    headers: &HeaderMap,
    query: Result<Query<ClientQuery>, QueryRejection>,
) -> Result<Subscription, ApiError> {
    let Query(query) = query?;
    let token = extract_token(headers, query.token.as_deref())
        .ok_or(StreamError::Unauthorized(AuthError::MissingToken))?;

    let last_event_id = match headers.get("last-event-id") {
        Some(value) => Some(
            value
                .to_str()
                .ok()
                .and_then(|v| v.parse::<EventId>().ok())
                .ok_or_else(|| ApiError::bad_request("invalid Last-Event-ID"))?,
        ),
        None => None,
    };

    let subscription = state
        .service
        .fanout()
        .subscribe(&query.key, &token, last_event_id)
        .await?;
    Ok(subscription)
}

/// GET /api/client/sse - stream events as Server-Sent Events
pub async fn handle_sse(
    State(state): State<AppState>,
    headers: HeaderMap,
    query: Result<Query<ClientQuery>, QueryRejection>,
) -> Result<Response, ApiError> {
    let subscription = open_subscription(&state, &headers, query).await?;
    info!(key = %subscription.key(), "New SSE subscriber");

    Ok(Sse::new(sse_stream(subscription))
        .keep_alive(
            KeepAlive::new()
                .interval(state.options.keep_alive)
                .text("keepalive"),
        )
        .into_response())
}

fn sse_stream(mut subscription: Subscription) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        while let Some(delivery) = subscription.next().await {
            match delivery {
                Delivery::Event(event) => {
                    if let Some(frame) = event_frame(&event) {
                        yield Ok(frame);
                    }
                }
                Delivery::Closed(reason) => {
                    debug!(key = %subscription.key(), reason = ?reason, "Closing SSE subscriber");
                    if let Some(frame) = close_frame(reason) {
                        yield Ok(frame);
                    }
                }
            }
        }
    }
}

fn event_frame(event: &StreamEvent) -> Option<Event> {
    Event::default()
        .id(event.id.to_string())
        .event(event.event.as_str())
        .json_data(event)
        .inspect_err(|e| warn!(id = %event.id, error = %e, "Failed to encode event"))
        .ok()
}

fn close_frame(reason: CloseReason) -> Option<Event> {
    match reason {
        CloseReason::Client => None,
        CloseReason::StreamEnded(status) => Event::default()
            .event("status")
            .json_data(serde_json::json!({ "status": status }))
            .ok(),
        CloseReason::StreamExpired => Event::default()
            .event("status")
            .json_data(serde_json::json!({ "status": "expired" }))
            .ok(),
        CloseReason::Overflow { missed } => Event::default()
            .event("error")
            .json_data(serde_json::json!({
                "code": "overflow",
                "message": overflow_message(missed),
            }))
            .ok(),
    }
}

fn overflow_message(missed: u64) -> String {
    format!("subscriber fell behind and missed {missed} events")
}

/// GET /api/client/ws - stream events over a WebSocket
pub async fn handle_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    query: Result<Query<ClientQuery>, QueryRejection>,
) -> Result<Response, ApiError> {
    let subscription = open_subscription(&state, &headers, query).await?;
    info!(key = %subscription.key(), "New WebSocket subscriber");

    Ok(ws.on_upgrade(move |socket| deliver_ws(socket, subscription)))
}

async fn deliver_ws(socket: WebSocket, mut subscription: Subscription) {
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            delivery = subscription.next() => {
                let Some(delivery) = delivery else { break };
                let (frame, last) = match &delivery {
                    Delivery::Event(event) => (ClientFrame::Event(event), false),
                    Delivery::Closed(reason) => match close_client_frame(*reason) {
                        Some(frame) => (frame, true),
                        None => break,
                    },
                };

                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "Failed to encode frame");
                        continue;
                    }
                };
                if sender.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
                if last {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => {
                    subscription.close();
                    break;
                }
                Some(Err(e)) => {
                    warn!(key = %subscription.key(), error = %e, "WebSocket error");
                    subscription.close();
                    break;
                }
                // Subscribers do not send data
                Some(Ok(_)) => {}
            },
        }
    }

    debug!(key = %subscription.key(), "WebSocket subscriber disconnected");
}

fn close_client_frame(reason: CloseReason) -> Option<ClientFrame<'static>> {
    match reason {
        CloseReason::Client => None,
        CloseReason::StreamEnded(status) => Some(ClientFrame::Status {
            status: status.as_str(),
        }),
        CloseReason::StreamExpired => Some(ClientFrame::Status { status: "expired" }),
        CloseReason::Overflow { missed } => Some(ClientFrame::Error {
            code: "overflow",
            message: overflow_message(missed),
        }),
    }
}
