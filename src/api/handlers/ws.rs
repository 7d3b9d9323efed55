//! Telemetry WebSocket handler
//!
//! Each connection becomes one sink in the fanout registry: events flow
//! out as `{type, payload}` JSON, commands (`reload`, `test`,
//! `get_status`) flow in and route through the orchestrator.

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;

use crate::api::AppContext;
use crate::error::AppError;
use crate::telemetry::{Event, SubscriberCommand};

#[derive(Debug, Deserialize)]
struct CommandMessage {
    command: SubscriberCommand,
}

/// GET /ws - Upgrade to the telemetry stream
pub async fn telemetry_ws(ws: WebSocketUpgrade, State(ctx): State<AppContext>) -> Response {
    ws.on_upgrade(move |socket| telemetry_session(socket, ctx))
}

async fn telemetry_session(socket: WebSocket, ctx: AppContext) {
    let (id, mut events) = ctx.fanout.subscribe().await;
    let (mut sink, mut stream) = socket.split();

    // Initial snapshot so the session renders without waiting a tick.
    let status = ctx.nginx.status().await;
    let maintenance = ctx.store.get_maintenance().await;
    let metrics = ctx.fanout.collect_metrics().await;
    for event in [
        Event::NginxStatus(status),
        Event::MaintenanceMode(crate::telemetry::MaintenancePayload {
            enabled: maintenance.enabled,
            message: if maintenance.message.is_empty() {
                None
            } else {
                Some(maintenance.message)
            },
        }),
        Event::Metrics(metrics),
    ] {
        if send_event(&mut sink, &event).await.is_err() {
            ctx.fanout.unsubscribe(id).await;
            return;
        }
    }

    loop {
        tokio::select! {
            // Fanout -> client
            event = events.recv() => {
                match event {
                    Some(event) => {
                        if send_event(&mut sink, &event).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            // Client -> commands
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_command(&ctx, &mut sink, &text).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!("WebSocket read error: {}", e);
                        break;
                    }
                }
            }
        }
    }

    ctx.fanout.unsubscribe(id).await;
    tracing::debug!("Telemetry session closed: {}", id);
}

async fn send_event(
    sink: &mut (impl SinkExt<Message> + Unpin),
    event: &Event,
) -> Result<(), ()> {
    let json = match serde_json::to_string(event) {
        Ok(json) => json,
        Err(e) => {
            tracing::warn!("Event serialization failed (non-fatal): {}", e);
            return Ok(());
        }
    };
    sink.send(Message::Text(json)).await.map_err(|_| ())
}

async fn handle_command(
    ctx: &AppContext,
    sink: &mut (impl SinkExt<Message> + Unpin),
    text: &str,
) {
    let parsed: Result<CommandMessage, _> = serde_json::from_str(text);
    let command = match parsed {
        Ok(msg) => msg.command,
        Err(e) => {
            tracing::debug!("Unparsable subscriber command ({}): {}", e, text);
            return;
        }
    };

    match command {
        SubscriberCommand::Reload => {
            // The orchestrator broadcasts the fresh status on completion.
            if let Err(e) = ctx.orchestrator.reload().await {
                send_error(sink, &e).await;
            }
        }
        SubscriberCommand::Test => {
            let result = match ctx.orchestrator.validate_config().await {
                Ok(output) => serde_json::json!({
                    "type": "test_result",
                    "payload": { "valid": true, "output": output }
                }),
                Err(AppError::ConfigInvalid(output)) => serde_json::json!({
                    "type": "test_result",
                    "payload": { "valid": false, "output": output }
                }),
                Err(e) => {
                    send_error(sink, &e).await;
                    return;
                }
            };
            let _ = sink.send(Message::Text(result.to_string())).await;
        }
        SubscriberCommand::GetStatus => {
            let status = ctx.nginx.status().await;
            let _ = send_event(sink, &Event::NginxStatus(status)).await;
        }
    }
}

async fn send_error(sink: &mut (impl SinkExt<Message> + Unpin), error: &AppError) {
    let body = serde_json::json!({
        "type": "error",
        "payload": { "kind": error.kind(), "message": error.to_string() }
    });
    let _ = sink.send(Message::Text(body.to_string())).await;
}
