use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Extension, Query, State,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use huddle_common::protocol::ws::ServerEvent;
use serde::Deserialize;
use tokio::{sync::mpsc, time::Instant};
use tracing::{debug, info, warn};

use super::{protocol as ws_protocol, WsState, HEARTBEAT_INTERVAL, HEARTBEAT_TIMEOUT, MAX_FRAME_BYTES};
use crate::{
    auth::Identity,
    error::{current_request_id, request_id_from_headers_or_generate, with_request_id_scope},
    gateway::CoreHandle,
    metrics, protocol,
};

#[derive(Debug, Default, Deserialize)]
pub(super) struct UpgradeParams {
    protocol: Option<String>,
}

pub(super) async fn ws_upgrade(
    State(state): State<WsState>,
    Extension(identity): Extension<Identity>,
    Query(params): Query<UpgradeParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if let Some(version) = params.protocol.as_deref() {
        if let Err(upgrade_error) = protocol::require_supported(version) {
            return upgrade_error.into_response();
        }
    }

    let core = state.core.clone();
    let request_id = request_id_from_headers_or_generate(&headers);
    ws.max_frame_size(MAX_FRAME_BYTES).max_message_size(MAX_FRAME_BYTES).on_upgrade(
        move |socket| async move {
            with_request_id_scope(request_id, handle_socket(core, identity, socket)).await;
        },
    )
}

fn frame_size_exceeded_reason() -> String {
    format!("websocket frame exceeds maximum size of {MAX_FRAME_BYTES} bytes")
}

pub(super) fn is_frame_size_violation(error: &axum::Error) -> bool {
    let message = error.to_string().to_ascii_lowercase();
    message.contains("message too long")
        || message.contains("frame too long")
        || message.contains("too large")
        || message.contains("too big")
        || message.contains("size limit")
}

async fn close_frame_too_large(socket: &mut WebSocket) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::SIZE,
            reason: frame_size_exceeded_reason().into(),
        })))
        .await;
}

enum Inbound {
    Event(huddle_common::protocol::ws::ClientEvent),
    Invalid(ServerEvent),
}

fn decode_text(raw: &str) -> Inbound {
    match ws_protocol::decode_client_event(raw) {
        Ok(event) => Inbound::Event(event),
        Err(error) => Inbound::Invalid(ws_protocol::invalid_message(&error)),
    }
}

fn decode_binary(raw: &[u8]) -> Inbound {
    match ws_protocol::decode_client_event_bytes(raw) {
        Ok(event) => Inbound::Event(event),
        Err(error) => Inbound::Invalid(ws_protocol::invalid_message(&error)),
    }
}

async fn handle_socket(core: CoreHandle, identity: Identity, mut socket: WebSocket) {
    let request_id = current_request_id().unwrap_or_else(|| "unknown".to_string());
    let user_id = identity.user_id;

    let (outbound_sender, mut outbound_receiver) = mpsc::unbounded_channel::<ServerEvent>();
    let Some(connection_id) = core.connect(identity, outbound_sender).await else {
        warn!(user_id = %user_id, request_id = %request_id, "realtime core unavailable, closing socket");
        let _ = socket.send(Message::Close(None)).await;
        return;
    };

    // The server pings every HEARTBEAT_INTERVAL and drops the peer when a
    // ping goes unanswered for HEARTBEAT_TIMEOUT.
    let mut heartbeat_interval = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat_interval.reset();
    let mut ping_sent_at: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = heartbeat_interval.tick() => {
                if ping_sent_at.is_some_and(|sent_at| sent_at.elapsed() > HEARTBEAT_TIMEOUT) {
                    warn!(
                        connection_id = %connection_id,
                        request_id = %request_id,
                        "heartbeat timeout, disconnecting"
                    );
                    break;
                }
                if socket.send(Message::Ping(vec![].into())).await.is_err() {
                    break;
                }
                ping_sent_at.get_or_insert_with(Instant::now);
            }
            maybe_outbound = outbound_receiver.recv() => {
                match maybe_outbound {
                    Some(event) => {
                        if ws_protocol::send_event(&mut socket, &event).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            maybe_message = socket.recv() => {
                let Some(message) = maybe_message else {
                    break;
                };

                let inbound = match message {
                    Ok(Message::Text(raw_message)) => {
                        if raw_message.len() > MAX_FRAME_BYTES {
                            close_frame_too_large(&mut socket).await;
                            break;
                        }
                        decode_text(&raw_message)
                    }
                    Ok(Message::Binary(raw_message)) => {
                        if raw_message.len() > MAX_FRAME_BYTES {
                            close_frame_too_large(&mut socket).await;
                            break;
                        }
                        decode_binary(&raw_message)
                    }
                    Ok(Message::Ping(payload)) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                        continue;
                    }
                    Ok(Message::Pong(_)) => {
                        ping_sent_at = None;
                        continue;
                    }
                    Ok(Message::Close(_)) => break,
                    Err(error) => {
                        if is_frame_size_violation(&error) {
                            warn!(connection_id = %connection_id, "inbound frame too large");
                            close_frame_too_large(&mut socket).await;
                        } else {
                            debug!(connection_id = %connection_id, error = %error, "websocket read failed");
                        }
                        break;
                    }
                };

                match inbound {
                    Inbound::Event(event) => {
                        if !core.dispatch(connection_id, event) {
                            break;
                        }
                    }
                    Inbound::Invalid(error_event) => {
                        metrics::record_ws_request("invalid_message", true, 0);
                        if ws_protocol::send_event(&mut socket, &error_event).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }

    core.disconnect(connection_id);
    info!(connection_id = %connection_id, user_id = %user_id, request_id = %request_id, "websocket closed");
}

#[cfg(test)]
mod tests {
    use super::is_frame_size_violation;

    #[test]
    fn frame_size_errors_are_recognised() {
        let too_long = axum::Error::new(std::io::Error::other("Space limit exceeded: Message too long: 3000000 > 2097152"));
        assert!(is_frame_size_violation(&too_long));

        let reset = axum::Error::new(std::io::Error::other("Connection reset without closing handshake"));
        assert!(!is_frame_size_violation(&reset));
    }
}
