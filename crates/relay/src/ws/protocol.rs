use axum::extract::ws::{Message, WebSocket};
use huddle_common::protocol::ws::{ClientEvent, ServerEvent};

use crate::error::{ErrorCode, RelayError};

pub fn decode_client_event(raw: &str) -> Result<ClientEvent, serde_json::Error> {
    serde_json::from_str::<ClientEvent>(raw)
}

pub fn decode_client_event_bytes(raw: &[u8]) -> Result<ClientEvent, serde_json::Error> {
    serde_json::from_slice::<ClientEvent>(raw)
}

pub fn encode_event(event: &ServerEvent) -> Result<String, serde_json::Error> {
    serde_json::to_string(event)
}

pub async fn send_event(socket: &mut WebSocket, event: &ServerEvent) -> Result<(), ()> {
    let encoded = encode_event(event).map_err(|_| ())?;
    socket.send(Message::Text(encoded.into())).await.map_err(|_| ())
}

/// The answer to a frame that is not a known client event.
pub fn invalid_message(error: &serde_json::Error) -> ServerEvent {
    RelayError::new(ErrorCode::InvalidMessage, format!("invalid event payload: {error}")).to_event()
}
