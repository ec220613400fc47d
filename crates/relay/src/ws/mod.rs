//! WebSocket transport: authenticated upgrade at `/v1/ws`, then one socket
//! task per connection that shuttles frames between the client and the
//! realtime core.

mod handler;
pub mod protocol;

use std::{sync::Arc, time::Duration};

use axum::{middleware, routing::get, Router};

use crate::{
    auth::{middleware::require_identity, IdentityBinder},
    gateway::CoreHandle,
};

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(10);
pub const MAX_FRAME_BYTES: usize = 2 * 1024 * 1024;

#[derive(Clone)]
pub struct WsState {
    core: CoreHandle,
}

pub fn router(binder: Arc<IdentityBinder>, core: CoreHandle) -> Router {
    let auth_layer = middleware::from_fn_with_state(binder, require_identity);

    Router::new()
        .route("/v1/ws", get(handler::ws_upgrade).route_layer(auth_layer))
        .with_state(WsState { core })
}

#[cfg(test)]
mod tests {
    use std::{net::SocketAddr, sync::Arc, time::Duration};

    use futures_util::{SinkExt, StreamExt};
    use huddle_common::{
        protocol::ws::{ClientEvent, ServerEvent, CURRENT_PROTOCOL_VERSION},
        types::RoomKind,
    };
    use tokio::{net::TcpListener, time::timeout};
    use tokio_tungstenite::{
        connect_async,
        tungstenite::{Error as WsError, Message as WsFrame},
        MaybeTlsStream, WebSocketStream,
    };
    use uuid::Uuid;

    use super::*;
    use crate::{
        auth::jwt::{JwtAccessTokenService, ACCESS_TOKEN_TTL_SECONDS},
        config::CoreConfig,
        gateway::spawn_core,
        store::{Stores, UserStore},
    };

    const TEST_SECRET: &str = "huddle_test_secret_that_is_definitely_long_enough";

    type ClientSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

    struct TestRelay {
        addr: SocketAddr,
        jwt: JwtAccessTokenService,
    }

    impl TestRelay {
        async fn start() -> Self {
            let jwt = JwtAccessTokenService::new(TEST_SECRET).expect("jwt service should initialize");
            let binder = Arc::new(IdentityBinder::new(jwt.clone(), UserStore::in_memory()));
            let (core, _core_task) = spawn_core(CoreConfig::default(), Stores::in_memory());
            let app = router(binder, core);

            let listener = TcpListener::bind("127.0.0.1:0").await.expect("listener should bind");
            let addr = listener.local_addr().expect("listener should expose local address");
            tokio::spawn(async move {
                axum::serve(listener, app).await.expect("relay server should run");
            });
            Self { addr, jwt }
        }

        fn url(&self, user_id: Uuid, name: &str) -> String {
            let token = self
                .jwt
                .issue_user_token(user_id, Some(name), ACCESS_TOKEN_TTL_SECONDS)
                .expect("token should issue");
            format!("ws://{}/v1/ws?access_token={token}&protocol={CURRENT_PROTOCOL_VERSION}", self.addr)
        }

        async fn connect(&self, user_id: Uuid, name: &str) -> ClientSocket {
            let (socket, _) = connect_async(self.url(user_id, name)).await.expect("websocket should connect");
            socket
        }
    }

    async fn ws_send(socket: &mut ClientSocket, event: &ClientEvent) {
        let raw = serde_json::to_string(event).expect("client event should serialize");
        socket.send(WsFrame::Text(raw.into())).await.expect("client event should send");
    }

    async fn ws_recv(socket: &mut ClientSocket) -> ServerEvent {
        loop {
            let next = timeout(Duration::from_secs(2), socket.next())
                .await
                .expect("timed out waiting for websocket frame");
            let frame = next.expect("websocket should remain open").expect("websocket frame should decode");

            match frame {
                WsFrame::Text(payload) => {
                    return serde_json::from_str::<ServerEvent>(&payload)
                        .expect("text frame should decode as server event");
                }
                WsFrame::Ping(payload) => {
                    socket.send(WsFrame::Pong(payload)).await.expect("pong should send");
                }
                WsFrame::Close(_) => panic!("websocket closed unexpectedly"),
                WsFrame::Binary(_) | WsFrame::Pong(_) | WsFrame::Frame(_) => {}
            }
        }
    }

    /// Reads until an event matching `predicate` shows up.
    async fn ws_recv_until(socket: &mut ClientSocket, predicate: impl Fn(&ServerEvent) -> bool) -> ServerEvent {
        loop {
            let event = ws_recv(socket).await;
            if predicate(&event) {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn connected_event_carries_identity_and_limits() {
        let relay = TestRelay::start().await;
        let user_id = Uuid::new_v4();
        let mut socket = relay.connect(user_id, "Ada").await;

        match ws_recv(&mut socket).await {
            ServerEvent::Connected {
                user_id: connected_user,
                display_name,
                protocol_version,
                heartbeat_interval_ms,
                max_frame_bytes,
                ..
            } => {
                assert_eq!(connected_user, user_id);
                assert_eq!(display_name, "Ada");
                assert_eq!(protocol_version, CURRENT_PROTOCOL_VERSION);
                assert_eq!(heartbeat_interval_ms, 15_000);
                assert_eq!(max_frame_bytes, MAX_FRAME_BYTES);
            }
            other => panic!("expected connected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn room_members_see_each_other_and_departures() {
        let relay = TestRelay::start().await;
        let ada = Uuid::new_v4();
        let grace = Uuid::new_v4();
        let mut ada_socket = relay.connect(ada, "Ada").await;
        let mut grace_socket = relay.connect(grace, "Grace").await;

        let lobby = ClientEvent::JoinRoom { kind: RoomKind::Chat, room_id: "lobby".into() };
        ws_send(&mut ada_socket, &lobby).await;
        ws_recv_until(&mut ada_socket, |event| matches!(event, ServerEvent::ActiveMembers { .. })).await;
        ws_send(&mut grace_socket, &lobby).await;

        let joined =
            ws_recv_until(&mut ada_socket, |event| matches!(event, ServerEvent::MemberJoined { .. })).await;
        assert!(matches!(
            joined,
            ServerEvent::MemberJoined { member, .. } if member.user_id == grace && member.display_name == "Grace"
        ));

        grace_socket.close(None).await.expect("close should send");
        let left = ws_recv_until(&mut ada_socket, |event| matches!(event, ServerEvent::MemberLeft { .. })).await;
        assert!(matches!(left, ServerEvent::MemberLeft { user_id, .. } if user_id == grace));
    }

    #[tokio::test]
    async fn malformed_frames_are_answered_without_closing() {
        let relay = TestRelay::start().await;
        let mut socket = relay.connect(Uuid::new_v4(), "Ada").await;
        ws_recv_until(&mut socket, |event| matches!(event, ServerEvent::Connected { .. })).await;

        socket.send(WsFrame::Text("{\"type\":\"teleport\"}".into())).await.expect("frame should send");
        let error = ws_recv_until(&mut socket, |event| matches!(event, ServerEvent::Error { .. })).await;
        assert!(matches!(error, ServerEvent::Error { code, .. } if code == "INVALID_MESSAGE"));

        ws_send(&mut socket, &ClientEvent::GetOnlineUsers).await;
        let online = ws_recv_until(&mut socket, |event| matches!(event, ServerEvent::OnlineUsers { .. })).await;
        assert!(matches!(online, ServerEvent::OnlineUsers { user_ids } if user_ids.len() == 1));
    }

    #[tokio::test]
    async fn upgrade_requires_a_valid_token() {
        let relay = TestRelay::start().await;
        let url = format!("ws://{}/v1/ws", relay.addr);

        match connect_async(url).await {
            Err(WsError::Http(response)) => assert_eq!(response.status().as_u16(), 401),
            other => panic!("expected 401 rejection, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn unsupported_protocol_version_is_refused() {
        let relay = TestRelay::start().await;
        let url = relay.url(Uuid::new_v4(), "Ada").replace(CURRENT_PROTOCOL_VERSION, "huddle-rt.v99");

        match connect_async(url).await {
            Err(WsError::Http(response)) => assert_eq!(response.status().as_u16(), 426),
            other => panic!("expected 426 rejection, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn heartbeat_timeout_is_less_than_interval() {
        assert_eq!(HEARTBEAT_INTERVAL, Duration::from_secs(15));
        assert!(HEARTBEAT_TIMEOUT < HEARTBEAT_INTERVAL);
    }
}
