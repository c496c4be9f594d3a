//! Live event channel: `GET /ws?token=…`
//!
//! Text JSON frames only. The server greets with
//! `{"type":"connected","connectionId":…}` and then forwards engine events
//! as `{"type":"event","event":"node.completed","data":{…}}`. The client
//! sends nothing after connecting; auth failure closes with code 1008.

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use serde_json::json;

use crate::auth::verify_token;
use crate::AppState;

const POLICY_VIOLATION: u16 = 1008;

#[derive(Debug, Deserialize)]
pub struct WsParams {
    #[serde(default)]
    token: String,
}

pub fn routes(state: AppState) -> Router {
    Router::new().route("/ws", get(ws_upgrade)).with_state(state)
}

pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(state, socket, params.token))
}

async fn handle_socket(state: AppState, mut socket: WebSocket, token: String) {
    let user = match verify_token(&state.auth, &token) {
        Ok(user) => user,
        Err(_) => {
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: POLICY_VIOLATION,
                    reason: "unauthorized".into(),
                })))
                .await;
            return;
        }
    };

    let mut subscription = state.hub.subscribe(user.user_id, user.admin);

    let connected = json!({
        "type": "connected",
        "connectionId": subscription.id,
    });
    if socket
        .send(Message::Text(connected.to_string()))
        .await
        .is_err()
    {
        return;
    }

    tracing::debug!(user_id = %user.user_id, connection_id = %subscription.id, "live channel connected");

    loop {
        tokio::select! {
            event = subscription.receiver.recv() => {
                let Some(event) = event else { break };
                let frame = json!({
                    "type": "event",
                    "event": event.name,
                    "data": {
                        "executionId": event.execution_id,
                        "payload": event.data,
                    },
                });
                if socket.send(Message::Text(frame.to_string())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    // Clients do not speak after connecting; pings are
                    // answered by axum, anything else is ignored until
                    // close or error.
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    tracing::debug!(user_id = %user.user_id, "live channel closed");
}
