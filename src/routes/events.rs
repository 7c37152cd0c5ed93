//! `GET /events/ws`: live event stream for dashboards.
//!
//! Each connection is one fan-out subscriber. Nothing is replayed on
//! connect; a client too slow to keep up is dropped by the fan-out and its
//! socket closed here.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use tracing::debug;

use super::AppState;

// ---

pub fn router() -> Router<AppState> {
    Router::new().route("/events/ws", get(ws_handler))
}

async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_session(socket, state))
}

async fn ws_session(mut socket: WebSocket, state: AppState) {
    // ---
    let mut subscription = state.fanout.subscribe();
    debug!("Dashboard {} connected", subscription.id());

    loop {
        tokio::select! {
            event = subscription.recv() => {
                let Some(event) = event else {
                    debug!("Dashboard {} dropped by fan-out", subscription.id());
                    break;
                };
                if socket.send(Message::Text(event.to_json().into())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                // Clients have nothing to say; pings are answered by axum.
                Some(Ok(_)) => {}
            },
        }
    }

    let _ = socket.send(Message::Close(None)).await;
    debug!("Dashboard {} disconnected", subscription.id());
}
