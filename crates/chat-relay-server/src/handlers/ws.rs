//! WebSocket transport for the chat relay.
//!
//! Each connection gets one [`ParticipantHandle`]; the handler multiplexes
//! relay events going out and client frames coming in with `tokio::select!`.
//!
//! Posts are handed to a per-connection worker task so they run in arrival
//! order and are not cancelled when the socket closes: a visitor who hangs up
//! mid-answer still gets the reply recorded and shown to admins.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::client_addr::ClientAddr;
use crate::models::{ClientFrame, ConversationId, ParticipantRole, RelayEvent};
use crate::services::{ChatRelay, ParticipantHandle};

struct PendingPost {
    conversation_id: ConversationId,
    sender_role: ParticipantRole,
    content: String,
}

/// Upgrade an HTTP request to a relay connection. Mounted at `/ws`.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(relay): State<Arc<ChatRelay>>,
    ClientAddr(origin): ClientAddr,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_connection(socket, relay, origin))
}

async fn handle_ws_connection(socket: WebSocket, relay: Arc<ChatRelay>, origin: Option<String>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (handle, mut events) = ParticipantHandle::channel(ParticipantRole::Visitor);
    let connection_id = handle.connection_id;
    info!(%connection_id, "Relay client connected");

    let (post_tx, post_rx) = mpsc::unbounded_channel();
    tokio::spawn(run_posts(relay.clone(), handle.clone(), post_rx, origin));

    loop {
        tokio::select! {
            Some(event) = events.recv() => {
                match serde_json::to_string(&event) {
                    Ok(json) => {
                        if ws_sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!("Failed to serialize relay event: {err}"),
                }
            }

            msg_result = ws_receiver.next() => {
                match msg_result {
                    Some(Ok(Message::Text(text))) => {
                        process_frame(&text, &relay, &handle, &post_tx).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(err)) => {
                        debug!(%connection_id, "WebSocket receive error: {err}");
                        break;
                    }
                    // ping/pong/binary frames
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    let rooms = relay.disconnect(connection_id);
    info!(%connection_id, rooms = rooms.len(), "Relay client disconnected");
}

async fn process_frame(
    text: &str,
    relay: &ChatRelay,
    handle: &ParticipantHandle,
    post_tx: &mpsc::UnboundedSender<PendingPost>,
) {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(raw = %text, error = %err, "Ignoring malformed relay frame");
            handle.send(RelayEvent::Error {
                message: format!("malformed frame: {err}"),
            });
            return;
        }
    };

    match frame {
        ClientFrame::Join {
            conversation_id,
            role,
        } => {
            let participant = handle.with_role(role);
            if let Err(err) = relay.join(conversation_id.as_deref(), &participant).await {
                handle.send(RelayEvent::Error {
                    message: err.to_string(),
                });
            }
        }
        ClientFrame::Message {
            conversation_id,
            sender_role,
            content,
        } => {
            let pending = PendingPost {
                conversation_id,
                sender_role,
                content,
            };
            if post_tx.send(pending).is_err() {
                warn!(connection_id = %handle.connection_id, "Post worker stopped, dropping message");
            }
        }
        ClientFrame::Leave { conversation_id } => {
            relay.leave_room(&conversation_id, handle.connection_id);
        }
        ClientFrame::Ping => {
            handle.send(RelayEvent::Pong);
        }
    }
}

/// Drains one connection's posts in order. Outlives the socket until the queue is empty.
async fn run_posts(
    relay: Arc<ChatRelay>,
    handle: ParticipantHandle,
    mut posts: mpsc::UnboundedReceiver<PendingPost>,
    origin: Option<String>,
) {
    while let Some(post) = posts.recv().await {
        let result = relay
            .post(
                &post.conversation_id,
                post.sender_role,
                &post.content,
                origin.clone(),
            )
            .await;
        if let Err(err) = result {
            handle.send(RelayEvent::Error {
                message: err.to_string(),
            });
        }
    }
    debug!(connection_id = %handle.connection_id, "Post worker finished");
}
