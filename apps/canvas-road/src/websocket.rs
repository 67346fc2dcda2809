use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures_util::{Sink, SinkExt, StreamExt};
use metrics::counter;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::connection::ConnectionHandle;
use crate::registry::validate_room_name;
use crate::server::AppState;

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Path(room): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Response {
    if let Err(err) = validate_room_name(&room) {
        warn!(room = %room, error = %err, "refusing websocket for invalid room name");
        return (StatusCode::BAD_REQUEST, err.to_string()).into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, room, state))
}

async fn handle_socket(socket: WebSocket, room_name: String, state: Arc<AppState>) {
    let (sender, mut receiver) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<String>();
    let connection = ConnectionHandle::new(tx);
    let connection_id = connection.id;

    tokio::spawn(async move {
        write_frames(sender, rx).await;
        debug!(connection = %connection_id, "writer task finished");
    });

    let room = match state.registry.join(&room_name, connection).await {
        Ok(room) => room,
        Err(err) => {
            warn!(room = %room_name, connection = %connection_id, error = %err, "failed to join room");
            return;
        }
    };
    info!(
        room = %room_name,
        host = %room.identity().id,
        connection = %connection_id,
        "websocket connected"
    );

    while let Some(frame) = receiver.next().await {
        let payload = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    debug!(connection = %connection_id, "ignoring non-utf8 binary frame");
                    counter!("canvas_road_client_errors_total", 1, "kind" => "non_utf8_frame");
                    continue;
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Err(err) => {
                debug!(connection = %connection_id, error = %err, "websocket read failed");
                break;
            }
        };
        if !room.message(connection_id, payload) {
            warn!(room = %room_name, connection = %connection_id, "room host stopped");
            break;
        }
    }

    room.close(connection_id);
    info!(room = %room_name, connection = %connection_id, "websocket disconnected");
}

/// Drain queued frames into the socket. A failed write ends the writer, so
/// the room sees this connection as stale on its next send. Once every
/// sender is gone (room closed the connection, host stopped or the join
/// failed) the peer gets a close frame.
async fn write_frames<S>(mut sink: S, mut frames: mpsc::UnboundedReceiver<String>)
where
    S: Sink<Message> + Unpin,
{
    while let Some(frame) = frames.recv().await {
        if sink.send(Message::Text(frame)).await.is_err() {
            return;
        }
    }
    let _ = sink.send(Message::Close(None)).await;
}
