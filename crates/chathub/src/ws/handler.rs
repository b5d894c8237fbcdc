//! WebSocket upgrade handler and the axum transport adapter.

use async_trait::async_trait;
use axum::{
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use log::{debug, info};

use crate::api::{ApiError, AppState};
use crate::auth::CurrentUser;

use super::transport::{BoxFrameReader, BoxFrameWriter, FrameReader, FrameWriter, TransportError};
use super::types::RoomId;

/// WebSocket upgrade into a room.
///
/// GET /auth/ws/joinRoom/{room_id}
///
/// The room is resolved before upgrading so an unknown room is a plain 404.
pub async fn join_room(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(room_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let room_id = RoomId::new(room_id);
    let identity = user.identity();
    info!(
        "WebSocket upgrade request from user {} for room {}",
        identity.user_id, room_id
    );

    state.hub.resolve_room(&room_id).await?;

    let hub = state.hub.clone();
    Ok(ws.on_upgrade(move |socket| async move {
        let (reader, writer) = split_socket(socket);
        match hub.join(identity, room_id, reader, writer).await {
            Ok(summary) => debug!(
                "Connection {} finished ({}, {} message(s))",
                summary.connection_id, summary.reason, summary.messages_received
            ),
            Err(e) => debug!("Join after upgrade failed: {}", e),
        }
    }))
}

/// Split an upgraded socket into hub transport halves.
pub fn split_socket(socket: WebSocket) -> (BoxFrameReader, BoxFrameWriter) {
    let (sink, stream) = socket.split();
    (
        Box::new(WsFrameReader { stream }),
        Box::new(WsFrameWriter { sink }),
    )
}

struct WsFrameReader {
    stream: SplitStream<WebSocket>,
}

#[async_trait]
impl FrameReader for WsFrameReader {
    async fn read_frame(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.to_string())),
                Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => return Some(Ok(text)),
                    Err(_) => debug!("Ignoring non-UTF-8 binary frame"),
                },
                // Pings are answered by axum itself.
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
                Ok(Message::Close(_)) => return None,
                Err(e) => return Some(Err(TransportError::Io(e.to_string()))),
            }
        }
    }
}

struct WsFrameWriter {
    sink: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl FrameWriter for WsFrameWriter {
    async fn write_frame(&mut self, frame: String) -> Result<(), TransportError> {
        self.sink
            .send(Message::Text(frame.into()))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.sink
            .close()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }
}
