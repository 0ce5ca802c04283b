//! WebSocket transport.
//!
//! One task per connection runs a writer that drains the session's
//! outbound queue and a reader that decodes frames into a per-session
//! dispatch queue. Handlers run on the blocking pool, one message at a
//! time per session, so a slow handler delays only its own session's
//! later messages and never the socket.

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use nerfhub_proto::{Decoded, ViewerMessage, decode, encode};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::server::{SessionServer, SessionStream};
use super::types::SessionId;

pub(super) fn router(server: SessionServer) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .with_state(server)
}

async fn health(State(server): State<SessionServer>) -> impl IntoResponse {
    axum::Json(server.stats())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(server): State<SessionServer>,
) -> impl IntoResponse {
    let max_frame = server.config().max_frame_bytes;
    ws.max_message_size(max_frame)
        .max_frame_size(max_frame)
        .on_upgrade(move |socket| run_connection(server, socket))
}

async fn run_connection(server: SessionServer, socket: WebSocket) {
    let (handle, stream) = server.open_session();
    let id = handle.id();
    let (sink, source) = socket.split();
    let mut shutdown = server.shutdown_signal();

    let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
    let dispatcher = tokio::spawn(run_dispatcher(server.clone(), id, dispatch_rx));

    let reason = tokio::select! {
        reason = write_loop(id, stream, sink) => reason,
        reason = read_loop(id, source, dispatch_tx) => reason,
        _ = shutdown.wait_for(|stop| *stop) => "server shutdown",
    };

    server.close_session(id);
    // Queued messages still reach handlers; the dispatcher ends once drained.
    drop(dispatcher);
    info!(session_id = %id, reason, "Connection finished");
}

async fn write_loop(
    id: SessionId,
    mut stream: SessionStream,
    mut sink: futures_util::stream::SplitSink<WebSocket, Message>,
) -> &'static str {
    while let Some(envelope) = stream.recv().await {
        let frame = match encode(&envelope) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(session_id = %id, kind = %envelope.kind(), error = %e, "Failed to encode message");
                continue;
            }
        };
        if let Err(e) = sink.send(Message::Text(frame)).await {
            debug!(session_id = %id, error = %e, "Write failed");
            return "write failed";
        }
    }
    let _ = sink.close().await;
    "session closed"
}

async fn read_loop(
    id: SessionId,
    mut source: futures_util::stream::SplitStream<WebSocket>,
    dispatch: mpsc::UnboundedSender<ViewerMessage>,
) -> &'static str {
    while let Some(frame) = source.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    warn!(session_id = %id, "Dropping non-UTF-8 binary frame");
                    continue;
                }
            },
            Ok(Message::Close(_)) => return "client closed",
            Ok(Message::Ping(_) | Message::Pong(_)) => continue,
            Err(e) => {
                debug!(session_id = %id, error = %e, "Read failed");
                return "read failed";
            }
        };

        match decode(&text) {
            Ok(Decoded::Message(envelope)) => {
                if dispatch.send(envelope.message).is_err() {
                    return "dispatcher stopped";
                }
            }
            Ok(Decoded::Unknown { kind }) => {
                debug!(session_id = %id, %kind, "Ignoring unknown message type");
            }
            Err(e) => {
                warn!(session_id = %id, error = %e, "Ignoring malformed frame");
            }
        }
    }
    "client disconnected"
}

async fn run_dispatcher(
    server: SessionServer,
    id: SessionId,
    mut queue: mpsc::UnboundedReceiver<ViewerMessage>,
) {
    while let Some(message) = queue.recv().await {
        if let Some(task) = server.dispatch(id, message) {
            if let Err(e) = task.await {
                warn!(session_id = %id, error = %e, "Handler task failed");
            }
        }
    }
}
