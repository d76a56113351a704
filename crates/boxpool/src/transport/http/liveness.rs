//! WebSocket liveness channel: `GET /ws/{id}`.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt, future};

use crate::heartbeat::{HeartbeatFrame, Inbound};
use crate::manager::{SlotError, SlotManager};
use crate::slot::SlotId;

/// Close code sent when the requested slot does not exist.
pub const CLOSE_UNKNOWN_SLOT: u16 = 4004;
/// Close code sent when the requested slot is not RUNNING.
pub const CLOSE_NOT_RUNNING: u16 = 4009;

const CLOSE_GOING_AWAY: u16 = 1001;
const CLOSE_INTERNAL_ERROR: u16 = 1011;

pub(super) async fn liveness_socket(
    State(manager): State<Arc<SlotManager>>,
    Path(id): Path<u32>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(manager, SlotId::new(id), socket))
}

async fn handle_socket(manager: Arc<SlotManager>, id: SlotId, mut socket: WebSocket) {
    let lease = match manager.open_liveness(id).await {
        Ok(lease) => lease,
        Err(e) => {
            tracing::info!(slot = %id, error = %e, "Rejecting liveness channel");
            let frame = CloseFrame {
                code: close_code(&e),
                reason: e.to_string().into(),
            };
            let _ = socket.send(Message::Close(Some(frame))).await;
            return;
        }
    };

    let (sink, stream) = socket.split();
    let tx = sink.with(|frame: HeartbeatFrame| {
        future::ready(
            serde_json::to_string(&frame)
                .map(|text| Message::Text(text.into()))
                .map_err(axum::Error::new),
        )
    });
    let rx = stream.filter_map(|msg| future::ready(inbound(msg)));

    let outcome = lease.run(tx, rx).await;
    tracing::debug!(slot = %id, ?outcome, "Liveness socket finished");
}

fn close_code(error: &SlotError) -> u16 {
    match error {
        SlotError::NotFound(_) => CLOSE_UNKNOWN_SLOT,
        SlotError::NotRunning(_) => CLOSE_NOT_RUNNING,
        SlotError::ShuttingDown => CLOSE_GOING_AWAY,
        _ => CLOSE_INTERNAL_ERROR,
    }
}

/// Map a socket message to monitor input. Protocol-level ping/pong and close
/// frames are handled by the socket itself.
fn inbound(msg: Result<Message, axum::Error>) -> Option<Result<Inbound, axum::Error>> {
    match msg {
        Ok(Message::Text(text)) => Some(Ok(Inbound::parse(text.as_str()))),
        Ok(Message::Binary(_)) => Some(Ok(Inbound::Other)),
        Ok(Message::Ping(_) | Message::Pong(_) | Message::Close(_)) => None,
        Err(e) => Some(Err(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heartbeat::FrameKind;

    #[test]
    fn close_codes_distinguish_unknown_and_idle_slots() {
        assert_eq!(close_code(&SlotError::NotFound(SlotId::new(9))), 4004);
        assert_eq!(close_code(&SlotError::NotRunning(SlotId::new(1))), 4009);
        assert_eq!(close_code(&SlotError::ShuttingDown), 1001);
        assert_eq!(
            close_code(&SlotError::StoreUnavailable("disk".into())),
            1011
        );
    }

    #[test]
    fn text_frames_are_parsed() {
        let msg = Message::Text(r#"{"type":"pong","timestamp":"2024-05-01T12:00:00Z"}"#.into());
        match inbound(Ok(msg)) {
            Some(Ok(Inbound::Frame(frame))) => assert_eq!(frame.kind, FrameKind::Pong),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(matches!(
            inbound(Ok(Message::Text("hi".into()))),
            Some(Ok(Inbound::Other))
        ));
    }

    #[test]
    fn control_frames_are_skipped() {
        assert!(inbound(Ok(Message::Ping(Default::default()))).is_none());
        assert!(inbound(Ok(Message::Close(None))).is_none());
        assert!(matches!(
            inbound(Ok(Message::Binary(Default::default()))),
            Some(Ok(Inbound::Other))
        ));
    }
}
