//! Per-socket read loop feeding inbound frames into the engine.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::SplitStream;
use herald_core::{Herald, InboundEvent, Session};
use metrics::{counter, gauge};
use tracing::{debug, instrument};

use crate::metrics::{
    WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL, WS_DISCONNECTIONS_TOTAL, WS_FRAMES_RECEIVED_TOTAL,
};

/// Close status reported when the peer's close frame carries none.
const NO_STATUS: u16 = 1005;

/// Translate one `WebSocket` message into an engine event.
///
/// Pings are answered by the socket itself and yield `None`.
pub fn to_event(message: Message) -> Option<InboundEvent> {
    match message {
        Message::Text(text) => Some(InboundEvent::Text(Bytes::copy_from_slice(
            text.as_str().as_bytes(),
        ))),
        Message::Binary(data) => Some(InboundEvent::Binary(data)),
        Message::Pong(_) => Some(InboundEvent::Pong),
        Message::Ping(_) => None,
        Message::Close(frame) => {
            let (code, reason) = frame.map_or((NO_STATUS, String::new()), |f| {
                (f.code, f.reason.as_str().to_owned())
            });
            Some(InboundEvent::Close { code, reason })
        }
    }
}

fn kind_label(event: &InboundEvent) -> &'static str {
    match event {
        InboundEvent::Text(_) => "text",
        InboundEvent::Binary(_) => "binary",
        InboundEvent::Pong => "pong",
        InboundEvent::Close { .. } => "close",
        InboundEvent::Disconnected => "disconnected",
    }
}

/// Read frames until the peer goes away, the read deadline passes or the
/// session closes, then report the disconnect.
///
/// Every inbound frame extends the deadline by `pong_wait`.
#[instrument(skip_all, fields(session_id = %session.id()))]
pub async fn run_connection(
    herald: Herald,
    session: Session,
    mut stream: SplitStream<WebSocket>,
    pong_wait: Duration,
) {
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);

    loop {
        let next = tokio::select! {
            () = session.closed() => break,
            next = tokio::time::timeout(pong_wait, stream.next()) => next,
        };
        let message = match next {
            Err(_) => {
                debug!(?pong_wait, "read deadline exceeded");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(error))) => {
                debug!(%error, "websocket read failed");
                break;
            }
            Ok(Some(Ok(message))) => message,
        };
        if let Some(event) = to_event(message) {
            counter!(WS_FRAMES_RECEIVED_TOTAL, "kind" => kind_label(&event)).increment(1);
            herald.handle_inbound(&session, event).await;
        }
    }

    herald
        .handle_inbound(&session, InboundEvent::Disconnected)
        .await;
    counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    debug!("read loop ended");
}

#[cfg(test)]
mod tests {
    use axum::extract::ws::CloseFrame;

    use super::*;

    #[test]
    fn text_is_copied_verbatim() {
        assert_eq!(
            to_event(Message::Text("hello".into())),
            Some(InboundEvent::Text(Bytes::from_static(b"hello")))
        );
    }

    #[test]
    fn binary_and_pong_map_directly() {
        let data = Bytes::from_static(&[9, 8]);
        assert_eq!(
            to_event(Message::Binary(data.clone())),
            Some(InboundEvent::Binary(data))
        );
        assert_eq!(
            to_event(Message::Pong(Bytes::new())),
            Some(InboundEvent::Pong)
        );
    }

    #[test]
    fn ping_is_not_forwarded() {
        assert_eq!(to_event(Message::Ping(Bytes::new())), None);
    }

    #[test]
    fn close_without_frame_reports_no_status() {
        assert_eq!(
            to_event(Message::Close(None)),
            Some(InboundEvent::Close {
                code: NO_STATUS,
                reason: String::new()
            })
        );
        assert_eq!(
            to_event(Message::Close(Some(CloseFrame {
                code: 1000,
                reason: "bye".into(),
            }))),
            Some(InboundEvent::Close {
                code: 1000,
                reason: "bye".into()
            })
        );
    }
}
