//! Websocket side of a session: relays bridge frames out and client
//! messages in until either side closes.

use crate::bridge::{Attach, Frame, Transport};
use crate::state::AppState;
use crate::workspace::SessionKey;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tracing::{info, warn};

pub async fn serve(state: AppState, mut socket: WebSocket, id: Option<String>) {
    let bridge = id
        .as_deref()
        .and_then(SessionKey::parse)
        .and_then(|key| state.registry().lookup(&key));
    let Some(bridge) = bridge else {
        warn!(id = ?id, "Websocket presented unknown session key; closing");
        let _ = socket.send(Message::Close(None)).await;
        return;
    };

    let (transport, mut frames) = Transport::channel();
    let transport_id = transport.id();
    let attach = bridge.attach(transport);
    info!(key = %bridge.key(), ?attach, "Websocket connected");

    let (mut sender, mut receiver) = socket.split();
    loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Some(Frame::Data(bytes)) => {
                    if sender.send(to_message(bytes)).await.is_err() {
                        break;
                    }
                }
                Some(Frame::Close) | None => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            },
            inbound = receiver.next(), if attach == Attach::Attached => match inbound {
                Some(Ok(Message::Text(text))) => bridge.deliver_input(text.as_bytes()),
                Some(Ok(Message::Binary(bytes))) => bridge.deliver_input(&bytes),
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
            },
        }
    }

    bridge.detach(transport_id);
    info!(key = %bridge.key(), closed = ?bridge.close_reason(), "Websocket disconnected");
}

/// Output goes out as text when it is valid UTF-8, raw binary otherwise.
fn to_message(bytes: Vec<u8>) -> Message {
    match String::from_utf8(bytes) {
        Ok(text) => Message::Text(text),
        Err(e) => Message::Binary(e.into_bytes()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utf8_output_is_sent_as_text() {
        assert_eq!(to_message(b"hi\n".to_vec()), Message::Text("hi\n".into()));
        assert_eq!(
            to_message(vec![0xff, 0x00]),
            Message::Binary(vec![0xff, 0x00])
        );
    }
}
